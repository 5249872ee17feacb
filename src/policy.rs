//! Encrypt/compress policies and the collaborators they consult.
//!
//! Both policies are pure functions of `(self address, peer address,
//! snitch)`. The snitch classifies addresses into datacenters and racks;
//! the gossip view tells the retry loop when a peer has left the cluster.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

/// Which peers to encrypt traffic to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncryptWhat {
    None,
    All,
    /// Peers in a different datacenter.
    Dc,
    /// Peers in a different rack.
    Rack,
}

/// Which peers to compress traffic to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompressWhat {
    None,
    /// Peers in a different datacenter.
    Dc,
    All,
}

/// Classifies endpoint addresses by datacenter and rack.
pub trait Snitch: Send + Sync {
    fn datacenter_of(&self, endpoint: IpAddr) -> String;
    fn rack_of(&self, endpoint: IpAddr) -> String;
}

/// Places every endpoint in a single datacenter and rack.
pub struct SimpleSnitch;

impl Snitch for SimpleSnitch {
    fn datacenter_of(&self, _endpoint: IpAddr) -> String {
        "datacenter1".to_string()
    }

    fn rack_of(&self, _endpoint: IpAddr) -> String {
        "rack1".to_string()
    }
}

/// Cluster-membership view consulted when deciding whether retrying a peer
/// still makes sense.
pub trait Gossip: Send + Sync {
    fn is_known_endpoint(&self, endpoint: IpAddr) -> bool;
}

/// Membership view that never forgets a peer.
pub struct AlwaysKnown;

impl Gossip for AlwaysKnown {
    fn is_known_endpoint(&self, _endpoint: IpAddr) -> bool {
        true
    }
}

pub(crate) fn must_encrypt(
    what: EncryptWhat,
    snitch: &dyn Snitch,
    local: IpAddr,
    peer: IpAddr,
) -> bool {
    match what {
        EncryptWhat::None => false,
        EncryptWhat::All => true,
        EncryptWhat::Dc => snitch.datacenter_of(peer) != snitch.datacenter_of(local),
        EncryptWhat::Rack => snitch.rack_of(peer) != snitch.rack_of(local),
    }
}

pub(crate) fn must_compress(
    what: CompressWhat,
    snitch: &dyn Snitch,
    local: IpAddr,
    peer: IpAddr,
) -> bool {
    match what {
        CompressWhat::None => false,
        CompressWhat::All => true,
        CompressWhat::Dc => snitch.datacenter_of(peer) != snitch.datacenter_of(local),
    }
}

/// Mapping from a peer's canonical address to a preferred (usually local)
/// address to dial instead. Populated externally, e.g. from persisted
/// cluster state.
#[derive(Default)]
pub(crate) struct PreferredIpCache {
    cache: Mutex<HashMap<IpAddr, IpAddr>>,
}

impl PreferredIpCache {
    /// Preferred address for `endpoint` if one is cached and the endpoint
    /// resides in the same datacenter as this node; `endpoint` itself
    /// otherwise.
    pub(crate) fn resolve(
        &self,
        endpoint: IpAddr,
        snitch: &dyn Snitch,
        local: IpAddr,
    ) -> IpAddr {
        if let Some(preferred) = self.cache.lock().unwrap().get(&endpoint) {
            if snitch.datacenter_of(endpoint) == snitch.datacenter_of(local) {
                return *preferred;
            }
        }
        endpoint
    }

    pub(crate) fn insert(&self, endpoint: IpAddr, preferred: IpAddr) {
        self.cache.lock().unwrap().insert(endpoint, preferred);
    }

    pub(crate) fn replace(&self, entries: HashMap<IpAddr, IpAddr>) {
        *self.cache.lock().unwrap() = entries;
    }
}
