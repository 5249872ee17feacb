//! The closed set of RPC verbs and their connection classes, plus the wire
//! messages of the gossip verb family.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Protocol version exchanged in the connection setup preamble.
pub const CURRENT_VERSION: i32 = 0;

/// Default max-result-size auxiliary announced by the `CLIENT_ID` handshake.
pub const MAXIMUM_RESULT_SIZE: u64 = 1024 * 1024;

// Retransmission parameters for streaming verbs.
// A stream plan gives up retrying in 10*30 + 10*60 seconds (15 minutes) at
// most, 10*30 seconds (5 minutes) at least.
pub const STREAMING_NR_RETRY: usize = 10;
pub const STREAMING_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const STREAMING_WAIT_BEFORE_RETRY: Duration = Duration::from_secs(30);

/// Number of connection classes; each (class, peer) pair gets its own
/// connection so latency-sensitive verbs are not stuck behind bulk traffic.
pub(crate) const VERB_CLASS_COUNT: usize = 2;

/// Number of verbs, sizing the dense dropped-message counter array.
pub const VERB_COUNT: usize = 20;

/// A typed RPC operation identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Verb {
    ClientId = 0,
    Mutation,
    MutationDone,
    ReadData,
    ReadMutationData,
    ReadDigest,
    GossipEcho,
    GossipShutdown,
    GossipDigestSyn,
    GossipDigestAck,
    GossipDigestAck2,
    DefinitionsUpdate,
    Truncate,
    ReplicationFinished,
    MigrationRequest,
    PrepareMessage,
    PrepareDoneMessage,
    StreamMutation,
    StreamMutationDone,
    CompleteMessage,
}

impl Verb {
    pub const ALL: [Verb; VERB_COUNT] = [
        Verb::ClientId,
        Verb::Mutation,
        Verb::MutationDone,
        Verb::ReadData,
        Verb::ReadMutationData,
        Verb::ReadDigest,
        Verb::GossipEcho,
        Verb::GossipShutdown,
        Verb::GossipDigestSyn,
        Verb::GossipDigestAck,
        Verb::GossipDigestAck2,
        Verb::DefinitionsUpdate,
        Verb::Truncate,
        Verb::ReplicationFinished,
        Verb::MigrationRequest,
        Verb::PrepareMessage,
        Verb::PrepareDoneMessage,
        Verb::StreamMutation,
        Verb::StreamMutationDone,
        Verb::CompleteMessage,
    ];

    /// Connection class of this verb. Chatty gossip verbs go on a separate
    /// connection so they are not blocked behind bulk reads and mutations,
    /// which also keeps their latency down.
    pub fn class(self) -> usize {
        match self {
            Verb::GossipDigestSyn
            | Verb::GossipDigestAck2
            | Verb::GossipShutdown
            | Verb::GossipEcho => 1,
            _ => 0,
        }
    }

    /// Stable name used for metric labels and logs.
    pub fn name(self) -> &'static str {
        match self {
            Verb::ClientId => "CLIENT_ID",
            Verb::Mutation => "MUTATION",
            Verb::MutationDone => "MUTATION_DONE",
            Verb::ReadData => "READ_DATA",
            Verb::ReadMutationData => "READ_MUTATION_DATA",
            Verb::ReadDigest => "READ_DIGEST",
            Verb::GossipEcho => "GOSSIP_ECHO",
            Verb::GossipShutdown => "GOSSIP_SHUTDOWN",
            Verb::GossipDigestSyn => "GOSSIP_DIGEST_SYN",
            Verb::GossipDigestAck => "GOSSIP_DIGEST_ACK",
            Verb::GossipDigestAck2 => "GOSSIP_DIGEST_ACK2",
            Verb::DefinitionsUpdate => "DEFINITIONS_UPDATE",
            Verb::Truncate => "TRUNCATE",
            Verb::ReplicationFinished => "REPLICATION_FINISHED",
            Verb::MigrationRequest => "MIGRATION_REQUEST",
            Verb::PrepareMessage => "PREPARE_MESSAGE",
            Verb::PrepareDoneMessage => "PREPARE_DONE_MESSAGE",
            Verb::StreamMutation => "STREAM_MUTATION",
            Verb::StreamMutationDone => "STREAM_MUTATION_DONE",
            Verb::CompleteMessage => "COMPLETE_MESSAGE",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Payload of the `CLIENT_ID` handshake sent on every fresh outbound
/// connection. The receiving side attaches these as auxiliaries to the
/// connection's [`ClientInfo`](crate::ClientInfo).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub broadcast_address: IpAddr,
    pub src_core_id: u32,
    pub max_result_size: u64,
}

/// State digest for one endpoint, exchanged during a gossip round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipDigest {
    pub endpoint: IpAddr,
    pub generation: i32,
    pub max_version: i32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipDigestSyn {
    pub cluster_id: String,
    pub digests: Vec<GossipDigest>,
}

/// Digests the responder is missing plus the endpoint states it can offer.
/// State payloads are opaque to the transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipDigestAck {
    pub digests: Vec<GossipDigest>,
    pub endpoint_states: Vec<(IpAddr, Bytes)>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipDigestAck2 {
    pub endpoint_states: Vec<(IpAddr, Bytes)>,
}
