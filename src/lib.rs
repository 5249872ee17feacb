//! Messaging service.
//!
//! Peer-to-peer RPC transport used by the nodes of a distributed database
//! to exchange typed messages ("verbs") over long-lived connections. Every
//! node runs one service that is simultaneously a server, accepting
//! connections from its peers, and a client, opening connections to peers
//! on demand.
//!
//! COMPONENTS:
//!  - Client cache (cache.rs): per verb class and peer, the one outbound
//!    connection in use; entries in error are evicted and rebuilt.
//!  - Connection (connection.rs): one outbound connection with keepalive,
//!    optional TLS and compression, and per-connection stats.
//!  - Listener (listener.rs): accepts inbound connections on a bound
//!    address, plain or TLS, and feeds them through the verb registry.
//!  - Verb registry (registry.rs): maps verbs to typed handlers.
//!
//! API:
//!  - `send_oneway`/`send_request`/`send_request_timeout`/
//!    `send_request_retry`: the uniform send pipeline. Failed sends bump
//!    the per-verb dropped counter; transport closures additionally evict
//!    the connection so the next send dials afresh.
//!  - `register_<verb>`/`unregister_<verb>`/`send_<verb>` wrappers for the
//!    gossip verb family; generic typed primitives for everything else.
//!  - `stop()` quiesces traffic and drains every listener and connection.
//!
//! GUARANTEES:
//!  - At most one live connection per (verb class, peer); a connection in
//!    error state is never handed out.
//!  - Once `stop()` has begun no new connection is created and no send is
//!    dispatched; previously-issued futures drain to completion, and
//!    `stop()` resolves only after every connection stop has resolved.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

mod cache;
mod codec;
mod connection;
mod error;
mod listener;
mod metrics;
mod policy;
mod registry;
mod utils;
mod verb;

pub use codec::{decode, encode, ForeignPtr, SharedPtr};
pub use connection::Stats;
pub use error::{Error, Result};
pub use listener::{ClientInfo, ResourceLimits};
pub use policy::{AlwaysKnown, CompressWhat, EncryptWhat, Gossip, SimpleSnitch, Snitch};
pub use verb::{
    ClientIdentity, GossipDigest, GossipDigestAck, GossipDigestAck2, GossipDigestSyn, Verb,
    CURRENT_VERSION, MAXIMUM_RESULT_SIZE, STREAMING_NR_RETRY, STREAMING_TIMEOUT,
    STREAMING_WAIT_BEFORE_RETRY, VERB_COUNT,
};

use cache::ClientCache;
use connection::{ClientConn, ConnectOptions};
use listener::Listener;
use metrics::MessagingMetrics;
use policy::PreferredIpCache;
use registry::{HandlerRegistry, RawHandler};
use verb::VERB_CLASS_COUNT;

const GOSSIP_ECHO_TIMEOUT: Duration = Duration::from_millis(3000);

/// Identity of a peer: its broadcast address plus the core the connection
/// originates from. The core id is kept for stats and future routing.
#[derive(Clone, Copy, Debug)]
pub struct PeerId {
    pub addr: IpAddr,
    pub core_id: u32,
}

impl PeerId {
    pub fn new(addr: IpAddr, core_id: u32) -> Self {
        Self { addr, core_id }
    }
}

// Ignore the core id since connections are not yet routed core to core.
impl PartialEq for PeerId {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl Eq for PeerId {}

impl Hash for PeerId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
    }
}

impl PartialOrd for PeerId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PeerId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.addr.cmp(&other.addr)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.core_id)
    }
}

/// TLS material of the service. Building it produces the server and client
/// configurations shared by every encrypted listener and connection.
pub struct CredentialsBuilder {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub roots: rustls::RootCertStore,
}

pub(crate) struct Credentials {
    server: Arc<rustls::ServerConfig>,
    client: Arc<rustls::ClientConfig>,
}

impl CredentialsBuilder {
    pub(crate) fn build(&self) -> Result<Credentials> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let server = rustls::ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(self.certs.clone(), self.key.clone_key())?;
        let client = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_root_certificates(self.roots.clone())
            .with_no_client_auth();
        Ok(Credentials {
            server: Arc::new(server),
            client: Arc::new(client),
        })
    }
}

/// Construction parameters of a [`MessagingService`].
pub struct Config {
    pub listen_address: IpAddr,
    /// Address this node is known by to its peers; defaults to the listen
    /// address.
    pub broadcast_address: Option<IpAddr>,
    pub port: u16,
    pub ssl_port: u16,
    pub encrypt: EncryptWhat,
    pub compress: CompressWhat,
    pub credentials: Option<CredentialsBuilder>,
    pub should_listen_to_broadcast: bool,
    pub listen_now: bool,
    pub core_id: u32,
    pub snitch: Arc<dyn Snitch>,
    pub gossip: Arc<dyn Gossip>,
    pub resource_limits: ResourceLimits,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            broadcast_address: None,
            port: 7000,
            ssl_port: 7001,
            encrypt: EncryptWhat::None,
            compress: CompressWhat::None,
            credentials: None,
            should_listen_to_broadcast: false,
            listen_now: true,
            core_id: 0,
            snitch: Arc::new(SimpleSnitch),
            gossip: Arc::new(AlwaysKnown),
            resource_limits: ResourceLimits::default(),
        }
    }
}

struct Inner {
    listen_address: IpAddr,
    broadcast_address: IpAddr,
    port: u16,
    ssl_port: u16,
    encrypt: EncryptWhat,
    compress: CompressWhat,
    should_listen_to_broadcast: bool,
    core_id: u32,
    credentials: Option<Credentials>,
    snitch: Arc<dyn Snitch>,
    gossip: Arc<dyn Gossip>,
    limits: ResourceLimits,

    registry: Arc<HandlerRegistry>,
    cache: ClientCache,
    preferred_ips: PreferredIpCache,
    metrics: MessagingMetrics,

    stopping: AtomicBool,
    /// Cancels abortable waits (retry sleeps) when the service stops.
    abort: CancellationToken,
    /// Tracks scheduled per-connection stops so `stop()` can drain them.
    stop_tracker: TaskTracker,

    servers: Mutex<[Option<Listener>; 2]>,
    servers_tls: Mutex<[Option<Listener>; 2]>,
}

/// The messaging service. Cheap to clone; every clone is a handle onto the
/// same instance. Pending operations hold such a handle, which is what
/// keeps the service alive across their suspension points.
#[derive(Clone)]
pub struct MessagingService {
    inner: Arc<Inner>,
}

impl MessagingService {
    /// Builds the service and, unless `listen_now` is off, starts its
    /// listeners. Must run inside a Tokio runtime.
    pub fn new(config: Config, metrics_registry: &prometheus::Registry) -> Result<MessagingService> {
        let credentials = match &config.credentials {
            Some(builder) => Some(builder.build()?),
            None => None,
        };
        let broadcast_address = config.broadcast_address.unwrap_or(config.listen_address);

        let service = MessagingService {
            inner: Arc::new(Inner {
                listen_address: config.listen_address,
                broadcast_address,
                port: config.port,
                ssl_port: config.ssl_port,
                encrypt: config.encrypt,
                compress: config.compress,
                should_listen_to_broadcast: config.should_listen_to_broadcast,
                core_id: config.core_id,
                credentials,
                snitch: config.snitch,
                gossip: config.gossip,
                limits: config.resource_limits,
                registry: Arc::new(HandlerRegistry::default()),
                cache: ClientCache::default(),
                preferred_ips: PreferredIpCache::default(),
                metrics: MessagingMetrics::new(metrics_registry),
                stopping: AtomicBool::new(false),
                abort: CancellationToken::new(),
                stop_tracker: TaskTracker::new(),
                servers: Mutex::new([None, None]),
                servers_tls: Mutex::new([None, None]),
            }),
        };

        // Peers identify themselves right after connecting.
        service.register_handler(
            Verb::ClientId,
            |info: Arc<ClientInfo>, identity: ClientIdentity| async move {
                info.attach_identity(identity);
                Ok(())
            },
        )?;

        if config.listen_now {
            service.start_listen()?;
        }
        Ok(service)
    }

    pub fn listen_address(&self) -> IpAddr {
        self.inner.listen_address
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }

    /// Identity of the peer behind an inbound connection, as announced by
    /// its `CLIENT_ID` handshake.
    pub fn get_source(info: &ClientInfo) -> Option<PeerId> {
        info.identity()
            .map(|identity| PeerId::new(identity.broadcast_address, identity.src_core_id))
    }

    /// Creates any listener that is not up yet. Idempotent.
    pub fn start_listen(&self) -> Result<()> {
        let inner = &self.inner;
        let listen_to_bc = inner.should_listen_to_broadcast
            && inner.listen_address != inner.broadcast_address;

        {
            let mut servers = inner.servers.lock().unwrap();
            if servers[0].is_none() {
                servers[0] = Some(self.bind_listener(inner.listen_address, inner.port, None)?);
                if listen_to_bc {
                    servers[1] =
                        Some(self.bind_listener(inner.broadcast_address, inner.port, None)?);
                }
            }
        }

        let tls_up;
        {
            let mut servers_tls = inner.servers_tls.lock().unwrap();
            if servers_tls[0].is_none() && inner.encrypt != EncryptWhat::None {
                if let Some(credentials) = &inner.credentials {
                    let acceptor = TlsAcceptor::from(credentials.server.clone());
                    servers_tls[0] = Some(self.bind_listener(
                        inner.listen_address,
                        inner.ssl_port,
                        Some(acceptor.clone()),
                    )?);
                    if listen_to_bc {
                        servers_tls[1] = Some(self.bind_listener(
                            inner.broadcast_address,
                            inner.ssl_port,
                            Some(acceptor),
                        )?);
                    }
                }
            }
            tls_up = servers_tls[0].is_some();
        }

        // Do this on just core 0, to avoid duplicate logs.
        if inner.core_id == 0 {
            if tls_up {
                info!(
                    "Starting Encrypted Messaging Service on SSL port {}",
                    inner.ssl_port
                );
            }
            info!("Starting Messaging Service on port {}", inner.port);
        }
        Ok(())
    }

    fn bind_listener(&self, addr: IpAddr, port: u16, tls: Option<TlsAcceptor>) -> Result<Listener> {
        Listener::bind(
            SocketAddr::new(addr, port),
            tls,
            self.inner.registry.clone(),
            self.inner.limits,
            self.inner.compress != CompressWhat::None,
        )
    }

    /// Quiesces the service: no new connections or sends, then drains the
    /// plain listeners, the TLS listeners and all cached connections in
    /// parallel. Resolves only once every connection stop has resolved.
    pub async fn stop(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        self.inner.abort.cancel();
        tokio::join!(
            self.stop_nontls_server(),
            self.stop_tls_server(),
            self.stop_client(),
        );
        self.inner.stop_tracker.close();
        self.inner.stop_tracker.wait().await;
    }

    async fn stop_nontls_server(&self) {
        let servers: Vec<_> = {
            let mut servers = self.inner.servers.lock().unwrap();
            servers.iter_mut().filter_map(|slot| slot.take()).collect()
        };
        futures::future::join_all(servers.iter().map(|server| server.stop())).await;
    }

    async fn stop_tls_server(&self) {
        let servers: Vec<_> = {
            let mut servers = self.inner.servers_tls.lock().unwrap();
            servers.iter_mut().filter_map(|slot| slot.take()).collect()
        };
        futures::future::join_all(servers.iter().map(|server| server.stop())).await;
    }

    async fn stop_client(&self) {
        let conns = self.inner.cache.drain();
        futures::future::join_all(conns.iter().map(|conn| conn.stop())).await;
    }

    // --- verb registry -----------------------------------------------------

    /// Installs a typed handler for `verb`. Fails if one is already
    /// registered.
    pub fn register_handler<Req, Resp, F, Fut>(&self, verb: Verb, handler: F) -> Result<()>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Arc<ClientInfo>, Req) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Resp>> + Send + 'static,
    {
        let raw: RawHandler = Arc::new(move |info, body| match codec::decode::<Req>(&body) {
            Ok(request) => {
                let reply = handler(info, request);
                async move { codec::encode(&reply.await?) }.boxed()
            }
            Err(e) => futures::future::ready(Err(e)).boxed(),
        });
        self.inner.registry.register(verb, raw)
    }

    /// Removes the handler for `verb`. Idempotent.
    pub fn unregister_handler(&self, verb: Verb) {
        self.inner.registry.unregister(verb);
    }

    // --- client cache ------------------------------------------------------

    fn get_client(&self, verb: Verb, id: PeerId) -> Result<Arc<ClientConn>> {
        let inner = &self.inner;
        let class = verb.class();

        let must_encrypt = policy::must_encrypt(
            inner.encrypt,
            inner.snitch.as_ref(),
            inner.broadcast_address,
            id.addr,
        );
        let must_compress = policy::must_compress(
            inner.compress,
            inner.snitch.as_ref(),
            inner.broadcast_address,
            id.addr,
        );
        let remote_ip =
            inner
                .preferred_ips
                .resolve(id.addr, inner.snitch.as_ref(), inner.broadcast_address);
        let port = if must_encrypt {
            inner.ssl_port
        } else {
            inner.port
        };
        let tls = if must_encrypt {
            inner
                .credentials
                .as_ref()
                .map(|c| (c.client.clone(), ServerName::IpAddress(remote_ip.into())))
        } else {
            None
        };

        let mut evicted = None;
        // Lookup, eviction and insert happen under the table lock, so a
        // concurrent stop() cannot observe a new entry after it started
        // draining, and concurrent callers get the same connection.
        let result = inner.cache.with_table(class, |table| {
            if inner.stopping.load(Ordering::SeqCst) {
                return Err(Error::Stopping);
            }
            if let Some(conn) = table.get(&id) {
                if !conn.error() {
                    return Ok((conn.clone(), false));
                }
                evicted = table.remove(&id);
            }
            let conn = ClientConn::open(
                SocketAddr::new(remote_ip, port),
                inner.listen_address,
                ConnectOptions {
                    compress: must_compress,
                    tls,
                },
            );
            table.insert(id, conn.clone());
            Ok((conn, true))
        });
        if let Some(dead) = evicted {
            self.schedule_conn_stop(id, dead);
        }

        let (conn, fresh) = result?;
        if fresh {
            // Identify ourselves on the new connection. A hand-off failure
            // surfaces through the connection's error flag soon enough.
            let identity = ClientIdentity {
                broadcast_address: inner.broadcast_address,
                src_core_id: inner.core_id,
                max_result_size: MAXIMUM_RESULT_SIZE,
            };
            let _ = conn.send_oneway(Verb::ClientId, codec::encode(&identity)?);
        }
        Ok(conn)
    }

    /// Evicts the connection used by `verb` towards `id`, but only if it
    /// is in error state.
    pub fn remove_error_client(&self, verb: Verb, id: PeerId) {
        // While stopping the connections are already being stopped;
        // removing them here would interfere with that.
        if self.is_stopping() {
            return;
        }
        if let Some(conn) = self.inner.cache.remove(verb.class(), &id, true) {
            self.schedule_conn_stop(id, conn);
        }
    }

    /// Evicts every connection towards `id`, across all verb classes.
    pub fn remove_client(&self, id: PeerId) {
        if self.is_stopping() {
            return;
        }
        for class in 0..VERB_CLASS_COUNT {
            if let Some(conn) = self.inner.cache.remove(class, &id, false) {
                self.schedule_conn_stop(id, conn);
            }
        }
    }

    fn schedule_conn_stop(&self, id: PeerId, conn: Arc<ClientConn>) {
        // Hold a strong service handle until the stop resolves, so that
        // `stop()` cannot finish while this connection is still winding
        // down.
        let service = self.clone();
        self.inner.stop_tracker.spawn(async move {
            conn.stop().await;
            debug!(peer = %id, "dropped connection to {}", id.addr);
            drop(service);
        });
    }

    /// Yields every cached outbound connection as `(peer, stats)`.
    pub fn foreach_client(&self, mut f: impl FnMut(&PeerId, Stats)) {
        self.inner.cache.foreach_client(&mut f);
    }

    /// Yields every active inbound connection on every listener.
    pub fn foreach_server_connection(&self, mut f: impl FnMut(&ClientInfo, Stats)) {
        for group in [&self.inner.servers, &self.inner.servers_tls] {
            for listener in group.lock().unwrap().iter().flatten() {
                listener.foreach_connection(&mut f);
            }
        }
    }

    // --- preferred IPs -----------------------------------------------------

    /// Address to dial for `endpoint`: the cached preferred IP when the
    /// endpoint is in our datacenter, the endpoint itself otherwise.
    pub fn get_preferred_ip(&self, endpoint: IpAddr) -> IpAddr {
        self.inner.preferred_ips.resolve(
            endpoint,
            self.inner.snitch.as_ref(),
            self.inner.broadcast_address,
        )
    }

    pub fn cache_preferred_ip(&self, endpoint: IpAddr, preferred: IpAddr) {
        self.inner.preferred_ips.insert(endpoint, preferred);
    }

    /// Installs a persisted preferred-IP map and drops existing
    /// connections to the affected endpoints so they reopen on the
    /// preferred addresses.
    pub fn init_preferred_ip_cache(&self, entries: HashMap<IpAddr, IpAddr>) {
        let endpoints: Vec<IpAddr> = entries.keys().copied().collect();
        self.inner.preferred_ips.replace(entries);
        for endpoint in endpoints {
            self.remove_client(PeerId::new(endpoint, 0));
        }
    }

    // --- metrics -----------------------------------------------------------

    pub fn increment_dropped_messages(&self, verb: Verb) {
        self.inner.metrics.increment_dropped(verb);
    }

    pub fn dropped_for(&self, verb: Verb) -> u64 {
        self.inner.metrics.dropped_for(verb)
    }

    /// Raw per-verb dropped counters, indexed by `Verb::index()`.
    pub fn dropped_messages(&self) -> [u64; VERB_COUNT] {
        self.inner.metrics.dropped_snapshot()
    }

    // --- send pipeline -----------------------------------------------------

    /// Fire-and-forget send: the future completes once the payload has
    /// been handed to the transport.
    pub async fn send_oneway<Req: Serialize>(
        &self,
        verb: Verb,
        id: PeerId,
        msg: &Req,
    ) -> Result<()> {
        let body = codec::encode(msg)?;
        self.send_message(verb, id, body, true, None).await?;
        Ok(())
    }

    /// Sends a request and decodes the typed response.
    pub async fn send_request<Req, Resp>(&self, verb: Verb, id: PeerId, msg: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let body = codec::encode(msg)?;
        let reply = self.send_message(verb, id, body, false, None).await?;
        codec::decode(&reply)
    }

    /// Like [`send_request`](Self::send_request), but fails with
    /// [`Error::Timeout`] if the peer does not reply within `timeout`.
    pub async fn send_request_timeout<Req, Resp>(
        &self,
        verb: Verb,
        id: PeerId,
        msg: &Req,
        timeout: Duration,
    ) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let body = codec::encode(msg)?;
        let reply = self
            .send_message(verb, id, body, false, Some(timeout))
            .await?;
        codec::decode(&reply)
    }

    /// Repeated [`send_request_timeout`](Self::send_request_timeout)
    /// attempts. Only transport closures are retried: the loop stops when
    /// the attempt budget runs out, the service starts stopping, or gossip
    /// no longer knows the peer. The wait between attempts aborts on
    /// shutdown.
    pub async fn send_request_retry<Req, Resp>(
        &self,
        verb: Verb,
        id: PeerId,
        msg: &Req,
        timeout: Duration,
        nr_retry: usize,
        wait: Duration,
    ) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let body = codec::encode(msg)?;
        let mut attempts_left = nr_retry;
        loop {
            match self
                .send_message(verb, id, body.clone(), false, Some(timeout))
                .await
            {
                Ok(reply) => {
                    if attempts_left != nr_retry {
                        info!(%verb, peer = %id, "Retry to {}: OK", id.addr);
                    }
                    return codec::decode(&reply);
                }
                Err(e @ Error::Timeout(_)) => {
                    info!(%verb, peer = %id, "Retry to {}: timeout in {:?}", id.addr, timeout);
                    return Err(e);
                }
                Err(e) if e.is_closed() => {
                    info!(%verb, peer = %id, attempts_left, "Retry to {}: {}", id.addr, e);
                    attempts_left -= 1;
                    if attempts_left == 0 {
                        debug!(%verb, peer = %id, "stop retrying: no attempts left");
                        return Err(e);
                    }
                    if self.is_stopping() {
                        debug!(%verb, peer = %id, "stop retrying: messaging service is stopped");
                        return Err(e);
                    }
                    if !self.inner.gossip.is_known_endpoint(id.addr) {
                        debug!(%verb, peer = %id, "stop retrying: node is removed from the cluster");
                        return Err(e);
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = self.inner.abort.cancelled() => {
                            debug!(%verb, peer = %id, "stop retrying: wait aborted");
                            return Err(Error::Aborted(
                                "messaging service is stopping".to_string(),
                            ));
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Request with the retransmission profile streaming verbs use.
    pub async fn send_streaming<Req, Resp>(&self, verb: Verb, id: PeerId, msg: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.send_request_retry(
            verb,
            id,
            msg,
            STREAMING_TIMEOUT,
            STREAMING_NR_RETRY,
            STREAMING_WAIT_BEFORE_RETRY,
        )
        .await
    }

    async fn send_message(
        &self,
        verb: Verb,
        id: PeerId,
        body: Bytes,
        no_wait: bool,
        timeout: Option<Duration>,
    ) -> Result<Bytes> {
        if self.is_stopping() {
            // Pre-failed, with no side effects.
            return Err(Error::Stopping);
        }
        let conn = self.get_client(verb, id)?;
        // `conn` stays alive until the reply future resolves.
        let result = if no_wait {
            conn.send_oneway(verb, body).map(|()| Bytes::new())
        } else {
            conn.send_request(verb, body, timeout).await
        };
        match result {
            Ok(reply) => Ok(reply),
            Err(e) => {
                self.inner.metrics.increment_dropped(verb);
                if e.is_closed() {
                    // Transport failure: evict so the next send rebuilds.
                    self.remove_error_client(verb, id);
                }
                Err(e)
            }
        }
    }

    // --- gossip verb family ------------------------------------------------

    pub fn register_gossip_echo<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.register_handler(Verb::GossipEcho, move |_info: Arc<ClientInfo>, _: ()| {
            handler()
        })
    }

    pub fn unregister_gossip_echo(&self) {
        self.unregister_handler(Verb::GossipEcho);
    }

    pub async fn send_gossip_echo(&self, id: PeerId) -> Result<()> {
        self.send_request_timeout(Verb::GossipEcho, id, &(), GOSSIP_ECHO_TIMEOUT)
            .await
    }

    pub fn register_gossip_shutdown<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(IpAddr) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.register_handler(
            Verb::GossipShutdown,
            move |_info: Arc<ClientInfo>, from: IpAddr| handler(from),
        )
    }

    pub fn unregister_gossip_shutdown(&self) {
        self.unregister_handler(Verb::GossipShutdown);
    }

    pub async fn send_gossip_shutdown(&self, id: PeerId, from: IpAddr) -> Result<()> {
        self.send_oneway(Verb::GossipShutdown, id, &from).await
    }

    pub fn register_gossip_digest_syn<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(Arc<ClientInfo>, GossipDigestSyn) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.register_handler(Verb::GossipDigestSyn, handler)
    }

    pub fn unregister_gossip_digest_syn(&self) {
        self.unregister_handler(Verb::GossipDigestSyn);
    }

    pub async fn send_gossip_digest_syn(&self, id: PeerId, msg: &GossipDigestSyn) -> Result<()> {
        self.send_oneway(Verb::GossipDigestSyn, id, msg).await
    }

    pub fn register_gossip_digest_ack<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(Arc<ClientInfo>, GossipDigestAck) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.register_handler(Verb::GossipDigestAck, handler)
    }

    pub fn unregister_gossip_digest_ack(&self) {
        self.unregister_handler(Verb::GossipDigestAck);
    }

    pub async fn send_gossip_digest_ack(&self, id: PeerId, msg: &GossipDigestAck) -> Result<()> {
        self.send_oneway(Verb::GossipDigestAck, id, msg).await
    }

    pub fn register_gossip_digest_ack2<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(GossipDigestAck2) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.register_handler(
            Verb::GossipDigestAck2,
            move |_info: Arc<ClientInfo>, msg: GossipDigestAck2| handler(msg),
        )
    }

    pub fn unregister_gossip_digest_ack2(&self) {
        self.unregister_handler(Verb::GossipDigestAck2);
    }

    pub async fn send_gossip_digest_ack2(&self, id: PeerId, msg: &GossipDigestAck2) -> Result<()> {
        self.send_oneway(Verb::GossipDigestAck2, id, msg).await
    }
}
