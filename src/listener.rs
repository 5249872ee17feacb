//! Inbound side of the messaging service.
//!
//! Each [`Listener`] accepts connections on one bound address, plain or
//! TLS, and feeds received messages through the verb registry. Handlers run
//! as their own tasks so a slow verb does not hold up the connection;
//! replies are correlated by request id and may be written out of order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use crate::connection::{ConnectionStats, Stats};
use crate::error::{Error, Result};
use crate::registry::HandlerRegistry;
use crate::utils::{self, Setup, WireError, WireRequestHeader, WireResponseHeader, FEATURE_LZ4};
use crate::verb::{ClientIdentity, CURRENT_VERSION};

const ACCEPT_BACKLOG: u32 = 1024;

/// Resource limits applied to inbound traffic. A request accounts for
/// `basic_request_size + bloat_factor * body_len` bytes of `max_memory`
/// while its handler runs.
#[derive(Clone, Copy, Debug)]
pub struct ResourceLimits {
    pub bloat_factor: usize,
    pub basic_request_size: usize,
    pub max_memory: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            bloat_factor: 3,
            basic_request_size: 1000,
            max_memory: 1_000_000,
        }
    }
}

impl ResourceLimits {
    /// Limits for a node with `total` bytes of memory: 8% of it, with a
    /// 1 MB floor.
    pub fn for_total_memory(total: usize) -> Self {
        Self {
            max_memory: std::cmp::max(total * 8 / 100, 1_000_000),
            ..Self::default()
        }
    }
}

/// Information about one inbound connection, handed to verb handlers.
/// The identity auxiliaries arrive with the peer's `CLIENT_ID` handshake.
#[derive(Debug)]
pub struct ClientInfo {
    remote_addr: SocketAddr,
    identity: OnceLock<ClientIdentity>,
}

impl ClientInfo {
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn identity(&self) -> Option<&ClientIdentity> {
        self.identity.get()
    }

    /// The first handshake on a connection wins.
    pub(crate) fn attach_identity(&self, identity: ClientIdentity) {
        let _ = self.identity.set(identity);
    }
}

struct InboundConn {
    info: Arc<ClientInfo>,
    stats: Arc<ConnectionStats>,
}

struct ServeCtx {
    registry: Arc<HandlerRegistry>,
    limits: ResourceLimits,
    memory: Arc<Semaphore>,
    compress: bool,
    tls: Option<TlsAcceptor>,
    tracker: TaskTracker,
    conns: Arc<Mutex<HashMap<u64, InboundConn>>>,
    cancel: CancellationToken,
    next_conn_id: AtomicU64,
}

pub(crate) struct Listener {
    cancel: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    tracker: TaskTracker,
    conns: Arc<Mutex<HashMap<u64, InboundConn>>>,
}

impl Listener {
    /// Binds `addr` and starts accepting. `tls` selects between a plain
    /// and an encrypted listener.
    pub(crate) fn bind(
        addr: SocketAddr,
        tls: Option<TlsAcceptor>,
        registry: Arc<HandlerRegistry>,
        limits: ResourceLimits,
        compress: bool,
    ) -> Result<Listener> {
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(ACCEPT_BACKLOG)?;

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let conns = Arc::new(Mutex::new(HashMap::new()));
        let memory = Arc::new(Semaphore::new(
            limits.max_memory.min(Semaphore::MAX_PERMITS),
        ));
        let ctx = Arc::new(ServeCtx {
            registry,
            limits,
            memory,
            compress,
            tls,
            tracker: tracker.clone(),
            conns: conns.clone(),
            cancel: cancel.clone(),
            next_conn_id: AtomicU64::new(0),
        });

        let accept_task = tokio::spawn(accept_loop(listener, ctx));
        Ok(Listener {
            cancel,
            accept_task: Mutex::new(Some(accept_task)),
            tracker,
            conns,
        })
    }

    /// Closes the accepting socket and waits for all active inbound
    /// connections to terminate.
    pub(crate) async fn stop(&self) {
        self.cancel.cancel();
        let accept_task = self.accept_task.lock().unwrap().take();
        if let Some(accept_task) = accept_task {
            let _ = accept_task.await;
        }
        self.tracker.close();
        self.tracker.wait().await;
    }

    pub(crate) fn foreach_connection(&self, f: &mut dyn FnMut(&ClientInfo, Stats)) {
        for conn in self.conns.lock().unwrap().values() {
            f(&conn.info, conn.stats.snapshot());
        }
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<ServeCtx>) {
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let ctx = ctx.clone();
                    ctx.tracker.clone().spawn(handle_connection(stream, remote, ctx));
                }
                Err(e) => {
                    warn!(target: "rpc", error = %e, "accept failed");
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, remote: SocketAddr, ctx: Arc<ServeCtx>) {
    let result = match ctx.tls.clone() {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(stream) => serve_connection(stream, remote, ctx).await,
            Err(e) => Err(e.into()),
        },
        None => serve_connection(stream, remote, ctx).await,
    };
    if let Err(e) = result {
        debug!(target: "rpc", %remote, error = %e, "inbound connection closed with error");
    }
}

async fn serve_connection<S>(mut stream: S, remote: SocketAddr, ctx: Arc<ServeCtx>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let offered = utils::read_setup(&mut stream).await?;
    let ours = if ctx.compress { FEATURE_LZ4 } else { 0 };
    let accepted = Setup {
        version: CURRENT_VERSION,
        features: offered.features & ours,
    };
    utils::write_setup(&mut stream, accepted).await?;
    if offered.version != CURRENT_VERSION {
        return Err(Error::VersionMismatch {
            peer: offered.version,
            ours: CURRENT_VERSION,
        });
    }
    let lz4 = accepted.lz4();
    trace!(target: "rpc", %remote, lz4, "inbound connection established");

    let info = Arc::new(ClientInfo {
        remote_addr: remote,
        identity: OnceLock::new(),
    });
    let stats = Arc::new(ConnectionStats::default());
    let conn_id = ctx.next_conn_id.fetch_add(1, Ordering::Relaxed);
    ctx.conns.lock().unwrap().insert(
        conn_id,
        InboundConn {
            info: info.clone(),
            stats: stats.clone(),
        },
    );

    let result = drive_connection(stream, lz4, info, stats, &ctx).await;
    ctx.conns.lock().unwrap().remove(&conn_id);
    result
}

async fn drive_connection<S>(
    stream: S,
    lz4: bool,
    info: Arc<ClientInfo>,
    stats: Arc<ConnectionStats>,
    ctx: &Arc<ServeCtx>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (rd, wr) = tokio::io::split(stream);
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();

    tokio::select! {
        _ = ctx.cancel.cancelled() => Ok(()),
        result = read_requests(rd, lz4, info, stats.clone(), ctx, reply_tx) => result,
        result = write_replies(wr, lz4, stats, reply_rx) => result,
    }
}

async fn read_requests<R>(
    rd: R,
    lz4: bool,
    info: Arc<ClientInfo>,
    stats: Arc<ConnectionStats>,
    ctx: &Arc<ServeCtx>,
    reply_tx: mpsc::UnboundedSender<(u64, Result<Bytes>)>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut rd = FramedRead::new(rd, LengthDelimitedCodec::new());
    loop {
        let Some((header, body, wire_bytes)) =
            utils::read_message::<_, WireRequestHeader>(&mut rd, lz4).await?
        else {
            // Clean close at a message boundary.
            return Ok(());
        };
        stats.on_received(wire_bytes);
        let WireRequestHeader {
            verb,
            request_id,
            no_wait,
        } = header;
        if !no_wait {
            stats.pending.fetch_add(1, Ordering::Relaxed);
        }

        let Some(handler) = ctx.registry.get(verb) else {
            warn!(target: "rpc", %verb, "dropping message with no registered handler");
            if !no_wait {
                let _ = reply_tx.send((request_id, Err(Error::HandlerMissing(verb))));
            }
            continue;
        };

        let cost = request_cost(&ctx.limits, body.len());
        let memory = ctx.memory.clone();
        let info = info.clone();
        let reply_tx = reply_tx.clone();
        ctx.tracker.spawn(async move {
            // Bounds the memory held by in-flight handlers on this listener.
            let _permit = memory.acquire_many_owned(cost).await.ok();
            let result = handler(info, body).await;
            if no_wait {
                if let Err(e) = result {
                    debug!(target: "rpc", %verb, error = %e, "one-way handler failed");
                }
            } else {
                let _ = reply_tx.send((request_id, result));
            }
        });
    }
}

async fn write_replies<W>(
    wr: W,
    lz4: bool,
    stats: Arc<ConnectionStats>,
    mut reply_rx: mpsc::UnboundedReceiver<(u64, Result<Bytes>)>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut wr = FramedWrite::new(wr, LengthDelimitedCodec::new());
    while let Some((request_id, result)) = reply_rx.recv().await {
        let (error, body) = match result {
            Ok(body) => (None, body),
            Err(Error::HandlerMissing(verb)) => (Some(WireError::UnknownVerb(verb)), Bytes::new()),
            Err(e) => {
                stats.exception_received.fetch_add(1, Ordering::Relaxed);
                (Some(WireError::Handler(e.to_string())), Bytes::new())
            }
        };
        let header = WireResponseHeader { request_id, error };
        let wire_bytes = utils::write_message(&mut wr, &header, body, lz4).await?;
        stats.wire_bytes_sent.fetch_add(wire_bytes, Ordering::Relaxed);
        stats.replied.fetch_add(1, Ordering::Relaxed);
        stats.pending.fetch_sub(1, Ordering::Relaxed);
    }
    Ok(())
}

fn request_cost(limits: &ResourceLimits, body_len: usize) -> u32 {
    let cost = limits
        .basic_request_size
        .saturating_add(limits.bloat_factor.saturating_mul(body_len));
    cost.min(limits.max_memory).min(u32::MAX as usize) as u32
}
