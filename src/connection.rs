//! Outbound RPC connections.
//!
//! A [`ClientConn`] owns one long-lived connection to a peer: the socket
//! (plain or TLS), its keepalive schedule, the negotiated compressor, a
//! sticky error flag and per-connection stats. Opening is non-blocking;
//! messages handed over before the dial completes are queued and flushed
//! once the connection is ready. In-flight requests are correlated to
//! responses by request id, so responses may resolve out of order.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use rustls::pki_types::ServerName;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::utils::{self, Setup, WireError, WireRequestHeader, WireResponseHeader, FEATURE_LZ4};
use crate::verb::{Verb, CURRENT_VERSION};

// Probe an idle connection each minute, drop it after 10 failed probes.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
#[cfg(not(windows))]
const KEEPALIVE_RETRIES: u32 = 10;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Bytes>>>>>;

/// Point-in-time counters of one connection.
#[derive(Clone, Copy, Debug, Default)]
pub struct Stats {
    pub sent_messages: u64,
    pub replied: u64,
    pub exception_received: u64,
    pub timeout: u64,
    pub pending: u64,
    pub wire_bytes_sent: u64,
    pub wire_bytes_received: u64,
}

#[derive(Default)]
pub(crate) struct ConnectionStats {
    pub(crate) sent_messages: AtomicU64,
    pub(crate) replied: AtomicU64,
    pub(crate) exception_received: AtomicU64,
    pub(crate) timeout: AtomicU64,
    pub(crate) pending: AtomicU64,
    pub(crate) wire_bytes_sent: AtomicU64,
    pub(crate) wire_bytes_received: AtomicU64,
}

impl ConnectionStats {
    pub(crate) fn snapshot(&self) -> Stats {
        Stats {
            sent_messages: self.sent_messages.load(Ordering::Relaxed),
            replied: self.replied.load(Ordering::Relaxed),
            exception_received: self.exception_received.load(Ordering::Relaxed),
            timeout: self.timeout.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
            wire_bytes_sent: self.wire_bytes_sent.load(Ordering::Relaxed),
            wire_bytes_received: self.wire_bytes_received.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn on_sent(&self) {
        self.sent_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_received(&self, wire_bytes: u64) {
        self.wire_bytes_received.fetch_add(wire_bytes, Ordering::Relaxed);
    }
}

/// Options applied when opening an outbound connection.
pub(crate) struct ConnectOptions {
    pub compress: bool,
    pub tls: Option<(Arc<rustls::ClientConfig>, ServerName<'static>)>,
}

struct Outbound {
    header: WireRequestHeader,
    body: Bytes,
}

pub(crate) struct ClientConn {
    error: Arc<AtomicBool>,
    stats: Arc<ConnectionStats>,
    next_request_id: AtomicU64,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    pending: PendingMap,
    cancel: CancellationToken,
    io_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientConn {
    /// Opens a connection to `remote_addr`, binding locally to
    /// `local_addr`. Returns immediately; the dial happens in the
    /// background and sends issued before readiness are queued.
    pub(crate) fn open(
        remote_addr: SocketAddr,
        local_addr: IpAddr,
        opts: ConnectOptions,
    ) -> Arc<ClientConn> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let error = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(ConnectionStats::default());
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let io_task = tokio::spawn(run_connection(
            remote_addr,
            local_addr,
            opts,
            error.clone(),
            stats.clone(),
            pending.clone(),
            cancel.clone(),
            outbound_rx,
        ));

        Arc::new(ClientConn {
            error,
            stats,
            next_request_id: AtomicU64::new(1),
            outbound_tx,
            pending,
            cancel,
            io_task: Mutex::new(Some(io_task)),
        })
    }

    /// True once any fatal I/O error has been observed; stays true.
    pub(crate) fn error(&self) -> bool {
        self.error.load(Ordering::Relaxed)
    }

    pub(crate) fn stats(&self) -> Stats {
        self.stats.snapshot()
    }

    /// Hands a one-way message to the transport. Completes on hand-off,
    /// not on peer acknowledgment.
    pub(crate) fn send_oneway(&self, verb: Verb, body: Bytes) -> Result<()> {
        if self.error() {
            return Err(Error::closed("connection is in error state"));
        }
        let header = WireRequestHeader {
            verb,
            request_id: self.next_request_id.fetch_add(1, Ordering::Relaxed),
            no_wait: true,
        };
        self.outbound_tx
            .send(Outbound { header, body })
            .map_err(|_| Error::closed("connection stopped"))?;
        self.stats.on_sent();
        Ok(())
    }

    /// Sends a request and waits for the peer's reply, optionally bounded
    /// by `timeout`.
    pub(crate) async fn send_request(
        &self,
        verb: Verb,
        body: Bytes,
        timeout: Option<Duration>,
    ) -> Result<Bytes> {
        if self.error() {
            return Err(Error::closed("connection is in error state"));
        }
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(request_id, reply_tx);
        self.stats.pending.fetch_add(1, Ordering::Relaxed);

        let header = WireRequestHeader {
            verb,
            request_id,
            no_wait: false,
        };
        if self.outbound_tx.send(Outbound { header, body }).is_err() {
            self.pending.lock().unwrap().remove(&request_id);
            self.stats.pending.fetch_sub(1, Ordering::Relaxed);
            return Err(Error::closed("connection stopped"));
        }
        self.stats.on_sent();

        let reply = match timeout {
            Some(deadline) => match tokio::time::timeout(deadline, reply_rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.pending.lock().unwrap().remove(&request_id);
                    self.stats.timeout.fetch_add(1, Ordering::Relaxed);
                    self.stats.pending.fetch_sub(1, Ordering::Relaxed);
                    return Err(Error::Timeout(deadline));
                }
            },
            None => reply_rx.await,
        };
        self.stats.pending.fetch_sub(1, Ordering::Relaxed);
        match reply {
            Ok(Ok(body)) => {
                self.stats.replied.fetch_add(1, Ordering::Relaxed);
                Ok(body)
            }
            Ok(Err(e)) => {
                self.stats.exception_received.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
            // The io task exited without answering.
            Err(_) => Err(Error::closed("connection stopped")),
        }
    }

    /// Orderly close; resolves once the socket is fully released.
    pub(crate) async fn stop(&self) {
        self.cancel.cancel();
        let io_task = self.io_task.lock().unwrap().take();
        if let Some(io_task) = io_task {
            let _ = io_task.await;
        }
    }
}

impl Drop for ClientConn {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_connection(
    remote_addr: SocketAddr,
    local_addr: IpAddr,
    opts: ConnectOptions,
    error: Arc<AtomicBool>,
    stats: Arc<ConnectionStats>,
    pending: PendingMap,
    cancel: CancellationToken,
    outbound_rx: mpsc::UnboundedReceiver<Outbound>,
) {
    let result = tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        result = dial_and_serve(remote_addr, local_addr, opts, stats.clone(), pending.clone(), outbound_rx) => result,
    };

    // The serve future (and with it the outbound receiver) is gone by now,
    // so every send issued from here on fails at hand-off; draining the
    // pending map below therefore cannot strand a later request.
    let reason = match &result {
        Ok(()) => "connection stopped".to_string(),
        Err(e) => {
            error.store(true, Ordering::Relaxed);
            debug!(remote = %remote_addr, error = %e, "connection failed");
            e.to_string()
        }
    };
    let waiters: Vec<_> = {
        let mut pending = pending.lock().unwrap();
        pending.drain().map(|(_, tx)| tx).collect()
    };
    for tx in waiters {
        let _ = tx.send(Err(Error::closed(reason.clone())));
    }
}

async fn dial_and_serve(
    remote_addr: SocketAddr,
    local_addr: IpAddr,
    opts: ConnectOptions,
    stats: Arc<ConnectionStats>,
    pending: PendingMap,
    outbound_rx: mpsc::UnboundedReceiver<Outbound>,
) -> Result<()> {
    let socket = match remote_addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.bind(SocketAddr::new(local_addr, 0))?;
    let stream = socket.connect(remote_addr).await?;

    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_IDLE)
        .with_interval(KEEPALIVE_INTERVAL);
    #[cfg(not(windows))]
    let keepalive = keepalive.with_retries(KEEPALIVE_RETRIES);
    SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
    stream.set_nodelay(true)?;

    match opts.tls {
        Some((config, server_name)) => {
            let stream = TlsConnector::from(config)
                .connect(server_name, stream)
                .await?;
            serve(stream, opts.compress, stats, pending, outbound_rx).await
        }
        None => serve(stream, opts.compress, stats, pending, outbound_rx).await,
    }
}

async fn serve<S>(
    mut stream: S,
    compress: bool,
    stats: Arc<ConnectionStats>,
    pending: PendingMap,
    outbound_rx: mpsc::UnboundedReceiver<Outbound>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let offered = if compress { FEATURE_LZ4 } else { 0 };
    utils::write_setup(
        &mut stream,
        Setup {
            version: CURRENT_VERSION,
            features: offered,
        },
    )
    .await?;
    let accepted = utils::read_setup(&mut stream).await?;
    if accepted.version != CURRENT_VERSION {
        return Err(Error::VersionMismatch {
            peer: accepted.version,
            ours: CURRENT_VERSION,
        });
    }
    let lz4 = compress && accepted.lz4();
    trace!(target: "rpc", lz4, "outbound connection established");

    let (rd, wr) = tokio::io::split(stream);
    tokio::select! {
        result = write_loop(wr, outbound_rx, stats.clone(), lz4) => result,
        result = read_loop(rd, pending, stats, lz4) => result,
    }
}

async fn write_loop<W>(
    wr: W,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    stats: Arc<ConnectionStats>,
    lz4: bool,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut wr = FramedWrite::new(wr, LengthDelimitedCodec::new());
    while let Some(Outbound { header, body }) = outbound_rx.recv().await {
        let wire_bytes = utils::write_message(&mut wr, &header, body, lz4).await?;
        stats.wire_bytes_sent.fetch_add(wire_bytes, Ordering::Relaxed);
    }
    // All senders gone: the connection was dropped without stop().
    Ok(())
}

async fn read_loop<R>(
    rd: R,
    pending: PendingMap,
    stats: Arc<ConnectionStats>,
    lz4: bool,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut rd = FramedRead::new(rd, LengthDelimitedCodec::new());
    loop {
        match utils::read_message::<_, WireResponseHeader>(&mut rd, lz4).await? {
            None => return Err(Error::closed("connection closed by peer")),
            Some((header, body, wire_bytes)) => {
                stats.on_received(wire_bytes);
                complete(&pending, header, body);
            }
        }
    }
}

fn complete(pending: &PendingMap, header: WireResponseHeader, body: Bytes) {
    let waiter = pending.lock().unwrap().remove(&header.request_id);
    match waiter {
        Some(reply_tx) => {
            let result = match header.error {
                None => Ok(body),
                Some(WireError::UnknownVerb(verb)) => Err(Error::HandlerMissing(verb)),
                Some(WireError::Handler(message)) => Err(Error::Server(message)),
            };
            let _ = reply_tx.send(result);
        }
        // The request already timed out on our side.
        None => trace!(target: "rpc", request_id = header.request_id, "late response"),
    }
}
