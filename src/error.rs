use std::time::Duration;

use crate::verb::Verb;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the messaging service.
///
/// The send pipeline recovers from exactly one of these locally: a
/// [`Error::Closed`] evicts the affected connection so the next call
/// rebuilds it. Everything else is reported upward unchanged.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The transport closed underneath an in-flight request.
    #[error("connection closed: {0}")]
    Closed(String),

    /// The per-request deadline elapsed before the peer replied.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The remote handler failed; the error text is peer-supplied.
    #[error("remote handler error: {0}")]
    Server(String),

    /// The send was issued after `stop()` began.
    #[error("messaging service is stopping")]
    Stopping,

    /// The peer has no handler registered for this verb.
    #[error("no handler registered for verb {0}")]
    HandlerMissing(Verb),

    /// A handler is already registered for this verb.
    #[error("handler already registered for verb {0}")]
    HandlerExists(Verb),

    /// A retry sleep was aborted, normally by service shutdown.
    #[error("retry aborted: {0}")]
    Aborted(String),

    /// The peer speaks an incompatible protocol version.
    #[error("protocol version mismatch: peer speaks {peer}, we speak {ours}")]
    VersionMismatch { peer: i32, ours: i32 },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("codec error: {0}")]
    Codec(String),
}

impl Error {
    pub(crate) fn closed(reason: impl Into<String>) -> Self {
        Error::Closed(reason.into())
    }

    /// True for transport-closure failures, the only kind the retry
    /// primitive keeps retrying on.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed(_))
    }
}
