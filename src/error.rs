use std::io;
use thiserror::Error;

/// Error taxonomy for the proxy core.
///
/// Only `WouldBlock` and `BufferFull` are recoverable; everything else ends
/// the session that raised it (never the worker).
#[derive(Error, Debug)]
pub enum ProxyError {
    /// The peer closed its end of the connection (recv returned 0).
    #[error("peer shutdown")]
    PeerShutdown,

    /// The peer reset the connection.
    #[error("peer reset")]
    PeerReset,

    /// The socket operation would block; retry on the next readiness event.
    #[error("operation would block")]
    WouldBlock,

    /// No room left in the receiving ring.
    #[error("buffer full")]
    BufferFull,

    /// The request or response head failed to parse.
    #[error("malformed message head: {reason}")]
    MalformedHead { reason: &'static str },

    /// The message body violated its declared framing.
    #[error("malformed message body: {reason}")]
    MalformedBody { reason: &'static str },

    /// Connecting to the origin server failed.
    #[error("upstream connect failed: {source}")]
    UpstreamConnectFailed {
        #[source]
        source: io::Error,
    },

    /// The Host header did not resolve to an IPv4 address.
    #[error("host resolution failed: {host}")]
    ResolveFailed { host: String },

    /// The per-worker session pool has no free slot.
    #[error("session pool exhausted")]
    PoolExhausted,

    /// Unexpected session state.
    #[error("fatal session state: {message}")]
    Fatal { message: String },

    /// Any other socket-level failure.
    #[error("io error: {source}")]
    Io {
        #[source]
        source: io::Error,
    },
}

impl ProxyError {
    pub fn malformed_head(reason: &'static str) -> Self {
        Self::MalformedHead { reason }
    }

    pub fn malformed_body(reason: &'static str) -> Self {
        Self::MalformedBody { reason }
    }

    pub fn resolve_failed<S: Into<String>>(host: S) -> Self {
        Self::ResolveFailed { host: host.into() }
    }

    pub fn fatal<S: Into<String>>(message: S) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// A recoverable error suspends the watcher in the stalled direction;
    /// it does not terminate the session.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ProxyError::WouldBlock | ProxyError::BufferFull)
    }
}

impl From<io::Error> for ProxyError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => ProxyError::WouldBlock,
            io::ErrorKind::ConnectionReset | io::ErrorKind::NotConnected => ProxyError::PeerReset,
            _ => ProxyError::Io { source: err },
        }
    }
}

/// Result type alias for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;
