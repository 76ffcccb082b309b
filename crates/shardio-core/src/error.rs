//! Error types for the shardio engine

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Result type for engine-level operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors returned by `Engine::start` and `Engine::shutdown`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An address could not be bound. No worker was started.
    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Configuration rejected by validation.
    #[error("invalid config: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// `start()` was called on a running engine.
    #[error("engine already started")]
    AlreadyStarted,

    /// The engine has been shut down and cannot be restarted.
    #[error("engine stopped")]
    Stopped,

    /// Shutdown did not drain in time; the remainder was force-closed.
    #[error("shutdown deadline exceeded, {remaining} connections force-closed")]
    DeadlineExceeded { remaining: usize },

    /// Failed to create a readiness context, notifier or socket.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to spawn a worker or acceptor thread.
    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
}

impl EngineError {
    /// Whether this is a bind failure.
    pub fn is_bind(&self) -> bool {
        matches!(self, EngineError::Bind { .. })
    }
}

/// Errors returned by `Conn::write` and `Conn::close`.
#[derive(Debug, Error)]
pub enum ConnError {
    /// The connection is closing or closed; nothing was written.
    #[error("connection closed")]
    ConnectionClosed,

    /// `close()` was already called (or the engine closed the connection).
    #[error("connection already closed")]
    AlreadyClosed,

    /// The socket write failed. The connection is now closing.
    #[error("write failed: {0}")]
    Write(#[source] io::Error),

    /// Queuing the payload would exceed the per-connection write limit.
    #[error("write buffer full ({queued} bytes queued, limit {limit})")]
    BufferFull { queued: usize, limit: usize },
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0}")]
    InvalidValue(&'static str),

    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    #[error("unknown network {0:?} (expected tcp, udp or unix)")]
    UnknownNetwork(String),
}

/// Why a connection was closed; delivered to the close hook exactly once.
#[derive(Debug, Clone, Error)]
pub enum CloseReason {
    /// The peer closed its side cleanly (zero-length read).
    #[error("peer closed")]
    PeerClosed,

    /// `Conn::close()` was called.
    #[error("closed locally")]
    Local,

    /// A read, write or readiness error.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// Closed during a graceful drain.
    #[error("engine shutdown")]
    Shutdown,

    /// Still open when the shutdown deadline expired.
    #[error("forced shutdown")]
    ForcedShutdown,

    /// A datagram session saw no traffic for the configured idle timeout.
    #[error("idle timeout")]
    IdleTimeout,
}

impl CloseReason {
    pub fn io(err: io::Error) -> Self {
        CloseReason::Io(Arc::new(err))
    }

    /// Clean disconnects, as opposed to failures.
    pub fn is_clean(&self) -> bool {
        matches!(
            self,
            CloseReason::PeerClosed | CloseReason::Local | CloseReason::Shutdown
        )
    }

    /// The underlying I/O error kind, if any.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            CloseReason::Io(e) => Some(e.kind()),
            _ => None,
        }
    }
}

impl From<io::Error> for CloseReason {
    fn from(e: io::Error) -> Self {
        CloseReason::io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = EngineError::DeadlineExceeded { remaining: 3 };
        assert_eq!(format!("{}", e), "shutdown deadline exceeded, 3 connections force-closed");

        let e = EngineError::Bind {
            addr: "127.0.0.1:80".into(),
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        assert!(e.is_bind());
        assert!(format!("{}", e).starts_with("bind 127.0.0.1:80: "));
    }

    #[test]
    fn test_config_error_conversion() {
        let e: EngineError = ConfigError::InvalidValue("num_workers must be > 0").into();
        assert!(matches!(e, EngineError::InvalidConfig(ConfigError::InvalidValue(_))));
        assert_eq!(format!("{}", e), "invalid config: num_workers must be > 0");
    }

    #[test]
    fn test_close_reason_classification() {
        assert!(CloseReason::PeerClosed.is_clean());
        assert!(CloseReason::Local.is_clean());
        assert!(CloseReason::Shutdown.is_clean());
        assert!(!CloseReason::ForcedShutdown.is_clean());
        assert!(!CloseReason::IdleTimeout.is_clean());

        let r: CloseReason = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert!(!r.is_clean());
        assert_eq!(r.io_kind(), Some(io::ErrorKind::ConnectionReset));
        assert_eq!(format!("{}", CloseReason::PeerClosed), "peer closed");
    }
}
