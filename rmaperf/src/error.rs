//! Error types for rmaperf.

use std::fmt;

use softverbs::WcStatus;

/// Error type for benchmark sessions.
#[derive(Debug)]
pub enum Error {
    /// IO error from the connection provider.
    Io(std::io::Error),
    /// Connection could not be established or was lost.
    Connection(std::io::Error),
    /// Buffer allocation or memory registration failed.
    Registration { region: usize, source: std::io::Error },
    /// Peer announced a different number of MR records.
    CountMismatch { local: u64, remote: u64 },
    /// Malformed MR exchange message.
    Handshake(String),
    /// A work request could not be posted.
    Post {
        op: &'static str,
        source: std::io::Error,
    },
    /// A work request completed with an error status.
    Completion {
        op: &'static str,
        wr_id: u64,
        status: WcStatus,
    },
    /// Termination sentinel did not match.
    UnexpectedSentinel(Vec<u8>),
    /// Invalid configuration.
    InvalidConfig(String),
}

impl Error {
    /// Whether the error means the connection itself is gone, as opposed to
    /// a single request failing.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Error::Connection(_) => true,
            Error::Post { source, .. } | Error::Io(source) => matches!(
                source.kind(),
                std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Connection(e) => write!(f, "Connection error: {}", e),
            Error::Registration { region, source } => {
                write!(f, "Failed to register region {}: {}", region, source)
            }
            Error::CountMismatch { local, remote } => write!(
                f,
                "Inconsistent request count: local {}, remote {}",
                local, remote
            ),
            Error::Handshake(msg) => write!(f, "MR exchange failed: {}", msg),
            Error::Post { op, source } => write!(f, "Failed to post {}: {}", op, source),
            Error::Completion { op, wr_id, status } => {
                write!(f, "Failed {} request {}: {}", op, wr_id, status)
            }
            Error::UnexpectedSentinel(got) => {
                write!(f, "Unexpected termination message: {:02x?}", got)
            }
            Error::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) | Error::Connection(e) => Some(e),
            Error::Registration { source, .. } | Error::Post { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type for rmaperf operations.
pub type Result<T> = std::result::Result<T, Error>;
