//! Error types for registry operations.

use crate::member::MemberHandle;
use crate::transport::TransportError;
use std::fmt;

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during registry operations.
#[derive(Debug)]
pub enum Error {
    /// No member of the queried group produced a response before the
    /// deadline.
    NotFound,

    /// The member handle refers to a member that has already been dropped.
    MemberClosed {
        /// The stale handle.
        member: MemberHandle,
    },

    /// The member handle is owned by another node. Joins and leaves are
    /// only accepted for members registered on the local node.
    NotLocal {
        /// The foreign handle.
        member: MemberHandle,
    },

    /// Group name exceeds the configured maximum length.
    GroupNameTooLong {
        /// Length of the name in bytes.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },

    /// Payload exceeds the configured maximum size.
    PayloadTooLarge {
        /// Size of the payload in bytes.
        size: usize,
        /// Maximum allowed size.
        max_size: usize,
    },

    /// The registry has been shut down.
    Shutdown,

    /// Internal channel error.
    Channel(String),

    /// Transport operation failed.
    Transport(TransportError),

    /// Generic IO error.
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound => {
                write!(f, "no group member answered before the deadline")
            }
            Error::MemberClosed { member } => {
                write!(f, "member {} is closed", member)
            }
            Error::NotLocal { member } => {
                write!(f, "member {} is not owned by this node", member)
            }
            Error::GroupNameTooLong { len, max } => {
                write!(
                    f,
                    "group name length ({} bytes) exceeds maximum ({} bytes)",
                    len, max
                )
            }
            Error::PayloadTooLarge { size, max_size } => {
                write!(
                    f,
                    "payload size ({} bytes) exceeds maximum ({} bytes)",
                    size, max_size
                )
            }
            Error::Shutdown => {
                write!(f, "registry has been shut down")
            }
            Error::Channel(msg) => {
                write!(f, "channel error: {}", msg)
            }
            Error::Transport(err) => {
                write!(f, "transport error: {}", err)
            }
            Error::Io(err) => {
                write!(f, "IO error: {}", err)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(err) => Some(err),
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Error::Transport(err)
    }
}

impl<T> From<async_channel::SendError<T>> for Error {
    fn from(err: async_channel::SendError<T>) -> Self {
        Error::Channel(err.to_string())
    }
}

impl From<async_channel::RecvError> for Error {
    fn from(err: async_channel::RecvError) -> Self {
        Error::Channel(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeId;

    fn handle() -> MemberHandle {
        let addr = "127.0.0.1:9000".parse().unwrap();
        MemberHandle::new(NodeId::new(addr, 3), 12)
    }

    #[test]
    fn test_error_display() {
        let err = Error::PayloadTooLarge {
            size: 100000,
            max_size: 65536,
        };
        assert!(err.to_string().contains("100000"));
        assert!(err.to_string().contains("65536"));

        let err = Error::NotLocal { member: handle() };
        assert!(err.to_string().contains("not owned"));

        assert!(Error::NotFound.to_string().contains("deadline"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_error_source() {
        let err = Error::Transport(TransportError::Closed);
        assert!(std::error::Error::source(&err).is_some());
        assert!(std::error::Error::source(&Error::Shutdown).is_none());
    }
}
