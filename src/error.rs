//! Error types for bulkmq.

use std::io;

use crate::Peid;

/// Queue operation errors.
#[derive(Debug)]
pub enum Error {
    /// The receiver rank is outside the communicator's rank range.
    InvalidReceiver {
        /// The rank that was requested.
        receiver: Peid,
        /// Number of ranks in the group.
        comm_size: Peid,
    },
    /// A send was posted after the queue finished terminating.
    QueueTerminating,
    /// A single message does not fit within the configured maximum length.
    BufferOverflow {
        /// Encoded length of the offending message, in buffer elements.
        message_len: usize,
        /// Configured maximum, in buffer elements.
        max_len: usize,
    },
    /// IO error from the underlying transport. The queue is left in an
    /// unspecified state and must be torn down.
    Transport(io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidReceiver { receiver, comm_size } => {
                write!(f, "receiver rank {} not in [0, {})", receiver, comm_size)
            }
            Error::QueueTerminating => write!(f, "queue is terminating, no new sends accepted"),
            Error::BufferOverflow { message_len, max_len } => {
                write!(f, "message of {} elements exceeds maximum of {}", message_len, max_len)
            }
            Error::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Transport(e)
    }
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, Error>;
