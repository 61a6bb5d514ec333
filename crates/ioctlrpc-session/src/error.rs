use ioctlrpc_transport::TransportError;
use ioctlrpc_wire::{BufferKind, WireError};

/// Errors that can occur in a request/response cycle.
///
/// These are channel failures. A command that ran and failed is reported
/// through its return code, never through this type.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Transport-level error, including descriptor hand-off.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Short transfer, I/O failure or size violation on the byte stream.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// A buffer for an incoming request could not be allocated.
    #[error("failed to allocate {size} byte {kind} buffer")]
    Allocation { kind: BufferKind, size: usize },

    /// A declared size does not fit the buffer that should hold it.
    #[error("{kind} buffer holds {capacity} bytes but {declared} are declared")]
    BufferTooSmall {
        kind: BufferKind,
        declared: u64,
        capacity: usize,
    },

    /// The peer closed the connection cleanly between requests.
    #[error("peer closed the connection")]
    Closed,
}

impl SessionError {
    /// True when the peer hung up, cleanly or mid-message.
    pub fn is_connection_closed(&self) -> bool {
        matches!(
            self,
            SessionError::Closed
                | SessionError::Wire(WireError::ConnectionClosed { .. })
                | SessionError::Transport(TransportError::DescriptorChannelClosed)
        )
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
