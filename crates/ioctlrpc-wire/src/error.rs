use crate::envelope::BufferKind;

/// Errors that can occur while moving envelope bytes.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The peer closed the connection before the declared byte count arrived.
    #[error("connection closed after {received} of {expected} bytes")]
    ConnectionClosed { expected: usize, received: usize },

    /// The underlying read or write call failed.
    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A declared buffer size exceeds the configured bound.
    #[error("{kind} buffer too large ({size} bytes, max {max})")]
    BufferTooLarge {
        kind: BufferKind,
        size: u64,
        max: usize,
    },

    /// A name does not fit in its fixed-size descriptor field.
    #[error("name too long ({len} bytes, max {max})")]
    NameTooLong { len: usize, max: usize },
}

impl WireError {
    /// True when the peer hung up before any byte of the transfer arrived.
    pub fn is_clean_close(&self) -> bool {
        matches!(self, WireError::ConnectionClosed { received: 0, .. })
    }
}

pub type Result<T> = std::result::Result<T, WireError>;
