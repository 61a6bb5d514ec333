use std::time::Duration;

use ioctlrpc_transport::{IpcStream, TransportError};

use crate::envelope::BufferKind;
use crate::error::{Result, WireError};

/// Default upper bound for any declared buffer size: 16 MiB.
pub const DEFAULT_MAX_BUFFER: usize = 16 * 1024 * 1024;

/// Configuration shared by both session endpoints.
#[derive(Debug, Clone)]
pub struct WireConfig {
    /// Largest size accepted for any single declared buffer. Default: 16 MiB.
    pub max_buffer_size: usize,
    /// Read timeout for blocking operations. `None` blocks indefinitely.
    pub read_timeout: Option<Duration>,
    /// Write timeout for blocking operations. `None` blocks indefinitely.
    pub write_timeout: Option<Duration>,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: DEFAULT_MAX_BUFFER,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

impl WireConfig {
    /// Validate a declared size against `max_buffer_size`.
    pub fn check_size(&self, kind: BufferKind, size: u64) -> Result<usize> {
        match usize::try_from(size) {
            Ok(len) if len <= self.max_buffer_size => Ok(len),
            _ => Err(WireError::BufferTooLarge {
                kind,
                size,
                max: self.max_buffer_size,
            }),
        }
    }

    /// Apply the configured timeouts to a connected stream.
    pub fn apply(&self, stream: &IpcStream) -> Result<()> {
        stream
            .set_read_timeout(self.read_timeout)
            .map_err(transport_to_wire_error)?;
        stream
            .set_write_timeout(self.write_timeout)
            .map_err(transport_to_wire_error)
    }
}

fn transport_to_wire_error(err: TransportError) -> WireError {
    match err {
        TransportError::Io(io) | TransportError::Accept(io) => WireError::Io(io),
        TransportError::Bind { source, .. } | TransportError::Connect { source, .. } => {
            WireError::Io(source)
        }
        other => WireError::Io(std::io::Error::other(other.to_string())),
    }
}
