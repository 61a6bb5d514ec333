//! Exact-size transfers over a blocking stream.
//!
//! Each function either moves exactly the requested number of bytes or
//! reports why it could not: [`WireError::ConnectionClosed`] when the peer
//! hung up early, [`WireError::Io`] when the underlying call failed.
//! Interrupted calls are retried and never surface.

use std::io::{ErrorKind, Read, Write};

use tracing::trace;

use crate::error::{Result, WireError};

const DISCARD_CHUNK_SIZE: usize = 8 * 1024;

/// Result of one underlying `read`/`write` call.
#[derive(Debug)]
enum Step {
    Advanced(usize),
    Closed,
    Retry,
    Failed(std::io::Error),
}

impl Step {
    fn from_call(result: std::io::Result<usize>) -> Self {
        match result {
            Ok(0) => Step::Closed,
            Ok(n) => Step::Advanced(n),
            Err(err) if err.kind() == ErrorKind::Interrupted => Step::Retry,
            Err(err) => Step::Failed(err),
        }
    }
}

/// Read exactly `buf.len()` bytes.
///
/// An empty `buf` succeeds without touching the reader. Never reads past the
/// end of `buf`.
pub fn read_exact<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    if buf.is_empty() {
        return Ok(());
    }

    let expected = buf.len();
    let mut filled = 0usize;
    while filled < expected {
        match Step::from_call(reader.read(&mut buf[filled..])) {
            Step::Advanced(n) => filled += n,
            Step::Retry => continue,
            Step::Closed => {
                return Err(WireError::ConnectionClosed {
                    expected,
                    received: filled,
                })
            }
            Step::Failed(err) => return Err(WireError::Io(err)),
        }
    }

    trace!(size = expected, "read complete");
    Ok(())
}

/// Write exactly `buf.len()` bytes.
///
/// An empty `buf` succeeds without touching the writer. A write call that
/// accepts zero bytes is reported as [`WireError::ConnectionClosed`].
pub fn write_exact<W: Write + ?Sized>(writer: &mut W, buf: &[u8]) -> Result<()> {
    if buf.is_empty() {
        return Ok(());
    }

    let expected = buf.len();
    let mut written = 0usize;
    while written < expected {
        match Step::from_call(writer.write(&buf[written..])) {
            Step::Advanced(n) => written += n,
            Step::Retry => continue,
            Step::Closed => {
                return Err(WireError::ConnectionClosed {
                    expected,
                    received: written,
                })
            }
            Step::Failed(err) => return Err(WireError::Io(err)),
        }
    }

    trace!(size = expected, "write complete");
    Ok(())
}

/// Read and drop exactly `len` bytes.
pub fn discard_exact<R: Read + ?Sized>(reader: &mut R, len: usize) -> Result<()> {
    let mut scratch = [0u8; DISCARD_CHUNK_SIZE];
    let mut remaining = len;
    while remaining > 0 {
        let take = remaining.min(scratch.len());
        read_exact(reader, &mut scratch[..take]).map_err(|err| match err {
            WireError::ConnectionClosed { received, .. } => WireError::ConnectionClosed {
                expected: len,
                received: len - remaining + received,
            },
            other => other,
        })?;
        remaining -= take;
    }
    Ok(())
}
