//! Unix domain socket transport for the ioctl channel.
//!
//! This is the lowest layer of ioctlrpc. It provides:
//! - [`UnixDomainSocket`] for binding, accepting and connecting
//! - [`IpcStream`], the connected blocking byte-stream handle
//! - [`DescriptorTransfer`], hand-off of one open file descriptor as
//!   `SCM_RIGHTS` ancillary data alongside the byte stream
//!
//! Everything else builds on top of the [`IpcStream`] type provided here.

pub mod error;
pub mod traits;

#[cfg(unix)]
pub mod fdpass;
#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use traits::IpcStream;

#[cfg(unix)]
pub use fdpass::{recv_fd, send_fd, DescriptorTransfer, DESCRIPTOR_MARKER};
#[cfg(unix)]
pub use uds::{UnixDomainSocket, DEFAULT_SOCKET_PATH};
