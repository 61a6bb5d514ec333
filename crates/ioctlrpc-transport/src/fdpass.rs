//! File descriptor hand-off over a Unix domain stream socket.
//!
//! A descriptor travels as `SCM_RIGHTS` ancillary data attached to a single
//! marker byte. On a stream socket the kernel never merges a read across the
//! skb carrying the rights, so the receiver must consume every preceding
//! byte of the message with plain reads and then call [`recv_fd`] for the
//! marker. Reading the marker with a plain `read` would drop the descriptor.

use std::io::ErrorKind;
use std::mem::{size_of, size_of_val};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use tracing::{debug, trace};

use crate::error::{Result, TransportError};
use crate::traits::IpcStream;

/// Byte carried in the main stream alongside the ancillary descriptor.
pub const DESCRIPTOR_MARKER: u8 = b'F';

const MAX_RECV_FDS: usize = 4;

#[repr(C)]
struct CmsgScmRights<const N: usize> {
    hdr: libc::cmsghdr,
    fds: [RawFd; N],
}

/// Sending and receiving one open descriptor as ancillary data.
///
/// Implemented for every socket-backed stream in this crate. Session code is
/// generic over this trait so the hand-off can be observed in tests.
pub trait DescriptorTransfer {
    /// Send `fd` to the peer. The local copy stays open and owned by the caller.
    fn send_descriptor(&mut self, fd: RawFd) -> Result<()>;

    /// Receive one descriptor from the peer. The returned descriptor is owned
    /// by the caller and closed on drop.
    fn receive_descriptor(&mut self) -> Result<OwnedFd>;
}

impl DescriptorTransfer for IpcStream {
    fn send_descriptor(&mut self, fd: RawFd) -> Result<()> {
        send_fd(self.as_fd(), fd)
    }

    fn receive_descriptor(&mut self) -> Result<OwnedFd> {
        recv_fd(self.as_fd())
    }
}

impl DescriptorTransfer for std::os::unix::net::UnixStream {
    fn send_descriptor(&mut self, fd: RawFd) -> Result<()> {
        send_fd(self.as_fd(), fd)
    }

    fn receive_descriptor(&mut self) -> Result<OwnedFd> {
        recv_fd(self.as_fd())
    }
}

impl<T: DescriptorTransfer + ?Sized> DescriptorTransfer for &mut T {
    fn send_descriptor(&mut self, fd: RawFd) -> Result<()> {
        (**self).send_descriptor(fd)
    }

    fn receive_descriptor(&mut self) -> Result<OwnedFd> {
        (**self).receive_descriptor()
    }
}

/// Send `fd` over `socket` as `SCM_RIGHTS` attached to [`DESCRIPTOR_MARKER`].
///
/// An invalid or closed `fd` is reported by the kernel (`EBADF`) as
/// [`TransportError::DescriptorTransfer`].
// `cmsghdr` field types differ between gnu, musl and BSD targets.
#[allow(clippy::needless_update, clippy::useless_conversion, clippy::unnecessary_cast)]
pub fn send_fd(socket: BorrowedFd<'_>, fd: RawFd) -> Result<()> {
    let mut marker = [DESCRIPTOR_MARKER];
    let mut cmsg = CmsgScmRights::<1> {
        hdr: libc::cmsghdr {
            cmsg_level: libc::SOL_SOCKET,
            cmsg_type: libc::SCM_RIGHTS,
            cmsg_len: (size_of::<libc::cmsghdr>() + size_of::<RawFd>()) as _,
            ..{
                // SAFETY: type has no invariants
                unsafe { std::mem::zeroed() }
            }
        },
        fds: [fd],
    };

    let mut iov = libc::iovec {
        iov_base: marker.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: marker.len(),
    };

    // SAFETY: type has no invariants
    let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
    hdr.msg_iov = &mut iov;
    hdr.msg_iovlen = 1;
    hdr.msg_control = std::ptr::from_mut(&mut cmsg).cast::<libc::c_void>();
    hdr.msg_controllen = cmsg.hdr.cmsg_len as _;

    #[cfg(target_os = "linux")]
    let flags = libc::MSG_NOSIGNAL;
    #[cfg(not(target_os = "linux"))]
    let flags = 0;

    loop {
        // SAFETY: `hdr` points at `iov` and `cmsg`, both alive for the call and
        // sized as declared; `socket` is an open descriptor borrowed for the call.
        let n = unsafe { libc::sendmsg(socket.as_raw_fd(), &hdr, flags) };
        if n > 0 {
            debug!(fd, "sent descriptor");
            return Ok(());
        }
        if n == 0 {
            return Err(TransportError::DescriptorTransfer(std::io::Error::from(
                ErrorKind::WriteZero,
            )));
        }
        let err = std::io::Error::last_os_error();
        if err.kind() == ErrorKind::Interrupted {
            continue;
        }
        return Err(TransportError::DescriptorTransfer(err));
    }
}

/// Receive one descriptor sent with [`send_fd`] from `socket`.
///
/// Extra descriptors in the same control message are closed. On Linux the
/// received descriptor is opened with `O_CLOEXEC`.
#[allow(clippy::unnecessary_cast)]
pub fn recv_fd(socket: BorrowedFd<'_>) -> Result<OwnedFd> {
    let mut marker = [0u8; 1];
    // SAFETY: type has no invariants
    let mut cmsg: CmsgScmRights<MAX_RECV_FDS> = unsafe { std::mem::zeroed() };

    let mut iov = libc::iovec {
        iov_base: marker.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: marker.len(),
    };

    // SAFETY: type has no invariants
    let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
    hdr.msg_iov = &mut iov;
    hdr.msg_iovlen = 1;
    hdr.msg_control = std::ptr::from_mut(&mut cmsg).cast::<libc::c_void>();
    hdr.msg_controllen = size_of_val(&cmsg) as _;

    #[cfg(target_os = "linux")]
    let flags = libc::MSG_CMSG_CLOEXEC;
    #[cfg(not(target_os = "linux"))]
    let flags = 0;

    let n = loop {
        // SAFETY: `hdr` points at `iov` and `cmsg`, both alive for the call and
        // sized as declared; `socket` is an open descriptor borrowed for the call.
        let n = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut hdr, flags) };
        if n >= 0 {
            break n;
        }
        let err = std::io::Error::last_os_error();
        if err.kind() == ErrorKind::Interrupted {
            continue;
        }
        return Err(TransportError::DescriptorTransfer(err));
    };

    if n == 0 {
        return Err(TransportError::DescriptorChannelClosed);
    }

    let fd_count = if hdr.msg_controllen as usize > 0
        && cmsg.hdr.cmsg_level == libc::SOL_SOCKET
        && cmsg.hdr.cmsg_type == libc::SCM_RIGHTS
    {
        ((cmsg.hdr.cmsg_len as usize).saturating_sub(size_of::<libc::cmsghdr>())
            / size_of::<RawFd>())
        .min(MAX_RECV_FDS)
    } else {
        0
    };

    let mut received: Vec<OwnedFd> = cmsg.fds[..fd_count]
        .iter()
        // SAFETY: the kernel installed these descriptors in our table for this
        // message; nothing else owns them.
        .map(|raw| unsafe { OwnedFd::from_raw_fd(*raw) })
        .collect();

    if hdr.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(TransportError::DescriptorTransfer(std::io::Error::new(
            ErrorKind::InvalidData,
            "ancillary data truncated",
        )));
    }

    if marker[0] != DESCRIPTOR_MARKER {
        trace!(marker = marker[0], "unexpected descriptor marker byte");
    }

    if received.is_empty() {
        return Err(TransportError::MissingDescriptor);
    }
    if received.len() > 1 {
        debug!(extra = received.len() - 1, "closing surplus received descriptors");
        received.truncate(1);
    }

    let fd = received.remove(0);
    #[cfg(not(target_os = "linux"))]
    set_cloexec(&fd);

    debug!(fd = fd.as_raw_fd(), "received descriptor");
    Ok(fd)
}

#[cfg(not(target_os = "linux"))]
fn set_cloexec(fd: &OwnedFd) {
    // SAFETY: `fd` is an open descriptor owned by this process.
    unsafe {
        let flags = libc::fcntl(fd.as_raw_fd(), libc::F_GETFD);
        if flags >= 0 {
            libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, flags | libc::FD_CLOEXEC);
        }
    }
}
