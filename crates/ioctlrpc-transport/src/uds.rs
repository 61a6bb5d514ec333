use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::traits::IpcStream;

/// Well-known path the command daemon listens on.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/uzfs.sock";

/// Only the daemon's owner may issue commands.
const SOCKET_MODE: u32 = 0o600;

/// Capacity of `sockaddr_un.sun_path`, NUL terminator included.
const SUN_PATH_MAX: usize = if cfg!(target_os = "linux") { 108 } else { 104 };

/// The daemon's listening socket.
///
/// The socket file is unlinked on drop as long as the path still names the
/// socket created by [`UnixDomainSocket::bind`].
#[derive(Debug)]
pub struct UnixDomainSocket {
    listener: UnixListener,
    path: PathBuf,
    /// `(dev, ino)` of the socket file created at bind.
    identity: (u64, u64),
}

impl UnixDomainSocket {
    /// Bind the daemon socket at `path`, owner-only.
    ///
    /// A socket left behind by an earlier daemon is replaced. Any other kind
    /// of file at `path` is an error.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let len = path.as_os_str().len();
        if len >= SUN_PATH_MAX {
            return Err(TransportError::PathTooLong {
                path: path.to_path_buf(),
                len,
                max: SUN_PATH_MAX,
            });
        }

        let bind_err = |source: io::Error| TransportError::Bind {
            path: path.to_path_buf(),
            source,
        };

        remove_stale_socket(path).map_err(bind_err)?;
        let listener = UnixListener::bind(path).map_err(bind_err)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE))
            .map_err(bind_err)?;
        let identity = socket_identity(path).map_err(bind_err)?;

        info!(?path, "command daemon listening");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            identity,
        })
    }

    /// Bind the daemon socket at [`DEFAULT_SOCKET_PATH`].
    pub fn bind_default() -> Result<Self> {
        Self::bind(DEFAULT_SOCKET_PATH)
    }

    /// Wait for the next client. Interrupted `accept` calls are retried.
    pub fn accept(&self) -> Result<IpcStream> {
        let stream = loop {
            match self.listener.accept() {
                Ok((stream, _)) => break IpcStream::from_unix(stream),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(TransportError::Accept(err)),
            }
        };
        match stream.peer_credentials() {
            Some((uid, gid, pid)) => debug!(uid, gid, pid, "client connected"),
            None => debug!("client connected"),
        }
        Ok(stream)
    }

    /// Connect to a daemon listening at `path`.
    pub fn connect(path: impl AsRef<Path>) -> Result<IpcStream> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).map_err(|source| TransportError::Connect {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(?path, "connected to command daemon");
        Ok(IpcStream::from_unix(stream))
    }

    /// Connect to the daemon at [`DEFAULT_SOCKET_PATH`].
    pub fn connect_default() -> Result<IpcStream> {
        Self::connect(DEFAULT_SOCKET_PATH)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UnixDomainSocket {
    fn drop(&mut self) {
        match socket_identity(&self.path) {
            Ok(identity) if identity == self.identity => {
                debug!(path = ?self.path, "removing daemon socket");
                let _ = std::fs::remove_file(&self.path);
            }
            Ok(_) => debug!(path = ?self.path, "daemon socket replaced; leaving it"),
            Err(_) => {}
        }
    }
}

/// Unlink a leftover socket at `path`. A missing path is fine.
fn remove_stale_socket(path: &Path) -> io::Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    if !metadata.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "path exists and is not a unix socket",
        ));
    }
    debug!(?path, "removing stale daemon socket");
    std::fs::remove_file(path)
}

/// `(dev, ino)` of the socket at `path`; a non-socket is `InvalidData`.
fn socket_identity(path: &Path) -> io::Result<(u64, u64)> {
    let metadata = std::fs::symlink_metadata(path)?;
    if !metadata.file_type().is_socket() {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "not a unix socket"));
    }
    Ok((metadata.dev(), metadata.ino()))
}
