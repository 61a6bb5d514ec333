use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ioctlrpc_transport::{IpcStream, UnixDomainSocket};
use ioctlrpc_wire::WireConfig;
use tracing::{debug, warn};

use crate::buffers::{BufferAllocator, HeapAllocator};
use crate::error::{Result, SessionError};
use crate::server::{recv_request, send_response, RequestContext};

/// Executes one received command.
///
/// Returns the command's return code. The handler may fill the output
/// buffer, write history and take the stream descriptor from `ctx`.
pub trait CommandHandler {
    fn execute(&self, ctx: &mut RequestContext) -> i32;
}

impl<F> CommandHandler for F
where
    F: Fn(&mut RequestContext) -> i32,
{
    fn execute(&self, ctx: &mut RequestContext) -> i32 {
        self(ctx)
    }
}

/// Daemon-side listener for command connections.
pub struct CommandListener {
    socket: UnixDomainSocket,
    config: WireConfig,
    allocator: Arc<dyn BufferAllocator>,
}

impl CommandListener {
    /// Bind to a Unix domain socket path.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_socket(UnixDomainSocket::bind(path)?))
    }

    /// Bind to [`ioctlrpc_transport::DEFAULT_SOCKET_PATH`].
    pub fn bind_default() -> Result<Self> {
        Ok(Self::from_socket(UnixDomainSocket::bind_default()?))
    }

    fn from_socket(socket: UnixDomainSocket) -> Self {
        Self {
            socket,
            config: WireConfig::default(),
            allocator: Arc::new(HeapAllocator),
        }
    }

    /// Override the wire configuration applied to accepted connections.
    pub fn with_config(mut self, config: WireConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the allocator used for request buffers.
    pub fn with_allocator(mut self, allocator: Arc<dyn BufferAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Accept the next client connection.
    pub fn accept(&self) -> Result<Connection> {
        let stream = self.socket.accept()?;
        Connection::new(stream, self.config.clone(), Arc::clone(&self.allocator))
    }

    /// Accept and serve connections one at a time while `running` is set.
    ///
    /// A connection that fails mid-request is dropped and the loop moves on
    /// to the next one. Returns the number of requests served.
    pub fn serve<H>(&self, handler: &H, running: &AtomicBool) -> Result<usize>
    where
        H: CommandHandler + ?Sized,
    {
        let mut served = 0usize;
        while running.load(Ordering::SeqCst) {
            let mut conn = self.accept()?;
            if !running.load(Ordering::SeqCst) {
                break;
            }
            match conn.serve(handler) {
                Ok(count) => served = served.saturating_add(count),
                Err(err) => warn!(error = %err, "connection dropped"),
            }
        }
        Ok(served)
    }

    /// Bound socket path.
    pub fn path(&self) -> &Path {
        self.socket.path()
    }
}

/// One accepted client connection on the daemon side.
pub struct Connection {
    stream: IpcStream,
    config: WireConfig,
    allocator: Arc<dyn BufferAllocator>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("stream", &self.stream)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(
        stream: IpcStream,
        config: WireConfig,
        allocator: Arc<dyn BufferAllocator>,
    ) -> Result<Self> {
        config.apply(&stream)?;
        Ok(Self {
            stream,
            config,
            allocator,
        })
    }

    /// Receive the next request on this connection.
    pub fn recv_request(&mut self) -> Result<RequestContext> {
        recv_request(&mut self.stream, &self.config, &self.allocator)
    }

    /// Send the response for `ctx`, releasing its buffers.
    pub fn send_response(&mut self, ctx: RequestContext) -> Result<()> {
        send_response(&mut self.stream, ctx)
    }

    /// Serve requests until the client closes the connection.
    ///
    /// Returns the number of requests served. A channel failure ends the
    /// connection with an error.
    pub fn serve<H>(&mut self, handler: &H) -> Result<usize>
    where
        H: CommandHandler + ?Sized,
    {
        let mut served = 0usize;
        loop {
            let mut ctx = match self.recv_request() {
                Ok(ctx) => ctx,
                Err(SessionError::Closed) => {
                    debug!(served, "client closed connection");
                    return Ok(served);
                }
                Err(err) => return Err(err),
            };

            let code = handler.execute(&mut ctx);
            ctx.set_return_code(code);
            debug!(op = %ctx.operation(), return_code = code, "command executed");

            self.send_response(ctx)?;
            served += 1;
        }
    }
}
