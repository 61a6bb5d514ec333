use std::io::{Read, Write};
use std::os::fd::RawFd;
use std::path::Path;
use std::thread::ThreadId;

use bytes::BytesMut;
use ioctlrpc_transport::{DescriptorTransfer, IpcStream, TransportError, UnixDomainSocket};
use ioctlrpc_wire::{
    channel, request_packet_size, requires_descriptor, BufferKind, CommandDescriptor, Header,
    OperationCode, WireConfig, DESCRIPTOR_SIZE, HEADER_SIZE,
};
use tracing::{debug, warn};

use crate::buffers::ClientBuffers;
use crate::error::{Result, SessionError};

/// Send one request: header, descriptor, input, config, history, then the
/// stream descriptor named by `desc.cookie` for streaming operations.
///
/// Declared sizes and the cookie are validated before anything is written;
/// such an error leaves the connection untouched. Any later failure leaves it
/// in an unknown state and it must not be used for another request.
pub fn send_request<S>(
    stream: &mut S,
    op: OperationCode,
    desc: &CommandDescriptor,
    buffers: &ClientBuffers<'_>,
    config: &WireConfig,
) -> Result<()>
where
    S: Write + DescriptorTransfer + ?Sized,
{
    let request = Request::prepare(op, desc, buffers, config)?;
    request.transmit(stream, desc)
}

/// A validated request whose buffers are sliced to their declared sizes.
struct Request<'b> {
    header: Header,
    input: &'b [u8],
    config: &'b [u8],
    history: &'b [u8],
    fd: Option<RawFd>,
}

impl<'b> Request<'b> {
    fn prepare(
        op: OperationCode,
        desc: &CommandDescriptor,
        buffers: &'b ClientBuffers<'_>,
        config: &WireConfig,
    ) -> Result<Self> {
        let history_length = request_history_length(desc, buffers.history.as_deref());

        let input = outgoing(BufferKind::Input, desc.input_size, buffers.input, config)?;
        let conf = outgoing(BufferKind::Config, desc.config_size, buffers.config, config)?;
        config.check_size(BufferKind::Output, desc.output_size)?;
        // Receive-side history is bounded as well as the sent line.
        config.check_size(BufferKind::History, desc.history_length)?;
        let history = outgoing(
            BufferKind::History,
            history_length,
            buffers.history.as_deref().unwrap_or(&[]),
            config,
        )?;

        let fd = if requires_descriptor(op, desc) {
            Some(cookie_fd(desc.cookie)?)
        } else {
            None
        };

        Ok(Self {
            header: Header {
                operation_code: op,
                history_length,
                packet_size: request_packet_size(desc, history_length),
                return_code: 0,
            },
            input,
            config: conf,
            history,
            fd,
        })
    }

    fn transmit<S>(&self, stream: &mut S, desc: &CommandDescriptor) -> Result<()>
    where
        S: Write + DescriptorTransfer + ?Sized,
    {
        debug!(
            op = %self.header.operation_code,
            name = %desc.name(),
            packet_size = self.header.packet_size,
            history = self.header.history_length,
            "sending request"
        );

        channel::write_exact(stream, &encode_envelope(&self.header, desc))?;
        channel::write_exact(stream, self.input)?;
        channel::write_exact(stream, self.config)?;
        channel::write_exact(stream, self.history)?;

        if let Some(fd) = self.fd {
            stream.send_descriptor(fd)?;
        }
        Ok(())
    }
}

/// Receive one response into the caller's descriptor and buffers.
///
/// Scalars of `desc` are replaced by the peer's. The caller's buffers stay
/// where they are: the history and output bytes are copied into them. Returns
/// the command's return code; an `Err` always means the channel failed.
pub fn recv_response<S>(
    stream: &mut S,
    desc: &mut CommandDescriptor,
    buffers: &mut ClientBuffers<'_>,
    config: &WireConfig,
) -> Result<i32>
where
    S: Read + ?Sized,
{
    let mut raw_header = [0u8; HEADER_SIZE];
    channel::read_exact(stream, &mut raw_header)?;
    let header = Header::decode(&raw_header);

    let mut image = [0u8; DESCRIPTOR_SIZE];
    channel::read_exact(stream, &mut image)?;
    *desc = CommandDescriptor::decode(&image);

    let history_len = config.check_size(BufferKind::History, desc.history_length)?;
    if history_len > 0 {
        match buffers.history.as_deref_mut() {
            Some(history) => {
                let dst = incoming(BufferKind::History, desc.history_length, history)?;
                channel::read_exact(stream, dst)?;
            }
            None => {
                debug!(len = history_len, "discarding history without caller buffer");
                channel::discard_exact(stream, history_len)?;
            }
        }
    }

    if desc.output_filled {
        config.check_size(BufferKind::Output, desc.output_size)?;
        let dst = incoming(BufferKind::Output, desc.output_size, buffers.output)?;
        channel::read_exact(stream, dst)?;
    }

    debug!(
        op = %header.operation_code,
        return_code = header.return_code,
        output_filled = desc.output_filled,
        "received response"
    );
    Ok(header.return_code)
}

/// History bytes sent with a request.
///
/// A descriptor that declares a history length uses its buffer to receive
/// history, so nothing is sent. Otherwise a caller-supplied buffer holds a
/// NUL-terminated log line and its length is sent.
pub(crate) fn request_history_length(desc: &CommandDescriptor, history: Option<&[u8]>) -> u64 {
    match history {
        Some(buf) if desc.history_length == 0 => {
            buf.iter().position(|b| *b == 0).unwrap_or(buf.len()) as u64
        }
        _ => 0,
    }
}

pub(crate) fn encode_envelope(header: &Header, desc: &CommandDescriptor) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + DESCRIPTOR_SIZE);
    header.encode(&mut buf);
    desc.encode(&mut buf);
    buf
}

fn outgoing<'b>(
    kind: BufferKind,
    declared: u64,
    buf: &'b [u8],
    config: &WireConfig,
) -> Result<&'b [u8]> {
    let len = config.check_size(kind, declared)?;
    buf.get(..len).ok_or(SessionError::BufferTooSmall {
        kind,
        declared,
        capacity: buf.len(),
    })
}

fn incoming<'b>(kind: BufferKind, declared: u64, buf: &'b mut [u8]) -> Result<&'b mut [u8]> {
    let capacity = buf.len();
    usize::try_from(declared)
        .ok()
        .and_then(|len| buf.get_mut(..len))
        .ok_or(SessionError::BufferTooSmall {
            kind,
            declared,
            capacity,
        })
}

fn cookie_fd(cookie: u64) -> Result<RawFd> {
    RawFd::try_from(cookie).map_err(|_| {
        SessionError::Transport(TransportError::DescriptorTransfer(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("cookie {cookie} is not a descriptor number"),
        )))
    })
}

/// A client connection to the command daemon.
///
/// Records the thread that created it; see [`Client::is_main_thread`]. Once a
/// call fails on the channel the client refuses further calls.
#[derive(Debug)]
pub struct Client {
    stream: IpcStream,
    config: WireConfig,
    owner: ThreadId,
    broken: bool,
}

impl Client {
    /// Connect to the daemon socket at `path`.
    pub fn connect(path: impl AsRef<Path>) -> Result<Self> {
        Self::connect_with_config(path, WireConfig::default())
    }

    /// Connect to the daemon at [`ioctlrpc_transport::DEFAULT_SOCKET_PATH`].
    pub fn connect_default() -> Result<Self> {
        Self::connect(ioctlrpc_transport::DEFAULT_SOCKET_PATH)
    }

    /// Connect with explicit configuration.
    pub fn connect_with_config(path: impl AsRef<Path>, config: WireConfig) -> Result<Self> {
        let stream = UnixDomainSocket::connect(path)?;
        Self::from_stream(stream, config)
    }

    /// Wrap an already-connected stream.
    pub fn from_stream(stream: IpcStream, config: WireConfig) -> Result<Self> {
        config.apply(&stream)?;
        Ok(Self {
            stream,
            config,
            owner: std::thread::current().id(),
            broken: false,
        })
    }

    /// True when called from the thread that created this client.
    pub fn is_main_thread(&self) -> bool {
        std::thread::current().id() == self.owner
    }

    /// Whether an earlier channel failure made this client unusable.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn config(&self) -> &WireConfig {
        &self.config
    }

    /// Run one command: send the request and wait for its response.
    ///
    /// `Ok` carries the command's return code. A request rejected during
    /// validation (`BufferTooSmall`, `BufferTooLarge`, a cookie that is not a
    /// descriptor number) writes nothing and leaves the client usable. Any
    /// other `Err` means the channel failed; the client is then broken and
    /// must be replaced.
    pub fn call(
        &mut self,
        op: OperationCode,
        desc: &mut CommandDescriptor,
        buffers: &mut ClientBuffers<'_>,
    ) -> Result<i32> {
        if self.broken {
            return Err(TransportError::Shutdown.into());
        }

        let sent = match Request::prepare(op, desc, buffers, &self.config) {
            Ok(request) => request.transmit(&mut self.stream, desc),
            Err(err) => {
                debug!(%op, error = %err, "request rejected before sending");
                return Err(err);
            }
        };
        let result =
            sent.and_then(|()| recv_response(&mut self.stream, desc, buffers, &self.config));

        if let Err(err) = &result {
            warn!(%op, error = %err, "command channel failed");
            self.broken = true;
        }
        result
    }

    /// Consume the client and return the underlying stream.
    pub fn into_inner(self) -> IpcStream {
        self.stream
    }
}
