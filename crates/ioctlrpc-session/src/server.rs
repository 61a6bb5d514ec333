use std::io::{Read, Write};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;

use ioctlrpc_transport::DescriptorTransfer;
use ioctlrpc_wire::{
    channel, requires_descriptor, response_packet_size, BufferKind, CommandDescriptor, Header,
    OperationCode, WireConfig, DESCRIPTOR_SIZE, HEADER_SIZE,
};
use tracing::{debug, trace};

use crate::buffers::{BufferAllocator, BufferSet};
use crate::client::encode_envelope;
use crate::error::{Result, SessionError};

/// One in-flight request on the daemon side.
///
/// Owns the buffers allocated for the request and, for streaming
/// operations, the received stream descriptor. Dropping the context releases
/// all of them.
#[derive(Debug)]
pub struct RequestContext {
    pub header: Header,
    pub descriptor: CommandDescriptor,
    buffers: BufferSet,
    stream_fd: Option<OwnedFd>,
}

impl RequestContext {
    pub fn operation(&self) -> OperationCode {
        self.header.operation_code
    }

    pub fn input(&self) -> &[u8] {
        self.buffers.get(BufferKind::Input)
    }

    pub fn config(&self) -> &[u8] {
        self.buffers.get(BufferKind::Config)
    }

    /// The whole history buffer, sized to the larger declared length.
    pub fn history(&self) -> &[u8] {
        self.buffers.get(BufferKind::History)
    }

    pub fn history_mut(&mut self) -> &mut [u8] {
        self.buffers.get_mut(BufferKind::History)
    }

    /// The output buffer, sized as the client declared it.
    pub fn output_mut(&mut self) -> &mut [u8] {
        self.buffers.get_mut(BufferKind::Output)
    }

    pub fn output_capacity(&self) -> usize {
        self.buffers.len(BufferKind::Output)
    }

    /// Copy `data` into the output buffer and mark it filled.
    pub fn fill_output(&mut self, data: &[u8]) -> Result<()> {
        let capacity = self.output_capacity();
        let dst = self
            .buffers
            .get_mut(BufferKind::Output)
            .get_mut(..data.len())
            .ok_or(SessionError::BufferTooSmall {
                kind: BufferKind::Output,
                declared: data.len() as u64,
                capacity,
            })?;
        dst.copy_from_slice(data);
        self.descriptor.output_size = data.len() as u64;
        self.descriptor.output_filled = true;
        Ok(())
    }

    /// The stream descriptor received with a streaming request.
    pub fn descriptor_fd(&self) -> Option<BorrowedFd<'_>> {
        self.stream_fd.as_ref().map(AsFd::as_fd)
    }

    /// Take ownership of the stream descriptor away from the context.
    pub fn take_descriptor_fd(&mut self) -> Option<OwnedFd> {
        self.stream_fd.take()
    }

    pub fn set_return_code(&mut self, code: i32) {
        self.header.return_code = code;
    }
}

/// Receive one request and allocate its buffers.
///
/// Returns [`SessionError::Closed`] when the peer hung up before sending any
/// byte of a new request. On any failure every buffer allocated so far is
/// released before the error is returned.
pub fn recv_request<S>(
    stream: &mut S,
    config: &WireConfig,
    allocator: &Arc<dyn BufferAllocator>,
) -> Result<RequestContext>
where
    S: Read + DescriptorTransfer + ?Sized,
{
    let mut raw_header = [0u8; HEADER_SIZE];
    match channel::read_exact(stream, &mut raw_header) {
        Ok(()) => {}
        Err(err) if err.is_clean_close() => return Err(SessionError::Closed),
        Err(err) => return Err(err.into()),
    }
    let header = Header::decode(&raw_header);

    let mut image = [0u8; DESCRIPTOR_SIZE];
    channel::read_exact(stream, &mut image)?;
    let descriptor = CommandDescriptor::decode(&image);

    let input_len = config.check_size(BufferKind::Input, descriptor.input_size)?;
    let config_len = config.check_size(BufferKind::Config, descriptor.config_size)?;
    let output_len = config.check_size(BufferKind::Output, descriptor.output_size)?;
    let sent_history = config.check_size(BufferKind::History, header.history_length)?;
    let declared_history = config.check_size(BufferKind::History, descriptor.history_length)?;

    let mut buffers = BufferSet::new(Arc::clone(allocator));
    buffers.allocate(BufferKind::Input, input_len)?;
    buffers.allocate(BufferKind::Config, config_len)?;
    buffers.allocate(BufferKind::Output, output_len)?;
    buffers.allocate(BufferKind::History, sent_history.max(declared_history))?;

    channel::read_exact(stream, buffers.get_mut(BufferKind::Input))?;
    channel::read_exact(stream, buffers.get_mut(BufferKind::Config))?;
    channel::read_exact(
        stream,
        &mut buffers.get_mut(BufferKind::History)[..sent_history],
    )?;

    let expected = ioctlrpc_wire::request_packet_size(&descriptor, header.history_length);
    if header.packet_size != expected {
        trace!(
            declared = header.packet_size,
            expected,
            "request packet size differs from framed size"
        );
    }

    let stream_fd = if requires_descriptor(header.operation_code, &descriptor) {
        Some(stream.receive_descriptor()?)
    } else {
        None
    };

    debug!(
        op = %header.operation_code,
        name = %descriptor.name(),
        input = input_len,
        config = config_len,
        history = sent_history,
        descriptor = stream_fd.is_some(),
        "received request"
    );

    Ok(RequestContext {
        header,
        descriptor,
        buffers,
        stream_fd,
    })
}

/// Send the response for `ctx` and release everything it owns.
///
/// The context's copy of the stream descriptor is closed before anything is
/// written. Buffers are released whether or not the write succeeds.
pub fn send_response<S>(stream: &mut S, mut ctx: RequestContext) -> Result<()>
where
    S: Write + ?Sized,
{
    drop(ctx.stream_fd.take());

    let desc = &ctx.descriptor;
    let history = outgoing(&ctx.buffers, BufferKind::History, desc.history_length)?;
    let output: &[u8] = if desc.output_filled {
        outgoing(&ctx.buffers, BufferKind::Output, desc.output_size)?
    } else {
        &[]
    };

    let header = Header {
        history_length: desc.history_length,
        packet_size: response_packet_size(desc),
        ..ctx.header
    };

    channel::write_exact(stream, &encode_envelope(&header, desc))?;
    channel::write_exact(stream, history)?;
    channel::write_exact(stream, output)?;

    debug!(
        op = %header.operation_code,
        return_code = header.return_code,
        packet_size = header.packet_size,
        "sent response"
    );
    Ok(())
}

fn outgoing(buffers: &BufferSet, kind: BufferKind, declared: u64) -> Result<&[u8]> {
    let buf = buffers.get(kind);
    usize::try_from(declared)
        .ok()
        .and_then(|len| buf.get(..len))
        .ok_or(SessionError::BufferTooSmall {
            kind,
            declared,
            capacity: buf.len(),
        })
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Seek, SeekFrom};
    use std::os::fd::{AsRawFd, RawFd};
    use std::sync::atomic::Ordering;

    use ioctlrpc_transport::{IpcStream, TransportError};
    use ioctlrpc_wire::WireError;

    use super::*;
    use crate::buffers::tests::CountingAllocator;
    use crate::buffers::{ClientBuffers, HeapAllocator};
    use crate::client::{recv_response, send_request};

    /// In-memory request source; optionally hands out a descriptor.
    struct ScriptedStream {
        bytes: Cursor<Vec<u8>>,
        descriptor: Option<OwnedFd>,
        descriptor_calls: usize,
    }

    impl ScriptedStream {
        fn new(bytes: Vec<u8>) -> Self {
            Self {
                bytes: Cursor::new(bytes),
                descriptor: None,
                descriptor_calls: 0,
            }
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.bytes.read(buf)
        }
    }

    impl DescriptorTransfer for ScriptedStream {
        fn send_descriptor(&mut self, _fd: RawFd) -> ioctlrpc_transport::Result<()> {
            unreachable!("daemon never sends descriptors")
        }

        fn receive_descriptor(&mut self) -> ioctlrpc_transport::Result<OwnedFd> {
            self.descriptor_calls += 1;
            self.descriptor
                .take()
                .ok_or(TransportError::DescriptorChannelClosed)
        }
    }

    fn request_bytes(
        op: OperationCode,
        desc: &CommandDescriptor,
        history_length: u64,
        payload: &[u8],
    ) -> Vec<u8> {
        let header = Header {
            operation_code: op,
            history_length,
            packet_size: ioctlrpc_wire::request_packet_size(desc, history_length),
            return_code: 0,
        };
        let mut wire = encode_envelope(&header, desc).to_vec();
        wire.extend_from_slice(payload);
        wire
    }

    fn heap() -> Arc<dyn BufferAllocator> {
        Arc::new(HeapAllocator)
    }

    #[test]
    fn request_buffers_match_declared_sizes() {
        let mut desc = CommandDescriptor::for_target("tank/fs").unwrap();
        desc.input_size = 3;
        desc.config_size = 2;
        desc.output_size = 16;
        let wire = request_bytes(OperationCode::CREATE, &desc, 4, b"abccfhist");

        let mut stream = ScriptedStream::new(wire);
        let ctx = recv_request(&mut stream, &WireConfig::default(), &heap()).unwrap();

        assert_eq!(ctx.operation(), OperationCode::CREATE);
        assert_eq!(ctx.descriptor, desc);
        assert_eq!(ctx.input(), b"abc");
        assert_eq!(ctx.config(), b"cf");
        assert_eq!(ctx.history(), b"hist");
        assert_eq!(ctx.output_capacity(), 16);
        assert!(ctx.descriptor_fd().is_none());
        assert_eq!(stream.descriptor_calls, 0);
    }

    #[test]
    fn history_buffer_uses_larger_declared_length() {
        let mut desc = CommandDescriptor::default();
        desc.history_length = 32;
        let wire = request_bytes(OperationCode::POOL_GET_HISTORY, &desc, 0, b"");

        let ctx = recv_request(
            &mut ScriptedStream::new(wire),
            &WireConfig::default(),
            &heap(),
        )
        .unwrap();
        assert_eq!(ctx.history().len(), 32);
        assert!(ctx.history().iter().all(|b| *b == 0));
    }

    #[test]
    fn only_sent_history_bytes_are_read() {
        let mut desc = CommandDescriptor::default();
        desc.history_length = 8;
        let mut wire = request_bytes(OperationCode::CREATE, &desc, 3, b"log");
        wire.extend_from_slice(b"following-request");

        let mut stream = ScriptedStream::new(wire);
        let ctx = recv_request(&mut stream, &WireConfig::default(), &heap()).unwrap();
        assert_eq!(&ctx.history()[..3], b"log");
        assert_eq!(ctx.history().len(), 8);
        assert_eq!(
            stream.bytes.position() as usize,
            HEADER_SIZE + DESCRIPTOR_SIZE + 3
        );
    }

    #[test]
    fn clean_close_before_request() {
        let err = recv_request(
            &mut ScriptedStream::new(Vec::new()),
            &WireConfig::default(),
            &heap(),
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::Closed));
    }

    #[test]
    fn close_after_header_is_short_transfer() {
        let wire = Header::request(OperationCode::CREATE).to_bytes().to_vec();
        let err = recv_request(
            &mut ScriptedStream::new(wire),
            &WireConfig::default(),
            &heap(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Wire(WireError::ConnectionClosed {
                expected: DESCRIPTOR_SIZE,
                received: 0
            })
        ));
    }

    #[test]
    fn config_allocation_failure_releases_input() {
        let alloc = Arc::new(CountingAllocator::failing(BufferKind::Config));
        let shared: Arc<dyn BufferAllocator> = alloc.clone();
        let mut desc = CommandDescriptor::default();
        desc.input_size = 3;
        desc.config_size = 5;
        let wire = request_bytes(OperationCode::CREATE, &desc, 0, b"abcconfg");

        let err = recv_request(
            &mut ScriptedStream::new(wire),
            &WireConfig::default(),
            &shared,
        )
        .unwrap_err();

        assert!(matches!(
            err,
            SessionError::Allocation {
                kind: BufferKind::Config,
                size: 5
            }
        ));
        assert_eq!(alloc.allocated.load(Ordering::SeqCst), 1);
        assert_eq!(alloc.outstanding(), 0);
        assert_eq!(
            *alloc.released_kinds.lock().unwrap(),
            vec![BufferKind::Input]
        );
    }

    #[test]
    fn short_read_releases_all_buffers() {
        let alloc = Arc::new(CountingAllocator::default());
        let shared: Arc<dyn BufferAllocator> = alloc.clone();
        let mut desc = CommandDescriptor::default();
        desc.input_size = 10;
        desc.output_size = 4;
        let wire = request_bytes(OperationCode::CREATE, &desc, 2, b"abc");

        let err = recv_request(
            &mut ScriptedStream::new(wire),
            &WireConfig::default(),
            &shared,
        )
        .unwrap_err();

        assert!(err.is_connection_closed());
        assert_eq!(alloc.allocated.load(Ordering::SeqCst), 3);
        assert_eq!(alloc.outstanding(), 0);
    }

    #[test]
    fn oversized_declaration_is_rejected_before_allocation() {
        let alloc = Arc::new(CountingAllocator::default());
        let shared: Arc<dyn BufferAllocator> = alloc.clone();
        let mut desc = CommandDescriptor::default();
        desc.input_size = 4;
        desc.output_size = 1 << 40;
        let wire = request_bytes(OperationCode::CREATE, &desc, 0, b"abcd");

        let err = recv_request(
            &mut ScriptedStream::new(wire),
            &WireConfig::default(),
            &shared,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Wire(WireError::BufferTooLarge {
                kind: BufferKind::Output,
                ..
            })
        ));
        assert_eq!(alloc.allocated.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn streaming_request_receives_descriptor_after_buffers() {
        let (carried, _peer) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut desc = CommandDescriptor::default();
        desc.input_size = 2;
        let wire = request_bytes(OperationCode::RECV, &desc, 0, b"in");

        let mut stream = ScriptedStream::new(wire);
        stream.descriptor = Some(OwnedFd::from(carried));
        let mut ctx = recv_request(&mut stream, &WireConfig::default(), &heap()).unwrap();

        assert_eq!(stream.descriptor_calls, 1);
        assert!(ctx.descriptor_fd().is_some());
        assert!(ctx.take_descriptor_fd().is_some());
        assert!(ctx.descriptor_fd().is_none());
    }

    #[test]
    fn send_estimate_receives_no_descriptor() {
        let mut desc = CommandDescriptor::default();
        desc.guid = 1;
        let wire = request_bytes(OperationCode::SEND, &desc, 0, b"");

        let mut stream = ScriptedStream::new(wire);
        recv_request(&mut stream, &WireConfig::default(), &heap()).unwrap();
        assert_eq!(stream.descriptor_calls, 0);
    }

    #[test]
    fn missing_descriptor_fails_and_releases() {
        let alloc = Arc::new(CountingAllocator::default());
        let shared: Arc<dyn BufferAllocator> = alloc.clone();
        let mut desc = CommandDescriptor::default();
        desc.input_size = 1;
        let wire = request_bytes(OperationCode::RECV_NEW, &desc, 0, b"x");

        let err = recv_request(
            &mut ScriptedStream::new(wire),
            &WireConfig::default(),
            &shared,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Transport(TransportError::DescriptorChannelClosed)
        ));
        assert_eq!(alloc.outstanding(), 0);
    }

    #[test]
    fn fill_output_respects_capacity() {
        let mut desc = CommandDescriptor::default();
        desc.output_size = 4;
        let wire = request_bytes(OperationCode::POOL_STATS, &desc, 0, b"");
        let mut ctx = recv_request(
            &mut ScriptedStream::new(wire),
            &WireConfig::default(),
            &heap(),
        )
        .unwrap();

        let err = ctx.fill_output(b"too long").unwrap_err();
        assert!(matches!(
            err,
            SessionError::BufferTooSmall {
                kind: BufferKind::Output,
                declared: 8,
                capacity: 4
            }
        ));
        assert!(!ctx.descriptor.output_filled);

        ctx.fill_output(b"ok").unwrap();
        assert!(ctx.descriptor.output_filled);
        assert_eq!(ctx.descriptor.output_size, 2);
        assert_eq!(&ctx.output_mut()[..2], b"ok");
    }

    #[test]
    fn response_layout() {
        let mut desc = CommandDescriptor::default();
        desc.output_size = 8;
        desc.history_length = 4;
        let wire = request_bytes(OperationCode::POOL_GET_HISTORY, &desc, 0, b"");
        let mut ctx = recv_request(
            &mut ScriptedStream::new(wire),
            &WireConfig::default(),
            &heap(),
        )
        .unwrap();
        ctx.history_mut().copy_from_slice(b"hist");
        ctx.fill_output(b"result").unwrap();
        ctx.set_return_code(-5);

        let mut out = Cursor::new(Vec::new());
        send_response(&mut out, ctx).unwrap();
        let bytes = out.into_inner();

        let header = Header::decode(bytes[..HEADER_SIZE].try_into().unwrap());
        assert_eq!(header.return_code, -5);
        assert_eq!(header.packet_size as usize, bytes.len());
        assert_eq!(bytes.len(), HEADER_SIZE + DESCRIPTOR_SIZE + 4 + 6);
        assert_eq!(&bytes[HEADER_SIZE + DESCRIPTOR_SIZE..], b"histresult");
    }

    #[test]
    fn unfilled_output_is_not_sent() {
        let mut desc = CommandDescriptor::default();
        desc.output_size = 8;
        let wire = request_bytes(OperationCode::POOL_STATS, &desc, 0, b"");
        let ctx = recv_request(
            &mut ScriptedStream::new(wire),
            &WireConfig::default(),
            &heap(),
        )
        .unwrap();

        let mut out = Cursor::new(Vec::new());
        send_response(&mut out, ctx).unwrap();
        assert_eq!(out.get_ref().len(), HEADER_SIZE + DESCRIPTOR_SIZE);
    }

    #[test]
    fn send_response_releases_buffers_on_write_failure() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
                Err(std::io::ErrorKind::BrokenPipe.into())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let alloc = Arc::new(CountingAllocator::default());
        let shared: Arc<dyn BufferAllocator> = alloc.clone();
        let mut desc = CommandDescriptor::default();
        desc.input_size = 2;
        desc.output_size = 2;
        let wire = request_bytes(OperationCode::CREATE, &desc, 0, b"ab");
        let ctx = recv_request(
            &mut ScriptedStream::new(wire),
            &WireConfig::default(),
            &shared,
        )
        .unwrap();
        assert_eq!(alloc.outstanding(), 2);

        let err = send_response(&mut Broken, ctx).unwrap_err();
        assert!(matches!(err, SessionError::Wire(WireError::Io(_))));
        assert_eq!(alloc.outstanding(), 0);
    }

    #[test]
    fn send_response_closes_stream_descriptor() {
        let (carried, mut peer) = std::os::unix::net::UnixStream::pair().unwrap();
        let raw = carried.as_raw_fd();
        let wire = request_bytes(OperationCode::RECV, &CommandDescriptor::default(), 0, b"");
        let mut stream = ScriptedStream::new(wire);
        stream.descriptor = Some(OwnedFd::from(carried));
        let ctx = recv_request(&mut stream, &WireConfig::default(), &heap()).unwrap();
        assert_eq!(ctx.descriptor_fd().map(|fd| fd.as_raw_fd()), Some(raw));

        send_response(&mut Cursor::new(Vec::new()), ctx).unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn handler_history_longer_than_buffer_is_rejected() {
        let wire = request_bytes(OperationCode::CREATE, &CommandDescriptor::default(), 0, b"");
        let mut ctx = recv_request(
            &mut ScriptedStream::new(wire),
            &WireConfig::default(),
            &heap(),
        )
        .unwrap();
        ctx.descriptor.history_length = 10;

        let mut out = Cursor::new(Vec::new());
        let err = send_response(&mut out, ctx).unwrap_err();
        assert!(matches!(
            err,
            SessionError::BufferTooSmall {
                kind: BufferKind::History,
                declared: 10,
                capacity: 0
            }
        ));
        assert!(out.get_ref().is_empty());
    }

    #[test]
    fn end_to_end_over_socket_pair() {
        let (mut client, mut daemon) = IpcStream::pair().unwrap();
        let cfg = WireConfig::default();

        let server = std::thread::spawn(move || {
            let mut ctx = recv_request(&mut daemon, &WireConfig::default(), &heap()).unwrap();
            assert_eq!(ctx.input(), b"abc");
            assert!(ctx.config().is_empty());
            assert!(ctx.history().is_empty());
            ctx.fill_output(b"result").unwrap();
            ctx.set_return_code(0);
            send_response(&mut daemon, ctx).unwrap();

            let err = recv_request(&mut daemon, &WireConfig::default(), &heap()).unwrap_err();
            assert!(matches!(err, SessionError::Closed));
        });

        let mut desc = CommandDescriptor::for_target("tank").unwrap();
        let mut out = [0u8; 64];
        let mut buffers = ClientBuffers::new().input(b"abc").output(&mut out);
        buffers.declare(&mut desc);

        send_request(&mut client, OperationCode::POOL_STATS, &desc, &buffers, &cfg).unwrap();
        let rc = recv_response(&mut client, &mut desc, &mut buffers, &cfg).unwrap();

        assert_eq!(rc, 0);
        assert!(desc.output_filled);
        assert_eq!(desc.output_size, 6);
        assert_eq!(&out[..6], b"result");
        assert_eq!(desc.name(), "tank");

        drop(client);
        server.join().unwrap();
    }

    #[test]
    fn streaming_round_trip_over_socket_pair() {
        let (mut client, mut daemon) = IpcStream::pair().unwrap();
        let file = tempfile_with(b"payload");

        let server = std::thread::spawn(move || {
            let mut ctx = recv_request(&mut daemon, &WireConfig::default(), &heap()).unwrap();
            let fd = ctx.take_descriptor_fd().unwrap();
            let mut received = std::fs::File::from(fd);
            let mut content = Vec::new();
            received.seek(SeekFrom::Start(0)).unwrap();
            received.read_to_end(&mut content).unwrap();
            ctx.fill_output(&content).unwrap();
            send_response(&mut daemon, ctx).unwrap();
        });

        let mut desc = CommandDescriptor::for_target("tank/vol").unwrap();
        desc.cookie = file.as_raw_fd() as u64;
        let mut out = [0u8; 16];
        let mut buffers = ClientBuffers::new().output(&mut out);
        buffers.declare(&mut desc);
        let cfg = WireConfig::default();

        send_request(&mut client, OperationCode::RECV, &desc, &buffers, &cfg).unwrap();
        let rc = recv_response(&mut client, &mut desc, &mut buffers, &cfg).unwrap();

        assert_eq!(rc, 0);
        assert_eq!(&out[..desc.output_size as usize], b"payload");
        server.join().unwrap();
    }

    fn tempfile_with(content: &[u8]) -> std::fs::File {
        let path = std::env::temp_dir().join(format!(
            "ioctlrpc-session-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .unwrap();
        let _ = std::fs::remove_file(&path);
        file.write_all(content).unwrap();
        file
    }
}
