use std::borrow::Cow;
use std::fmt;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Result, WireError};
use crate::opcode::OperationCode;

/// Header: operation (8) + history length (8) + packet size (8) + return code (4) + pad (4).
pub const HEADER_SIZE: usize = 32;

/// Command descriptor: two names (2 x 256) + 16 eight-byte slots.
pub const DESCRIPTOR_SIZE: usize = 2 * NAME_LEN + 16 * 8;

/// Width of each NUL-padded name field in the descriptor.
pub const NAME_LEN: usize = 256;

/// The variable-length buffers a command can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Input,
    Config,
    Output,
    History,
}

impl BufferKind {
    pub const ALL: [BufferKind; 4] = [
        BufferKind::Input,
        BufferKind::Config,
        BufferKind::Output,
        BufferKind::History,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BufferKind::Input => "input",
            BufferKind::Config => "config",
            BufferKind::Output => "output",
            BufferKind::History => "history",
        }
    }
}

impl fmt::Display for BufferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed-size envelope sent first in both directions.
///
/// Wire format (little-endian):
/// ```text
/// ┌────────────────┬────────────────┬────────────────┬─────────────┬──────────┐
/// │ operation (8B) │ history (8B)   │ packet (8B)    │ return (4B) │ pad (4B) │
/// └────────────────┴────────────────┴────────────────┴─────────────┴──────────┘
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    /// Command kind; also decides whether a descriptor hand-off follows.
    pub operation_code: OperationCode,
    /// Length of the history bytes that follow in this direction (requests).
    pub history_length: u64,
    /// Total framed size in this direction. Informational only.
    pub packet_size: u64,
    /// Functional result of the command. Zero on requests.
    pub return_code: i32,
}

impl Header {
    /// A request header for `operation_code` with the other fields zeroed.
    pub fn request(operation_code: OperationCode) -> Self {
        Self {
            operation_code,
            ..Self::default()
        }
    }

    /// Append the encoded header to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u64_le(self.operation_code.0);
        dst.put_u64_le(self.history_length);
        dst.put_u64_le(self.packet_size);
        dst.put_i32_le(self.return_code);
        dst.put_u32_le(0);
    }

    /// Encode into a fixed array.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        self.encode(&mut buf);
        let mut out = [0u8; HEADER_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    /// Decode a header. The trailing pad is ignored.
    pub fn decode(src: &[u8; HEADER_SIZE]) -> Self {
        let mut src = &src[..];
        let operation_code = OperationCode(src.get_u64_le());
        let history_length = src.get_u64_le();
        let packet_size = src.get_u64_le();
        let return_code = src.get_i32_le();
        Self {
            operation_code,
            history_length,
            packet_size,
            return_code,
        }
    }
}

/// Fixed-size command descriptor, scalars only.
///
/// Buffer locations never travel on the wire. Each endpoint keeps its own
/// buffers out of band and this type only carries their declared sizes. The
/// layout keeps a reserved eight-byte slot in front of every size; it is
/// written as zero and ignored on decode.
///
/// Wire format (little-endian, 640 bytes):
/// ```text
///   0  name[256]          256  value[256]
/// 512  guid               520  cookie
/// 528  objset_type        536  obj
/// 544  flags              552  cleanup_fd (i64)
/// 560  (reserved)         568  input_size
/// 576  (reserved)         584  config_size
/// 592  (reserved)         600  output_size
/// 608  output_filled (u8 + 7 pad)
/// 616  (reserved)         624  history_length
/// 632  history_offset
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct CommandDescriptor {
    pub name: [u8; NAME_LEN],
    pub value: [u8; NAME_LEN],
    /// Correlation value. For `SEND`, non-zero marks an estimate-only call.
    pub guid: u64,
    /// Descriptor number of the stream for streaming operations.
    pub cookie: u64,
    pub objset_type: u64,
    pub obj: u64,
    pub flags: u64,
    pub cleanup_fd: i64,
    pub input_size: u64,
    pub config_size: u64,
    pub output_size: u64,
    /// Set by the executing side when the output buffer holds valid data.
    pub output_filled: bool,
    pub history_length: u64,
    pub history_offset: u64,
}

impl Default for CommandDescriptor {
    fn default() -> Self {
        Self {
            name: [0; NAME_LEN],
            value: [0; NAME_LEN],
            guid: 0,
            cookie: 0,
            objset_type: 0,
            obj: 0,
            flags: 0,
            cleanup_fd: -1,
            input_size: 0,
            config_size: 0,
            output_size: 0,
            output_filled: false,
            history_length: 0,
            history_offset: 0,
        }
    }
}

impl CommandDescriptor {
    /// A descriptor targeting `name`.
    pub fn for_target(name: &str) -> Result<Self> {
        let mut desc = Self::default();
        desc.set_name(name)?;
        Ok(desc)
    }

    /// The target name up to its first NUL.
    pub fn name(&self) -> Cow<'_, str> {
        field_str(&self.name)
    }

    pub fn set_name(&mut self, name: &str) -> Result<()> {
        set_field(&mut self.name, name)
    }

    /// The secondary name up to its first NUL.
    pub fn value(&self) -> Cow<'_, str> {
        field_str(&self.value)
    }

    pub fn set_value(&mut self, value: &str) -> Result<()> {
        set_field(&mut self.value, value)
    }

    /// Size declared for a buffer in this descriptor.
    pub fn declared_size(&self, kind: BufferKind) -> u64 {
        match kind {
            BufferKind::Input => self.input_size,
            BufferKind::Config => self.config_size,
            BufferKind::Output => self.output_size,
            BufferKind::History => self.history_length,
        }
    }

    /// Append the encoded descriptor to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(DESCRIPTOR_SIZE);
        dst.put_slice(&self.name);
        dst.put_slice(&self.value);
        dst.put_u64_le(self.guid);
        dst.put_u64_le(self.cookie);
        dst.put_u64_le(self.objset_type);
        dst.put_u64_le(self.obj);
        dst.put_u64_le(self.flags);
        dst.put_i64_le(self.cleanup_fd);
        dst.put_u64_le(0);
        dst.put_u64_le(self.input_size);
        dst.put_u64_le(0);
        dst.put_u64_le(self.config_size);
        dst.put_u64_le(0);
        dst.put_u64_le(self.output_size);
        dst.put_u8(u8::from(self.output_filled));
        dst.put_bytes(0, 7);
        dst.put_u64_le(0);
        dst.put_u64_le(self.history_length);
        dst.put_u64_le(self.history_offset);
    }

    /// Decode a descriptor image received from the peer.
    pub fn decode(src: &[u8; DESCRIPTOR_SIZE]) -> Self {
        let mut src = &src[..];
        let mut desc = Self::default();
        src.copy_to_slice(&mut desc.name);
        src.copy_to_slice(&mut desc.value);
        desc.guid = src.get_u64_le();
        desc.cookie = src.get_u64_le();
        desc.objset_type = src.get_u64_le();
        desc.obj = src.get_u64_le();
        desc.flags = src.get_u64_le();
        desc.cleanup_fd = src.get_i64_le();
        src.advance(8);
        desc.input_size = src.get_u64_le();
        src.advance(8);
        desc.config_size = src.get_u64_le();
        src.advance(8);
        desc.output_size = src.get_u64_le();
        desc.output_filled = src.get_u8() != 0;
        src.advance(7);
        src.advance(8);
        desc.history_length = src.get_u64_le();
        desc.history_offset = src.get_u64_le();
        desc
    }
}

impl fmt::Debug for CommandDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDescriptor")
            .field("name", &self.name())
            .field("value", &self.value())
            .field("guid", &self.guid)
            .field("cookie", &self.cookie)
            .field("objset_type", &self.objset_type)
            .field("obj", &self.obj)
            .field("flags", &self.flags)
            .field("cleanup_fd", &self.cleanup_fd)
            .field("input_size", &self.input_size)
            .field("config_size", &self.config_size)
            .field("output_size", &self.output_size)
            .field("output_filled", &self.output_filled)
            .field("history_length", &self.history_length)
            .field("history_offset", &self.history_offset)
            .finish()
    }
}

/// Framed size of a request: header, descriptor, input, config and history.
///
/// The output buffer is only declared on requests, never sent.
pub fn request_packet_size(desc: &CommandDescriptor, history_length: u64) -> u64 {
    (HEADER_SIZE + DESCRIPTOR_SIZE) as u64
        + desc.input_size
        + desc.config_size
        + history_length
}

/// Framed size of a response: header, descriptor, history and filled output.
pub fn response_packet_size(desc: &CommandDescriptor) -> u64 {
    let output = if desc.output_filled {
        desc.output_size
    } else {
        0
    };
    output + (HEADER_SIZE + DESCRIPTOR_SIZE) as u64 + desc.history_length
}

fn field_str(field: &[u8; NAME_LEN]) -> Cow<'_, str> {
    let end = field.iter().position(|b| *b == 0).unwrap_or(NAME_LEN);
    String::from_utf8_lossy(&field[..end])
}

fn set_field(field: &mut [u8; NAME_LEN], text: &str) -> Result<()> {
    let bytes = text.as_bytes();
    // One byte is kept for the terminating NUL.
    if bytes.len() >= NAME_LEN {
        return Err(WireError::NameTooLong {
            len: bytes.len(),
            max: NAME_LEN - 1,
        });
    }
    field.fill(0);
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_descriptor() -> CommandDescriptor {
        let mut desc = CommandDescriptor::for_target("tank/vol1").unwrap();
        desc.set_value("tank/vol1@snap").unwrap();
        desc.guid = 0x1122_3344_5566_7788;
        desc.cookie = 9;
        desc.objset_type = 2;
        desc.obj = 77;
        desc.flags = 0b101;
        desc.cleanup_fd = 12;
        desc.input_size = 3;
        desc.config_size = 4;
        desc.output_size = 4096;
        desc.output_filled = true;
        desc.history_length = 21;
        desc.history_offset = 5;
        desc
    }

    #[test]
    fn header_layout_is_little_endian() {
        let header = Header {
            operation_code: OperationCode(0x5a1c),
            history_length: 3,
            packet_size: 0x0102,
            return_code: -2,
        };
        let bytes = header.to_bytes();

        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[0..8], &0x5a1cu64.to_le_bytes());
        assert_eq!(&bytes[8..16], &3u64.to_le_bytes());
        assert_eq!(&bytes[16..24], &0x0102u64.to_le_bytes());
        assert_eq!(&bytes[24..28], &(-2i32).to_le_bytes());
        assert_eq!(&bytes[28..32], &[0, 0, 0, 0]);
        assert_eq!(Header::decode(&bytes), header);
    }

    #[test]
    fn header_decode_ignores_pad() {
        let mut bytes = Header::request(OperationCode::CREATE).to_bytes();
        bytes[28..32].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        let decoded = Header::decode(&bytes);
        assert_eq!(decoded, Header::request(OperationCode::CREATE));
    }

    #[test]
    fn descriptor_encodes_to_fixed_size() {
        let mut buf = BytesMut::new();
        sample_descriptor().encode(&mut buf);
        assert_eq!(buf.len(), DESCRIPTOR_SIZE);
        assert_eq!(DESCRIPTOR_SIZE, 640);
    }

    #[test]
    fn descriptor_scalar_offsets() {
        let mut buf = BytesMut::new();
        sample_descriptor().encode(&mut buf);

        assert_eq!(&buf[0..9], b"tank/vol1");
        assert_eq!(buf[9], 0);
        assert_eq!(&buf[256..270], b"tank/vol1@snap");
        assert_eq!(&buf[512..520], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(&buf[520..528], &9u64.to_le_bytes());
        assert_eq!(&buf[552..560], &12i64.to_le_bytes());
        assert_eq!(&buf[568..576], &3u64.to_le_bytes());
        assert_eq!(&buf[584..592], &4u64.to_le_bytes());
        assert_eq!(&buf[600..608], &4096u64.to_le_bytes());
        assert_eq!(buf[608], 1);
        assert_eq!(&buf[624..632], &21u64.to_le_bytes());
        assert_eq!(&buf[632..640], &5u64.to_le_bytes());
    }

    #[test]
    fn reserved_location_slots_are_zero_on_encode() {
        let mut buf = BytesMut::new();
        sample_descriptor().encode(&mut buf);
        for offset in [560usize, 576, 592, 616] {
            assert_eq!(&buf[offset..offset + 8], &[0u8; 8], "slot at {offset}");
        }
    }

    #[test]
    fn reserved_location_slots_are_ignored_on_decode() {
        let desc = sample_descriptor();
        let mut buf = BytesMut::new();
        desc.encode(&mut buf);
        for offset in [560usize, 576, 592, 616] {
            buf[offset..offset + 8].copy_from_slice(&0xdead_beef_dead_beefu64.to_le_bytes());
        }

        let image: [u8; DESCRIPTOR_SIZE] = buf[..].try_into().unwrap();
        assert_eq!(CommandDescriptor::decode(&image), desc);
    }

    #[test]
    fn name_fields_reject_overflow() {
        let mut desc = CommandDescriptor::default();
        let err = desc.set_name(&"x".repeat(NAME_LEN)).unwrap_err();
        assert!(matches!(err, WireError::NameTooLong { len: 256, max: 255 }));

        desc.set_name(&"y".repeat(NAME_LEN - 1)).unwrap();
        assert_eq!(desc.name().len(), NAME_LEN - 1);
    }

    #[test]
    fn set_name_clears_previous_value() {
        let mut desc = CommandDescriptor::for_target("tank/a-long-name").unwrap();
        desc.set_name("tank").unwrap();
        assert_eq!(desc.name(), "tank");
    }

    #[test]
    fn packet_sizes() {
        let desc = sample_descriptor();
        assert_eq!(
            request_packet_size(&desc, 21),
            (HEADER_SIZE + DESCRIPTOR_SIZE) as u64 + 3 + 4 + 21
        );
        assert_eq!(
            response_packet_size(&desc),
            (HEADER_SIZE + DESCRIPTOR_SIZE) as u64 + 4096 + 21
        );

        let mut unfilled = desc;
        unfilled.output_filled = false;
        assert_eq!(
            response_packet_size(&unfilled),
            (HEADER_SIZE + DESCRIPTOR_SIZE) as u64 + 21
        );
    }

    #[test]
    fn default_descriptor_has_no_cleanup_fd() {
        assert_eq!(CommandDescriptor::default().cleanup_fd, -1);
    }
}
