//! Channel primitives and envelope layout for the ioctl channel.
//!
//! Every message in either direction starts with a fixed 32-byte
//! [`Header`] followed by a fixed 640-byte [`CommandDescriptor`], then the
//! variable buffers whose sizes the descriptor declares:
//!
//! ```text
//! request:  [header][descriptor][input][config][history]  (+ descriptor hand-off)
//! response: [header][descriptor][history][output if output_filled]
//! ```
//!
//! All reads are bounded by declared sizes; [`channel::read_exact`] never
//! reads past them, which keeps `SCM_RIGHTS` hand-off aligned with the stream.

pub mod channel;
pub mod config;
pub mod envelope;
pub mod error;
pub mod opcode;

pub use channel::{discard_exact, read_exact, write_exact};
pub use config::{WireConfig, DEFAULT_MAX_BUFFER};
pub use envelope::{
    request_packet_size, response_packet_size, BufferKind, CommandDescriptor, Header,
    DESCRIPTOR_SIZE, HEADER_SIZE, NAME_LEN,
};
pub use error::{Result, WireError};
pub use opcode::{requires_descriptor, OperationCode};
