//! Local ioctl request/response channel over Unix domain sockets.
//!
//! A client process ships one command (operation code, fixed descriptor,
//! input, configuration and history buffers, and for streaming operations an
//! open file descriptor) to a daemon, which executes it and answers with a
//! return code, an updated descriptor and optional output.
//!
//! # Crate Structure
//!
//! - [`transport`]: Unix socket binding, connecting and descriptor hand-off
//! - [`wire`]: exact-length channel I/O and the envelope layout
//! - [`session`]: client and daemon request/response endpoints

/// Re-export transport types.
pub mod transport {
    pub use ioctlrpc_transport::*;
}

/// Re-export wire types.
pub mod wire {
    pub use ioctlrpc_wire::*;
}

/// Re-export session types.
pub mod session {
    pub use ioctlrpc_session::*;
}

pub use ioctlrpc_session::{Client, ClientBuffers, CommandHandler, CommandListener, SessionError};
pub use ioctlrpc_wire::{CommandDescriptor, OperationCode, WireConfig};
