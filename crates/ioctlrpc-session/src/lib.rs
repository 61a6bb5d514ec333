//! Client and daemon endpoints for the ioctl channel.
//!
//! One connection carries one request and then one response at a time:
//!
//! - the client fills a [`CommandDescriptor`] and [`ClientBuffers`], calls
//!   [`send_request`] and then [`recv_response`] (or [`Client::call`]);
//! - the daemon calls [`recv_request`] to get a [`RequestContext`] owning
//!   freshly allocated buffers, runs its [`CommandHandler`], and hands the
//!   context back to [`send_response`], which releases every buffer.
//!
//! [`CommandDescriptor`]: ioctlrpc_wire::CommandDescriptor

pub mod buffers;
pub mod client;
pub mod error;
pub mod listener;
pub mod server;

pub use buffers::{BufferAllocator, BufferSet, ClientBuffers, HeapAllocator};
pub use client::{recv_response, send_request, Client};
pub use error::{Result, SessionError};
pub use listener::{CommandHandler, CommandListener, Connection};
pub use server::{recv_request, send_response, RequestContext};
