use clap::{Args, Subcommand};
use ioctlrpc_wire::DEFAULT_MAX_BUFFER;
use std::path::PathBuf;

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod call;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a daemon backed by the built-in loopback engine.
    Serve(ServeArgs),
    /// Send one command and print the response.
    Call(CallArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args),
        Command::Call(args) => call::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Socket path to bind.
    #[arg(env = "IOCTLRPC_SOCKET", default_value = ioctlrpc_transport::DEFAULT_SOCKET_PATH)]
    pub path: PathBuf,
    /// Largest accepted size for any declared buffer, in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_BUFFER)]
    pub max_buffer_size: usize,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Socket path to connect to.
    #[arg(env = "IOCTLRPC_SOCKET", default_value = ioctlrpc_transport::DEFAULT_SOCKET_PATH)]
    pub path: PathBuf,
    /// Operation name (e.g. `pool-stats`) or number (e.g. `0x5a05`).
    #[arg(long)]
    pub op: String,
    /// Target name carried in the descriptor.
    #[arg(long, default_value = "")]
    pub name: String,
    /// Secondary name carried in the descriptor.
    #[arg(long)]
    pub value: Option<String>,
    /// Correlation value. Non-zero makes `send` an estimate.
    #[arg(long, default_value_t = 0)]
    pub guid: u64,
    /// Input payload.
    #[arg(long, conflicts_with = "input_file")]
    pub input: Option<String>,
    /// Read input payload from file.
    #[arg(long, conflicts_with = "input")]
    pub input_file: Option<PathBuf>,
    /// Configuration payload.
    #[arg(long)]
    pub config: Option<String>,
    /// History line sent with the command.
    #[arg(long, conflicts_with = "history_size")]
    pub history: Option<String>,
    /// Size of a history buffer to receive into.
    #[arg(long, conflicts_with = "history")]
    pub history_size: Option<usize>,
    /// Offset into the daemon's history to start reading from.
    #[arg(long, default_value_t = 0)]
    pub history_offset: u64,
    /// Size of the output buffer.
    #[arg(long, default_value_t = 4096)]
    pub output_size: usize,
    /// File passed as the stream descriptor for streaming operations.
    #[arg(long, value_name = "FILE")]
    pub fd_file: Option<PathBuf>,
    /// Largest accepted size for any declared buffer, in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_BUFFER)]
    pub max_buffer_size: usize,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}
