use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use ioctlrpc_session::{CommandHandler, CommandListener, RequestContext};
use ioctlrpc_wire::{OperationCode, WireConfig};
use tracing::{debug, info, warn};

use crate::cmd::ServeArgs;
use crate::exit::{session_error, CliError, CliResult, INTERNAL, SUCCESS};

pub fn run(args: ServeArgs) -> CliResult<i32> {
    let config = WireConfig {
        max_buffer_size: args.max_buffer_size,
        ..WireConfig::default()
    };
    let listener = CommandListener::bind(&args.path)
        .map_err(|err| session_error("bind failed", err))?
        .with_config(config);

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone(), listener.path().to_path_buf())?;

    info!(path = %listener.path().display(), "serving");
    let engine = Loopback::default();
    let served = listener
        .serve(&engine, &running)
        .map_err(|err| session_error("accept failed", err))?;
    info!(served, "stopped");

    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>, path: PathBuf) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
        // Unblock a pending accept so the loop observes the flag.
        let _ = std::os::unix::net::UnixStream::connect(&path);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

/// Command engine that executes everything locally.
///
/// - streaming `send` writes the input to the received descriptor; an
///   estimate (`send` without descriptor) answers with the input size
/// - `recv` and `recv-new` read the descriptor to EOF into the output
/// - `pool-get-history` returns recorded history lines from `history_offset`
/// - anything else copies input into output
///
/// History lines sent with any command are recorded. An output buffer that
/// is too small yields `ENOMEM` with `output_size` set to the size needed.
#[derive(Debug, Default)]
pub struct Loopback {
    history: Mutex<Vec<u8>>,
}

impl CommandHandler for Loopback {
    fn execute(&self, ctx: &mut RequestContext) -> i32 {
        self.record_history(ctx);

        let rc = match ctx.operation() {
            OperationCode::SEND | OperationCode::SEND_NEW => write_to_stream(ctx),
            OperationCode::RECV | OperationCode::RECV_NEW => read_from_stream(ctx),
            OperationCode::POOL_GET_HISTORY => self.read_history(ctx),
            _ => {
                let input = ctx.input().to_vec();
                fill(ctx, &input)
            }
        };
        debug!(op = %ctx.operation(), rc, "loopback executed");
        rc
    }
}

impl Loopback {
    fn record_history(&self, ctx: &RequestContext) {
        let sent = usize::try_from(ctx.header.history_length).unwrap_or(usize::MAX);
        let Some(line) = ctx.history().get(..sent).filter(|line| !line.is_empty()) else {
            return;
        };
        let mut log = match self.history.lock() {
            Ok(log) => log,
            Err(poisoned) => poisoned.into_inner(),
        };
        log.extend_from_slice(line);
        log.push(b'\n');
    }

    fn read_history(&self, ctx: &mut RequestContext) -> i32 {
        let log = match self.history.lock() {
            Ok(log) => log,
            Err(poisoned) => poisoned.into_inner(),
        };
        let start = usize::try_from(ctx.descriptor.history_offset)
            .unwrap_or(usize::MAX)
            .min(log.len());
        let chunk = &log[start..];

        let dst = ctx.history_mut();
        let len = chunk.len().min(dst.len());
        dst[..len].copy_from_slice(&chunk[..len]);
        ctx.descriptor.history_length = len as u64;
        ctx.descriptor.history_offset = (start + len) as u64;
        0
    }
}

fn write_to_stream(ctx: &mut RequestContext) -> i32 {
    let Some(fd) = ctx.take_descriptor_fd() else {
        let estimate = (ctx.input().len() as u64).to_le_bytes();
        return fill(ctx, &estimate);
    };
    let mut stream = File::from(fd);
    match stream.write_all(ctx.input()) {
        Ok(()) => 0,
        Err(err) => {
            warn!(error = %err, "stream write failed");
            err.raw_os_error().unwrap_or(libc::EIO)
        }
    }
}

fn read_from_stream(ctx: &mut RequestContext) -> i32 {
    let Some(fd) = ctx.take_descriptor_fd() else {
        return libc::EBADF;
    };
    let capacity = ctx.output_capacity();
    let mut data = Vec::new();
    // One byte past capacity tells "fits exactly" apart from "too large".
    let limit = capacity as u64 + 1;
    if let Err(err) = File::from(fd).take(limit).read_to_end(&mut data) {
        warn!(error = %err, "stream read failed");
        return err.raw_os_error().unwrap_or(libc::EIO);
    }
    if data.len() > capacity {
        ctx.descriptor.output_size = data.len() as u64;
        return libc::ENOMEM;
    }
    fill(ctx, &data)
}

fn fill(ctx: &mut RequestContext, data: &[u8]) -> i32 {
    if data.len() > ctx.output_capacity() {
        ctx.descriptor.output_size = data.len() as u64;
        return libc::ENOMEM;
    }
    match ctx.fill_output(data) {
        Ok(()) => 0,
        Err(_) => libc::ENOMEM,
    }
}
