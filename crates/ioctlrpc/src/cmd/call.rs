use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;

use ioctlrpc_session::{Client, ClientBuffers};
use ioctlrpc_wire::{
    requires_descriptor, BufferKind, CommandDescriptor, OperationCode, WireConfig,
};

use crate::cmd::CallArgs;
use crate::exit::{
    io_error, session_error, wire_error, CliError, CliResult, FAILURE, SUCCESS, USAGE,
};
use crate::output::{preview, print_call, CallOutput, OutputFormat};

pub fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let op = parse_op(&args.op)?;

    let input = match (&args.input, &args.input_file) {
        (Some(text), _) => text.clone().into_bytes(),
        (None, Some(path)) => {
            std::fs::read(path).map_err(|err| io_error("read input file failed", err))?
        }
        (None, None) => Vec::new(),
    };
    let config = args.config.clone().map(String::into_bytes).unwrap_or_default();

    let mut desc = CommandDescriptor::for_target(&args.name)
        .map_err(|err| wire_error("invalid --name", err))?;
    if let Some(value) = &args.value {
        desc.set_value(value)
            .map_err(|err| wire_error("invalid --value", err))?;
    }
    desc.guid = args.guid;
    desc.history_offset = args.history_offset;

    let wire_config = WireConfig {
        max_buffer_size: args.max_buffer_size,
        ..WireConfig::default()
    };
    let output_size = buffer_size(&wire_config, BufferKind::Output, args.output_size)?;
    let history_size = args
        .history_size
        .map(|size| buffer_size(&wire_config, BufferKind::History, size))
        .transpose()?;

    // A sent history line is NUL-terminated; a receive buffer is declared.
    let mut history = match (&args.history, history_size) {
        (Some(line), _) => {
            let mut buf = line.clone().into_bytes();
            buf.push(0);
            Some(buf)
        }
        (None, Some(size)) => {
            desc.history_length = size as u64;
            Some(vec![0u8; size])
        }
        (None, None) => None,
    };

    let stream_file = open_stream_file(&args, op, &desc)?;
    if let Some(file) = &stream_file {
        desc.cookie = file.as_raw_fd() as u64;
    }

    let mut client = Client::connect_with_config(&args.path, wire_config)
        .map_err(|err| session_error("connect failed", err))?;

    let mut output = vec![0u8; output_size];
    let mut buffers = ClientBuffers::new()
        .input(&input)
        .config(&config)
        .output(&mut output);
    if let Some(buf) = history.as_deref_mut() {
        buffers = buffers.history(buf);
    }
    buffers.declare(&mut desc);

    let return_code = client
        .call(op, &mut desc, &mut buffers)
        .map_err(|err| session_error("call failed", err))?;
    drop(stream_file);

    let output_bytes = if desc.output_filled {
        let len = usize::try_from(desc.output_size).unwrap_or(output.len());
        output[..len.min(output.len())].to_vec()
    } else {
        Vec::new()
    };
    let returned_history = history
        .as_deref()
        .zip(usize::try_from(desc.history_length).ok())
        .filter(|(_, len)| *len > 0)
        .map(|(buf, len)| preview(&buf[..len.min(buf.len())]));

    let out = CallOutput {
        op: op.name().to_string(),
        op_code: op.0,
        name: desc.name().into_owned(),
        return_code,
        output_filled: desc.output_filled,
        output_size: desc.output_size,
        output: desc.output_filled.then(|| preview(&output_bytes)),
        history: returned_history,
        output_bytes,
    };
    print_call(&out, format);

    Ok(if return_code == 0 { SUCCESS } else { FAILURE })
}

/// Parse an operation name or a decimal/`0x` hex number.
pub fn parse_op(text: &str) -> CliResult<OperationCode> {
    if let Some(op) = OperationCode::from_name(text) {
        return Ok(op);
    }
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse::<u64>(),
    };
    parsed
        .map(OperationCode)
        .map_err(|_| CliError::new(USAGE, format!("unknown operation: {text}")))
}

/// Bound a buffer size given on the command line before allocating it.
fn buffer_size(config: &WireConfig, kind: BufferKind, size: usize) -> CliResult<usize> {
    config
        .check_size(kind, size as u64)
        .map_err(|err| CliError::new(USAGE, format!("--{kind}-size: {err}")))
}

fn open_stream_file(
    args: &CallArgs,
    op: OperationCode,
    desc: &CommandDescriptor,
) -> CliResult<Option<File>> {
    let Some(path) = &args.fd_file else {
        if requires_descriptor(op, desc) {
            return Err(CliError::new(
                USAGE,
                format!("{op} needs a stream descriptor; pass --fd-file"),
            ));
        }
        return Ok(None);
    };

    let opened = match op {
        OperationCode::SEND | OperationCode::SEND_NEW => OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path),
        _ => File::open(path),
    };
    opened
        .map(Some)
        .map_err(|err| io_error("open --fd-file failed", err))
}
