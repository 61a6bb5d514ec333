use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// Result of one `call`, as printed.
#[derive(Debug, Serialize)]
pub struct CallOutput {
    pub op: String,
    pub op_code: u64,
    pub name: String,
    pub return_code: i32,
    pub output_filled: bool,
    pub output_size: u64,
    pub output: Option<String>,
    pub history: Option<String>,
    #[serde(skip)]
    pub output_bytes: Vec<u8>,
}

pub fn print_call(out: &CallOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["OP", "NAME", "RC", "FILLED", "SIZE", "OUTPUT", "HISTORY"])
                .add_row(vec![
                    out.op.clone(),
                    out.name.clone(),
                    out.return_code.to_string(),
                    out.output_filled.to_string(),
                    out.output_size.to_string(),
                    out.output.clone().unwrap_or_default(),
                    out.history.clone().unwrap_or_default(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "op={} ({:#x}) name={} rc={} filled={} size={}",
                out.op, out.op_code, out.name, out.return_code, out.output_filled, out.output_size
            );
            if let Some(output) = &out.output {
                println!("output: {output}");
            }
            if let Some(history) = &out.history {
                println!("history: {history}");
            }
        }
        OutputFormat::Raw => print_raw(&out.output_bytes),
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

/// Text form of a buffer, trimmed at the first NUL.
pub fn preview(data: &[u8]) -> String {
    let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
    match std::str::from_utf8(&data[..end]) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", data.len()),
    }
}
