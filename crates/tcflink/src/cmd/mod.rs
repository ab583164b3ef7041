use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod decode;
pub mod encode;
pub mod pong;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Split a raw wire capture into messages and print them.
    Decode(DecodeArgs),
    /// Build one message and print its wire bytes.
    Encode(EncodeArgs),
    /// Run the echo demo over the in-memory transport.
    Pong(PongArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Decode(args) => decode::run(args, format),
        Command::Encode(args) => encode::run(args, format),
        Command::Pong(args) => pong::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// Capture file. Reads stdin when omitted.
    pub file: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct EncodeArgs {
    /// Message type: C, R, P, N or E.
    #[arg(value_name = "TYPE")]
    pub msg_type: String,
    /// Header fields then JSON arguments, e.g. `1 Pong echo '"x"'` for a command.
    #[arg(value_name = "FIELD", allow_hyphen_values = true)]
    pub fields: Vec<String>,
    /// Treat arguments as text strings instead of JSON.
    #[arg(long)]
    pub strings: bool,
}

#[derive(Args, Debug)]
pub struct PongArgs {
    /// Number of echo round trips.
    #[arg(long, default_value = "3")]
    pub count: usize,
    /// Text to echo; the sequence number is appended.
    #[arg(long, default_value = "ping")]
    pub message: String,
    /// Deliver wire traffic in chunks of at most this many bytes.
    #[arg(long)]
    pub chunk_size: Option<usize>,
    /// Per-reply timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}
