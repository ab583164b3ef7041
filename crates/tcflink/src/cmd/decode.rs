use std::io::Read;

use bytes::Bytes;
use tcflink_frame::Reassembler;

use crate::cmd::DecodeArgs;
use crate::exit::{frame_error, io_error, CliResult, SUCCESS};
use crate::output::{print_messages, OutputFormat};

pub fn run(args: DecodeArgs, format: OutputFormat) -> CliResult<i32> {
    let data = match &args.file {
        Some(path) => std::fs::read(path)
            .map_err(|err| io_error(&format!("read {} failed", path.display()), err))?,
        None => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .map_err(|err| io_error("read stdin failed", err))?;
            buf
        }
    };

    let mut input = Reassembler::new();
    input.push(Bytes::from(data));
    let (messages, failure) = input.drain_messages();
    if failure.is_none() && input.buffered() > 0 {
        tracing::warn!(
            bytes = input.buffered(),
            "capture ends inside an unterminated message"
        );
    }
    tracing::debug!(count = messages.len(), eof = input.is_eof(), "capture decoded");

    print_messages(&messages, format);
    match failure {
        Some(err) => Err(frame_error(
            &format!("decode stopped after {} messages", messages.len()),
            err,
        )),
        None => Ok(SUCCESS),
    }
}
