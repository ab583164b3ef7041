use bytes::Bytes;
use tcflink_frame::{
    write_command, write_event, write_reply, Arg, ArgCodec, FrameWriter, ReplyKind,
};

use crate::cmd::EncodeArgs;
use crate::exit::{frame_error, CliError, CliResult, DATA_INVALID, SUCCESS, USAGE};
use crate::output::{print_encoded, OutputFormat};

pub fn run(args: EncodeArgs, format: OutputFormat) -> CliResult<i32> {
    let bytes = build(&args)?;
    tracing::debug!(len = bytes.len(), msg_type = %args.msg_type, "message encoded");
    print_encoded(&bytes, format);
    Ok(SUCCESS)
}

fn build(args: &EncodeArgs) -> CliResult<Bytes> {
    let msg_type = args.msg_type.to_ascii_uppercase();
    let header_fields = match msg_type.as_str() {
        "C" => ["token", "service", "method"].as_slice(),
        "R" | "P" | "N" => ["token"].as_slice(),
        "E" => ["service", "event"].as_slice(),
        other => {
            return Err(CliError::new(
                USAGE,
                format!("unknown message type '{other}' (expected C, R, P, N or E)"),
            ))
        }
    };
    if args.fields.len() < header_fields.len() {
        return Err(CliError::new(
            USAGE,
            format!(
                "message type {msg_type} needs {} before its arguments",
                header_fields.join(", ")
            ),
        ));
    }

    let (head, rest) = args.fields.split_at(header_fields.len());
    let call_args = parse_args(rest, args.strings)?;
    let mut writer = FrameWriter::default();
    let codec = ArgCodec::default();
    let written = match msg_type.as_str() {
        "C" => write_command(&mut writer, &codec, &head[0], &head[1], &head[2], &call_args),
        "E" => write_event(&mut writer, &codec, &head[0], &head[1], &call_args),
        "P" => write_reply(&mut writer, &codec, ReplyKind::Progress, &head[0], &call_args),
        "N" => write_reply(&mut writer, &codec, ReplyKind::NotRecognized, &head[0], &call_args),
        _ => write_reply(&mut writer, &codec, ReplyKind::Result, &head[0], &call_args),
    };
    written.map_err(|err| frame_error("encode failed", err))
}

fn parse_args(fields: &[String], strings: bool) -> CliResult<Vec<Arg>> {
    fields
        .iter()
        .map(|field| {
            if strings {
                return Ok(Arg::from(field.as_str()));
            }
            serde_json::from_str(field).map(Arg::Json).map_err(|err| {
                CliError::new(
                    DATA_INVALID,
                    format!("argument {field:?} is not valid JSON: {err}"),
                )
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(msg_type: &str, fields: &[&str], strings: bool) -> EncodeArgs {
        EncodeArgs {
            msg_type: msg_type.to_string(),
            fields: fields.iter().map(|s| s.to_string()).collect(),
            strings,
        }
    }

    #[test]
    fn command_bytes() {
        let bytes = build(&args("c", &["1", "Pong", "echo", "\"x\""], false)).unwrap();
        assert_eq!(bytes.as_ref(), b"C\x001\x00Pong\x00echo\x00\"x\"\x00\x03\x01");
    }

    #[test]
    fn string_arguments_are_quoted() {
        let bytes = build(&args("R", &["4", "ok"], true)).unwrap();
        assert_eq!(bytes.as_ref(), b"R\x004\x00\"ok\"\x00\x03\x01");
    }

    #[test]
    fn missing_header_is_usage_error() {
        let err = build(&args("E", &["Locator"], false)).unwrap_err();
        assert_eq!(err.code, USAGE);
        assert!(err.message.contains("service, event"));
    }

    #[test]
    fn bad_type_and_bad_json_are_rejected() {
        assert_eq!(build(&args("X", &[], false)).unwrap_err().code, USAGE);
        assert_eq!(
            build(&args("R", &["1", "{nope"], false)).unwrap_err().code,
            DATA_INVALID
        );
    }
}
