use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use tcflink_frame::{Message, RawArg};

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

#[derive(Serialize)]
struct MessageOutput<'a> {
    index: usize,
    #[serde(rename = "type")]
    msg_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    service: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    args: Vec<String>,
}

impl<'a> MessageOutput<'a> {
    fn new(index: usize, msg: &'a Message) -> Self {
        let (token, service, name) = match msg {
            Message::Command {
                token,
                service,
                method,
                ..
            } => (Some(token.as_str()), Some(service.as_str()), Some(method.as_str())),
            Message::Reply { token, .. } => (Some(token.as_str()), None, None),
            Message::Event { service, name, .. } => {
                (None, Some(service.as_str()), Some(name.as_str()))
            }
            Message::EndOfStream => (None, None, None),
        };
        Self {
            index,
            msg_type: msg.type_tag(),
            token,
            service,
            name,
            args: msg.args().iter().map(arg_preview).collect(),
        }
    }
}

pub fn print_messages(messages: &[Message], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            for (idx, msg) in messages.iter().enumerate() {
                println!(
                    "{}",
                    serde_json::to_string(&MessageOutput::new(idx, msg))
                        .unwrap_or_else(|_| "{}".to_string())
                );
            }
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["#", "TYPE", "TOKEN", "SERVICE", "NAME", "ARGS"]);
            for (idx, msg) in messages.iter().enumerate() {
                let out = MessageOutput::new(idx, msg);
                table.add_row(vec![
                    idx.to_string(),
                    out.msg_type.to_string(),
                    out.token.unwrap_or("").to_string(),
                    out.service.unwrap_or("").to_string(),
                    out.name.unwrap_or("").to_string(),
                    out.args.join(" "),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty | OutputFormat::Raw => {
            for msg in messages {
                let args: Vec<String> = msg.args().iter().map(arg_preview).collect();
                if args.is_empty() {
                    println!("{msg}");
                } else {
                    println!("{msg}: {}", args.join(" "));
                }
            }
        }
    }
}

#[derive(Serialize)]
struct EncodedOutput<'a> {
    len: usize,
    hex: &'a str,
}

pub fn print_encoded(bytes: &[u8], format: OutputFormat) {
    let hex = to_hex(bytes);
    match format {
        OutputFormat::Json => {
            let out = EncodedOutput {
                len: bytes.len(),
                hex: &hex,
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["LEN", "HEX"])
                .add_row(vec![bytes.len().to_string(), hex]);
            println!("{table}");
        }
        OutputFormat::Pretty => println!("{hex}"),
        OutputFormat::Raw => print_raw(bytes),
    }
}

/// One echo round trip of the pong demo.
#[derive(Serialize)]
pub struct PongRow {
    pub seq: usize,
    pub sent: String,
    pub received: String,
    pub elapsed_us: u128,
}

pub fn print_pong(rows: &[PongRow], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            for row in rows {
                println!(
                    "{}",
                    serde_json::to_string(row).unwrap_or_else(|_| "{}".to_string())
                );
            }
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["SEQ", "SENT", "RECEIVED", "ELAPSED (us)"]);
            for row in rows {
                table.add_row(vec![
                    row.seq.to_string(),
                    row.sent.clone(),
                    row.received.clone(),
                    row.elapsed_us.to_string(),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty | OutputFormat::Raw => {
            for row in rows {
                println!(
                    "seq={} sent={:?} received={:?} elapsed={}us",
                    row.seq, row.sent, row.received, row.elapsed_us
                );
            }
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

pub fn to_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

fn arg_preview(arg: &RawArg) -> String {
    match std::str::from_utf8(&arg.data) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", arg.data.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_is_lowercase_pairs() {
        assert_eq!(to_hex(&[0x03, 0x01, 0xab]), "0301ab");
    }

    #[test]
    fn command_output_fields() {
        let msg = Message::Command {
            token: "1".to_string(),
            service: "Pong".to_string(),
            method: "echo".to_string(),
            args: vec![RawArg {
                offset: 14,
                data: b"\"x\"".to_vec(),
            }],
        };
        let json = serde_json::to_value(MessageOutput::new(0, &msg)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "index": 0,
                "type": "C",
                "token": "1",
                "service": "Pong",
                "name": "echo",
                "args": ["\"x\""]
            })
        );
    }
}
