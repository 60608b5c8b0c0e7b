use std::io::IsTerminal;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use cmux::chat::Notification;
use cmux::frame::{channel_name, decode_control, ControlMessage, Frame, CONTROL};
use cmux::CommandResult;
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

fn table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

#[derive(Serialize)]
struct ResultOutput<'a> {
    channel: u8,
    command: &'a str,
    ok: bool,
    code: String,
    result: &'a str,
    lines: &'a [String],
}

pub fn print_result(channel: u8, result: &CommandResult, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&ResultOutput {
            channel,
            command: &result.command,
            ok: result.ok(),
            code: result.code.to_string(),
            result: &result.result_line,
            lines: &result.lines,
        }),
        OutputFormat::Table => {
            let mut out = table(vec!["COMMAND", "RESULT", "RESPONSE"]);
            out.add_row(vec![
                result.command.clone(),
                result.code.describe(),
                result.content(),
            ]);
            println!("{out}");
        }
        OutputFormat::Pretty => {
            println!("> {}", result.command);
            for line in &result.lines {
                println!("  {line}");
            }
            println!("< {}", result.code.describe());
        }
        OutputFormat::Raw => {
            for line in &result.lines {
                println!("{line}");
            }
            println!("{}", result.result_line);
        }
    }
}

#[derive(Serialize)]
struct NotificationOutput<'a> {
    channel: u8,
    kind: &'static str,
    prefix: Option<&'a str>,
    line: &'a str,
    pdu: Option<String>,
    timestamp: String,
}

pub fn print_notification(channel: u8, notification: &Notification, format: OutputFormat) {
    let pdu = notification.pdu.as_deref().map(hex::encode_upper);
    print_unsolicited(
        NotificationOutput {
            channel,
            kind: "notification",
            prefix: Some(notification.prefix.as_str()),
            line: &notification.line,
            pdu,
            timestamp: now_unix_seconds(),
        },
        format,
    );
}

pub fn print_call_notification(channel: u8, line: &str, format: OutputFormat) {
    print_unsolicited(
        NotificationOutput {
            channel,
            kind: "call",
            prefix: None,
            line,
            pdu: None,
            timestamp: now_unix_seconds(),
        },
        format,
    );
}

fn print_unsolicited(out: NotificationOutput<'_>, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&out),
        OutputFormat::Table => {
            let mut t = table(vec!["CHANNEL", "KIND", "LINE", "PDU"]);
            t.add_row(vec![
                out.channel.to_string(),
                out.kind.to_string(),
                out.line.to_string(),
                out.pdu.unwrap_or_default(),
            ]);
            println!("{t}");
        }
        OutputFormat::Pretty => match out.pdu {
            Some(pdu) => println!("[{}] {} pdu={pdu}", out.channel, out.line),
            None => println!("[{}] {}", out.channel, out.line),
        },
        OutputFormat::Raw => println!("{}", out.line),
    }
}

#[derive(Serialize)]
struct FrameOutput {
    channel: u8,
    channel_name: &'static str,
    frame_type: &'static str,
    cr: bool,
    poll_final: bool,
    payload_size: usize,
    payload: String,
    control: Vec<String>,
}

impl FrameOutput {
    fn new(frame: &Frame) -> Self {
        let control = if frame.channel == CONTROL && frame.frame_type.is_information() {
            match decode_control(&frame.payload) {
                Ok(messages) => messages
                    .iter()
                    .map(|m| {
                        let kind = if m.command { "command" } else { "response" };
                        format!("{} {kind}", describe_control(&m.message))
                    })
                    .collect(),
                Err(err) => vec![format!("undecodable: {err}")],
            }
        } else {
            Vec::new()
        };
        Self {
            channel: frame.channel,
            channel_name: channel_name(frame.channel),
            frame_type: frame.frame_type.as_str(),
            cr: frame.cr,
            poll_final: frame.poll_final,
            payload_size: frame.payload.len(),
            payload: payload_preview(&frame.payload),
            control,
        }
    }
}

pub fn print_frames(frames: &[Frame], format: OutputFormat) {
    let rows: Vec<FrameOutput> = frames.iter().map(FrameOutput::new).collect();
    match format {
        OutputFormat::Json => {
            for row in &rows {
                print_json(row);
            }
        }
        OutputFormat::Table => {
            let mut t = table(vec!["DLCI", "TYPE", "C/R", "P/F", "SIZE", "PAYLOAD"]);
            for row in rows {
                let payload = if row.control.is_empty() {
                    row.payload
                } else {
                    row.control.join("; ")
                };
                t.add_row(vec![
                    format!("{} ({})", row.channel, row.channel_name),
                    row.frame_type.to_string(),
                    u8::from(row.cr).to_string(),
                    u8::from(row.poll_final).to_string(),
                    row.payload_size.to_string(),
                    payload,
                ]);
            }
            println!("{t}");
        }
        OutputFormat::Pretty => {
            for row in rows {
                println!(
                    "dlci={} ({}) type={} cr={} pf={} size={} payload={}",
                    row.channel,
                    row.channel_name,
                    row.frame_type,
                    u8::from(row.cr),
                    u8::from(row.poll_final),
                    row.payload_size,
                    row.payload
                );
                for message in row.control {
                    println!("  control: {message}");
                }
            }
        }
        OutputFormat::Raw => {
            for frame in frames {
                println!("{}", hex::encode_upper(&frame.payload));
            }
        }
    }
}

fn describe_control(message: &ControlMessage) -> String {
    match message {
        ControlMessage::ModemStatus {
            channel, signals, ..
        } => format!("MSC dlci={channel} signals=0x{:02X}", signals.bits()),
        ControlMessage::CloseDown => "CLD".to_string(),
        ControlMessage::Test(value) => format!("TEST {}", hex::encode_upper(value)),
        ControlMessage::FlowControlOn => "FCon".to_string(),
        ControlMessage::FlowControlOff => "FCoff".to_string(),
        ControlMessage::NonSupported { command_type } => {
            format!("NSC type=0x{command_type:02X}")
        }
        ControlMessage::Other { code, value } => {
            format!("0x{code:02X} {}", hex::encode_upper(value))
        }
    }
}

#[derive(Serialize)]
pub struct ProbeOutput {
    pub device: String,
    pub transport: &'static str,
    pub variant: &'static str,
    pub cmux_command: Option<String>,
    pub frames_decoded: Option<u64>,
}

pub fn print_probe(out: &ProbeOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(out),
        OutputFormat::Table => {
            let mut t = table(vec!["DEVICE", "TRANSPORT", "VARIANT", "CMUX"]);
            t.add_row(vec![
                out.device.clone(),
                out.transport.to_string(),
                out.variant.to_string(),
                out.cmux_command.clone().unwrap_or_else(|| "-".to_string()),
            ]);
            println!("{t}");
        }
        OutputFormat::Pretty | OutputFormat::Raw => {
            println!(
                "device={} transport={} variant={}",
                out.device, out.transport, out.variant
            );
        }
    }
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.escape_debug().to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use cmux::frame::{ControlFrame, FrameType};

    use super::*;

    #[test]
    fn control_frames_are_described() {
        let payload = ControlFrame::command(ControlMessage::CloseDown).to_bytes();
        let out = FrameOutput::new(&Frame::new(CONTROL, FrameType::Uih, payload));
        assert_eq!(out.control, vec!["CLD command"]);
        assert_eq!(out.channel_name, "control");
    }

    #[test]
    fn data_payload_preview_escapes_line_ends() {
        let out = FrameOutput::new(&Frame::new(1, FrameType::Uih, Bytes::from_static(b"AT\r")));
        assert_eq!(out.payload, "AT\\r");
        assert!(out.control.is_empty());
    }
}
