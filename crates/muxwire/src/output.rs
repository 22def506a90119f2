use std::io::{IsTerminal, Write};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use muxwire_frame::SharedMessage;
use serde::Serialize;
use uuid::Uuid;

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
            Self::Pretty
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct MessageOutput {
    channel: String,
    message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<String>,
    payload_size: usize,
    payload: String,
    peer: String,
    timestamp: String,
}

impl MessageOutput {
    fn new(channel: Uuid, message: &SharedMessage, peer: SocketAddr) -> Self {
        Self {
            channel: channel.to_string(),
            message_id: message.id().to_string(),
            reply_to: message.is_reply().then(|| message.reply_to().to_string()),
            payload_size: message.payload().len(),
            payload: payload_preview(message.payload()),
            peer: peer.to_string(),
            timestamp: now_unix_seconds(),
        }
    }
}

pub fn print_message(channel: Uuid, message: &SharedMessage, peer: SocketAddr, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = MessageOutput::new(channel, message, peer);
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let out = MessageOutput::new(channel, message, peer);
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["CHANNEL", "MESSAGE", "REPLY TO", "SIZE", "PEER", "PAYLOAD"])
                .add_row(vec![
                    channel_label(channel),
                    out.message_id,
                    out.reply_to.unwrap_or_else(|| "-".to_string()),
                    out.payload_size.to_string(),
                    out.peer,
                    out.payload,
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "[{}] {} ({} bytes): {}",
                channel_label(channel),
                peer,
                message.payload().len(),
                payload_preview(message.payload())
            );
        }
        OutputFormat::Raw => {
            print_raw(message.payload());
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

/// Short label for a channel id; the nil id is the default channel.
pub fn channel_label(channel: Uuid) -> String {
    if channel.is_nil() {
        "default".to_string()
    } else {
        channel.to_string()
    }
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
