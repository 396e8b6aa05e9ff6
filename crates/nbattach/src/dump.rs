//! Optional message log for debugging an attachment.
//!
//! Every verified message received on iopub is appended to the dump file as
//! one JSON object per line.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use crate::channels::ChannelName;
use crate::wire::{Header, Message};

/// Entry in the dump file - wraps a message with metadata for analysis
#[derive(Serialize)]
struct DumpEntry<'a> {
    /// ISO 8601 timestamp when the message was logged
    ts: String,
    /// Direction; only received messages ("in") are logged
    dir: &'static str,
    /// Channel the message travelled on
    ch: String,
    header: &'a Header,
    parent_header: Option<&'a Header>,
    metadata: &'a Value,
    content: &'a Value,
    /// Number of binary buffers (contents are not logged)
    buffers: usize,
}

/// Shared handle to a dump file.
#[derive(Clone)]
pub struct MessageDump {
    file: Arc<Mutex<File>>,
}

impl MessageDump {
    /// Open the dump file for appending, creating it if needed.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Append one received message. Failures are ignored; the dump is
    /// best-effort and must never disturb the relay.
    pub fn record_incoming(&self, channel: ChannelName, message: &Message) {
        self.write(DumpEntry {
            ts: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            dir: "in",
            ch: channel.to_string(),
            header: &message.header,
            parent_header: message.parent_header.as_ref(),
            metadata: &message.metadata,
            content: &message.content,
            buffers: message.buffers.len(),
        });
    }

    fn write(&self, entry: DumpEntry<'_>) {
        if let Ok(json) = serde_json::to_string(&entry) {
            if let Ok(mut f) = self.file.lock() {
                let _ = writeln!(f, "{}", json);
                let _ = f.flush();
            }
        }
    }
}
