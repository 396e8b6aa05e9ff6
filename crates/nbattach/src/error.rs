//! Error types shared across the attach pipeline.
//!
//! Session-level faults (`LocatorError`, `AttachError`) end the attachment and
//! carry a distinct process exit code. Per-message faults (`CodecError`) are
//! logged and the offending message is dropped.

use std::path::PathBuf;

use crate::channels::ChannelName;

/// Failure to resolve a single live kernel for a target.
#[derive(Debug, thiserror::Error)]
pub enum LocatorError {
    #[error("No running kernel found for {target}")]
    NotFound { target: String },

    #[error("Multiple running kernels match {target}: {}", candidates.join(", "))]
    Ambiguous {
        target: String,
        candidates: Vec<String>,
    },

    #[error("Malformed connection file {}: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },
}

/// Failure to decode or authenticate a single wire message.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Signature mismatch")]
    Signature,

    #[error("Malformed message: {0}")]
    Format(String),
}

/// Fatal conditions that end an attachment.
#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    #[error(transparent)]
    Locator(#[from] LocatorError),

    #[error("Channel unavailable: {channel}: {reason}")]
    ChannelUnavailable {
        channel: ChannelName,
        reason: String,
    },

    #[error("Kernel unreachable: heartbeat failed {failures} consecutive times")]
    KernelUnreachable { failures: u32 },

    #[error("Request failed on {channel}: {reason}")]
    Request {
        channel: ChannelName,
        reason: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AttachError {
    /// Process exit code for this failure.
    ///
    /// Zero is reserved for a normal detach.
    pub fn exit_code(&self) -> i32 {
        match self {
            AttachError::Locator(LocatorError::NotFound { .. }) => 2,
            AttachError::Locator(LocatorError::Ambiguous { .. }) => 3,
            AttachError::Locator(LocatorError::Malformed { .. }) => 4,
            AttachError::ChannelUnavailable { .. } => 5,
            AttachError::KernelUnreachable { .. } => 6,
            AttachError::Request { .. } | AttachError::Io(_) => 1,
        }
    }
}
