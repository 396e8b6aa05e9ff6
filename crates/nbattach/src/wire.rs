//! Jupyter wire protocol framing and message authentication.
//!
//! A message on any kernel channel is a multipart ZeroMQ message:
//!
//! ```text
//! [routing identities...] "<IDS|MSG>" signature header parent_header metadata content [buffers...]
//! ```
//!
//! The signature is the hex-encoded HMAC of the header, parent header,
//! metadata and content frames, keyed with the connection file's `key`. An
//! empty key means the session is unsigned and the signature frame is empty.
//!
//! [`decode`] verifies the signature before any JSON is parsed, so content
//! from a message that fails authentication is never looked at.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use ring::hmac;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::connection::SignatureScheme;
use crate::error::CodecError;

/// Separates routing identities from the message body.
pub const DELIMITER: &[u8] = b"<IDS|MSG>";

/// Messaging protocol version stamped on outgoing headers.
pub const PROTOCOL_VERSION: &str = "5.3";

/// Username stamped on outgoing headers.
const USERNAME: &str = "nbattach";

/// Message header. Also used as the parent header of replies and outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: String,
    #[serde(default)]
    pub session: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub date: String,
    pub msg_type: String,
    #[serde(default)]
    pub version: String,
}

impl Header {
    pub fn new(msg_type: &str, session: &str) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            session: session.to_string(),
            username: USERNAME.to_string(),
            date: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            msg_type: msg_type.to_string(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// Message types this tool understands. Anything else is carried through
/// as `Unrecognized` rather than failing to decode.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Stream,
    DisplayData,
    UpdateDisplayData,
    ExecuteInput,
    ExecuteResult,
    Error,
    Status,
    ClearOutput,
    KernelInfoRequest,
    KernelInfoReply,
    InterruptRequest,
    InterruptReply,
    Unrecognized(String),
}

impl MessageKind {
    pub fn parse(msg_type: &str) -> Self {
        match msg_type {
            "stream" => MessageKind::Stream,
            "display_data" => MessageKind::DisplayData,
            "update_display_data" => MessageKind::UpdateDisplayData,
            "execute_input" => MessageKind::ExecuteInput,
            "execute_result" => MessageKind::ExecuteResult,
            "error" => MessageKind::Error,
            "status" => MessageKind::Status,
            "clear_output" => MessageKind::ClearOutput,
            "kernel_info_request" => MessageKind::KernelInfoRequest,
            "kernel_info_reply" => MessageKind::KernelInfoReply,
            "interrupt_request" => MessageKind::InterruptRequest,
            "interrupt_reply" => MessageKind::InterruptReply,
            other => MessageKind::Unrecognized(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::Stream => "stream",
            MessageKind::DisplayData => "display_data",
            MessageKind::UpdateDisplayData => "update_display_data",
            MessageKind::ExecuteInput => "execute_input",
            MessageKind::ExecuteResult => "execute_result",
            MessageKind::Error => "error",
            MessageKind::Status => "status",
            MessageKind::ClearOutput => "clear_output",
            MessageKind::KernelInfoRequest => "kernel_info_request",
            MessageKind::KernelInfoReply => "kernel_info_reply",
            MessageKind::InterruptRequest => "interrupt_request",
            MessageKind::InterruptReply => "interrupt_reply",
            MessageKind::Unrecognized(other) => other,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded, authenticated protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub identities: Vec<Bytes>,
    pub header: Header,
    pub parent_header: Option<Header>,
    pub metadata: Value,
    pub content: Value,
    pub buffers: Vec<Bytes>,
}

impl Message {
    /// Build an outgoing message for `session`.
    pub fn new(kind: MessageKind, session: &str, content: Value) -> Self {
        Self {
            identities: Vec::new(),
            header: Header::new(kind.as_str(), session),
            parent_header: None,
            metadata: Value::Object(Default::default()),
            content,
            buffers: Vec::new(),
        }
    }

    pub fn with_parent(mut self, parent: Header) -> Self {
        self.parent_header = Some(parent);
        self
    }

    pub fn kind(&self) -> MessageKind {
        MessageKind::parse(&self.header.msg_type)
    }

    /// `msg_id` of the message this one was caused by.
    pub fn parent_id(&self) -> Option<&str> {
        self.parent_header.as_ref().map(|h| h.msg_id.as_str())
    }
}

/// Computes and checks message signatures for one session.
#[derive(Clone)]
pub struct Signer {
    key: Option<Arc<hmac::Key>>,
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("signed", &self.key.is_some())
            .finish()
    }
}

impl Signer {
    /// An empty `key` yields an unsigned signer.
    pub fn new(scheme: SignatureScheme, key: &[u8]) -> Self {
        if key.is_empty() {
            return Self::unsigned();
        }
        let algorithm = match scheme {
            SignatureScheme::HmacSha256 => hmac::HMAC_SHA256,
            SignatureScheme::HmacSha384 => hmac::HMAC_SHA384,
            SignatureScheme::HmacSha512 => hmac::HMAC_SHA512,
        };
        Self {
            key: Some(Arc::new(hmac::Key::new(algorithm, key))),
        }
    }

    pub fn unsigned() -> Self {
        Self { key: None }
    }

    fn sign(&self, parts: &[&[u8]]) -> String {
        match &self.key {
            Some(key) => {
                let mut ctx = hmac::Context::with_key(key);
                for part in parts {
                    ctx.update(part);
                }
                hex::encode(ctx.sign().as_ref())
            }
            None => String::new(),
        }
    }

    fn verify(&self, signature: &[u8], parts: &[&[u8]]) -> Result<(), CodecError> {
        match &self.key {
            Some(key) => {
                let expected = hex::decode(signature).map_err(|_| CodecError::Signature)?;
                let signed: Vec<u8> = parts.concat();
                hmac::verify(key, &signed, &expected).map_err(|_| CodecError::Signature)
            }
            None if signature.is_empty() => Ok(()),
            None => Err(CodecError::Signature),
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Bytes, CodecError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| CodecError::Format(e.to_string()))
}

/// Serialize `message` into signed wire frames.
pub fn encode(message: &Message, signer: &Signer) -> Result<Vec<Bytes>, CodecError> {
    let header = to_json(&message.header)?;
    let parent = match &message.parent_header {
        Some(parent) => to_json(parent)?,
        None => Bytes::from_static(b"{}"),
    };
    let metadata = to_json(&message.metadata)?;
    let content = to_json(&message.content)?;

    let signature = signer.sign(&[&header[..], &parent[..], &metadata[..], &content[..]]);

    let mut frames = Vec::with_capacity(message.identities.len() + 6 + message.buffers.len());
    frames.extend(message.identities.iter().cloned());
    frames.push(Bytes::from_static(DELIMITER));
    frames.push(Bytes::from(signature));
    frames.push(header);
    frames.push(parent);
    frames.push(metadata);
    frames.push(content);
    frames.extend(message.buffers.iter().cloned());
    Ok(frames)
}

fn parse_json(frame: &[u8], what: &str) -> Result<Value, CodecError> {
    serde_json::from_slice(frame).map_err(|e| CodecError::Format(format!("{}: {}", what, e)))
}

/// Decode and authenticate wire frames.
///
/// Returns `CodecError::Signature` without parsing anything when the
/// signature does not match. Unknown message types decode normally.
pub fn decode(frames: Vec<Bytes>, signer: &Signer) -> Result<Message, CodecError> {
    let delimiter = frames
        .iter()
        .position(|f| f.as_ref() == DELIMITER)
        .ok_or_else(|| CodecError::Format("missing <IDS|MSG> delimiter".to_string()))?;

    if frames.len() < delimiter + 6 {
        return Err(CodecError::Format(format!(
            "expected at least 5 frames after delimiter, got {}",
            frames.len() - delimiter - 1
        )));
    }

    let mut frames = frames;
    let buffers = frames.split_off(delimiter + 6);
    let body = frames.split_off(delimiter);
    let identities = frames;

    let (signature, header, parent, metadata, content) =
        (&body[1], &body[2], &body[3], &body[4], &body[5]);

    signer.verify(signature, &[&header[..], &parent[..], &metadata[..], &content[..]])?;

    let header: Header = serde_json::from_slice(header)
        .map_err(|e| CodecError::Format(format!("header: {}", e)))?;

    let parent_header = match parse_json(parent, "parent_header")? {
        Value::Null => None,
        Value::Object(map) if map.is_empty() => None,
        value => Some(
            serde_json::from_value(value)
                .map_err(|e| CodecError::Format(format!("parent_header: {}", e)))?,
        ),
    };

    Ok(Message {
        identities,
        header,
        parent_header,
        metadata: parse_json(metadata, "metadata")?,
        content: parse_json(content, "content")?,
        buffers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn signer() -> Signer {
        Signer::new(SignatureScheme::HmacSha256, b"secret-key")
    }

    fn stream_message() -> Message {
        let parent = Header::new("execute_request", "frontend-session");
        Message::new(
            MessageKind::Stream,
            "kernel-session",
            json!({"name": "stdout", "text": "42\n"}),
        )
        .with_parent(parent)
    }

    #[test]
    fn test_roundtrip() {
        let message = stream_message();
        let frames = encode(&message, &signer()).unwrap();
        let decoded = decode(frames, &signer()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_roundtrip_with_identities_and_buffers() {
        let mut message = stream_message();
        message.identities = vec![Bytes::from_static(b"stream.stdout")];
        message.buffers = vec![Bytes::from_static(&[0, 1, 2, 3])];
        let frames = encode(&message, &signer()).unwrap();
        assert_eq!(frames[0].as_ref(), b"stream.stdout");
        assert_eq!(frames[1].as_ref(), DELIMITER);
        let decoded = decode(frames, &signer()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_signature_is_hex_hmac_sha256() {
        let frames = encode(&stream_message(), &signer()).unwrap();
        let signature = std::str::from_utf8(&frames[1]).unwrap();
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_altered_signature_is_rejected() {
        let mut frames = encode(&stream_message(), &signer()).unwrap();
        let mut sig = frames[1].to_vec();
        sig[0] = if sig[0] == b'0' { b'1' } else { b'0' };
        frames[1] = Bytes::from(sig);
        assert_eq!(decode(frames, &signer()), Err(CodecError::Signature));
    }

    #[test]
    fn test_altered_content_is_rejected() {
        let mut frames = encode(&stream_message(), &signer()).unwrap();
        frames[5] = Bytes::from_static(br#"{"name":"stdout","text":"43\n"}"#);
        assert_eq!(decode(frames, &signer()), Err(CodecError::Signature));
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let frames = encode(&stream_message(), &signer()).unwrap();
        let other = Signer::new(SignatureScheme::HmacSha256, b"other-key");
        assert_eq!(decode(frames, &other), Err(CodecError::Signature));
    }

    #[test]
    fn test_signature_checked_before_parsing() {
        // Garbage JSON with a bogus signature reports Signature, not Format.
        let frames = vec![
            Bytes::from_static(DELIMITER),
            Bytes::from_static(b"deadbeef"),
            Bytes::from_static(b"not json"),
            Bytes::from_static(b"{}"),
            Bytes::from_static(b"{}"),
            Bytes::from_static(b"{}"),
        ];
        assert_eq!(decode(frames, &signer()), Err(CodecError::Signature));
    }

    #[test]
    fn test_bad_json_with_valid_signature_is_format_error() {
        let s = signer();
        let parts: [&[u8]; 4] = [b"not json", b"{}", b"{}", b"{}"];
        let sig = s.sign(&parts);
        let mut frames = vec![Bytes::from_static(DELIMITER), Bytes::from(sig)];
        frames.extend(parts.iter().map(|p| Bytes::copy_from_slice(p)));
        assert!(matches!(decode(frames, &s), Err(CodecError::Format(_))));
    }

    #[test]
    fn test_missing_delimiter() {
        let frames = vec![Bytes::from_static(b"{}"); 6];
        assert!(matches!(decode(frames, &signer()), Err(CodecError::Format(_))));
    }

    #[test]
    fn test_truncated_message() {
        let mut frames = encode(&stream_message(), &signer()).unwrap();
        frames.truncate(4);
        assert!(matches!(decode(frames, &signer()), Err(CodecError::Format(_))));
    }

    #[test]
    fn test_unknown_message_type_decodes() {
        let message = Message::new(
            MessageKind::parse("comm_open"),
            "kernel-session",
            json!({"comm_id": "abc"}),
        );
        let frames = encode(&message, &signer()).unwrap();
        let decoded = decode(frames, &signer()).unwrap();
        assert_eq!(
            decoded.kind(),
            MessageKind::Unrecognized("comm_open".to_string())
        );
    }

    #[test]
    fn test_empty_and_null_parent_header() {
        let message = Message::new(MessageKind::Status, "s", json!({"execution_state": "idle"}));
        let mut frames = encode(&message, &Signer::unsigned()).unwrap();
        assert_eq!(frames[3].as_ref(), b"{}");
        frames[3] = Bytes::from_static(b"null");
        let decoded = decode(frames, &Signer::unsigned()).unwrap();
        assert!(decoded.parent_header.is_none());
        assert!(decoded.parent_id().is_none());
    }

    #[test]
    fn test_unsigned_session() {
        let message = stream_message();
        let frames = encode(&message, &Signer::unsigned()).unwrap();
        assert!(frames[1].is_empty());
        assert_eq!(decode(frames.clone(), &Signer::unsigned()).unwrap(), message);
        // A signed frame is not accepted by an unsigned session, nor vice versa.
        assert_eq!(decode(frames, &signer()), Err(CodecError::Signature));
        let signed = encode(&message, &signer()).unwrap();
        assert_eq!(decode(signed, &Signer::unsigned()), Err(CodecError::Signature));
    }

    #[test]
    fn test_sha512_scheme() {
        let s = Signer::new(SignatureScheme::HmacSha512, b"k");
        let frames = encode(&stream_message(), &s).unwrap();
        assert_eq!(frames[1].len(), 128);
        assert!(decode(frames, &s).is_ok());
    }

    #[test]
    fn test_decodes_kernel_style_header() {
        // Headers from ipykernel carry extra fields and may omit username.
        let s = signer();
        let header = br#"{"msg_id":"a1","session":"k","date":"2025-05-14T14:32:23.490000Z","msg_type":"stream","version":"5.3","subshell_id":null}"#;
        let parent = br#"{"msg_id":"p1","msg_type":"execute_request","session":"f","username":"u","date":"2025-05-14T14:32:23.400000Z","version":"5.3"}"#;
        let parts: [&[u8]; 4] = [header, parent, b"{}", br#"{"name":"stdout","text":"hi"}"#];
        let sig = s.sign(&parts);
        let mut frames = vec![
            Bytes::from_static(b"kernel.abc.stream"),
            Bytes::from_static(DELIMITER),
            Bytes::from(sig),
        ];
        frames.extend(parts.iter().map(|p| Bytes::copy_from_slice(p)));

        let message = decode(frames, &s).unwrap();
        assert_eq!(message.kind(), MessageKind::Stream);
        assert_eq!(message.parent_id(), Some("p1"));
        assert_eq!(message.header.username, "");
        assert_eq!(message.identities.len(), 1);
        assert_eq!(message.content["text"], "hi");
    }

    #[test]
    fn test_kind_names_roundtrip() {
        for name in [
            "stream",
            "display_data",
            "execute_result",
            "error",
            "status",
            "kernel_info_reply",
            "interrupt_request",
            "something_new",
        ] {
            assert_eq!(MessageKind::parse(name).as_str(), name);
        }
    }
}
