//! Kernel connection descriptors.
//!
//! A running Jupyter kernel advertises how to reach it in a JSON connection
//! file:
//!
//! ```json
//! {
//!   "transport": "tcp", "ip": "127.0.0.1",
//!   "shell_port": 53794, "iopub_port": 53795, "stdin_port": 53796,
//!   "control_port": 53797, "hb_port": 53798,
//!   "signature_scheme": "hmac-sha256", "key": "a0436f6c-1916-498b-8eb9-e81ab9368e84",
//!   "kernel_name": "python3"
//! }
//! ```
//!
//! [`ConnectionDescriptor`] is the validated, immutable form of that file.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use crate::channels::ChannelName;
use crate::error::LocatorError;

/// Socket transport named in the connection file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Ipc,
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Transport::Tcp),
            "ipc" => Ok(Transport::Ipc),
            other => Err(format!("unsupported transport {:?}", other)),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Ipc => write!(f, "ipc"),
        }
    }
}

/// HMAC digest used to sign messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    HmacSha256,
    HmacSha384,
    HmacSha512,
}

impl FromStr for SignatureScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hmac-sha256" => Ok(SignatureScheme::HmacSha256),
            "hmac-sha384" => Ok(SignatureScheme::HmacSha384),
            "hmac-sha512" => Ok(SignatureScheme::HmacSha512),
            other => Err(format!("unsupported signature scheme {:?}", other)),
        }
    }
}

impl fmt::Display for SignatureScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignatureScheme::HmacSha256 => write!(f, "hmac-sha256"),
            SignatureScheme::HmacSha384 => write!(f, "hmac-sha384"),
            SignatureScheme::HmacSha512 => write!(f, "hmac-sha512"),
        }
    }
}

/// Connection file as written by the kernel launcher. Everything is optional
/// here so that missing fields can be reported by name.
#[derive(Debug, Deserialize)]
struct RawConnectionFile {
    transport: Option<String>,
    ip: Option<String>,
    shell_port: Option<i64>,
    iopub_port: Option<i64>,
    stdin_port: Option<i64>,
    control_port: Option<i64>,
    hb_port: Option<i64>,
    signature_scheme: Option<String>,
    key: Option<String>,
    kernel_name: Option<String>,
}

/// Validated parameters for reaching one kernel.
///
/// All five ports are positive and pairwise distinct.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub transport: Transport,
    pub ip: String,
    pub control_port: u16,
    pub shell_port: u16,
    pub iopub_port: u16,
    pub hb_port: u16,
    pub stdin_port: u16,
    pub signature_scheme: SignatureScheme,
    key: String,
    pub kernel_name: Option<String>,
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("transport", &self.transport)
            .field("ip", &self.ip)
            .field("control_port", &self.control_port)
            .field("shell_port", &self.shell_port)
            .field("iopub_port", &self.iopub_port)
            .field("hb_port", &self.hb_port)
            .field("stdin_port", &self.stdin_port)
            .field("signature_scheme", &self.signature_scheme)
            .field("key", &"[REDACTED]")
            .field("kernel_name", &self.kernel_name)
            .finish()
    }
}

fn required<T>(value: Option<T>, field: &str) -> Result<T, String> {
    value.ok_or_else(|| format!("missing field `{}`", field))
}

fn port(value: Option<i64>, field: &str) -> Result<u16, String> {
    let raw = required(value, field)?;
    match u16::try_from(raw) {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(format!("`{}` must be a port in 1..=65535, got {}", field, raw)),
    }
}

impl ConnectionDescriptor {
    /// Parse and validate the contents of a connection file.
    pub fn from_json(content: &str) -> Result<Self, String> {
        let raw: RawConnectionFile =
            serde_json::from_str(content).map_err(|e| format!("invalid JSON: {}", e))?;

        let key = required(raw.key, "key")?;
        // Without a key messages are unsigned and the scheme is never used.
        let signature_scheme = match raw.signature_scheme {
            Some(scheme) if !key.is_empty() => scheme.parse()?,
            None if !key.is_empty() => return Err("missing field `signature_scheme`".to_string()),
            _ => SignatureScheme::HmacSha256,
        };

        let descriptor = ConnectionDescriptor {
            transport: required(raw.transport, "transport")?.parse()?,
            ip: required(raw.ip, "ip")?,
            control_port: port(raw.control_port, "control_port")?,
            shell_port: port(raw.shell_port, "shell_port")?,
            iopub_port: port(raw.iopub_port, "iopub_port")?,
            hb_port: port(raw.hb_port, "hb_port")?,
            stdin_port: port(raw.stdin_port, "stdin_port")?,
            signature_scheme,
            key,
            kernel_name: raw.kernel_name.filter(|n| !n.is_empty()),
        };

        if descriptor.ip.is_empty() {
            return Err("`ip` is empty".to_string());
        }

        let ports = descriptor.ports();
        for (i, a) in ports.iter().enumerate() {
            if ports[i + 1..].contains(a) {
                return Err(format!("port {} is assigned to more than one channel", a));
            }
        }

        Ok(descriptor)
    }

    /// Read a connection file from disk. A single read; nothing is cached.
    pub fn read(path: &Path) -> Result<Self, LocatorError> {
        let content = std::fs::read_to_string(path).map_err(|e| LocatorError::Malformed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_json(&content).map_err(|reason| LocatorError::Malformed {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Ports in channel order: control, shell, iopub, heartbeat, stdin.
    pub fn ports(&self) -> [u16; 5] {
        [
            self.control_port,
            self.shell_port,
            self.iopub_port,
            self.hb_port,
            self.stdin_port,
        ]
    }

    pub fn port_for(&self, channel: ChannelName) -> u16 {
        match channel {
            ChannelName::Control => self.control_port,
            ChannelName::Shell => self.shell_port,
            ChannelName::IoPub => self.iopub_port,
            ChannelName::Heartbeat => self.hb_port,
            ChannelName::Stdin => self.stdin_port,
        }
    }

    /// ZeroMQ endpoint for `channel`.
    ///
    /// IPC endpoints follow the Jupyter convention of `<ip>-<port>` as the
    /// socket path.
    pub fn endpoint(&self, channel: ChannelName) -> String {
        let port = self.port_for(channel);
        match self.transport {
            Transport::Tcp => format!("tcp://{}:{}", self.ip, port),
            Transport::Ipc => format!("ipc://{}-{}", self.ip, port),
        }
    }

    /// Shared secret used for message signatures. Empty means unsigned.
    pub fn key(&self) -> &[u8] {
        self.key.as_bytes()
    }
}
