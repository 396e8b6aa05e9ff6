//! Terminal rendering of output events.
//!
//! Rich outputs carry several representations of the same value. The
//! renderer picks one, in order of preference:
//!
//! 1. `image/*`: a one-line placeholder with mimetype, pixel size (PNG only)
//!    and decoded size
//! 2. `text/html`, reduced to plain text
//! 3. `text/plain`
//! 4. anything else: a single notice naming what was not shown
//!
//! Stream text is written as-is so the user's terminal interprets any
//! escape sequences itself. The only thing held back is an escape sequence
//! cut off at the end of a chunk, which waits for the next chunk of the same
//! stream (or the idle status of its execution).

use std::collections::HashMap;
use std::sync::OnceLock;

use base64::Engine;
use regex::Regex;
use serde_json::Value;

use crate::dispatch::{ExecutionState, MimeBundle, OutputEvent, OutputKind, Representation};

/// Printed when an execution finishes.
pub const IDLE_PROMPT: &str = "Kernel is idle. Waiting for next cell execution...";

/// Printed when the kernel reports `starting` (a restart).
pub const RESTART_NOTICE: &str = "Kernel restarted.";

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

/// Key for held-back stream tails: (correlation id, stream name).
type StreamKey = (String, String);

/// Longest escape tail held back; an unterminated string longer than this
/// is written out as-is.
const MAX_HELD_TAIL: usize = 4096;

const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;

/// Length of the escape sequence at the start of `bytes` (which begins with
/// ESC), or `None` if it is cut off.
fn escape_len(bytes: &[u8]) -> Option<usize> {
    match bytes.get(1)? {
        // CSI: parameters and intermediates, then one final byte.
        b'[' => bytes
            .get(2..)?
            .iter()
            .position(|b| (0x40..=0x7e).contains(b))
            .map(|p| p + 3),
        // OSC, DCS, SOS, PM, APC: string terminated by BEL or ST.
        b']' | b'P' | b'X' | b'^' | b'_' => {
            let mut i = 2;
            while i < bytes.len() {
                match bytes[i] {
                    BEL => return Some(i + 1),
                    ESC => {
                        return match bytes.get(i + 1) {
                            Some(b'\\') => Some(i + 2),
                            // Another escape aborts the string.
                            Some(_) => Some(i),
                            None => None,
                        }
                    }
                    _ => i += 1,
                }
            }
            None
        }
        // Character set designation takes one more byte.
        b'(' | b')' | b'*' | b'+' | b'#' | b'%' => bytes.get(2).map(|_| 3),
        _ => Some(2),
    }
}

/// Split `text` into the part that can be written now and an incomplete
/// trailing escape sequence.
pub fn split_escape_tail(text: &str) -> (&str, &str) {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != ESC {
            i += 1;
            continue;
        }
        match escape_len(&bytes[i..]) {
            Some(len) => i += len,
            // ESC is ASCII, so `i` is a char boundary.
            None => return text.split_at(i),
        }
    }
    (text, "")
}

struct HtmlPatterns {
    hidden: Regex,
    line_breaks: Regex,
    cell_breaks: Regex,
    tags: Regex,
    blank_lines: Regex,
}

impl HtmlPatterns {
    fn compile() -> Option<Self> {
        Some(Self {
            hidden: Regex::new(r"(?is)<script\b.*?</script\s*>|<style\b.*?</style\s*>|<!--.*?-->")
                .ok()?,
            line_breaks: Regex::new(r"(?i)<br\s*/?>|</(p|div|tr|li|h[1-6]|pre|table|thead|tbody)\s*>")
                .ok()?,
            cell_breaks: Regex::new(r"(?i)</(td|th)\s*>").ok()?,
            tags: Regex::new(r"<[^>]*>").ok()?,
            blank_lines: Regex::new(r"\n[ \t]*\n([ \t]*\n)+").ok()?,
        })
    }
}

static HTML_PATTERNS: OnceLock<Option<HtmlPatterns>> = OnceLock::new();

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&amp;", "&")
}

/// Reduce HTML to readable text. Returns `None` when nothing visible is left.
pub fn html_to_text(html: &str) -> Option<String> {
    let patterns = HTML_PATTERNS.get_or_init(HtmlPatterns::compile).as_ref()?;
    let text = patterns.hidden.replace_all(html, "");
    let text = patterns.line_breaks.replace_all(&text, "\n");
    let text = patterns.cell_breaks.replace_all(&text, "  ");
    let text = patterns.tags.replace_all(&text, "");
    let text = decode_entities(&text);
    let text = patterns.blank_lines.replace_all(&text, "\n\n");
    let lines: Vec<&str> = text.lines().map(str::trim_end).collect();
    let text = lines.join("\n").trim().to_string();
    (!text.is_empty()).then_some(text)
}

/// Text from a mimebundle value: a string, or a list of strings (lines).
fn bundle_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => Some(
            parts
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .concat(),
        ),
        _ => None,
    }
}

/// Width and height from a PNG's IHDR chunk.
fn png_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    if bytes.len() < 24 || !bytes.starts_with(PNG_SIGNATURE) || &bytes[12..16] != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes(bytes[16..20].try_into().ok()?);
    let height = u32::from_be_bytes(bytes[20..24].try_into().ok()?);
    Some((width, height))
}

fn format_size(bytes: usize) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

fn image_placeholder(repr: &Representation) -> String {
    let Some(data) = bundle_text(&repr.data) else {
        return format!("[{}]", repr.mimetype);
    };

    // SVG travels as markup, everything else as base64.
    if repr.mimetype.starts_with("image/svg") {
        return format!("[{}, {}]", repr.mimetype, format_size(data.len()));
    }

    let compact: String = data.chars().filter(|c| !c.is_whitespace()).collect();
    match base64::engine::general_purpose::STANDARD.decode(compact) {
        Ok(bytes) => match png_dimensions(&bytes) {
            Some((w, h)) => format!(
                "[{}, {}x{}, {}]",
                repr.mimetype,
                w,
                h,
                format_size(bytes.len())
            ),
            None => format!("[{}, {}]", repr.mimetype, format_size(bytes.len())),
        },
        Err(_) => format!("[{}]", repr.mimetype),
    }
}

fn fallback_notice(bundle: &MimeBundle) -> String {
    if bundle.malformed {
        return "[malformed output]".to_string();
    }
    if bundle.is_empty() {
        return "[empty output]".to_string();
    }
    let types: Vec<&str> = bundle
        .representations
        .iter()
        .map(|r| r.mimetype.as_str())
        .collect();
    format!("[output not shown: {}]", types.join(", "))
}

/// Pick and render one representation of `bundle`. Always yields text.
pub fn render_bundle(bundle: &MimeBundle) -> String {
    if let Some(image) = bundle
        .representations
        .iter()
        .find(|r| r.mimetype.starts_with("image/"))
    {
        return image_placeholder(image);
    }
    if let Some(text) = bundle
        .get("text/html")
        .and_then(bundle_text)
        .and_then(|html| html_to_text(&html))
    {
        return text;
    }
    if let Some(text) = bundle.get("text/plain").and_then(bundle_text) {
        return text;
    }
    fallback_notice(bundle)
}

fn line(text: impl Into<String>) -> String {
    let mut text = text.into();
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text
}

/// Renders output events to terminal writes.
#[derive(Debug, Default)]
pub struct Renderer {
    show_status: bool,
    pending: HashMap<StreamKey, String>,
}

impl Renderer {
    pub fn new(show_status: bool) -> Self {
        Self {
            show_status,
            pending: HashMap::new(),
        }
    }

    /// Terminal writes for one event, in order. Never fails; malformed
    /// payloads degrade to a notice.
    pub fn render(&mut self, event: &OutputEvent) -> Vec<String> {
        match &event.kind {
            OutputKind::Stream { name, text } => {
                let key = (
                    event.correlation_id.clone().unwrap_or_default(),
                    name.clone(),
                );
                let mut buffered = self.pending.remove(&key).unwrap_or_default();
                buffered.push_str(text);

                let (ready, tail) = split_escape_tail(&buffered);
                if tail.len() > MAX_HELD_TAIL {
                    return vec![buffered];
                }
                let mut writes = Vec::new();
                if !ready.is_empty() {
                    writes.push(ready.to_string());
                }
                if !tail.is_empty() {
                    self.pending.insert(key, tail.to_string());
                }
                writes
            }
            OutputKind::DisplayData { bundle } => vec![line(render_bundle(bundle))],
            OutputKind::ExecuteResult {
                execution_count,
                bundle,
            } => {
                let prefix = match execution_count.or(event.execution_count) {
                    Some(n) => format!("Out[{}]: ", n),
                    None => "Out: ".to_string(),
                };
                vec![line(format!("{}{}", prefix, render_bundle(bundle)))]
            }
            OutputKind::Error {
                ename,
                evalue,
                traceback,
            } => {
                let mut writes = vec![line(format!("{}: {}", ename, evalue))];
                writes.extend(traceback.iter().map(|l| line(l.as_str())));
                writes
            }
            OutputKind::Status {
                state,
                after_execution,
            } => {
                let mut writes = Vec::new();
                match state {
                    ExecutionState::Idle => {
                        if let Some(id) = &event.correlation_id {
                            writes.extend(self.flush_correlation(id));
                        }
                        if self.show_status && *after_execution {
                            writes.push(line(IDLE_PROMPT));
                        }
                    }
                    ExecutionState::Starting => {
                        writes.extend(self.flush());
                        if self.show_status {
                            writes.push(line(RESTART_NOTICE));
                        }
                    }
                    _ => {}
                }
                writes
            }
        }
    }

    /// Release held-back tails of one execution's streams.
    fn flush_correlation(&mut self, correlation_id: &str) -> Vec<String> {
        let mut keys: Vec<StreamKey> = self
            .pending
            .keys()
            .filter(|(id, _)| id == correlation_id)
            .cloned()
            .collect();
        keys.sort();
        keys.into_iter()
            .filter_map(|key| self.pending.remove(&key))
            .collect()
    }

    /// Release every held-back tail.
    pub fn flush(&mut self) -> Vec<String> {
        let mut pending: Vec<(StreamKey, String)> = self.pending.drain().collect();
        pending.sort();
        pending.into_iter().map(|(_, tail)| tail).collect()
    }
}
