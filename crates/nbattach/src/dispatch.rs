//! Classifying iopub traffic into output events.
//!
//! The kernel broadcasts everything on iopub: outputs, status changes, echoed
//! inputs, comm traffic. Only five kinds produce an [`OutputEvent`]:
//! `stream`, `display_data`, `execute_result`, `error` and `status`.
//! `execute_input` is observed so later outputs of the same execution can
//! carry its execution count. Everything else is dropped.
//!
//! Events come out in exactly the order their messages went in. Nothing is
//! buffered, reordered or merged here.

use std::collections::HashMap;
use std::fmt;

use futures::future;
use futures::{Stream, StreamExt};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::wire::{Message, MessageKind};

/// Executions tracked before idle entries are pruned.
const MAX_TRACKED_EXECUTIONS: usize = 256;

/// One mimetype representation of a rich output.
#[derive(Debug, Clone, PartialEq)]
pub struct Representation {
    pub mimetype: String,
    pub data: Value,
}

/// All representations the kernel sent for one rich output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MimeBundle {
    pub representations: Vec<Representation>,
    /// The payload's `data` was not a mimetype map.
    pub malformed: bool,
}

impl MimeBundle {
    pub fn from_map(data: Map<String, Value>) -> Self {
        Self {
            representations: data
                .into_iter()
                .map(|(mimetype, data)| Representation { mimetype, data })
                .collect(),
            malformed: false,
        }
    }

    /// Bundle from a payload's `data` field. A missing field is an empty
    /// bundle; anything other than a map is a malformed one.
    pub fn from_value(data: Option<&Value>) -> Self {
        match data {
            None | Some(Value::Null) => Self::default(),
            Some(Value::Object(map)) => Self::from_map(map.clone()),
            Some(_) => Self {
                representations: Vec::new(),
                malformed: true,
            },
        }
    }

    pub fn get(&self, mimetype: &str) -> Option<&Value> {
        self.representations
            .iter()
            .find(|r| r.mimetype == mimetype)
            .map(|r| &r.data)
    }

    pub fn is_empty(&self) -> bool {
        self.representations.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionState {
    Starting,
    Busy,
    Idle,
    Other(String),
}

impl ExecutionState {
    pub fn parse(state: &str) -> Self {
        match state {
            "starting" => ExecutionState::Starting,
            "busy" => ExecutionState::Busy,
            "idle" => ExecutionState::Idle,
            other => ExecutionState::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionState::Starting => write!(f, "starting"),
            ExecutionState::Busy => write!(f, "busy"),
            ExecutionState::Idle => write!(f, "idle"),
            ExecutionState::Other(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputKind {
    Stream {
        name: String,
        text: String,
    },
    DisplayData {
        bundle: MimeBundle,
    },
    ExecuteResult {
        execution_count: Option<u64>,
        bundle: MimeBundle,
    },
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
    Status {
        state: ExecutionState,
        /// `idle` that ends a code execution (as opposed to e.g. a
        /// `kernel_info_request`).
        after_execution: bool,
    },
}

/// A renderable output derived from exactly one iopub message.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputEvent {
    /// `msg_id` of the request that caused the output.
    pub correlation_id: Option<String>,
    pub execution_count: Option<u64>,
    pub kind: OutputKind,
}

#[derive(Deserialize)]
struct StreamContent {
    name: String,
    text: String,
}

#[derive(Deserialize)]
struct StatusContent {
    execution_state: String,
}


#[derive(Debug, Clone)]
struct Execution {
    state: ExecutionState,
    execution_count: Option<u64>,
    /// An `execute_input` was seen for this correlation id.
    executed: bool,
    seq: u64,
}

/// Per-correlation execution state, bounded in size.
#[derive(Debug, Default)]
struct ExecutionTable {
    entries: HashMap<String, Execution>,
    seq: u64,
}

impl ExecutionTable {
    fn entry(&mut self, id: &str) -> &mut Execution {
        self.seq += 1;
        let seq = self.seq;
        if !self.entries.contains_key(id) {
            self.prune();
        }
        let entry = self
            .entries
            .entry(id.to_string())
            .or_insert_with(|| Execution {
                state: ExecutionState::Starting,
                execution_count: None,
                executed: false,
                seq,
            });
        entry.seq = seq;
        entry
    }

    fn get(&self, id: &str) -> Option<&Execution> {
        self.entries.get(id)
    }

    /// Make room for one more entry: drop idle executions first, then the
    /// least recently touched.
    fn prune(&mut self) {
        if self.entries.len() < MAX_TRACKED_EXECUTIONS {
            return;
        }
        self.entries
            .retain(|_, e| e.state != ExecutionState::Idle);
        while self.entries.len() >= MAX_TRACKED_EXECUTIONS {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.seq)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    self.entries.remove(&id);
                }
                None => break,
            }
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

fn parse_content<T: DeserializeOwned>(message: &Message) -> Option<T> {
    match serde_json::from_value(message.content.clone()) {
        Ok(content) => Some(content),
        Err(e) => {
            warn!(
                "[dispatch] Dropping malformed {} ({}): {}",
                message.header.msg_type, message.header.msg_id, e
            );
            None
        }
    }
}

/// `execution_count` when it is a non-negative integer.
fn execution_count(message: &Message) -> Option<u64> {
    let value = message.content.get("execution_count")?;
    let count = value.as_u64();
    if count.is_none() && !value.is_null() {
        warn!(
            "[dispatch] Ignoring execution_count {} in {} ({})",
            value, message.header.msg_type, message.header.msg_id
        );
    }
    count
}

fn text_field(content: &Value, field: &str) -> String {
    match content.get(field) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn traceback_lines(content: &Value) -> Vec<String> {
    match content.get("traceback") {
        Some(Value::Array(lines)) => lines
            .iter()
            .map(|line| match line {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        Some(Value::String(line)) => vec![line.clone()],
        _ => Vec::new(),
    }
}

fn rich_bundle(message: &Message) -> MimeBundle {
    let bundle = MimeBundle::from_value(message.content.get("data"));
    if bundle.malformed {
        warn!(
            "[dispatch] {} ({}) has non-map data",
            message.header.msg_type, message.header.msg_id
        );
    }
    bundle
}

/// Turns iopub messages into output events, one at a time.
#[derive(Debug, Default)]
pub struct Dispatcher {
    executions: ExecutionTable,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify one message. Returns `None` for messages that produce no
    /// output (unknown or untracked kinds, streams or statuses without text).
    pub fn dispatch(&mut self, message: &Message) -> Option<OutputEvent> {
        let correlation_id = message.parent_id().map(str::to_string);

        let kind = match message.kind() {
            MessageKind::Stream => {
                let c: StreamContent = parse_content(message)?;
                OutputKind::Stream {
                    name: c.name,
                    text: c.text,
                }
            }
            MessageKind::DisplayData => OutputKind::DisplayData {
                bundle: rich_bundle(message),
            },
            MessageKind::ExecuteResult => {
                let count = execution_count(message);
                if let (Some(id), Some(count)) = (&correlation_id, count) {
                    self.executions.entry(id).execution_count = Some(count);
                }
                OutputKind::ExecuteResult {
                    execution_count: count,
                    bundle: rich_bundle(message),
                }
            }
            MessageKind::Error => OutputKind::Error {
                ename: text_field(&message.content, "ename"),
                evalue: text_field(&message.content, "evalue"),
                traceback: traceback_lines(&message.content),
            },
            MessageKind::Status => {
                let c: StatusContent = parse_content(message)?;
                let state = ExecutionState::parse(&c.execution_state);
                let after_execution = self.track_status(correlation_id.as_deref(), &state);
                OutputKind::Status {
                    state,
                    after_execution,
                }
            }
            MessageKind::ExecuteInput => {
                let count = execution_count(message);
                if let Some(id) = &correlation_id {
                    let entry = self.executions.entry(id);
                    entry.executed = true;
                    entry.execution_count = count;
                }
                return None;
            }
            MessageKind::Unrecognized(msg_type) => {
                debug!("[dispatch] Ignoring unrecognized {}", msg_type);
                return None;
            }
            other => {
                debug!("[dispatch] Ignoring {}", other);
                return None;
            }
        };

        let execution_count = match &kind {
            OutputKind::ExecuteResult {
                execution_count: Some(n),
                ..
            } => Some(*n),
            _ => correlation_id
                .as_deref()
                .and_then(|id| self.executions.get(id))
                .and_then(|e| e.execution_count),
        };

        Some(OutputEvent {
            correlation_id,
            execution_count,
            kind,
        })
    }

    /// Update the execution table. Returns whether this status is the idle
    /// that ends an execution.
    fn track_status(&mut self, correlation_id: Option<&str>, state: &ExecutionState) -> bool {
        if *state == ExecutionState::Starting {
            // Kernel restarted: nothing from before is still running.
            self.executions.clear();
            return false;
        }
        let Some(id) = correlation_id else {
            return false;
        };
        let entry = self.executions.entry(id);
        let was_idle = entry.state == ExecutionState::Idle;
        entry.state = state.clone();
        *state == ExecutionState::Idle && entry.executed && !was_idle
    }

    /// Number of correlation ids currently tracked.
    pub fn tracked(&self) -> usize {
        self.executions.len()
    }
}

/// Adapt a stream of messages into a stream of output events, preserving
/// order.
pub fn output_events<S>(messages: S) -> impl Stream<Item = OutputEvent>
where
    S: Stream<Item = Message>,
{
    let mut dispatcher = Dispatcher::new();
    messages.filter_map(move |message| future::ready(dispatcher.dispatch(&message)))
}
