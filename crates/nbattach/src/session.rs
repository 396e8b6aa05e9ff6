//! One attach lifecycle.
//!
//! A [`Session`] is created by [`crate::channels::open`] and owns everything
//! the attachment holds: the request channels, the background tasks and the
//! receiving end of the iopub queue. [`Session::close`] tears these down in
//! order; dropping a session that was never closed aborts its tasks.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::channels::{ChannelName, RequestChannel};
use crate::connection::ConnectionDescriptor;
use crate::error::AttachError;
use crate::heartbeat::LivenessState;
use crate::wire::{Message, MessageKind};

/// Resolves once `shutdown` is set (or its sender is gone).
///
/// Never holds the watch borrow across an await.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Everything `open` assembles before handing it to the session.
pub(crate) struct SessionParts {
    pub id: String,
    pub descriptor: Arc<ConnectionDescriptor>,
    pub control: RequestChannel,
    pub shell: RequestChannel,
    pub stdin: Option<RequestChannel>,
    pub iopub_task: JoinHandle<()>,
    pub monitor_task: JoinHandle<()>,
    pub messages: mpsc::Receiver<Message>,
    pub liveness: watch::Receiver<LivenessState>,
    pub shutdown: watch::Sender<bool>,
    pub teardown_grace: Duration,
}

/// Kernel identity parsed from a `kernel_info_reply`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelInfo {
    pub implementation: String,
    pub implementation_version: String,
    pub language: String,
    pub language_version: String,
    pub banner: String,
}

impl KernelInfo {
    pub fn from_reply(content: &Value) -> Self {
        let text = |v: &Value| v.as_str().unwrap_or_default().to_string();
        Self {
            implementation: text(&content["implementation"]),
            implementation_version: text(&content["implementation_version"]),
            language: text(&content["language_info"]["name"]),
            language_version: text(&content["language_info"]["version"]),
            banner: text(&content["banner"]),
        }
    }

    /// One-line summary, e.g. `python 3.12.1 (ipython 8.20.0)`.
    pub fn summary(&self) -> String {
        let mut line = if self.language.is_empty() {
            "unknown language".to_string()
        } else {
            self.language.clone()
        };
        if !self.language_version.is_empty() {
            line.push(' ');
            line.push_str(&self.language_version);
        }
        if !self.implementation.is_empty() {
            line.push_str(&format!(" ({}", self.implementation));
            if !self.implementation_version.is_empty() {
                line.push(' ');
                line.push_str(&self.implementation_version);
            }
            line.push(')');
        }
        line
    }
}

pub struct Session {
    id: String,
    descriptor: Arc<ConnectionDescriptor>,
    /// Locked only by `interrupt`, so an interrupt can be in flight while
    /// the caller keeps relaying output.
    control: Mutex<Option<RequestChannel>>,
    shell: Option<RequestChannel>,
    stdin: Option<RequestChannel>,
    iopub_task: Option<JoinHandle<()>>,
    monitor_task: Option<JoinHandle<()>>,
    messages: Option<mpsc::Receiver<Message>>,
    liveness: watch::Receiver<LivenessState>,
    shutdown: watch::Sender<bool>,
    teardown_grace: Duration,
    closed: bool,
}

impl Session {
    pub(crate) fn from_parts(parts: SessionParts) -> Self {
        Self {
            id: parts.id,
            descriptor: parts.descriptor,
            control: Mutex::new(Some(parts.control)),
            shell: Some(parts.shell),
            stdin: parts.stdin,
            iopub_task: Some(parts.iopub_task),
            monitor_task: Some(parts.monitor_task),
            messages: Some(parts.messages),
            liveness: parts.liveness,
            shutdown: parts.shutdown,
            teardown_grace: parts.teardown_grace,
            closed: false,
        }
    }

    /// Client session id stamped on every outgoing header.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn descriptor(&self) -> &Arc<ConnectionDescriptor> {
        &self.descriptor
    }

    pub fn liveness(&self) -> LivenessState {
        *self.liveness.borrow()
    }

    pub fn liveness_watch(&self) -> watch::Receiver<LivenessState> {
        self.liveness.clone()
    }

    /// A receiver that flips to `true` when the session starts closing.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Take the queue of verified iopub messages. Can only be taken once.
    pub fn take_messages(&mut self) -> Option<mpsc::Receiver<Message>> {
        self.messages.take()
    }

    fn closed_error(channel: ChannelName) -> AttachError {
        AttachError::Request {
            channel,
            reason: "session is closed".to_string(),
        }
    }

    /// Ask the kernel to describe itself over the shell channel.
    pub async fn kernel_info(&mut self, timeout: Duration) -> Result<KernelInfo, AttachError> {
        let shell = self
            .shell
            .as_mut()
            .ok_or_else(|| Self::closed_error(ChannelName::Shell))?;
        let reply = shell
            .request(MessageKind::KernelInfoRequest, json!({}), timeout)
            .await?;
        Ok(KernelInfo::from_reply(&reply.content))
    }

    /// Interrupt the running cell via the control channel.
    ///
    /// Takes `&self`: the future can be polled alongside other work on the
    /// session. Concurrent interrupts queue on the control channel.
    pub async fn interrupt(&self, timeout: Duration) -> Result<(), AttachError> {
        let mut control = self.control.lock().await;
        let control = control
            .as_mut()
            .ok_or_else(|| Self::closed_error(ChannelName::Control))?;
        let reply = control
            .request(MessageKind::InterruptRequest, json!({}), timeout)
            .await?;
        match reply.content.get("status").and_then(Value::as_str) {
            Some("ok") | None => Ok(()),
            Some(other) => Err(AttachError::Request {
                channel: ChannelName::Control,
                reason: format!("interrupt_reply status {}", other),
            }),
        }
    }

    /// Ordered teardown: stop the liveness monitor, stop the iopub reader,
    /// close the request channels, then drop the message queue.
    ///
    /// Calling this more than once is a no-op.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        debug!("[channels] Closing session {}", self.id);

        self.shutdown.send_replace(true);

        if let Some(task) = self.monitor_task.take() {
            join_or_abort(task, self.teardown_grace, "heartbeat monitor").await;
        }
        if let Some(task) = self.iopub_task.take() {
            join_or_abort(task, self.teardown_grace, "iopub reader").await;
        }

        for channel in [self.control.get_mut().take(), self.shell.take(), self.stdin.take()]
            .into_iter()
            .flatten()
        {
            channel.close().await;
        }

        self.messages = None;
        info!("[channels] Session {} closed", self.id);
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

async fn join_or_abort(mut task: JoinHandle<()>, grace: Duration, what: &str) {
    if tokio::time::timeout(grace, &mut task).await.is_err() {
        debug!("[channels] {} did not stop in {:?}, aborting", what, grace);
        task.abort();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.shutdown.send_replace(true);
        if let Some(task) = self.monitor_task.take() {
            task.abort();
        }
        if let Some(task) = self.iopub_task.take() {
            task.abort();
        }
    }
}
