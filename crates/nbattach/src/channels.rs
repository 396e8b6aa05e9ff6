//! Kernel channel client.
//!
//! Opens the five Jupyter channels against a [`ConnectionDescriptor`]:
//!
//! - **control** and **shell**: DEALER sockets for request/reply traffic,
//!   one outstanding request at a time.
//! - **iopub**: SUB socket subscribed to every topic; receive only.
//! - **heartbeat**: REQ socket echoing probes (owned by the liveness monitor).
//! - **stdin**: DEALER socket, only when configured.
//!
//! Opening is all-or-nothing: if any channel fails, the ones already
//! connected are closed before the error is returned.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;
use zeromq::{DealerSocket, ReqSocket, Socket, SocketRecv, SocketSend, SubSocket, ZmqMessage};

use crate::config::AttachConfig;
use crate::connection::ConnectionDescriptor;
use crate::dump::MessageDump;
use crate::error::AttachError;
use crate::heartbeat::{self, LivenessState, LivenessTracker, Thresholds, ZmqHeartbeat};
use crate::session::{shutdown_requested, Session, SessionParts};
use crate::wire::{self, Message, MessageKind, Signer};

/// Upper bound on closing a single socket during teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

/// The kernel channels, named as in the connection file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelName {
    Control,
    Shell,
    IoPub,
    Heartbeat,
    Stdin,
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelName::Control => write!(f, "control"),
            ChannelName::Shell => write!(f, "shell"),
            ChannelName::IoPub => write!(f, "iopub"),
            ChannelName::Heartbeat => write!(f, "hb"),
            ChannelName::Stdin => write!(f, "stdin"),
        }
    }
}

async fn connect<S: Socket>(
    mut socket: S,
    channel: ChannelName,
    endpoint: &str,
    timeout: Duration,
) -> Result<S, AttachError> {
    debug!("[channels] Connecting {} to {}", channel, endpoint);
    match tokio::time::timeout(timeout, socket.connect(endpoint)).await {
        Ok(Ok(())) => Ok(socket),
        Ok(Err(e)) => Err(AttachError::ChannelUnavailable {
            channel,
            reason: e.to_string(),
        }),
        Err(_) => Err(AttachError::ChannelUnavailable {
            channel,
            reason: format!("timed out connecting to {}", endpoint),
        }),
    }
}

async fn close_socket<S: Socket>(socket: S, channel: ChannelName) {
    match tokio::time::timeout(CLOSE_TIMEOUT, socket.close()).await {
        Ok(errors) => {
            for e in errors {
                debug!("[channels] Error closing {}: {}", channel, e);
            }
        }
        Err(_) => debug!("[channels] Timed out closing {}", channel),
    }
}

/// Sockets connected so far during `open`, so a failure can roll them back.
#[derive(Default)]
struct Opened {
    control: Option<DealerSocket>,
    shell: Option<DealerSocket>,
    iopub: Option<SubSocket>,
    stdin: Option<DealerSocket>,
    heartbeat: Option<ReqSocket>,
}

impl Opened {
    async fn rollback(self) {
        if let Some(s) = self.control {
            close_socket(s, ChannelName::Control).await;
        }
        if let Some(s) = self.shell {
            close_socket(s, ChannelName::Shell).await;
        }
        if let Some(s) = self.iopub {
            close_socket(s, ChannelName::IoPub).await;
        }
        if let Some(s) = self.stdin {
            close_socket(s, ChannelName::Stdin).await;
        }
        if let Some(s) = self.heartbeat {
            close_socket(s, ChannelName::Heartbeat).await;
        }
    }
}

async fn connect_all(
    descriptor: &ConnectionDescriptor,
    config: &AttachConfig,
    opened: &mut Opened,
) -> Result<(), AttachError> {
    let timeout = config.connect_timeout();

    opened.control = Some(
        connect(
            DealerSocket::new(),
            ChannelName::Control,
            &descriptor.endpoint(ChannelName::Control),
            timeout,
        )
        .await?,
    );
    opened.shell = Some(
        connect(
            DealerSocket::new(),
            ChannelName::Shell,
            &descriptor.endpoint(ChannelName::Shell),
            timeout,
        )
        .await?,
    );

    let mut iopub = connect(
        SubSocket::new(),
        ChannelName::IoPub,
        &descriptor.endpoint(ChannelName::IoPub),
        timeout,
    )
    .await?;
    let subscribed = iopub.subscribe("").await;
    opened.iopub = Some(iopub);
    subscribed.map_err(|e| AttachError::ChannelUnavailable {
        channel: ChannelName::IoPub,
        reason: format!("subscribe failed: {}", e),
    })?;

    if config.open_stdin {
        opened.stdin = Some(
            connect(
                DealerSocket::new(),
                ChannelName::Stdin,
                &descriptor.endpoint(ChannelName::Stdin),
                timeout,
            )
            .await?,
        );
    }

    opened.heartbeat = Some(
        connect(
            ReqSocket::new(),
            ChannelName::Heartbeat,
            &descriptor.endpoint(ChannelName::Heartbeat),
            timeout,
        )
        .await?,
    );

    Ok(())
}

/// Open every channel to the kernel and start the session's background
/// tasks (iopub reader and liveness monitor).
///
/// On failure nothing is left connected.
pub async fn open(
    descriptor: ConnectionDescriptor,
    config: &AttachConfig,
    dump: Option<MessageDump>,
) -> Result<Session, AttachError> {
    let session_id = Uuid::new_v4().to_string();
    let signer = Signer::new(descriptor.signature_scheme, descriptor.key());

    let mut opened = Opened::default();
    if let Err(e) = connect_all(&descriptor, config, &mut opened).await {
        warn!("[channels] Attach failed, rolling back: {}", e);
        opened.rollback().await;
        return Err(e);
    }

    let Opened {
        control,
        shell,
        iopub,
        stdin,
        heartbeat,
    } = opened;
    let (Some(control), Some(shell), Some(iopub), Some(heartbeat)) =
        (control, shell, iopub, heartbeat)
    else {
        return Err(AttachError::ChannelUnavailable {
            channel: ChannelName::Shell,
            reason: "channel set incomplete after connect".to_string(),
        });
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (liveness_tx, liveness_rx) = watch::channel(LivenessState::Connecting);
    let (message_tx, message_rx) = mpsc::channel::<Message>(config.queue_depth.max(1));

    let iopub_task = spawn_iopub_reader(
        iopub,
        signer.clone(),
        message_tx,
        shutdown_rx.clone(),
        dump,
    );

    let probe = ZmqHeartbeat::with_socket(
        descriptor.endpoint(ChannelName::Heartbeat),
        config.connect_timeout(),
        heartbeat,
    );
    let tracker = LivenessTracker::new(Thresholds {
        degrade_after: config.degrade_after,
        dead_after: config.dead_after,
    });
    let monitor_task = tokio::spawn(heartbeat::run_monitor(
        probe,
        tracker,
        config.heartbeat_interval(),
        config.heartbeat_timeout(),
        liveness_tx,
        shutdown_rx,
    ));

    info!(
        "[channels] Session {} attached to {}",
        session_id,
        descriptor.endpoint(ChannelName::Shell)
    );

    let new_channel =
        |channel, socket| RequestChannel::new(channel, socket, signer.clone(), session_id.clone());

    Ok(Session::from_parts(SessionParts {
        control: new_channel(ChannelName::Control, control),
        shell: new_channel(ChannelName::Shell, shell),
        stdin: stdin.map(|s| new_channel(ChannelName::Stdin, s)),
        id: session_id.clone(),
        descriptor: Arc::new(descriptor),
        iopub_task,
        monitor_task,
        messages: message_rx,
        liveness: liveness_rx,
        shutdown: shutdown_tx,
        teardown_grace: config.heartbeat_interval(),
    }))
}

/// Read, authenticate and forward iopub traffic until shutdown.
///
/// Messages that fail to decode or verify are logged and dropped; the loop
/// keeps going. A full queue applies back-pressure to this task only.
fn spawn_iopub_reader(
    mut socket: SubSocket,
    signer: Signer,
    tx: mpsc::Sender<Message>,
    mut shutdown: watch::Receiver<bool>,
    dump: Option<MessageDump>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                received = socket.recv() => received,
            };

            let frames = match received {
                Ok(zmq) => zmq.into_vec(),
                Err(e) => {
                    error!("[channels] iopub read error: {}", e);
                    break;
                }
            };

            let message = match wire::decode(frames, &signer) {
                Ok(message) => message,
                Err(e) => {
                    warn!("[channels] Dropping iopub message: {}", e);
                    continue;
                }
            };

            if let Some(ref dump) = dump {
                dump.record_incoming(ChannelName::IoPub, &message);
            }

            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                sent = tx.send(message) => {
                    if sent.is_err() {
                        debug!("[channels] iopub consumer gone");
                        break;
                    }
                }
            }
        }
        close_socket(socket, ChannelName::IoPub).await;
        debug!("[channels] iopub reader stopped");
    })
}

/// A request/reply channel (shell, control or stdin).
pub struct RequestChannel {
    channel: ChannelName,
    socket: DealerSocket,
    signer: Signer,
    session_id: String,
}

impl RequestChannel {
    pub(crate) fn new(
        channel: ChannelName,
        socket: DealerSocket,
        signer: Signer,
        session_id: String,
    ) -> Self {
        Self {
            channel,
            socket,
            signer,
            session_id,
        }
    }

    fn fail(&self, reason: impl fmt::Display) -> AttachError {
        AttachError::Request {
            channel: self.channel,
            reason: reason.to_string(),
        }
    }

    /// Send one request and wait for the reply to it.
    ///
    /// Replies to earlier requests (which timed out) are skipped. The whole
    /// exchange is bounded by `timeout`.
    pub async fn request(
        &mut self,
        kind: MessageKind,
        content: Value,
        timeout: Duration,
    ) -> Result<Message, AttachError> {
        let request = Message::new(kind, &self.session_id, content);
        let frames = wire::encode(&request, &self.signer).map_err(|e| self.fail(e))?;
        let zmq = ZmqMessage::try_from(frames).map_err(|e| self.fail(e))?;

        let deadline = Instant::now() + timeout;

        match tokio::time::timeout(timeout, self.socket.send(zmq)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(self.fail(e)),
            Err(_) => return Err(self.fail("timed out sending request")),
        }
        debug!(
            "[channels] {} -> {} ({})",
            self.channel, request.header.msg_type, request.header.msg_id
        );

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let received = match tokio::time::timeout(remaining, self.socket.recv()).await {
                Ok(Ok(zmq)) => zmq,
                Ok(Err(e)) => return Err(self.fail(e)),
                Err(_) => {
                    return Err(self.fail(format!(
                        "no reply to {} within {:?}",
                        request.header.msg_type, timeout
                    )))
                }
            };

            match wire::decode(received.into_vec(), &self.signer) {
                Ok(reply) if reply.parent_id() == Some(request.header.msg_id.as_str()) => {
                    return Ok(reply)
                }
                Ok(other) => debug!(
                    "[channels] Skipping unrelated {} on {}",
                    other.header.msg_type, self.channel
                ),
                Err(e) => warn!("[channels] Dropping {} message: {}", self.channel, e),
            }
        }
    }

    pub async fn close(self) {
        close_socket(self.socket, self.channel).await;
    }
}
