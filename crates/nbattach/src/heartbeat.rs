//! Kernel liveness monitoring over the heartbeat channel.
//!
//! The heartbeat channel is a REQ/REP echo: we send a payload and the kernel
//! sends it straight back. [`run_monitor`] probes on a fixed interval and
//! feeds each outcome into a [`LivenessTracker`], publishing every state
//! change on a `watch` channel. The tracker itself is a plain state machine
//! with no I/O.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::sync::watch;
use uuid::Uuid;
use zeromq::{ReqSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

use crate::channels::ChannelName;
use crate::connection::ConnectionDescriptor;
use crate::session::shutdown_requested;

/// Liveness of the attached kernel as seen from heartbeat probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    /// No probe has succeeded yet.
    Connecting,
    Alive,
    /// Several consecutive probes failed.
    Degraded,
    /// Terminal. The session is torn down.
    Dead,
}

impl fmt::Display for LivenessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LivenessState::Connecting => write!(f, "connecting"),
            LivenessState::Alive => write!(f, "alive"),
            LivenessState::Degraded => write!(f, "degraded"),
            LivenessState::Dead => write!(f, "dead"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    /// Consecutive failures that move `alive` (or `connecting`) to `degraded`.
    pub degrade_after: u32,
    /// Further consecutive failures that move `degraded` to `dead`.
    pub dead_after: u32,
}

/// Heartbeat outcome state machine.
#[derive(Debug, Clone)]
pub struct LivenessTracker {
    thresholds: Thresholds,
    state: LivenessState,
    failures: u32,
}

impl LivenessTracker {
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            thresholds: Thresholds {
                degrade_after: thresholds.degrade_after.max(1),
                dead_after: thresholds.dead_after.max(1),
            },
            state: LivenessState::Connecting,
            failures: 0,
        }
    }

    pub fn state(&self) -> LivenessState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    /// Feed one probe outcome. Returns the new state if it changed.
    pub fn record(&mut self, success: bool) -> Option<LivenessState> {
        if self.state == LivenessState::Dead {
            return None;
        }

        let next = if success {
            self.failures = 0;
            LivenessState::Alive
        } else {
            self.failures = self.failures.saturating_add(1);
            let Thresholds {
                degrade_after,
                dead_after,
            } = self.thresholds;
            if self.failures >= degrade_after.saturating_add(dead_after) {
                LivenessState::Dead
            } else if self.failures >= degrade_after {
                LivenessState::Degraded
            } else {
                self.state
            }
        };

        if next == self.state {
            None
        } else {
            self.state = next;
            Some(next)
        }
    }
}

/// One heartbeat round trip.
pub trait HeartbeatProbe: Send {
    fn probe(&mut self) -> impl Future<Output = Result<(), String>> + Send;

    /// Called after a failed or timed-out probe, before the next one.
    fn reset(&mut self) {}
}

/// Heartbeat probe over a ZeroMQ REQ socket.
///
/// A REQ socket that missed its reply is stuck waiting for it, so after a
/// failure the socket is dropped and the next probe reconnects.
pub struct ZmqHeartbeat {
    endpoint: String,
    connect_timeout: Duration,
    socket: Option<ReqSocket>,
}

impl ZmqHeartbeat {
    pub fn new(endpoint: String, connect_timeout: Duration) -> Self {
        Self {
            endpoint,
            connect_timeout,
            socket: None,
        }
    }

    pub fn with_socket(endpoint: String, connect_timeout: Duration, socket: ReqSocket) -> Self {
        Self {
            endpoint,
            connect_timeout,
            socket: Some(socket),
        }
    }

    async fn socket(&mut self) -> Result<&mut ReqSocket, String> {
        if self.socket.is_none() {
            let mut socket = ReqSocket::new();
            match tokio::time::timeout(self.connect_timeout, socket.connect(&self.endpoint)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(format!("connect failed: {}", e)),
                Err(_) => return Err("connect timed out".to_string()),
            }
            debug!("[heartbeat] Connected to {}", self.endpoint);
            self.socket = Some(socket);
        }
        self.socket
            .as_mut()
            .ok_or_else(|| "heartbeat socket missing".to_string())
    }
}

impl HeartbeatProbe for ZmqHeartbeat {
    async fn probe(&mut self) -> Result<(), String> {
        let payload = Bytes::from(Uuid::new_v4().to_string());
        let socket = self.socket().await?;
        socket
            .send(ZmqMessage::from(payload.clone()))
            .await
            .map_err(|e| format!("send failed: {}", e))?;
        let reply = socket
            .recv()
            .await
            .map_err(|e| format!("recv failed: {}", e))?;
        match reply.into_vec().first() {
            Some(echo) if *echo == payload => Ok(()),
            _ => Err("heartbeat echo did not match".to_string()),
        }
    }

    fn reset(&mut self) {
        self.socket = None;
    }
}

/// Probe every `interval` until shutdown or until the kernel is declared
/// dead. Each probe is bounded by `timeout`.
///
/// This task is the only writer of `state_tx`.
pub async fn run_monitor<P: HeartbeatProbe>(
    mut probe: P,
    mut tracker: LivenessTracker,
    interval: Duration,
    timeout: Duration,
    state_tx: watch::Sender<LivenessState>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let outcome = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            outcome = tokio::time::timeout(timeout, probe.probe()) => outcome,
        };

        let success = match outcome {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("[heartbeat] Probe failed: {}", e);
                false
            }
            Err(_) => {
                debug!("[heartbeat] Probe timed out after {:?}", timeout);
                false
            }
        };
        if !success {
            probe.reset();
        }

        if let Some(state) = tracker.record(success) {
            match state {
                LivenessState::Alive => info!("[heartbeat] Kernel is alive"),
                LivenessState::Degraded => warn!(
                    "[heartbeat] Kernel not responding ({} missed heartbeats)",
                    tracker.consecutive_failures()
                ),
                LivenessState::Dead => warn!(
                    "[heartbeat] Kernel unreachable after {} missed heartbeats",
                    tracker.consecutive_failures()
                ),
                LivenessState::Connecting => {}
            }
            state_tx.send_replace(state);
            if state == LivenessState::Dead {
                break;
            }
        }

        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!("[heartbeat] Monitor stopped in state {}", tracker.state());
}

/// One-shot liveness check: connect a fresh heartbeat socket and wait for a
/// single echo within `timeout`.
pub async fn check_kernel_alive(descriptor: &ConnectionDescriptor, timeout: Duration) -> bool {
    let mut probe = ZmqHeartbeat::new(descriptor.endpoint(ChannelName::Heartbeat), timeout);
    matches!(
        tokio::time::timeout(timeout, probe.probe()).await,
        Ok(Ok(()))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn tracker(degrade_after: u32, dead_after: u32) -> LivenessTracker {
        LivenessTracker::new(Thresholds {
            degrade_after,
            dead_after,
        })
    }

    #[test]
    fn test_first_success_is_alive() {
        let mut t = tracker(3, 3);
        assert_eq!(t.state(), LivenessState::Connecting);
        assert_eq!(t.record(true), Some(LivenessState::Alive));
        assert_eq!(t.record(true), None);
    }

    #[test]
    fn test_degrade_then_dead() {
        let mut t = tracker(3, 2);
        t.record(true);
        assert_eq!(t.record(false), None);
        assert_eq!(t.record(false), None);
        assert_eq!(t.record(false), Some(LivenessState::Degraded));
        assert_eq!(t.record(false), None);
        assert_eq!(t.record(false), Some(LivenessState::Dead));
        assert_eq!(t.consecutive_failures(), 5);
    }

    #[test]
    fn test_success_while_degraded_recovers() {
        let mut t = tracker(2, 5);
        t.record(true);
        t.record(false);
        assert_eq!(t.record(false), Some(LivenessState::Degraded));
        assert_eq!(t.record(true), Some(LivenessState::Alive));
        assert_eq!(t.consecutive_failures(), 0);
        // Counting starts over.
        assert_eq!(t.record(false), None);
        assert_eq!(t.state(), LivenessState::Alive);
    }

    #[test]
    fn test_failures_while_connecting_count() {
        let mut t = tracker(1, 1);
        assert_eq!(t.record(false), Some(LivenessState::Degraded));
        assert_eq!(t.record(false), Some(LivenessState::Dead));
    }

    #[test]
    fn test_dead_is_terminal() {
        let mut t = tracker(1, 1);
        t.record(false);
        t.record(false);
        assert_eq!(t.record(true), None);
        assert_eq!(t.state(), LivenessState::Dead);
    }

    #[test]
    fn test_zero_thresholds_are_clamped() {
        let mut t = tracker(0, 0);
        assert_eq!(t.record(true), Some(LivenessState::Alive));
        assert_eq!(t.record(false), Some(LivenessState::Degraded));
        assert_eq!(t.record(false), Some(LivenessState::Dead));
    }

    struct ScriptedProbe {
        outcomes: VecDeque<bool>,
        resets: Arc<AtomicUsize>,
    }

    impl HeartbeatProbe for ScriptedProbe {
        async fn probe(&mut self) -> Result<(), String> {
            match self.outcomes.pop_front() {
                Some(true) => Ok(()),
                _ => Err("no echo".to_string()),
            }
        }

        fn reset(&mut self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_monitor_stops_when_dead() {
        let resets = Arc::new(AtomicUsize::new(0));
        let probe = ScriptedProbe {
            outcomes: VecDeque::from(vec![true, false, false, false, false]),
            resets: resets.clone(),
        };
        let (state_tx, state_rx) = watch::channel(LivenessState::Connecting);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::time::timeout(
            Duration::from_secs(5),
            run_monitor(
                probe,
                tracker(2, 2),
                Duration::from_millis(1),
                Duration::from_millis(100),
                state_tx,
                shutdown_rx,
            ),
        )
        .await
        .expect("monitor should stop on its own");

        assert_eq!(*state_rx.borrow(), LivenessState::Dead);
        assert_eq!(resets.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_monitor_stops_on_shutdown() {
        let probe = ScriptedProbe {
            outcomes: VecDeque::from(vec![true; 1000]),
            resets: Arc::new(AtomicUsize::new(0)),
        };
        let (state_tx, mut state_rx) = watch::channel(LivenessState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_monitor(
            probe,
            tracker(3, 3),
            Duration::from_millis(50),
            Duration::from_millis(100),
            state_tx,
            shutdown_rx,
        ));

        state_rx.changed().await.unwrap();
        assert_eq!(*state_rx.borrow(), LivenessState::Alive);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("monitor should exit within one interval")
            .unwrap();
    }

    #[tokio::test]
    async fn test_check_kernel_alive_with_nothing_listening() {
        let descriptor = ConnectionDescriptor::from_json(
            r#"{"transport": "tcp", "ip": "127.0.0.1", "control_port": 1,
                "shell_port": 2, "iopub_port": 3, "hb_port": 4, "stdin_port": 5,
                "signature_scheme": "hmac-sha256", "key": ""}"#,
        )
        .unwrap();
        assert!(!check_kernel_alive(&descriptor, Duration::from_millis(200)).await);
    }
}
