//! The attach loop: locate, open, relay until detach.

use std::io::{self, Write};
use std::time::Instant;

use futures::future::{LocalBoxFuture, OptionFuture};
use futures::FutureExt;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::channels::{self, ChannelName};
use crate::config::AttachConfig;
use crate::dispatch::Dispatcher;
use crate::dump::MessageDump;
use crate::error::AttachError;
use crate::heartbeat::LivenessState;
use crate::locator::{HeartbeatKernelProbe, KernelTarget, Locator};
use crate::render::Renderer;
use crate::session::{shutdown_requested, Session};
use crate::wire::Message;

/// Why a relay loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// Shutdown was signalled.
    Shutdown,
    /// The iopub reader stopped; no more messages will arrive.
    Closed,
}

/// Dispatches iopub messages and writes their rendering to `out`.
pub struct Relay<W> {
    dispatcher: Dispatcher,
    renderer: Renderer,
    out: W,
}

impl<W: Write> Relay<W> {
    pub fn new(renderer: Renderer, out: W) -> Self {
        Self {
            dispatcher: Dispatcher::new(),
            renderer,
            out,
        }
    }

    /// Render one message. Writes are flushed before returning.
    pub fn handle(&mut self, message: &Message) -> io::Result<()> {
        let Some(event) = self.dispatcher.dispatch(message) else {
            return Ok(());
        };
        let writes = self.renderer.render(&event);
        if writes.is_empty() {
            return Ok(());
        }
        for chunk in writes {
            self.out.write_all(chunk.as_bytes())?;
        }
        self.out.flush()
    }

    /// Write a line of our own (banner, notices).
    pub fn notice(&mut self, text: &str) -> io::Result<()> {
        writeln!(self.out, "{}", text)?;
        self.out.flush()
    }

    /// Write out any held-back stream tails.
    pub fn finish(&mut self) -> io::Result<()> {
        for chunk in self.renderer.flush() {
            self.out.write_all(chunk.as_bytes())?;
        }
        self.out.flush()
    }

    /// Relay messages until shutdown or until the queue closes.
    ///
    /// Cancel-safe: dropping the future between messages loses nothing, and
    /// once shutdown is observed nothing more is written.
    pub async fn run(
        &mut self,
        messages: &mut mpsc::Receiver<Message>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> io::Result<RelayEnd> {
        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => return Ok(RelayEnd::Shutdown),
                message = messages.recv() => message,
            };
            let Some(message) = message else {
                return Ok(RelayEnd::Closed);
            };
            if *shutdown.borrow() {
                return Ok(RelayEnd::Shutdown);
            }
            self.handle(&message)?;
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Resolves when the liveness monitor declares the kernel dead. Never
/// resolves if the monitor stops for any other reason.
async fn kernel_dead(liveness: &mut watch::Receiver<LivenessState>) {
    loop {
        if *liveness.borrow_and_update() == LivenessState::Dead {
            return;
        }
        if liveness.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Forward every Ctrl+C press into a channel until the receiver is dropped.
fn spawn_ctrl_c_listener() -> (mpsc::Receiver<()>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(4);
    let task = tokio::spawn(async move {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("[channels] Cannot listen for Ctrl+C: {}", e);
                return;
            }
            if tx.send(()).await.is_err() {
                return;
            }
        }
    });
    (rx, task)
}

/// Attach to the kernel behind `target` and relay its output to `out` until
/// the user detaches or the kernel goes away.
///
/// Ctrl+C sends `interrupt_request` to the kernel; a second Ctrl+C within
/// the configured window detaches. With `interrupt_on_ctrl_c` off, Ctrl+C
/// detaches immediately.
pub async fn attach<W: Write>(
    target: &KernelTarget,
    config: &AttachConfig,
    dump: Option<MessageDump>,
    out: W,
) -> Result<(), AttachError> {
    let probe = HeartbeatKernelProbe {
        timeout: config.heartbeat_timeout(),
    };
    let locator = Locator::default();
    debug!("[locator] Runtime dir {}", locator.runtime_dir().display());
    let located = locator.locate(target, &probe).await?;
    info!(
        "[locator] Using {} for {}",
        located.connection_file.display(),
        target
    );

    let mut relay = Relay::new(Renderer::new(config.show_status), out);
    relay.notice(if config.interrupt_on_ctrl_c {
        "Attaching to kernel (Ctrl+C to interrupt kernel, Ctrl+C twice to detach)..."
    } else {
        "Attaching to kernel (Ctrl+C to detach)..."
    })?;

    let mut session = channels::open(located.descriptor, config, dump).await?;

    match session.kernel_info(config.reply_timeout()).await {
        Ok(info) => relay.notice(&format!("Connected to {}", info.summary()))?,
        Err(e) => {
            warn!("[channels] No kernel_info_reply: {}", e);
            let descriptor = session.descriptor();
            relay.notice(&format!(
                "Connected to {}",
                descriptor
                    .kernel_name
                    .clone()
                    .unwrap_or_else(|| descriptor.endpoint(ChannelName::Shell))
            ))?;
        }
    }

    let (mut presses, listener) = spawn_ctrl_c_listener();
    let outcome = relay_session(&mut session, &mut relay, config, &mut presses).await;
    listener.abort();

    if let Err(e) = relay.finish() {
        debug!("[channels] Could not flush output: {}", e);
    }
    session.close().await;
    outcome
}

/// Foreground loop of an open session: relay output, watch liveness and
/// act on interrupt presses (Ctrl+C). Returns when the session should be
/// closed.
///
/// An interrupt request runs alongside the relay. Output keeps flowing and
/// a second press within the detach window detaches even while the kernel
/// has not answered the first one.
pub async fn relay_session<W: Write>(
    session: &mut Session,
    relay: &mut Relay<W>,
    config: &AttachConfig,
    presses: &mut mpsc::Receiver<()>,
) -> Result<(), AttachError> {
    let Some(mut messages) = session.take_messages() else {
        return Ok(());
    };
    let session: &Session = session;
    let mut shutdown = session.shutdown_signal();
    let mut liveness = session.liveness_watch();
    let mut last_press: Option<Instant> = None;
    let mut interrupting: Option<LocalBoxFuture<'_, Result<(), AttachError>>> = None;
    let mut listening = true;

    loop {
        tokio::select! {
            end = relay.run(&mut messages, &mut shutdown) => {
                return match end? {
                    RelayEnd::Closed => Ok(relay.notice("Kernel has been closed.")?),
                    RelayEnd::Shutdown => Ok(()),
                };
            }
            _ = kernel_dead(&mut liveness) => {
                // Output that arrived before the kernel went away still shows.
                while let Ok(message) = messages.try_recv() {
                    relay.handle(&message)?;
                }
                return Err(AttachError::KernelUnreachable {
                    failures: config.degrade_after.max(1) + config.dead_after.max(1),
                });
            }
            Some(result) = OptionFuture::from(interrupting.as_mut()), if interrupting.is_some() => {
                interrupting = None;
                if let Err(e) = result {
                    relay.notice(&format!("Warning: could not interrupt kernel: {}", e))?;
                }
            }
            press = presses.recv(), if listening => {
                if press.is_none() {
                    listening = false;
                    continue;
                }
                let within_window = last_press
                    .is_some_and(|at| at.elapsed() < config.detach_window());
                if !config.interrupt_on_ctrl_c || within_window {
                    relay.notice("\nDetaching from kernel...")?;
                    return Ok(());
                }
                last_press = Some(Instant::now());
                relay.notice(&format!(
                    "\nInterrupting kernel... (Ctrl+C again within {} s to detach)",
                    config.detach_window().as_secs_f64()
                ))?;
                if interrupting.is_none() {
                    interrupting = Some(session.interrupt(config.reply_timeout()).boxed_local());
                } else {
                    debug!("[channels] Interrupt already in flight");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Header, MessageKind};
    use serde_json::json;

    fn stream(parent: &str, text: &str) -> Message {
        let mut header = Header::new("execute_request", "client");
        header.msg_id = parent.to_string();
        Message::new(
            MessageKind::Stream,
            "kernel",
            json!({"name": "stdout", "text": text}),
        )
        .with_parent(header)
    }

    #[test]
    fn test_handle_writes_rendering() {
        let mut relay = Relay::new(Renderer::new(true), Vec::new());
        relay.handle(&stream("p", "42\n")).unwrap();
        relay
            .handle(&Message::new(
                MessageKind::parse("comm_msg"),
                "kernel",
                json!({}),
            ))
            .unwrap();
        assert_eq!(relay.into_inner(), b"42\n");
    }

    #[tokio::test]
    async fn test_run_until_closed() {
        let (tx, mut rx) = mpsc::channel(8);
        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
        tx.send(stream("p", "a")).await.unwrap();
        tx.send(stream("p", "b")).await.unwrap();
        drop(tx);

        let mut relay = Relay::new(Renderer::new(true), Vec::new());
        let end = relay.run(&mut rx, &mut shutdown_rx).await.unwrap();
        assert_eq!(end, RelayEnd::Closed);
        assert_eq!(relay.into_inner(), b"ab");
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (tx, mut rx) = mpsc::channel(8);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        shutdown_tx.send(true).unwrap();
        tx.send(stream("p", "never")).await.unwrap();

        let mut relay = Relay::new(Renderer::new(true), Vec::new());
        let end = relay.run(&mut rx, &mut shutdown_rx).await.unwrap();
        assert_eq!(end, RelayEnd::Shutdown);
        assert!(relay.into_inner().is_empty());
    }

    #[tokio::test]
    async fn test_kernel_dead_resolves() {
        let (tx, mut rx) = watch::channel(LivenessState::Alive);
        let waiter = tokio::spawn(async move { kernel_dead(&mut rx).await });
        tx.send(LivenessState::Degraded).unwrap();
        tx.send(LivenessState::Dead).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    /// A session over unconnected sockets with the given liveness.
    fn idle_session(
        messages: mpsc::Receiver<Message>,
        state: LivenessState,
    ) -> (Session, watch::Sender<LivenessState>) {
        use crate::channels::RequestChannel;
        use crate::connection::ConnectionDescriptor;
        use crate::session::SessionParts;
        use crate::wire::Signer;
        use std::sync::Arc;
        use zeromq::{DealerSocket, Socket};

        let descriptor = ConnectionDescriptor::from_json(
            r#"{"transport": "tcp", "ip": "127.0.0.1", "shell_port": 1, "iopub_port": 2,
                "stdin_port": 3, "control_port": 4, "hb_port": 5, "key": ""}"#,
        )
        .unwrap();
        let channel = |name| {
            RequestChannel::new(name, DealerSocket::new(), Signer::unsigned(), "s".to_string())
        };
        let (liveness_tx, liveness) = watch::channel(state);
        let (shutdown, _) = watch::channel(false);
        let session = Session::from_parts(SessionParts {
            id: "s".to_string(),
            descriptor: Arc::new(descriptor),
            control: channel(ChannelName::Control),
            shell: channel(ChannelName::Shell),
            stdin: None,
            iopub_task: tokio::spawn(async {}),
            monitor_task: tokio::spawn(async {}),
            messages,
            liveness,
            shutdown,
            teardown_grace: std::time::Duration::from_millis(100),
        });
        (session, liveness_tx)
    }

    #[tokio::test]
    async fn test_kernel_death_renders_queued_output() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(stream("p", "one\n")).await.unwrap();
        tx.send(stream("p", "two\n")).await.unwrap();
        let (mut session, _liveness) = idle_session(rx, LivenessState::Dead);
        let mut relay = Relay::new(Renderer::new(true), Vec::new());
        let (_press_tx, mut presses) = mpsc::channel(1);

        let outcome =
            relay_session(&mut session, &mut relay, &AttachConfig::default(), &mut presses).await;
        assert!(matches!(outcome, Err(AttachError::KernelUnreachable { .. })));
        session.close().await;
        assert_eq!(relay.into_inner(), b"one\ntwo\n");
        drop(tx);
    }

    #[tokio::test]
    async fn test_press_detaches_without_interrupt() {
        let (_tx, rx) = mpsc::channel(8);
        let (mut session, _liveness) = idle_session(rx, LivenessState::Alive);
        let mut relay = Relay::new(Renderer::new(true), Vec::new());
        let (press_tx, mut presses) = mpsc::channel(1);
        press_tx.send(()).await.unwrap();

        let config = AttachConfig {
            interrupt_on_ctrl_c: false,
            ..AttachConfig::default()
        };
        relay_session(&mut session, &mut relay, &config, &mut presses)
            .await
            .unwrap();
        session.close().await;
        assert_eq!(relay.into_inner(), b"\nDetaching from kernel...\n");
    }

    #[test]
    fn test_finish_flushes_tails() {
        let mut relay = Relay::new(Renderer::new(true), Vec::new());
        relay.handle(&stream("p", "x\x1b[")).unwrap();
        relay.finish().unwrap();
        assert_eq!(relay.into_inner(), b"x\x1b[");
    }
}
