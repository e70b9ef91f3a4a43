//! The session connection manager.
//!
//! A [`SessionManager`] is a cheap handle to a driver task. The driver is the
//! single owner of the transport, the recovery controller and the connection
//! state machine; every state change happens on it, one input at a time:
//!
//! - commands from handles (`connect`, `disconnect`, `send_event`),
//! - notifications from the live transport handle,
//! - the recovery controller's grace and backoff timers.
//!
//! Handshakes run inline but stay cancellable: while one is in flight the
//! driver keeps reading commands, so a `disconnect()` drops the pending
//! signaling request instead of waiting for it.

use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use crate::bus::{EventBus, Subscription};
use crate::config::RecoveryConfig;
use crate::error::SessionError;
use crate::event::ControlEvent;
use crate::media::AudioDevice;
use crate::recovery::{Recovery, RecoveryController};
use crate::signaling::Signaling;
use crate::state::{ConnectionState, ConnectionStateMachine, ConnectionStatus, SessionSnapshot};
use crate::transport::{IceState, Notification, Notifier, PeerState, Transport, TransportEvent};

enum Command {
    Connect(oneshot::Sender<Result<(), SessionError>>),
    Disconnect(oneshot::Sender<()>),
    Send(ControlEvent),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running session driver.
///
/// Clones share the driver. When the last handle is dropped the driver
/// closes the transport and exits.
#[derive(Clone)]
pub struct SessionManager {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<SessionSnapshot>,
    bus: EventBus,
}

impl SessionManager {
    /// Starts the driver task on the current tokio runtime.
    pub fn spawn<T, S, A>(
        config: RecoveryConfig,
        transport: T,
        signaling: S,
        audio: A,
        bus: EventBus,
    ) -> Self
    where
        T: Transport + 'static,
        S: Signaling + 'static,
        A: AudioDevice + 'static,
    {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (notices_tx, notices) = mpsc::unbounded_channel();
        let (state, snapshots) = ConnectionStateMachine::new();

        let driver = Driver {
            transport: Box::new(transport),
            signaling: Arc::new(signaling),
            audio: Arc::new(audio),
            bus: bus.clone(),
            state,
            recovery: RecoveryController::new(config),
            commands,
            notices_tx,
            notices,
            generation: 0,
            live: None,
        };
        tokio::spawn(driver.run());

        Self {
            commands: commands_tx,
            snapshots,
            bus,
        }
    }

    /// Begins a new session.
    ///
    /// Returns once the attempt is accepted; progress is observable through
    /// [`watch`](Self::watch). Rejected with [`SessionError::AlreadyActive`]
    /// while a session is connecting or connected.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect(tx))
            .map_err(|_| SessionError::Stopped)?;
        rx.await.map_err(|_| SessionError::Stopped)?
    }

    /// Ends the session and releases the transport. Cancels pending timers
    /// and any in-flight signaling request.
    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Writes an event to the control channel. Best effort: dropped with a
    /// warning when the channel is not open.
    pub fn send_event(&self, event: ControlEvent) {
        if self.commands.send(Command::Send(event)).is_err() {
            warn!("Session driver stopped, dropping outbound event");
        }
    }

    /// Registers a listener for inbound control events.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ControlEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(listener)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.snapshots.borrow().connection_state()
    }

    pub fn session(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Waits until the session satisfies `f`.
    pub async fn wait_for(
        &self,
        mut f: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Result<SessionSnapshot, SessionError> {
        let mut rx = self.snapshots.clone();
        let snapshot = rx
            .wait_for(|s| f(s))
            .await
            .map_err(|_| SessionError::Stopped)?;
        Ok(snapshot.clone())
    }

    /// Disconnects and stops the driver.
    pub async fn shutdown(self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// A handshake step that can be abandoned when a disconnect arrives.
enum Operation {
    Open(Notifier),
    Restart,
}

enum Interrupted {
    Done(Result<(), SessionError>),
    Disconnect(oneshot::Sender<()>),
    Shutdown(Option<oneshot::Sender<()>>),
}

type StepFuture<'a> = Pin<Box<dyn Future<Output = Result<(), SessionError>> + Send + 'a>>;

struct Driver {
    transport: Box<dyn Transport>,
    signaling: Arc<dyn Signaling>,
    audio: Arc<dyn AudioDevice>,
    bus: EventBus,
    state: ConnectionStateMachine,
    recovery: RecoveryController,
    commands: mpsc::UnboundedReceiver<Command>,
    notices_tx: mpsc::UnboundedSender<Notification>,
    notices: mpsc::UnboundedReceiver<Notification>,
    generation: u64,
    /// Generation of the live transport handle, if any.
    live: Option<u64>,
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

async fn open_handshake(
    transport: &mut dyn Transport,
    signaling: &dyn Signaling,
    audio: &dyn AudioDevice,
    notifier: Notifier,
) -> Result<(), SessionError> {
    let offer = transport.open(audio, notifier).await?;
    let answer = signaling.exchange(&offer).await?;
    transport.complete(&answer).await?;
    Ok(())
}

async fn restart_handshake(
    transport: &mut dyn Transport,
    signaling: &dyn Signaling,
) -> Result<(), SessionError> {
    let offer = transport.renegotiate().await?;
    let answer = signaling.exchange(&offer).await?;
    transport.complete(&answer).await?;
    Ok(())
}

impl Driver {
    async fn run(mut self) {
        loop {
            let deadline = self.recovery.poll_timeout();
            let flow = tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => ControlFlow::Break(()),
                },
                Some(notice) = self.notices.recv() => self.handle_notification(notice).await,
                _ = sleep_until(deadline) => {
                    let decision = self.recovery.handle_timeout(now());
                    self.recover(decision).await
                }
            };
            if flow.is_break() {
                break;
            }
        }

        self.teardown().await;
        debug!("Session driver stopped");
    }

    async fn handle_command(&mut self, cmd: Command) -> ControlFlow<()> {
        match cmd {
            Command::Connect(reply) => match self.state.begin() {
                Ok(_) => {
                    self.recovery.reset();
                    let _ = reply.send(Ok(()));
                    return self.reopen().await;
                }
                Err(e) => {
                    debug!("Rejecting connect: {}", e);
                    let _ = reply.send(Err(e));
                }
            },
            Command::Disconnect(reply) => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            Command::Send(event) => self.transport.send(&event),
            Command::Shutdown(reply) => {
                self.disconnect().await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Releases the current handle, then runs open → exchange → complete on
    /// a new one.
    async fn reopen(&mut self) -> ControlFlow<()> {
        self.release().await;
        self.generation += 1;
        self.live = Some(self.generation);
        let notifier = Notifier::new(self.generation, self.notices_tx.clone());
        info!(
            session = self.state.session_id(),
            generation = self.generation,
            "Opening transport"
        );
        self.run_step(Operation::Open(notifier)).await
    }

    /// In-place repair: ICE restart offer, exchange, complete.
    async fn restart(&mut self) -> ControlFlow<()> {
        info!(generation = self.generation, "Restarting ICE");
        self.run_step(Operation::Restart).await
    }

    async fn run_step(&mut self, op: Operation) -> ControlFlow<()> {
        let interrupted = {
            let mut step: StepFuture<'_> = match op {
                Operation::Open(notifier) => Box::pin(open_handshake(
                    self.transport.as_mut(),
                    self.signaling.as_ref(),
                    self.audio.as_ref(),
                    notifier,
                )),
                Operation::Restart => Box::pin(restart_handshake(
                    self.transport.as_mut(),
                    self.signaling.as_ref(),
                )),
            };

            loop {
                tokio::select! {
                    result = &mut step => break Interrupted::Done(result),
                    cmd = self.commands.recv() => match cmd {
                        Some(Command::Connect(reply)) => {
                            let _ = reply.send(Err(SessionError::AlreadyActive(self.state.status())));
                        }
                        Some(Command::Send(event)) => {
                            warn!(kind = %event.kind, "Handshake in flight, dropping outbound event");
                        }
                        Some(Command::Disconnect(reply)) => break Interrupted::Disconnect(reply),
                        Some(Command::Shutdown(reply)) => break Interrupted::Shutdown(Some(reply)),
                        None => break Interrupted::Shutdown(None),
                    },
                }
            }
        };

        match interrupted {
            Interrupted::Done(Ok(())) => {
                info!(generation = self.generation, "Handshake complete");
                ControlFlow::Continue(())
            }
            Interrupted::Done(Err(e)) => {
                self.handle_attempt_error(e).await;
                ControlFlow::Continue(())
            }
            Interrupted::Disconnect(reply) => {
                info!("Disconnect during handshake, abandoning it");
                self.disconnect().await;
                let _ = reply.send(());
                ControlFlow::Continue(())
            }
            Interrupted::Shutdown(reply) => {
                self.disconnect().await;
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
                ControlFlow::Break(())
            }
        }
    }

    async fn handle_attempt_error(&mut self, error: SessionError) {
        warn!(attempt = self.recovery.attempt_count(), "Connection attempt failed: {}", error);
        self.release().await;

        if !error.is_retryable() {
            self.recovery.cancel();
            self.state.fail(error.to_string());
            return;
        }

        let decision = self.recovery.handle_attempt_failed(now());
        self.escalate(decision).await;
    }

    /// Acts on a recovery decision.
    async fn recover(&mut self, decision: Option<Recovery>) -> ControlFlow<()> {
        let Some(decision) = decision else {
            return ControlFlow::Continue(());
        };
        if !self.state.status().is_active() {
            debug!(?decision, "Session inactive, ignoring recovery decision");
            self.recovery.cancel();
            return ControlFlow::Continue(());
        }

        match decision {
            Recovery::Reopen { attempt } => {
                info!(attempt, "Reconnecting");
                self.reopen().await
            }
            Recovery::Restart => self.restart().await,
            other => {
                self.escalate(Some(other)).await;
                ControlFlow::Continue(())
            }
        }
    }

    /// Handles the outcome of an escalation: a scheduled retry or the end.
    async fn escalate(&mut self, decision: Option<Recovery>) {
        match decision {
            Some(Recovery::Scheduled { attempt, delay }) => {
                info!(attempt, ?delay, "Reconnection scheduled");
                self.state.mark_retrying(attempt);
            }
            Some(Recovery::Exhausted { attempts }) => {
                self.release().await;
                self.state
                    .fail(format!("connection lost: gave up after {attempts} reconnection attempts"));
            }
            Some(other) => debug!(?other, "Unexpected escalation outcome"),
            None => {}
        }
    }

    async fn handle_notification(&mut self, notice: Notification) -> ControlFlow<()> {
        if self.live != Some(notice.generation) {
            trace!(generation = notice.generation, event = ?notice.event, "Ignoring stale notification");
            return ControlFlow::Continue(());
        }

        match notice.event {
            TransportEvent::RemoteTrack(kind) => {
                info!(?kind, "Remote track arrived");
            }
            TransportEvent::IceStateChange(state) => {
                debug!(?state, "ICE state");
                if matches!(state, IceState::Connected | IceState::Completed) {
                    self.mark_connected();
                }
                let decision = self.recovery.handle_ice_state(state, now());
                return self.recover(decision).await;
            }
            TransportEvent::ConnectionStateChange(state) => {
                debug!(?state, "Peer connection state");
                match state {
                    PeerState::Connected => self.mark_connected(),
                    PeerState::Failed | PeerState::Closed => {
                        // Feeds the same path as an ICE failure; a second
                        // report during backoff is a no-op.
                        let decision = self.recovery.handle_ice_state(IceState::Failed, now());
                        return self.recover(decision).await;
                    }
                    PeerState::New | PeerState::Connecting | PeerState::Disconnected => {}
                }
            }
            TransportEvent::ChannelOpen => {
                info!("Control channel open");
                self.mark_connected();
            }
            TransportEvent::ChannelMessage(raw) => match ControlEvent::parse(&raw) {
                Ok(event) => {
                    trace!(kind = %event.kind, "Inbound event");
                    self.bus.publish(&event);
                }
                Err(e) => warn!("Dropping unparsable control event: {}", e),
            },
            TransportEvent::ChannelError(message) => {
                warn!("Control channel error: {}", message);
            }
            TransportEvent::ChannelClosed => {
                if self.state.status() == ConnectionStatus::Connected {
                    // Without the channel the session is unusable even if ICE
                    // is still up.
                    warn!("Control channel closed by the remote peer");
                    let decision = self.recovery.handle_ice_state(IceState::Failed, now());
                    return self.recover(decision).await;
                }
            }
        }
        ControlFlow::Continue(())
    }

    fn mark_connected(&mut self) {
        if self.state.mark_connected() {
            info!(session = self.state.session_id(), "Session connected");
            self.recovery.handle_recovered();
        }
    }

    async fn release(&mut self) {
        self.live = None;
        self.transport.close().await;
    }

    async fn disconnect(&mut self) {
        self.recovery.cancel();
        self.release().await;
        if self.state.close() {
            info!(session = self.state.session_id(), "Session disconnected");
        }
    }

    async fn teardown(&mut self) {
        self.disconnect().await;
        let snapshot = self.state.snapshot();
        debug!(session = snapshot.id, state = %snapshot.status, "Session torn down");
    }
}
