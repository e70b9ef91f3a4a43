#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use rover_session::error::{MediaAccessError, SignalingError, TransportError};
use rover_session::media::{AudioCapture, AudioDevice, AudioPacket};
use rover_session::transport::{IceState, Notifier, Transport, TransportEvent};
use rover_session::{
    ConnectionStatus, ControlEvent, EventBus, RecoveryConfig, SessionDescription, SessionManager,
    SessionSnapshot, Signaling,
};

/// What the fake transport has been asked to do so far.
#[derive(Default)]
pub struct Ledger {
    pub opens: usize,
    pub restarts: usize,
    pub completes: usize,
    pub closes: usize,
    pub live: bool,
    pub sent: Vec<ControlEvent>,
    /// Notifier of every handle ever opened, oldest first.
    pub notifiers: Vec<Notifier>,
}

/// In-memory transport. With `auto_connect` it reports ICE connected and the
/// channel open as soon as an answer is applied.
pub struct FakeTransport {
    ledger: Arc<Mutex<Ledger>>,
    capture: Option<Box<dyn AudioCapture>>,
    auto_connect: bool,
}

#[derive(Clone)]
pub struct TransportHandle(Arc<Mutex<Ledger>>);

impl FakeTransport {
    pub fn new(auto_connect: bool) -> (Self, TransportHandle) {
        let ledger = Arc::new(Mutex::new(Ledger::default()));
        let transport = Self {
            ledger: ledger.clone(),
            capture: None,
            auto_connect,
        };
        (transport, TransportHandle(ledger))
    }

    fn release(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        let mut ledger = self.ledger.lock();
        if ledger.live {
            ledger.live = false;
            ledger.closes += 1;
        }
    }

    fn notify_connected(&self) {
        let ledger = self.ledger.lock();
        if let Some(notifier) = ledger.notifiers.last() {
            notifier.notify(TransportEvent::IceStateChange(IceState::Checking));
            notifier.notify(TransportEvent::IceStateChange(IceState::Connected));
            notifier.notify(TransportEvent::ChannelOpen);
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(
        &mut self,
        audio: &dyn AudioDevice,
        notifier: Notifier,
    ) -> Result<SessionDescription, TransportError> {
        self.release();
        self.capture = Some(audio.capture()?);

        let mut ledger = self.ledger.lock();
        ledger.opens += 1;
        ledger.live = true;
        ledger.notifiers.push(notifier);
        Ok(SessionDescription::offer(format!("v=0\r\ns=fake {}\r\n", ledger.opens)))
    }

    async fn complete(&mut self, answer: &SessionDescription) -> Result<(), TransportError> {
        {
            let mut ledger = self.ledger.lock();
            if !ledger.live {
                return Err(TransportError::NotOpen);
            }
            if answer.sdp.is_empty() {
                return Err(TransportError::Negotiation("empty answer".into()));
            }
            ledger.completes += 1;
        }
        if self.auto_connect {
            self.notify_connected();
        }
        Ok(())
    }

    async fn renegotiate(&mut self) -> Result<SessionDescription, TransportError> {
        let mut ledger = self.ledger.lock();
        if !ledger.live {
            return Err(TransportError::NotOpen);
        }
        ledger.restarts += 1;
        Ok(SessionDescription::offer("v=0\r\ns=fake restart\r\n"))
    }

    fn send(&mut self, event: &ControlEvent) {
        let mut ledger = self.ledger.lock();
        if ledger.live {
            ledger.sent.push(event.clone());
        }
    }

    async fn close(&mut self) {
        self.release();
    }

    fn is_open(&self) -> bool {
        self.ledger.lock().live
    }
}

impl TransportHandle {
    pub fn opens(&self) -> usize {
        self.0.lock().opens
    }

    pub fn restarts(&self) -> usize {
        self.0.lock().restarts
    }

    pub fn completes(&self) -> usize {
        self.0.lock().completes
    }

    pub fn closes(&self) -> usize {
        self.0.lock().closes
    }

    pub fn is_live(&self) -> bool {
        self.0.lock().live
    }

    pub fn sent(&self) -> Vec<ControlEvent> {
        self.0.lock().sent.clone()
    }

    /// Notifier of the `n`th opened handle, counting from one.
    pub fn notifier(&self, n: usize) -> Notifier {
        self.0.lock().notifiers[n - 1].clone()
    }

    /// Raises `event` from the most recent handle.
    pub fn notify(&self, event: TransportEvent) {
        let notifier = self.0.lock().notifiers.last().cloned();
        if let Some(notifier) = notifier {
            notifier.notify(event);
        }
    }
}

pub enum Reply {
    Answer,
    Status(u16),
    Hang,
}

#[derive(Default)]
struct Script {
    replies: VecDeque<Reply>,
    exchanges: usize,
}

/// Answers offers from a script; answers normally once the script runs out.
#[derive(Clone, Default)]
pub struct ScriptedSignaling(Arc<Mutex<Script>>);

impl ScriptedSignaling {
    pub fn new(replies: impl IntoIterator<Item = Reply>) -> Self {
        Self(Arc::new(Mutex::new(Script {
            replies: replies.into_iter().collect(),
            exchanges: 0,
        })))
    }

    pub fn exchanges(&self) -> usize {
        self.0.lock().exchanges
    }
}

#[async_trait]
impl Signaling for ScriptedSignaling {
    async fn exchange(
        &self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, SignalingError> {
        assert!(offer.sdp.starts_with("v=0"));
        let reply = {
            let mut script = self.0.lock();
            script.exchanges += 1;
            script.replies.pop_front().unwrap_or(Reply::Answer)
        };

        match reply {
            Reply::Answer => Ok(SessionDescription::answer("v=0\r\ns=answer\r\n")),
            Reply::Status(status) => Err(SignalingError::Status {
                status,
                body: "scripted failure".into(),
            }),
            Reply::Hang => std::future::pending().await,
        }
    }
}

/// Audio device that counts captures still running.
#[derive(Clone, Default)]
pub struct TrackedDevice {
    live: Arc<AtomicUsize>,
    denied: bool,
}

impl TrackedDevice {
    pub fn denied() -> Self {
        Self {
            live: Arc::default(),
            denied: true,
        }
    }

    pub fn live_captures(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl AudioDevice for TrackedDevice {
    fn capture(&self) -> Result<Box<dyn AudioCapture>, MediaAccessError> {
        if self.denied {
            return Err(MediaAccessError::PermissionDenied);
        }
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(TrackedCapture {
            live: Some(self.live.clone()),
        }))
    }
}

struct TrackedCapture {
    live: Option<Arc<AtomicUsize>>,
}

impl AudioCapture for TrackedCapture {
    fn poll_packet(&mut self) -> Option<AudioPacket> {
        None
    }

    fn stop(&mut self) {
        if let Some(live) = self.live.take() {
            live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn is_live(&self) -> bool {
        self.live.is_some()
    }
}

pub struct Harness {
    pub session: SessionManager,
    pub transport: TransportHandle,
    pub signaling: ScriptedSignaling,
    pub audio: TrackedDevice,
}

impl Harness {
    pub fn new(replies: impl IntoIterator<Item = Reply>) -> Self {
        Self::with(RecoveryConfig::default(), TrackedDevice::default(), replies)
    }

    pub fn with(
        config: RecoveryConfig,
        audio: TrackedDevice,
        replies: impl IntoIterator<Item = Reply>,
    ) -> Self {
        let (transport, handle) = FakeTransport::new(true);
        let signaling = ScriptedSignaling::new(replies);
        let session = SessionManager::spawn(
            config,
            transport,
            signaling.clone(),
            audio.clone(),
            EventBus::new(),
        );
        Self {
            session,
            transport: handle,
            signaling,
            audio,
        }
    }

    pub async fn wait_status(&self, status: ConnectionStatus) -> SessionSnapshot {
        tokio::time::timeout(
            Duration::from_secs(600),
            self.session.wait_for(|s| s.status == status),
        )
        .await
        .expect("status not reached in time")
        .expect("session driver stopped")
    }

    pub async fn connected(replies: impl IntoIterator<Item = Reply>) -> Self {
        let harness = Self::new(replies);
        harness.session.connect().await.unwrap();
        harness.wait_status(ConnectionStatus::Connected).await;
        harness
    }
}

/// Lets the driver drain everything already queued.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
