//! Peer-to-peer transport: connection, media tracks and the control channel.
//!
//! A [`Transport`] owns at most one live handle. Every handle reports to the
//! session through a [`Notifier`] stamped with the handle's generation, so
//! notifications from a superseded handle can be recognised and ignored.

mod reflexive;
pub mod rtc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::event::ControlEvent;
use crate::media::AudioDevice;
use crate::signaling::SessionDescription;

pub use rtc::RtcTransport;

/// ICE connection state.
///
/// `Failed` and `Closed` are synthesised by backends that do not report them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Overall peer connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Raw notifications raised by a transport handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    RemoteTrack(TrackKind),
    IceStateChange(IceState),
    ConnectionStateChange(PeerState),
    ChannelOpen,
    /// One text frame, not yet parsed.
    ChannelMessage(String),
    ChannelError(String),
    ChannelClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub generation: u64,
    pub event: TransportEvent,
}

/// Sends notifications on behalf of one transport handle.
#[derive(Debug, Clone)]
pub struct Notifier {
    generation: u64,
    tx: mpsc::UnboundedSender<Notification>,
}

impl Notifier {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<Notification>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `false` once the session has gone away.
    pub fn notify(&self, event: TransportEvent) -> bool {
        self.tx
            .send(Notification {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Lifecycle of the peer connection.
///
/// Implementations must release an existing handle before creating a new
/// one in [`open`](Transport::open), and [`close`](Transport::close) must be
/// safe to call at any time, any number of times.
#[async_trait]
pub trait Transport: Send {
    /// Creates the connection, attaches local audio, creates the control
    /// channel and returns the local offer (audio received, no video).
    async fn open(
        &mut self,
        audio: &dyn AudioDevice,
        notifier: Notifier,
    ) -> Result<SessionDescription, TransportError>;

    /// Applies the remote answer.
    async fn complete(&mut self, answer: &SessionDescription) -> Result<(), TransportError>;

    /// A fresh offer with ICE restart, keeping tracks and channel.
    async fn renegotiate(&mut self) -> Result<SessionDescription, TransportError>;

    /// Writes one event to the channel. Dropped with a warning when the
    /// channel is not open.
    fn send(&mut self, event: &ControlEvent);

    /// Closes channel and connection, stops capture, detaches playback.
    async fn close(&mut self);

    /// Whether a live handle exists.
    fn is_open(&self) -> bool;
}
