//! Externally observable connection status.
//!
//! [`ConnectionStateMachine`] is the only writer. It is owned by the session
//! driver, which feeds it transport notifications and recovery decisions;
//! everyone else observes [`SessionSnapshot`]s through a `watch` channel.

use std::fmt;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Initial, and terminal after a clean close.
    Disconnected,
    /// Handshake or reconnection in flight.
    Connecting,
    /// Channel open or ICE connected, whichever came first.
    Connected,
    /// Terminal for the attempt. See [`SessionSnapshot::last_error`].
    Error,
}

impl ConnectionStatus {
    /// Connecting or connected: a new `connect()` would duplicate the handshake.
    pub fn is_active(self) -> bool {
        matches!(self, ConnectionStatus::Connecting | ConnectionStatus::Connected)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// What UI layers poll: status plus the error message, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub error: Option<String>,
}

/// One logical conversation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    /// Increments on every `connect()`. Zero before the first.
    pub id: u64,
    pub status: ConnectionStatus,
    pub last_error: Option<String>,
    /// Reconnection attempts made since the last successful connection.
    pub attempt_count: u32,
}

impl SessionSnapshot {
    fn initial() -> Self {
        Self {
            id: 0,
            status: ConnectionStatus::Disconnected,
            last_error: None,
            attempt_count: 0,
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        ConnectionState {
            status: self.status,
            error: self.last_error.clone(),
        }
    }
}

pub(crate) struct ConnectionStateMachine {
    tx: watch::Sender<SessionSnapshot>,
}

impl ConnectionStateMachine {
    pub(crate) fn new() -> (Self, watch::Receiver<SessionSnapshot>) {
        let (tx, rx) = watch::channel(SessionSnapshot::initial());
        (Self { tx }, rx)
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        self.tx.borrow().clone()
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        self.tx.borrow().status
    }

    pub(crate) fn session_id(&self) -> u64 {
        self.tx.borrow().id
    }

    /// Replaces the session with a fresh one in `connecting`.
    ///
    /// Rejected while a session is already connecting or connected.
    pub(crate) fn begin(&mut self) -> Result<u64, SessionError> {
        let current = self.status();
        if current.is_active() {
            return Err(SessionError::AlreadyActive(current));
        }
        let id = self.session_id() + 1;
        self.tx.send_replace(SessionSnapshot {
            id,
            status: ConnectionStatus::Connecting,
            last_error: None,
            attempt_count: 0,
        });
        info!(session = id, "Session connecting");
        Ok(id)
    }

    /// The first of channel-open or ICE-connected. Later signals are no-ops.
    pub(crate) fn mark_connected(&mut self) -> bool {
        self.transition(|s| {
            if s.status != ConnectionStatus::Connecting {
                return false;
            }
            s.status = ConnectionStatus::Connected;
            s.attempt_count = 0;
            true
        })
    }

    /// A reconnection was scheduled; show `connecting`, never a transient `error`.
    pub(crate) fn mark_retrying(&mut self, attempt: u32) -> bool {
        self.transition(|s| {
            if !s.status.is_active() {
                return false;
            }
            s.status = ConnectionStatus::Connecting;
            s.attempt_count = attempt;
            true
        })
    }

    /// Ends the attempt in `error`.
    pub(crate) fn fail(&mut self, message: impl Into<String>) -> bool {
        let message = message.into();
        self.transition(|s| {
            if s.status == ConnectionStatus::Error {
                return false;
            }
            s.status = ConnectionStatus::Error;
            s.last_error = Some(message);
            true
        })
    }

    /// Clean close. Keeps an `error` status visible so the failure is not hidden.
    pub(crate) fn close(&mut self) -> bool {
        self.transition(|s| {
            if !s.status.is_active() {
                return false;
            }
            s.status = ConnectionStatus::Disconnected;
            true
        })
    }

    fn transition(&mut self, f: impl FnOnce(&mut SessionSnapshot) -> bool) -> bool {
        let changed = self.tx.send_if_modified(f);
        if changed {
            let s = self.tx.borrow();
            debug!(
                session = s.id,
                state = %s.status,
                attempt = s.attempt_count,
                error = s.last_error.as_deref().unwrap_or(""),
                "Connection state changed"
            );
        }
        changed
    }
}
