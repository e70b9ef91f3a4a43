//! Error types for the session connection manager.
//!
//! Errors are split by the component that raises them. [`SessionError`] is the
//! union the session driver works with and decides retry policy on.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::state::ConnectionStatus;

/// Local audio could not be acquired.
///
/// Fatal for the attempt: retrying does not change a permission denial.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaAccessError {
    /// The user or platform refused access to the capture device.
    #[error("audio capture permission denied")]
    PermissionDenied,
    /// There is no capture device to open.
    #[error("no audio capture device available")]
    NoDevice,
    /// The device exists but failed to start.
    #[error("audio capture failed: {0}")]
    Device(String),
}

/// The signaling exchange failed.
#[derive(Debug, Error)]
pub enum SignalingError {
    /// The endpoint answered with a non-success status.
    #[error("signaling endpoint returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, as text.
        body: String,
    },
    /// No response arrived within the configured bound.
    #[error("signaling exchange timed out after {0:?}")]
    Timeout(Duration),
    /// The endpoint answered with an empty body.
    #[error("signaling endpoint returned an empty answer")]
    EmptyResponse,
    /// The request could not be sent or its body not read.
    #[error("signaling request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Errors raised by a [`Transport`](crate::transport::Transport) backend.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Local audio could not be acquired.
    #[error(transparent)]
    MediaAccess(#[from] MediaAccessError),
    /// The session description was malformed or rejected.
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    /// Socket setup or I/O failed.
    #[error("transport i/o: {0}")]
    Io(#[from] io::Error),
    /// Server-reflexive discovery failed.
    #[error("STUN binding failed: {0}")]
    Stun(String),
    /// The operation needs a live handle and there is none.
    #[error("no live transport handle")]
    NotOpen,
}

/// Errors surfaced by the [`SessionManager`](crate::session::SessionManager).
#[derive(Debug, Error)]
pub enum SessionError {
    /// `connect()` was called while a session is connecting or connected.
    #[error("session already {0}")]
    AlreadyActive(ConnectionStatus),
    /// Local audio could not be acquired.
    #[error(transparent)]
    Media(#[from] MediaAccessError),
    /// The signaling exchange failed.
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    /// The remote description was rejected.
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    /// Transport setup failed.
    #[error("transport failed: {0}")]
    Transport(String),
    /// The session driver has shut down.
    #[error("session driver stopped")]
    Stopped,
}

impl SessionError {
    /// Whether the recovery controller may retry after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::Signaling(_)
            | SessionError::Negotiation(_)
            | SessionError::Transport(_) => true,
            SessionError::AlreadyActive(_) | SessionError::Media(_) | SessionError::Stopped => {
                false
            }
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::MediaAccess(m) => SessionError::Media(m),
            TransportError::Negotiation(msg) => SessionError::Negotiation(msg),
            TransportError::Io(io) => SessionError::Transport(io.to_string()),
            TransportError::Stun(msg) => SessionError::Transport(msg),
            TransportError::NotOpen => SessionError::Transport("no live transport handle".into()),
        }
    }
}

/// Configuration could not be loaded or is invalid.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("reading config: {0}")]
    Io(#[from] io::Error),
    /// The file is not valid JSON for [`Config`](crate::config::Config).
    #[error("parsing config: {0}")]
    Parse(#[from] serde_json::Error),
    /// A value is out of range or malformed.
    #[error("invalid config: {0}")]
    Invalid(String),
}
