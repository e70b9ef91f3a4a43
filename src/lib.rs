//! Client-side manager for one real-time voice session.
//!
//! The session negotiates a peer connection through an HTTP signaling
//! endpoint, carries local audio out and remote audio in, exchanges JSON
//! control events on a data channel, and recovers on its own from transient
//! network loss.
//!
//! ```no_run
//! use rover_session::{
//!     Config, ControlEvent, EventBus, HttpSignaling, RtcTransport, SessionManager, SilenceDevice,
//! };
//!
//! # async fn run() -> Result<(), rover_session::SessionError> {
//! let config = Config::default();
//! let session = SessionManager::spawn(
//!     config.recovery.clone(),
//!     RtcTransport::new(config.transport.clone()),
//!     HttpSignaling::new(&config.signaling),
//!     SilenceDevice,
//!     EventBus::new(),
//! );
//!
//! let _sub = session.subscribe(|event| println!("{}", event.kind));
//! session.connect().await?;
//! session.send_event(ControlEvent::new("response.create"));
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod loopback;
pub mod media;
pub mod recovery;
pub mod session;
pub mod signaling;
pub mod state;
pub mod transport;

pub(crate) mod util;

pub use bus::{EventBus, Subscription};
pub use config::{Backoff, Config, RecoveryConfig, SignalingConfig, TransportConfig};
pub use error::{ConfigError, MediaAccessError, SessionError, SignalingError, TransportError};
pub use event::ControlEvent;
pub use media::{AudioDevice, SilenceDevice, UnavailableDevice};
pub use session::SessionManager;
pub use signaling::{HttpSignaling, SessionDescription, Signaling};
pub use state::{ConnectionState, ConnectionStatus, SessionSnapshot};
pub use transport::{RtcTransport, Transport};
