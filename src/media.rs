//! Local audio capture and remote audio rendering.
//!
//! Capture hands encoded Opus packets to the transport; a sink receives the
//! remote peer's audio. Both are detached when the transport handle is
//! released.

use std::time::{Duration, Instant};

use crate::error::MediaAccessError;

/// One encoded audio frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPacket {
    /// Opus payload.
    pub data: Vec<u8>,
    pub duration: Duration,
}

/// Source of local and sink for remote audio.
pub trait AudioDevice: Send + Sync {
    /// Opens the capture device.
    fn capture(&self) -> Result<Box<dyn AudioCapture>, MediaAccessError>;

    /// Where remote audio is rendered, if anywhere.
    fn playback(&self) -> Option<Box<dyn AudioSink>> {
        None
    }
}

/// A live capture track.
pub trait AudioCapture: Send {
    /// Next packet ready for sending, if any.
    fn poll_packet(&mut self) -> Option<AudioPacket>;

    /// Stops capturing. Idempotent.
    fn stop(&mut self);

    fn is_live(&self) -> bool;
}

/// Renders remote audio.
pub trait AudioSink: Send {
    fn render(&mut self, payload: &[u8]);

    /// Detaches from the output device. Idempotent.
    fn detach(&mut self);
}

/// 20 ms of Opus silence.
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];
const FRAME: Duration = Duration::from_millis(20);

/// Produces silence at real-time pace. Lets the session run on machines
/// without a sound stack.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilenceDevice;

impl AudioDevice for SilenceDevice {
    fn capture(&self) -> Result<Box<dyn AudioCapture>, MediaAccessError> {
        Ok(Box::new(SilenceCapture {
            next: Some(Instant::now()),
        }))
    }
}

struct SilenceCapture {
    /// `None` once stopped.
    next: Option<Instant>,
}

impl AudioCapture for SilenceCapture {
    fn poll_packet(&mut self) -> Option<AudioPacket> {
        let next = self.next?;
        if Instant::now() < next {
            return None;
        }
        self.next = Some(next + FRAME);
        Some(AudioPacket {
            data: OPUS_SILENCE.to_vec(),
            duration: FRAME,
        })
    }

    fn stop(&mut self) {
        self.next = None;
    }

    fn is_live(&self) -> bool {
        self.next.is_some()
    }
}

/// A device that can never be opened.
#[derive(Debug, Clone)]
pub struct UnavailableDevice(pub MediaAccessError);

impl AudioDevice for UnavailableDevice {
    fn capture(&self) -> Result<Box<dyn AudioCapture>, MediaAccessError> {
        Err(self.0.clone())
    }
}
