use std::net::UdpSocket;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde_json::Value;
use str0m::channel::{ChannelData, ChannelId};
use str0m::{Event, IceConnectionState, Input, Output, Rtc};
use tracing::{debug, info, warn};

use crate::event::ControlEvent;

/// One answered offer, driven by the loopback UDP loop.
#[derive(Debug)]
pub struct Peer {
    pub id: PeerId,
    rtc: Rtc,
    cid: Option<ChannelId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerId(u64);

impl Deref for PeerId {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Peer {
    pub fn new(rtc: Rtc) -> Peer {
        static ID_COUNTER: AtomicU64 = AtomicU64::new(0);
        let next_id = ID_COUNTER.fetch_add(1, Ordering::SeqCst);
        Peer {
            id: PeerId(next_id),
            rtc,
            cid: None,
        }
    }

    pub fn accepts(&self, input: &Input) -> bool {
        self.rtc.accepts(input)
    }

    pub fn is_alive(&self) -> bool {
        self.rtc.is_alive()
    }

    pub fn handle_input(&mut self, input: Input) {
        if !self.rtc.is_alive() {
            return;
        }

        if let Err(e) = self.rtc.handle_input(input) {
            warn!("Peer ({}) disconnected: {:?}", *self.id, e);
            self.rtc.disconnect();
        }
    }

    /// Drains output until the peer asks to be woken at a later instant.
    pub fn poll_until_timeout(&mut self, socket: &UdpSocket) -> Instant {
        loop {
            if !self.rtc.is_alive() {
                return Instant::now();
            }

            match self.rtc.poll_output() {
                Ok(Output::Timeout(t)) => return t,
                Ok(Output::Transmit(transmit)) => {
                    if let Err(e) = socket.send_to(&transmit.contents, transmit.destination) {
                        warn!("Peer ({}) send failed: {}", *self.id, e);
                        self.rtc.disconnect();
                    }
                }
                Ok(Output::Event(e)) => self.handle_event(e),
                Err(e) => {
                    warn!("Peer ({}) poll_output failed: {:?}", *self.id, e);
                    self.rtc.disconnect();
                    return Instant::now();
                }
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::IceConnectionStateChange(state) => {
                info!("🔌 Loopback Peer({}): ICE State = {:?}", *self.id, state);
                if state == IceConnectionState::Disconnected {
                    // The session side owns recovery; this end just lets go.
                    self.rtc.disconnect();
                }
            }
            Event::ChannelOpen(cid, label) => {
                info!("🎉 Loopback Peer({}): channel '{}' open", *self.id, label);
                self.cid = Some(cid);
            }
            Event::ChannelData(data) => self.handle_channel_data(data),
            Event::ChannelClose(cid) => {
                if self.cid == Some(cid) {
                    self.cid = None;
                }
            }
            Event::MediaAdded(media) => {
                debug!("Loopback Peer({}): media {:?} {:?}", *self.id, media.mid, media.kind);
            }
            // Audio is accepted and discarded.
            Event::MediaData(_) => {}
            other => debug!("Loopback Peer({}): {:?}", *self.id, other),
        }
    }

    fn handle_channel_data(&mut self, data: ChannelData) {
        let reply = match std::str::from_utf8(&data.data)
            .map_err(|e| e.to_string())
            .and_then(|text| ControlEvent::parse(text).map_err(|e| e.to_string()))
        {
            Ok(event) => {
                info!("📥 Loopback Peer({}): {}", *self.id, event.kind);
                echo(event)
            }
            Err(reason) => {
                warn!("Loopback Peer({}): rejected frame: {}", *self.id, reason);
                ControlEvent::new("error").with("message", reason)
            }
        };

        let wire = match reply.to_wire() {
            Ok(wire) => wire,
            Err(e) => {
                warn!("Loopback Peer({}): encoding reply: {}", *self.id, e);
                return;
            }
        };

        let Some(mut channel) = self.cid.and_then(|id| self.rtc.channel(id)) else {
            return;
        };
        if let Err(e) = channel.write(false, wire.as_bytes()) {
            warn!("Loopback Peer({}): failed to reply: {:?}", *self.id, e);
        }
    }
}

/// Wraps an inbound event in an `echo` reply stamped with the receive time.
pub fn echo(event: ControlEvent) -> ControlEvent {
    let inner = serde_json::to_value(&event).unwrap_or(Value::Null);
    ControlEvent::new("echo")
        .with("event", inner)
        .with("received_at", chrono::Utc::now().to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_wraps_the_original_event() {
        let event = ControlEvent::new("response.create").with("id", 3);
        let reply = echo(event);

        assert_eq!(reply.kind, "echo");
        let inner = reply.get("event").unwrap();
        assert_eq!(inner["type"], "response.create");
        assert_eq!(inner["id"], 3);

        let stamp = reply.get("received_at").and_then(Value::as_str).unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());
    }
}
