//! [`Transport`] backed by `str0m`.
//!
//! str0m is sans-I/O, so every handle gets a tokio task that owns the `Rtc`
//! instance and its UDP socket and drives the usual loop: drain
//! `poll_output` (transmit, events, next timeout), then wait for whichever
//! comes first of a datagram, the timeout, a command or the audio clock.
//! The task is the only place the `Rtc` is touched; the [`RtcTransport`]
//! talks to it over a command channel.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use str0m::change::{SdpAnswer, SdpOffer, SdpPendingOffer};
use str0m::channel::ChannelId;
use str0m::format::Codec;
use str0m::media::{Direction, Frequency, MediaKind, MediaTime, Mid};
use str0m::net::{Protocol, Receive};
use str0m::{Candidate, Event, IceConnectionState, Input, Output, Rtc};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::reflexive;
use super::{IceState, Notifier, PeerState, TrackKind, Transport, TransportEvent};
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::event::ControlEvent;
use crate::media::{AudioCapture, AudioDevice, AudioPacket, AudioSink};
use crate::signaling::SessionDescription;
use crate::util::select_host_address;

const AUDIO_FRAME: Duration = Duration::from_millis(20);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

enum Command {
    Accept(SdpAnswer, oneshot::Sender<Result<(), TransportError>>),
    Restart(oneshot::Sender<Result<SdpOffer, TransportError>>),
    Send(String),
    Close(oneshot::Sender<()>),
}

struct RtcHandle {
    generation: u64,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

pub struct RtcTransport {
    config: TransportConfig,
    handle: Option<RtcHandle>,
}

impl RtcTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            handle: None,
        }
    }

    fn bind_ip(&self) -> Result<IpAddr, TransportError> {
        self.config
            .bind_ip
            .or_else(select_host_address)
            .ok_or_else(|| {
                TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    "found no usable network interface",
                ))
            })
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, TransportError>>) -> Command,
    ) -> Result<T, TransportError> {
        let handle = self.handle.as_ref().ok_or(TransportError::NotOpen)?;
        let (tx, rx) = oneshot::channel();
        handle
            .commands
            .send(make(tx))
            .map_err(|_| TransportError::NotOpen)?;
        rx.await.map_err(|_| TransportError::NotOpen)?
    }
}

#[async_trait]
impl Transport for RtcTransport {
    async fn open(
        &mut self,
        audio: &dyn AudioDevice,
        notifier: Notifier,
    ) -> Result<SessionDescription, TransportError> {
        self.close().await;

        // Stopped on every early exit, including this future being dropped
        // while the socket is prepared.
        let capture = CaptureGuard(Some(audio.capture()?));
        let sink = audio.playback();

        let prepared = self.prepare().await?;
        let offer = prepared.offer.to_sdp_string();

        info!(
            generation = notifier.generation(),
            local = %prepared.local,
            "Peer connection created, offering audio and channel '{}'",
            self.config.channel_label
        );

        let (commands, rx) = mpsc::unbounded_channel();
        let generation = notifier.generation();
        let driver = Driver::new(prepared, capture, sink, notifier);
        let task = tokio::spawn(driver.run(rx));

        self.handle = Some(RtcHandle {
            generation,
            commands,
            task,
        });

        Ok(SessionDescription::offer(offer))
    }

    async fn complete(&mut self, answer: &SessionDescription) -> Result<(), TransportError> {
        let answer = SdpAnswer::from_sdp_string(&answer.sdp)
            .map_err(|e| TransportError::Negotiation(format!("malformed answer: {e}")))?;
        self.request(|reply| Command::Accept(answer, reply)).await
    }

    async fn renegotiate(&mut self) -> Result<SessionDescription, TransportError> {
        let offer = self.request(Command::Restart).await?;
        Ok(SessionDescription::offer(offer.to_sdp_string()))
    }

    fn send(&mut self, event: &ControlEvent) {
        let Some(handle) = &self.handle else {
            warn!(kind = %event.kind, "No transport, dropping outbound event");
            return;
        };
        match event.to_wire() {
            Ok(text) => {
                if handle.commands.send(Command::Send(text)).is_err() {
                    warn!(kind = %event.kind, "Transport stopped, dropping outbound event");
                }
            }
            Err(e) => warn!(kind = %event.kind, "Failed to serialize event: {}", e),
        }
    }

    async fn close(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        debug!(generation = handle.generation, "Closing transport handle");

        let (tx, rx) = oneshot::channel();
        if handle.commands.send(Command::Close(tx)).is_ok() {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, rx).await;
        }
        // Wait for the driver to be dropped so its socket and capture are
        // released before anything replaces them.
        handle.task.abort();
        let _ = handle.task.await;
    }

    fn is_open(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| !h.task.is_finished())
            .unwrap_or(false)
    }
}

struct Prepared {
    rtc: Rtc,
    socket: UdpSocket,
    local: SocketAddr,
    mid: Mid,
    cid: ChannelId,
    offer: SdpOffer,
    pending: SdpPendingOffer,
}

impl RtcTransport {
    async fn prepare(&self) -> Result<Prepared, TransportError> {
        let socket = UdpSocket::bind(SocketAddr::new(self.bind_ip()?, 0)).await?;
        let local = socket.local_addr()?;

        let mut rtc = Rtc::new();
        let candidate = Candidate::host(local, "udp")
            .map_err(|e| TransportError::Negotiation(format!("host candidate: {e}")))?;
        rtc.add_local_candidate(candidate);

        // str0m does no server gathering of its own.
        let mapped = reflexive::gather(
            &socket,
            &self.config.ice_servers,
            usize::from(self.config.candidate_pool_size),
            reflexive::GATHER_TIMEOUT,
        )
        .await;
        for addr in mapped {
            match Candidate::server_reflexive(addr, local, "udp") {
                Ok(candidate) => {
                    debug!("Server reflexive candidate {}", addr);
                    rtc.add_local_candidate(candidate);
                }
                Err(e) => warn!("Rejected reflexive candidate {}: {:?}", addr, e),
            }
        }

        let mut change = rtc.sdp_api();
        let mid = change.add_media(MediaKind::Audio, Direction::SendRecv, None, None, None);
        let cid = change.add_channel(self.config.channel_label.clone());
        let (offer, pending) = change
            .apply()
            .ok_or_else(|| TransportError::Negotiation("offer had no changes".into()))?;

        Ok(Prepared {
            rtc,
            socket,
            local,
            mid,
            cid,
            offer,
            pending,
        })
    }
}

/// A capture that is stopped when dropped, wherever that happens.
struct CaptureGuard(Option<Box<dyn AudioCapture>>);

impl CaptureGuard {
    fn poll_packet(&mut self) -> Option<AudioPacket> {
        self.0.as_mut()?.poll_packet()
    }

    /// Idempotent.
    fn stop(&mut self) {
        if let Some(mut capture) = self.0.take() {
            capture.stop();
        }
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Owns one `Rtc` instance for its whole life.
struct Driver {
    rtc: Rtc,
    socket: UdpSocket,
    local: SocketAddr,
    mid: Mid,
    cid: ChannelId,
    pending: Option<SdpPendingOffer>,
    capture: CaptureGuard,
    sink: Option<Box<dyn AudioSink>>,
    notifier: Notifier,
    channel_open: bool,
    ice_connected: bool,
    /// RTP clock for outgoing audio, 48 kHz.
    audio_clock: u64,
    released: bool,
}

impl Driver {
    fn new(
        prepared: Prepared,
        capture: CaptureGuard,
        sink: Option<Box<dyn AudioSink>>,
        notifier: Notifier,
    ) -> Self {
        let Prepared {
            rtc,
            socket,
            local,
            mid,
            cid,
            offer: _,
            pending,
        } = prepared;

        Self {
            rtc,
            socket,
            local,
            mid,
            cid,
            pending: Some(pending),
            capture,
            sink,
            notifier,
            channel_open: false,
            ice_connected: false,
            audio_clock: 0,
            released: false,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut buf = vec![0; 2000];
        let mut audio_tick = tokio::time::interval(AUDIO_FRAME);
        audio_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let Some(timeout) = self.drain_output().await else {
                self.fail("poll_output failed");
                return;
            };

            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => self.release(),
                },
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((n, source)) => self.handle_datagram(&buf[..n], source),
                    Err(e) => {
                        warn!("UDP receive failed: {}", e);
                        self.fail("socket error");
                        return;
                    }
                },
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(timeout)) => {
                    self.handle_input(Input::Timeout(Instant::now()));
                }
                _ = audio_tick.tick() => self.pump_audio(),
            }

            if self.released {
                return;
            }
            if !self.rtc.is_alive() {
                self.fail("peer connection died");
                return;
            }
        }
    }

    /// Poll until str0m asks to be woken at a later time.
    async fn drain_output(&mut self) -> Option<Instant> {
        loop {
            match self.rtc.poll_output() {
                Ok(Output::Timeout(t)) => return Some(t),
                Ok(Output::Transmit(transmit)) => {
                    if let Err(e) = self
                        .socket
                        .send_to(&transmit.contents, transmit.destination)
                        .await
                    {
                        debug!("UDP send to {} failed: {}", transmit.destination, e);
                    }
                }
                Ok(Output::Event(event)) => self.handle_event(event),
                Err(e) => {
                    warn!("poll_output failed: {:?}", e);
                    return None;
                }
            }
        }
    }

    fn handle_datagram(&mut self, data: &[u8], source: SocketAddr) {
        let Ok(contents) = data.try_into() else {
            trace!("Ignoring unrecognised datagram from {}", source);
            return;
        };
        self.handle_input(Input::Receive(
            Instant::now(),
            Receive {
                proto: Protocol::Udp,
                source,
                destination: self.local,
                contents,
            },
        ));
    }

    fn handle_input(&mut self, input: Input) {
        if !self.rtc.is_alive() {
            return;
        }
        if let Err(e) = self.rtc.handle_input(input) {
            warn!("Peer connection input failed: {:?}", e);
            self.rtc.disconnect();
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Accept(answer, reply) => {
                let result = match self.pending.take() {
                    Some(pending) => self
                        .rtc
                        .sdp_api()
                        .accept_answer(pending, answer)
                        .map_err(|e| TransportError::Negotiation(e.to_string())),
                    None => Err(TransportError::Negotiation(
                        "no offer awaiting an answer".into(),
                    )),
                };
                if result.is_ok() {
                    info!("Answer accepted, waiting for ICE and channel");
                }
                let _ = reply.send(result);
            }
            Command::Restart(reply) => {
                let mut change = self.rtc.sdp_api();
                change.ice_restart(true);
                let result = match change.apply() {
                    Some((offer, pending)) => {
                        self.pending = Some(pending);
                        info!("ICE restart offer created");
                        Ok(offer)
                    }
                    None => Err(TransportError::Negotiation(
                        "ICE restart produced no offer".into(),
                    )),
                };
                let _ = reply.send(result);
            }
            Command::Send(text) => {
                if !self.channel_open {
                    warn!("Channel not open, dropping outbound event");
                    return;
                }
                let Some(mut channel) = self.rtc.channel(self.cid) else {
                    warn!("Channel {:?} gone, dropping outbound event", self.cid);
                    return;
                };
                if let Err(e) = channel.write(false, text.as_bytes()) {
                    warn!("Channel write failed: {:?}", e);
                }
            }
            Command::Close(done) => {
                self.release();
                let _ = done.send(());
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::IceConnectionStateChange(state) => {
                let (ice, peer) = match state {
                    IceConnectionState::New => (IceState::New, PeerState::New),
                    IceConnectionState::Checking => (IceState::Checking, PeerState::Connecting),
                    IceConnectionState::Connected => (IceState::Connected, PeerState::Connecting),
                    IceConnectionState::Completed => (IceState::Completed, PeerState::Connecting),
                    IceConnectionState::Disconnected => {
                        (IceState::Disconnected, PeerState::Disconnected)
                    }
                };
                info!("ICE connection state: {:?}", state);
                self.ice_connected = matches!(ice, IceState::Connected | IceState::Completed);
                self.notifier.notify(TransportEvent::IceStateChange(ice));
                if !self.ice_connected {
                    self.notifier
                        .notify(TransportEvent::ConnectionStateChange(peer));
                }
            }
            Event::Connected => {
                self.notifier
                    .notify(TransportEvent::ConnectionStateChange(PeerState::Connected));
            }
            Event::MediaAdded(media) => {
                let kind = match media.kind {
                    MediaKind::Audio => TrackKind::Audio,
                    MediaKind::Video => TrackKind::Video,
                };
                debug!(mid = ?media.mid, ?kind, "Remote track added");
                self.notifier.notify(TransportEvent::RemoteTrack(kind));
            }
            Event::MediaData(data) => {
                if let Some(sink) = self.sink.as_mut() {
                    sink.render(&data.data);
                }
            }
            Event::ChannelOpen(id, label) => {
                if id != self.cid {
                    debug!("Ignoring unexpected channel '{}' ({:?})", label, id);
                    return;
                }
                info!("Channel '{}' open", label);
                self.channel_open = true;
                self.notifier.notify(TransportEvent::ChannelOpen);
            }
            Event::ChannelData(data) => {
                if data.id != self.cid {
                    return;
                }
                match String::from_utf8(data.data) {
                    Ok(text) => {
                        self.notifier.notify(TransportEvent::ChannelMessage(text));
                    }
                    Err(_) => {
                        self.notifier.notify(TransportEvent::ChannelError(
                            "received a frame that is not UTF-8".into(),
                        ));
                    }
                }
            }
            Event::ChannelClose(id) => {
                if id == self.cid {
                    self.channel_open = false;
                    self.notifier.notify(TransportEvent::ChannelClosed);
                }
            }
            other => trace!("Event (other): {:?}", other),
        }
    }

    fn pump_audio(&mut self) {
        while let Some(packet) = self.capture.poll_packet() {
            let ticks = packet.duration.as_millis() as u64 * 48;
            if !self.ice_connected {
                continue;
            }
            let Some(writer) = self.rtc.writer(self.mid) else {
                continue;
            };
            let Some(pt) = writer
                .payload_params()
                .find(|p| p.spec().codec == Codec::Opus)
                .map(|p| p.pt())
            else {
                trace!("Opus not negotiated, dropping audio");
                continue;
            };
            let rtp_time = MediaTime::new(self.audio_clock, Frequency::FORTY_EIGHT_KHZ);
            self.audio_clock += ticks;
            if let Err(e) = writer.write(pt, Instant::now(), rtp_time, packet.data) {
                debug!("Audio write failed: {:?}", e);
            }
        }
    }

    /// The handle died on its own; report it and clean up.
    fn fail(&mut self, reason: &str) {
        warn!("Transport failed: {}", reason);
        self.notifier
            .notify(TransportEvent::IceStateChange(IceState::Failed));
        self.notifier
            .notify(TransportEvent::ConnectionStateChange(PeerState::Failed));
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        // Disconnecting tears down the SCTP association and with it the channel.
        self.channel_open = false;
        self.rtc.disconnect();
        self.capture.stop();
        if let Some(sink) = self.sink.as_mut() {
            sink.detach();
        }
        debug!(generation = self.notifier.generation(), "Transport handle released");
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.release();
    }
}
