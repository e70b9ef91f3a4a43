//! Loopback remote peer for manual testing.
//!
//! A small HTTP endpoint takes raw SDP offers and answers them; a UDP loop
//! drives every accepted `Rtc` and echoes each inbound control event back
//! on the channel it arrived on. Point `rover-session connect --url` at it
//! to exercise a full session on one machine.

pub mod peer;

use std::io::{self, ErrorKind, Read};
use std::net::{SocketAddr, UdpSocket};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use rouille::{Request, Response, Server};
use str0m::change::SdpOffer;
use str0m::net::{Protocol, Receive};
use str0m::{Candidate, Input, Rtc};
use tracing::{debug, info, warn};

use crate::signaling::SDP_CONTENT_TYPE;
use crate::util::select_host_address;

use self::peer::Peer;

/// Serves offers on `port` until the process exits.
pub fn serve(port: u16) -> io::Result<()> {
    let host_addr = select_host_address()
        .ok_or_else(|| io::Error::new(ErrorKind::AddrNotAvailable, "no usable network interface"))?;

    let (tx, rx) = mpsc::sync_channel(1);

    let socket = UdpSocket::bind(SocketAddr::new(host_addr, 0))?;
    let addr = socket.local_addr()?;
    info!("Bound UDP port: {}", addr);

    thread::spawn(move || run(socket, addr, rx));

    let server = Server::new(("0.0.0.0", port), move |request| {
        web_request(request, addr, tx.clone())
    })
    .map_err(|e| io::Error::new(ErrorKind::Other, e.to_string()))?;

    info!(
        "Answering offers on http://{}:{}",
        addr.ip(),
        server.server_addr().port()
    );

    server.run();
    Ok(())
}

fn run(socket: UdpSocket, local: SocketAddr, rx: Receiver<Rtc>) {
    let mut peers: Vec<Peer> = vec![];
    let mut buf = vec![0; 2000];

    loop {
        // Clean disconnected peers
        peers.retain(|p| p.is_alive());

        match rx.try_recv() {
            Ok(rtc) => peers.push(Peer::new(rtc)),
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                info!("Web server gone, stopping UDP loop");
                return;
            }
        }

        let mut timeout = Instant::now() + Duration::from_millis(100);
        for peer in peers.iter_mut() {
            timeout = timeout.min(peer.poll_until_timeout(&socket));
        }

        // The read timeout is not allowed to be 0. In case it is 0, we set 1 millisecond.
        let duration = timeout
            .saturating_duration_since(Instant::now())
            .max(Duration::from_millis(1));

        if let Err(e) = socket.set_read_timeout(Some(duration)) {
            warn!("Setting socket read timeout failed: {}", e);
            return;
        }

        match read_socket_input(&socket, local, &mut buf) {
            Ok(Some(input)) => {
                // rtc.accepts() demultiplexes the packet to its Rtc instance.
                if let Some(peer) = peers.iter_mut().find(|p| p.accepts(&input)) {
                    peer.handle_input(input);
                } else {
                    // Common when the first STUN arrives before the Rtc does.
                    debug!("No peer accepts UDP input: {:?}", input);
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!("UdpSocket read failed: {}", e);
                return;
            }
        }

        // Drive time forward in all peers.
        let now = Instant::now();
        for peer in &mut peers {
            peer.handle_input(Input::Timeout(now));
        }
    }
}

fn web_request(request: &Request, addr: SocketAddr, tx: SyncSender<Rtc>) -> Response {
    debug!("{} {}", request.method(), request.url());

    if request.method() != "POST" {
        return Response::text("POST an SDP offer").with_status_code(405);
    }

    let mut body = String::new();
    let Some(mut data) = request.data() else {
        return Response::text("request body unavailable").with_status_code(500);
    };
    if let Err(e) = data.read_to_string(&mut body) {
        return Response::text(format!("reading offer: {e}")).with_status_code(400);
    }

    let offer = match SdpOffer::from_sdp_string(&body) {
        Ok(offer) => offer,
        Err(e) => return Response::text(format!("malformed offer: {e}")).with_status_code(400),
    };

    let mut rtc = Rtc::builder().build();
    match Candidate::host(addr, "udp") {
        Ok(candidate) => {
            rtc.add_local_candidate(candidate);
        }
        Err(e) => return Response::text(format!("host candidate: {e}")).with_status_code(500),
    }

    let answer = match rtc.sdp_api().accept_offer(offer) {
        Ok(answer) => answer,
        Err(e) => return Response::text(format!("offer rejected: {e}")).with_status_code(400),
    };

    if tx.send(rtc).is_err() {
        return Response::text("peer loop stopped").with_status_code(503);
    }

    info!("Answered offer");
    Response::from_data(SDP_CONTENT_TYPE, answer.to_sdp_string())
}

fn read_socket_input<'a>(
    socket: &UdpSocket,
    local: SocketAddr,
    buf: &'a mut Vec<u8>,
) -> io::Result<Option<Input<'a>>> {
    buf.resize(2000, 0);

    match socket.recv_from(buf) {
        Ok((n, source)) => {
            buf.truncate(n);

            // Parse data to a DatagramRecv, which help preparse network data to
            // figure out the multiplexing of all protocols on one UDP port.
            let Ok(contents) = buf.as_slice().try_into() else {
                return Ok(None);
            };

            Ok(Some(Input::Receive(
                Instant::now(),
                Receive {
                    proto: Protocol::Udp,
                    source,
                    destination: local,
                    contents,
                },
            )))
        }

        Err(e) => match e.kind() {
            // Expected error for set_read_timeout(). One for windows, one for the rest.
            ErrorKind::WouldBlock | ErrorKind::TimedOut => Ok(None),
            _ => Err(e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use str0m::change::SdpAnswer;
    use str0m::media::{Direction, MediaKind};

    fn host() -> SocketAddr {
        "192.168.1.10:5000".parse().unwrap()
    }

    fn post(body: &str) -> Request {
        Request::fake_http(
            "POST",
            "/session",
            vec![("Content-Type".to_owned(), SDP_CONTENT_TYPE.to_owned())],
            body.as_bytes().to_vec(),
        )
    }

    #[test]
    fn only_post_is_accepted() {
        let (tx, _rx) = mpsc::sync_channel(1);
        let request = Request::fake_http("GET", "/session", vec![], vec![]);
        assert_eq!(web_request(&request, host(), tx).status_code, 405);
    }

    #[test]
    fn malformed_offer_is_rejected() {
        let (tx, rx) = mpsc::sync_channel(1);
        let response = web_request(&post("hello"), host(), tx);
        assert_eq!(response.status_code, 400);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn offer_is_answered_and_handed_to_the_loop() {
        let mut offerer = Rtc::new();
        let mut change = offerer.sdp_api();
        change.add_media(MediaKind::Audio, Direction::SendRecv, None, None, None);
        change.add_channel("oai-events".to_owned());
        let (offer, _pending) = change.apply().unwrap();

        let (tx, rx) = mpsc::sync_channel(1);
        let response = web_request(&post(&offer.to_sdp_string()), host(), tx);
        assert_eq!(response.status_code, 200);
        assert!(response
            .headers
            .iter()
            .any(|(k, v)| k.eq_ignore_ascii_case("content-type") && v == SDP_CONTENT_TYPE));

        let (mut reader, _) = response.data.into_reader_and_size();
        let mut body = String::new();
        reader.read_to_string(&mut body).unwrap();
        assert!(SdpAnswer::from_sdp_string(&body).is_ok());

        assert!(rx.try_recv().is_ok());
    }
}
