//! Server-reflexive candidate discovery.
//!
//! A STUN Binding request is sent from the media socket itself, so the
//! mapped address the server reports is the one remote peers can reach the
//! socket on. This runs before the socket is handed to the driver task; at
//! that point no other traffic arrives on it.

use std::net::SocketAddr;
use std::time::Duration;

use stun::agent::TransactionId;
use stun::message::{Getter, Message, BINDING_REQUEST, BINDING_SUCCESS};
use stun::xoraddr::XorMappedAddress;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::TransportError;

const DEFAULT_STUN_PORT: u16 = 3478;

/// How long gathering may delay the offer, across all servers.
pub(crate) const GATHER_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum IceServer {
    /// `host:port` of a plain UDP STUN server.
    Stun(String),
    /// A server this backend cannot use (TURN relays, STUN over TLS).
    Unsupported(String),
}

impl IceServer {
    pub(crate) fn parse(url: &str) -> IceServer {
        let Some(rest) = url.strip_prefix("stun:") else {
            return IceServer::Unsupported(url.to_string());
        };
        let target = rest.split('?').next().unwrap_or_default();
        let has_port = target
            .rsplit_once(':')
            .map_or(false, |(_, port)| port.parse::<u16>().is_ok());
        if has_port {
            IceServer::Stun(target.to_string())
        } else {
            IceServer::Stun(format!("{target}:{DEFAULT_STUN_PORT}"))
        }
    }
}

/// Asks every usable server in `urls` for this socket's mapped address.
///
/// Failures are logged and skipped. Returns distinct mapped addresses that
/// differ from the socket's own.
pub(crate) async fn gather(
    socket: &UdpSocket,
    urls: &[String],
    limit: usize,
    timeout: Duration,
) -> Vec<SocketAddr> {
    let Ok(local) = socket.local_addr() else {
        return vec![];
    };
    let deadline = Instant::now() + timeout;
    let mut mapped = vec![];

    for url in urls.iter().take(limit) {
        let target = match IceServer::parse(url) {
            IceServer::Stun(target) => target,
            IceServer::Unsupported(url) => {
                warn!("ICE server {} is not supported, skipping it", url);
                continue;
            }
        };

        match tokio::time::timeout_at(deadline, binding(socket, &target)).await {
            Ok(Ok(addr)) if addr == local => {
                debug!("{} sees the host address, no NAT in between", target);
            }
            Ok(Ok(addr)) => {
                debug!("{} mapped {} to {}", target, local, addr);
                if !mapped.contains(&addr) {
                    mapped.push(addr);
                }
            }
            Ok(Err(e)) => warn!("STUN binding with {} failed: {}", target, e),
            Err(_) => {
                warn!("STUN binding with {} timed out", target);
                break;
            }
        }
    }

    mapped
}

/// One Binding transaction with `target`.
pub(crate) async fn binding(socket: &UdpSocket, target: &str) -> Result<SocketAddr, TransportError> {
    let local = socket.local_addr()?;
    let server = lookup_host(target)
        .await?
        .find(|a| a.is_ipv4() == local.is_ipv4())
        .ok_or_else(|| TransportError::Stun(format!("{target} has no address")))?;

    let mut request = Message::new();
    request
        .build(&[Box::new(TransactionId::new()), Box::new(BINDING_REQUEST)])
        .map_err(|e| TransportError::Stun(e.to_string()))?;
    socket.send_to(&request.raw, server).await?;

    let mut buf = vec![0u8; 1500];
    loop {
        let (n, source) = socket.recv_from(&mut buf).await?;
        if source != server {
            continue;
        }

        let mut response = Message::new();
        if response.unmarshal_binary(&buf[..n]).is_err()
            || response.transaction_id != request.transaction_id
        {
            continue;
        }
        if response.typ != BINDING_SUCCESS {
            return Err(TransportError::Stun(format!(
                "{target} answered {}",
                response.typ
            )));
        }

        let mut xor_addr = XorMappedAddress::default();
        xor_addr
            .get_from(&response)
            .map_err(|e| TransportError::Stun(e.to_string()))?;
        return Ok(SocketAddr::new(xor_addr.ip, xor_addr.port));
    }
}

/// Answers Binding requests on `socket` as a STUN server would, reporting
/// `mapped` as the client's address.
#[cfg(test)]
pub(crate) async fn fake_stun_server(socket: UdpSocket, mapped: SocketAddr) -> std::io::Result<()> {
    let mut buf = vec![0u8; 1500];
    loop {
        let (n, source) = socket.recv_from(&mut buf).await?;
        let mut request = Message::new();
        if request.unmarshal_binary(&buf[..n]).is_err() {
            continue;
        }
        let mut response = Message::new();
        response
            .build(&[
                Box::new(request.transaction_id),
                Box::new(BINDING_SUCCESS),
                Box::new(XorMappedAddress {
                    ip: mapped.ip(),
                    port: mapped.port(),
                }),
            ])
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        socket.send_to(&response.raw, source).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn loopback_socket() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    #[test]
    fn parses_server_urls() {
        assert_eq!(
            IceServer::parse("stun:stun.l.google.com:19302"),
            IceServer::Stun("stun.l.google.com:19302".into())
        );
        assert_eq!(
            IceServer::parse("stun:example.org"),
            IceServer::Stun("example.org:3478".into())
        );
        assert_eq!(
            IceServer::parse("stun:example.org:3479?transport=udp"),
            IceServer::Stun("example.org:3479".into())
        );
        assert!(matches!(
            IceServer::parse("turn:relay.example.org"),
            IceServer::Unsupported(_)
        ));
        assert!(matches!(
            IceServer::parse("stuns:example.org"),
            IceServer::Unsupported(_)
        ));
    }

    #[tokio::test]
    async fn binding_reports_the_mapped_address() {
        let server = loopback_socket().await;
        let server_addr = server.local_addr().unwrap();
        let mapped: SocketAddr = "203.0.113.7:40000".parse().unwrap();
        tokio::spawn(fake_stun_server(server, mapped));

        let client = loopback_socket().await;
        let addr = binding(&client, &server_addr.to_string()).await.unwrap();
        assert_eq!(addr, mapped);
    }

    #[tokio::test]
    async fn gather_skips_silent_and_unsupported_servers() {
        let server = loopback_socket().await;
        let server_addr = server.local_addr().unwrap();
        let mapped: SocketAddr = "203.0.113.7:40000".parse().unwrap();
        tokio::spawn(fake_stun_server(server, mapped));

        let client = loopback_socket().await;
        let urls = vec![
            "turn:relay.example.org".to_string(),
            format!("stun:{server_addr}"),
            format!("stun:{server_addr}"),
        ];
        let found = gather(&client, &urls, 10, Duration::from_secs(2)).await;
        assert_eq!(found, vec![mapped]);

        // A server that never answers only costs the timeout.
        let silent = loopback_socket().await;
        let urls = vec![format!("stun:{}", silent.local_addr().unwrap())];
        let found = gather(&client, &urls, 10, Duration::from_millis(100)).await;
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn gather_respects_the_pool_limit() {
        let server = loopback_socket().await;
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(fake_stun_server(server, "203.0.113.7:40000".parse().unwrap()));

        let client = loopback_socket().await;
        let urls = vec![format!("stun:{server_addr}")];
        assert!(gather(&client, &urls, 0, Duration::from_secs(2)).await.is_empty());
    }
}
