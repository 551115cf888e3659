//! Rendezvous address handling
//!
//! A rendezvous address is a signaling server address followed by the
//! `/p2p-websocket-star` marker and, optionally, the announcing peer's id:
//!
//! `/ip4/127.0.0.1/tcp/9090/ws/p2p-websocket-star/p2p/12D3KooW...`

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AddrError {
    #[error("Not a rendezvous address: {0}")]
    NotRendezvous(String),
    #[error("Unsupported server address: {0}")]
    UnsupportedServer(String),
}

/// Whether `addr` matches the rendezvous scheme:
/// `(ip4|ip6|dns|dns4|dns6)/tcp/(ws|wss)/p2p-websocket-star[/p2p/<id>]`
pub fn is_rendezvous(addr: &Multiaddr) -> bool {
    let mut iter = addr.iter();

    match iter.next() {
        Some(Protocol::Ip4(_))
        | Some(Protocol::Ip6(_))
        | Some(Protocol::Dns(_))
        | Some(Protocol::Dns4(_))
        | Some(Protocol::Dns6(_)) => {}
        _ => return false,
    }
    if !matches!(iter.next(), Some(Protocol::Tcp(_))) {
        return false;
    }
    if !matches!(iter.next(), Some(Protocol::Ws(_)) | Some(Protocol::Wss(_))) {
        return false;
    }
    if !matches!(iter.next(), Some(Protocol::P2pWebSocketStar)) {
        return false;
    }
    match iter.next() {
        None => true,
        Some(Protocol::P2p(_)) => iter.next().is_none(),
        Some(_) => false,
    }
}

/// Keep only rendezvous addresses, preserving order
pub fn filter(addrs: &[Multiaddr]) -> Vec<Multiaddr> {
    addrs.iter().filter(|a| is_rendezvous(a)).cloned().collect()
}

/// The signaling server part of a rendezvous address (everything before the marker)
pub fn server_addr(addr: &Multiaddr) -> Result<Multiaddr, AddrError> {
    if !is_rendezvous(addr) {
        return Err(AddrError::NotRendezvous(addr.to_string()));
    }
    Ok(addr
        .iter()
        .take_while(|p| !matches!(p, Protocol::P2pWebSocketStar))
        .collect())
}

/// Normalized registry key for the server a rendezvous address points at
pub fn server_key(addr: &Multiaddr) -> Result<String, AddrError> {
    server_addr(addr).map(|a| a.to_string())
}

/// WebSocket URL of the signaling server, e.g. `ws://127.0.0.1:9090`
pub fn server_url(addr: &Multiaddr) -> Result<String, AddrError> {
    let server = server_addr(addr)?;
    let mut host = None;
    let mut port = None;
    let mut scheme = None;

    for proto in server.iter() {
        match proto {
            Protocol::Ip4(ip) => host = Some(ip.to_string()),
            Protocol::Ip6(ip) => host = Some(format!("[{}]", ip)),
            Protocol::Dns(name) | Protocol::Dns4(name) | Protocol::Dns6(name) => {
                host = Some(name.to_string())
            }
            Protocol::Tcp(p) => port = Some(p),
            Protocol::Ws(_) => scheme = Some("ws"),
            Protocol::Wss(_) => scheme = Some("wss"),
            _ => return Err(AddrError::UnsupportedServer(server.to_string())),
        }
    }

    match (scheme, host, port) {
        (Some(scheme), Some(host), Some(port)) => Ok(format!("{}://{}:{}", scheme, host, port)),
        _ => Err(AddrError::UnsupportedServer(server.to_string())),
    }
}

/// Peer id carried in the trailing `/p2p/` segment, if any
pub fn peer_id_of(addr: &Multiaddr) -> Option<PeerId> {
    match addr.iter().last() {
        Some(Protocol::P2p(peer_id)) => Some(peer_id),
        _ => None,
    }
}

/// Append `/p2p/<peer_id>` unless the address already carries a peer id
pub fn with_peer_id(addr: &Multiaddr, peer_id: PeerId) -> Multiaddr {
    if peer_id_of(addr).is_some() {
        addr.clone()
    } else {
        addr.clone().with(Protocol::P2p(peer_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKeys;

    fn peer() -> PeerId {
        IdentityKeys::generate().peer_id().unwrap()
    }

    #[test]
    fn test_rendezvous_scheme_matching() {
        let id = peer();
        let ok: Vec<Multiaddr> = vec![
            "/ip4/127.0.0.1/tcp/9090/ws/p2p-websocket-star".parse().unwrap(),
            format!("/ip4/127.0.0.1/tcp/9090/ws/p2p-websocket-star/p2p/{}", id)
                .parse()
                .unwrap(),
            "/dns4/signal.example.com/tcp/443/wss/p2p-websocket-star".parse().unwrap(),
            "/ip6/::1/tcp/9090/ws/p2p-websocket-star".parse().unwrap(),
        ];
        for addr in &ok {
            assert!(is_rendezvous(addr), "{} should match", addr);
        }

        let bad: Vec<Multiaddr> = vec![
            "/ip4/127.0.0.1/tcp/9090/ws".parse().unwrap(),
            "/ip4/127.0.0.1/tcp/9090".parse().unwrap(),
            "/ip4/127.0.0.1/udp/9090/quic-v1".parse().unwrap(),
            "/ip4/127.0.0.1/tcp/9090/p2p-websocket-star".parse().unwrap(),
            format!("/ip4/127.0.0.1/tcp/9090/ws/p2p/{}", id).parse().unwrap(),
        ];
        for addr in &bad {
            assert!(!is_rendezvous(addr), "{} should not match", addr);
        }
    }

    #[test]
    fn test_server_url() {
        let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/9090/ws/p2p-websocket-star/p2p/{}", peer())
            .parse()
            .unwrap();
        assert_eq!(server_url(&addr).unwrap(), "ws://127.0.0.1:9090");

        let addr: Multiaddr = "/dns4/signal.example.com/tcp/443/wss/p2p-websocket-star"
            .parse()
            .unwrap();
        assert_eq!(server_url(&addr).unwrap(), "wss://signal.example.com:443");

        let addr: Multiaddr = "/ip6/::1/tcp/9090/ws/p2p-websocket-star".parse().unwrap();
        assert_eq!(server_url(&addr).unwrap(), "ws://[::1]:9090");
    }

    #[test]
    fn test_server_key_ignores_peer_id() {
        let a: Multiaddr = format!("/ip4/127.0.0.1/tcp/9090/ws/p2p-websocket-star/p2p/{}", peer())
            .parse()
            .unwrap();
        let b: Multiaddr = format!("/ip4/127.0.0.1/tcp/9090/ws/p2p-websocket-star/p2p/{}", peer())
            .parse()
            .unwrap();
        assert_eq!(server_key(&a).unwrap(), server_key(&b).unwrap());
        assert_eq!(server_key(&a).unwrap(), "/ip4/127.0.0.1/tcp/9090/ws");
    }

    #[test]
    fn test_server_addr_rejects_foreign_address() {
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
        assert!(matches!(server_addr(&addr), Err(AddrError::NotRendezvous(_))));
    }

    #[test]
    fn test_peer_id_extraction() {
        let id = peer();
        let with: Multiaddr = format!("/ip4/127.0.0.1/tcp/9090/ws/p2p-websocket-star/p2p/{}", id)
            .parse()
            .unwrap();
        let without: Multiaddr = "/ip4/127.0.0.1/tcp/9090/ws/p2p-websocket-star".parse().unwrap();

        assert_eq!(peer_id_of(&with), Some(id));
        assert_eq!(peer_id_of(&without), None);
        assert_eq!(with_peer_id(&without, id), with);
        assert_eq!(with_peer_id(&with, peer()), with);
    }
}
