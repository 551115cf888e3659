//! Peer discovery: republishes the server's peer announcements as
//! [`PeerInfo`] records.
//!
//! Nothing is polled: records come only from relayed `ws-peer`
//! broadcasts, so `start`/`stop` just acknowledge.

use super::addr;
use libp2p::{Multiaddr, PeerId};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// A discovered peer and the addresses it was announced at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

/// Discovery emitter shared by every listener of one transport
#[derive(Debug, Clone)]
pub struct Discovery {
    tx: broadcast::Sender<PeerInfo>,
}

impl Discovery {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub async fn start(&self) -> Result<(), super::TransportError> {
        tokio::task::yield_now().await;
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), super::TransportError> {
        tokio::task::yield_now().await;
        Ok(())
    }

    /// Receive every record published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<PeerInfo> {
        self.tx.subscribe()
    }

    /// Translate one announcement. Announcements without a trailing peer id
    /// are dropped.
    pub fn peer_discovered(&self, announced: &Multiaddr) -> Option<PeerInfo> {
        let Some(peer_id) = addr::peer_id_of(announced) else {
            warn!("Dropping announcement without peer id: {}", announced);
            return None;
        };

        let info = PeerInfo {
            peer_id,
            addrs: vec![announced.clone()],
        };
        debug!("Discovered {} at {}", peer_id, announced);
        // No subscribers is fine
        let _ = self.tx.send(info.clone());
        Some(info)
    }
}

impl Default for Discovery {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKeys;

    #[tokio::test]
    async fn test_announcement_becomes_peer_info() {
        let discovery = Discovery::default();
        let mut rx = discovery.subscribe();
        discovery.start().await.unwrap();

        let peer_id = IdentityKeys::generate().peer_id().unwrap();
        let announced: Multiaddr = format!("/ip4/127.0.0.1/tcp/9090/ws/p2p-websocket-star/p2p/{}", peer_id)
            .parse()
            .unwrap();
        discovery.peer_discovered(&announced);

        let info = rx.recv().await.unwrap();
        assert_eq!(info.peer_id, peer_id);
        assert_eq!(info.addrs, vec![announced]);
        discovery.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_announcement_without_peer_id_is_dropped() {
        let discovery = Discovery::default();
        let mut rx = discovery.subscribe();

        let announced: Multiaddr = "/ip4/127.0.0.1/tcp/9090/ws/p2p-websocket-star".parse().unwrap();
        assert!(discovery.peer_discovered(&announced).is_none());
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
