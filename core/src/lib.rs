// wsstar core: rendezvous transport over a signaling server
//
// Peers that cannot reach each other directly hold one control channel to a
// shared server. Dials and their byte streams are relayed through it.

pub mod channel;
pub mod config;
pub mod identity;
pub mod relay;
pub mod transport;

pub use channel::{Channel, ChannelError, ChannelEvent, Connector, MemoryConnector, WsConnector};
pub use config::TransportConfig;
pub use identity::IdentityKeys;
pub use relay::server::{self, SignalServer, SignalServerConfig};
pub use transport::{
    Connection, ConnectionInfo, Direction, Discovery, Listener, ListenerEvent, ListenerState,
    PeerInfo, TransportError, WebSocketStar,
};

/// Install the default `tracing` subscriber, filtered by `RUST_LOG` and
/// falling back to `info`. Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
    }
}
