// Integration test: full WebSocket path
//
// A real signaling server on 127.0.0.1:0 and two transports that reach it
// through tokio-tungstenite.

use libp2p::Multiaddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use wsstar_core::server::ws;
use wsstar_core::transport::addr;
use wsstar_core::{
    IdentityKeys, ListenerEvent, SignalServer, SignalServerConfig, TransportConfig, WebSocketStar,
};

const WAIT: Duration = Duration::from_secs(10);

fn rendezvous_addr(port: u16, keys: &IdentityKeys) -> Multiaddr {
    let base: Multiaddr = format!("/ip4/127.0.0.1/tcp/{}/ws/p2p-websocket-star", port)
        .parse()
        .unwrap();
    addr::with_peer_id(&base, keys.peer_id().unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_echo_over_websocket() {
    tracing_subscriber::fmt().with_env_filter("debug").try_init().ok();

    let server = Arc::new(SignalServer::with_config(SignalServerConfig {
        require_proof: true,
        ..Default::default()
    }));
    let (local, _handle) = ws::spawn_server("127.0.0.1:0", Arc::clone(&server)).await.unwrap();

    let alice_keys = IdentityKeys::generate();
    let bob_keys = IdentityKeys::generate();
    let alice_addr = rendezvous_addr(local.port(), &alice_keys);
    let bob_addr = rendezvous_addr(local.port(), &bob_keys);

    let alice = WebSocketStar::new(TransportConfig::default()).with_identity(alice_keys);
    let bob = WebSocketStar::new(TransportConfig::default()).with_identity(bob_keys);

    let l1 = alice.create_listener(|_| {});
    timeout(WAIT, l1.listen(alice_addr.clone())).await.unwrap().unwrap();

    let l2 = bob.create_listener(|mut conn| {
        tokio::spawn(async move {
            while let Some(payload) = conn.recv().await {
                if conn.send(payload).is_err() {
                    break;
                }
            }
        });
    });
    let mut bob_events = l2.subscribe();
    timeout(WAIT, l2.listen(bob_addr.clone())).await.unwrap().unwrap();
    assert_eq!(bob_events.recv().await.unwrap(), ListenerEvent::Listening);

    let mut conn = timeout(WAIT, alice.dial(&bob_addr)).await.unwrap().unwrap();
    for message in [&b"first"[..], &b"second"[..]] {
        conn.send(message.to_vec()).unwrap();
        let echoed = timeout(WAIT, conn.recv()).await.unwrap().unwrap();
        assert_eq!(echoed, message);
    }

    assert_eq!(server.get_stats().dials_relayed, 1);
    assert_eq!(server.get_stats().peers_joined, 2);

    l1.close().await;
    l2.close().await;
    timeout(WAIT, async {
        while server.get_stats().connections_active > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_listen_on_unreachable_server() {
    let transport = WebSocketStar::new(TransportConfig::default());
    let listener = transport.create_listener(|_| {});
    let mut events = listener.subscribe();

    // Nothing listens on port 9 (discard)
    let unreachable: Multiaddr = "/ip4/127.0.0.1/tcp/9/ws/p2p-websocket-star".parse().unwrap();
    assert!(listener.listen(unreachable).await.is_err());
    assert!(matches!(events.recv().await.unwrap(), ListenerEvent::Error(_)));
    assert_eq!(events.recv().await.unwrap(), ListenerEvent::Close);
}
