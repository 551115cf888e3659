//! Dial/relay multiplexer: turns one control channel into many duplex
//! connections, each backed by a pair of sub-channels keyed by its dial id.

use super::error::TransportError;
use crate::channel::{Channel, ChannelError, Responder, SubSink, SubSource};
use crate::relay::protocol::{parse_ack, DialId, StreamId, Value, EVENT_DIAL};
use futures::Stream;
use libp2p::Multiaddr;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::debug;

/// Which side started the dial
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Metadata of one relayed connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub dial_id: DialId,
    pub direction: Direction,
    pub local_addr: Multiaddr,
    pub remote_addr: Multiaddr,
}

/// Live dial, tracked by its listener until the connection is dropped
#[derive(Debug, Clone)]
pub struct DialSession {
    pub info: ConnectionInfo,
    /// Sub-channel this side writes to
    pub sink: StreamId,
    /// Sub-channel this side reads from
    pub source: StreamId,
}

impl DialSession {
    fn new(info: ConnectionInfo) -> Self {
        let (sink, source) = match info.direction {
            Direction::Outbound => (StreamId::dialer(info.dial_id), StreamId::listener(info.dial_id)),
            Direction::Inbound => (StreamId::listener(info.dial_id), StreamId::dialer(info.dial_id)),
        };
        Self { info, sink, source }
    }
}

/// Dial sessions of one listener, by dial id
#[derive(Clone, Default)]
pub struct SessionTable {
    sessions: Arc<Mutex<HashMap<DialId, DialSession>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, session: DialSession) -> SessionGuard {
        let id = session.info.dial_id;
        self.sessions.lock().insert(id, session);
        SessionGuard {
            table: self.clone(),
            id,
        }
    }

    pub fn get(&self, id: &DialId) -> Option<DialSession> {
        self.sessions.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &DialId) -> bool {
        self.sessions.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Forget every session; used when the control channel goes away
    pub fn clear(&self) {
        let mut sessions = self.sessions.lock();
        if !sessions.is_empty() {
            debug!("Dropping {} dial sessions", sessions.len());
        }
        sessions.clear();
    }
}

/// Removes its session from the table when the last connection half drops
struct SessionGuard {
    table: SessionTable,
    id: DialId,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.table.sessions.lock().remove(&self.id);
    }
}

/// Writing half of a relayed connection
pub struct ConnSink {
    sink: SubSink,
    _session: Arc<SessionGuard>,
}

impl ConnSink {
    /// Write one chunk; chunks reach the remote in order
    pub fn send(&mut self, payload: impl Into<Vec<u8>>) -> Result<(), ChannelError> {
        self.sink.send(payload.into())
    }

    /// End the outbound direction
    pub fn close(&mut self) {
        self.sink.end();
    }
}

/// Reading half of a relayed connection
pub struct ConnSource {
    source: SubSource,
    _session: Arc<SessionGuard>,
}

impl ConnSource {
    /// Next chunk from the remote, `None` once it ends or the channel drops
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.source.recv().await
    }
}

impl Stream for ConnSource {
    type Item = Vec<u8>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.source).poll_next(cx)
    }
}

/// Duplex byte connection relayed through the signaling server
pub struct Connection {
    info: ConnectionInfo,
    sink: ConnSink,
    source: ConnSource,
}

impl Connection {
    fn new(info: ConnectionInfo, sink: SubSink, source: SubSource, session: SessionGuard) -> Self {
        let session = Arc::new(session);
        Self {
            info,
            sink: ConnSink {
                sink,
                _session: Arc::clone(&session),
            },
            source: ConnSource {
                source,
                _session: session,
            },
        }
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn dial_id(&self) -> DialId {
        self.info.dial_id
    }

    /// Addresses observed for the remote end
    pub fn observed_addrs(&self) -> Vec<Multiaddr> {
        vec![self.info.remote_addr.clone()]
    }

    pub fn send(&mut self, payload: impl Into<Vec<u8>>) -> Result<(), ChannelError> {
        self.sink.send(payload)
    }

    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.source.recv().await
    }

    /// End the outbound direction; inbound data can still be read
    pub fn close(&mut self) {
        self.sink.close();
    }

    pub fn split(self) -> (ConnSink, ConnSource) {
        (self.sink, self.source)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("info", &self.info).finish()
    }
}

/// Dial `target` through `channel`.
///
/// Both sub-channels are opened before the relay request goes out so no
/// early byte from the remote can be lost. If the dial fails they are
/// released together without signalling the remote.
pub async fn dial_outbound(
    channel: &Channel,
    sessions: &SessionTable,
    local: &Multiaddr,
    target: &Multiaddr,
) -> Result<Connection, TransportError> {
    let dial = DialId::generate();
    let session = DialSession::new(ConnectionInfo {
        dial_id: dial,
        direction: Direction::Outbound,
        local_addr: local.clone(),
        remote_addr: target.clone(),
    });
    let sink = channel.open_sink(session.sink);
    let source = channel.open_source(session.source);
    let guard = sessions.insert(session.clone());

    debug!("Dialing {} as {}", target, dial);
    let args = vec![
        Value::Str(local.to_string()),
        Value::Str(target.to_string()),
        Value::Str(dial.to_string()),
    ];

    let outcome = match channel.call(EVENT_DIAL, args).await {
        Ok(reply) => match parse_ack(reply) {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(reason)) => Err(TransportError::DialRejected(reason)),
            Err(e) => Err(TransportError::DialRejected(e.to_string())),
        },
        Err(_) if !sessions.contains(&dial) => Err(TransportError::Closed),
        Err(e) => Err(e.into()),
    };

    // A close that raced the acknowledgement wins
    let outcome = outcome.and_then(|()| {
        if sessions.contains(&dial) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    });

    match outcome {
        Ok(()) => {
            debug!("Dial {} established", dial);
            Ok(Connection::new(session.info, sink, source, guard))
        }
        Err(e) => {
            debug!("Dial {} failed: {}", dial, e);
            sink.discard();
            drop(source);
            drop(guard);
            Err(e)
        }
    }
}

/// Accept a relayed dial. The relay is acknowledged first, before any
/// sub-channel is opened or the caller sees the connection.
pub fn accept_inbound(
    channel: &Channel,
    sessions: &SessionTable,
    dial: DialId,
    remote: Multiaddr,
    local: Multiaddr,
    responder: Responder,
) -> Result<Connection, TransportError> {
    if sessions.contains(&dial) {
        responder.reject("duplicate dial id");
        return Err(TransportError::DialRejected(format!("duplicate dial id {}", dial)));
    }
    responder.accept();

    let session = DialSession::new(ConnectionInfo {
        dial_id: dial,
        direction: Direction::Inbound,
        local_addr: local,
        remote_addr: remote,
    });
    let source = channel.open_source(session.source);
    let sink = channel.open_sink(session.sink);
    let info = session.info.clone();
    let guard = sessions.insert(session);

    debug!("Accepted dial {} from {}", dial, info.remote_addr);
    Ok(Connection::new(info, sink, source, guard))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::protocol::{ack_err, ack_ok, Frame};
    use std::collections::HashSet;
    use tokio::sync::mpsc;

    const LOCAL: &str = "/ip4/127.0.0.1/tcp/9090/ws/p2p-websocket-star";
    const REMOTE: &str = "/ip4/10.0.0.2/tcp/9090/ws/p2p-websocket-star";

    fn attached() -> (Channel, mpsc::UnboundedReceiver<Frame>) {
        let (channel, _events) = Channel::new();
        let (tx, rx) = mpsc::unbounded_channel();
        channel.attach(tx);
        (channel, rx)
    }

    fn addr(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    async fn next_dial(wire: &mut mpsc::UnboundedReceiver<Frame>) -> (u64, DialId) {
        match wire.recv().await.unwrap() {
            Frame::Event {
                name,
                args,
                ack: Some(id),
            } => {
                assert_eq!(name, EVENT_DIAL);
                let dial = DialId::parse(args[2].as_str().unwrap()).unwrap();
                (id, dial)
            }
            other => panic!("expected dial request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_outbound_dial_success() {
        let (channel, mut wire) = attached();
        let sessions = SessionTable::new();

        let dialer = {
            let (channel, sessions) = (channel.clone(), sessions.clone());
            tokio::spawn(async move {
                dial_outbound(&channel, &sessions, &addr(LOCAL), &addr(REMOTE)).await
            })
        };

        let (id, dial) = next_dial(&mut wire).await;
        // Both halves exist before the acknowledgement arrives
        assert_eq!(channel.open_sources(), 1);
        assert!(sessions.contains(&dial));

        // Early data from the remote is not lost
        channel.handle_frame(Frame::Data {
            stream: StreamId::listener(dial),
            payload: b"early".to_vec(),
        });
        channel.handle_frame(Frame::Ack { id, args: ack_ok(vec![]) });

        let mut conn = dialer.await.unwrap().unwrap();
        assert_eq!(conn.dial_id(), dial);
        assert_eq!(conn.observed_addrs(), vec![addr(REMOTE)]);
        assert_eq!(conn.recv().await, Some(b"early".to_vec()));

        conn.send(b"hello".to_vec()).unwrap();
        assert_eq!(
            wire.recv().await.unwrap(),
            Frame::Data {
                stream: StreamId::dialer(dial),
                payload: b"hello".to_vec()
            }
        );

        drop(conn);
        assert!(sessions.is_empty());
        assert_eq!(channel.open_sources(), 0);
    }

    #[tokio::test]
    async fn test_rejected_dial_releases_both_halves() {
        let (channel, mut wire) = attached();
        let sessions = SessionTable::new();

        let dialer = {
            let (channel, sessions) = (channel.clone(), sessions.clone());
            tokio::spawn(async move {
                dial_outbound(&channel, &sessions, &addr(LOCAL), &addr(REMOTE)).await
            })
        };

        let (id, _) = next_dial(&mut wire).await;
        channel.handle_frame(Frame::Ack {
            id,
            args: ack_err("peer not found"),
        });

        let err = dialer.await.unwrap().unwrap_err();
        assert_eq!(err, TransportError::DialRejected("peer not found".to_string()));
        assert!(sessions.is_empty());
        assert_eq!(channel.open_sources(), 0);

        // The discarded sink never told the remote anything
        channel.emit("marker", vec![]).unwrap();
        match wire.recv().await.unwrap() {
            Frame::Event { name, .. } => assert_eq!(name, "marker"),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_unanswered_dial_stays_pending() {
        let (channel, mut wire) = attached();
        let sessions = SessionTable::new();
        let (local, remote) = (addr(LOCAL), addr(REMOTE));

        let mut dial = tokio_test::task::spawn(dial_outbound(&channel, &sessions, &local, &remote));
        tokio_test::assert_pending!(dial.poll());
        tokio_test::assert_pending!(dial.poll());
        assert!(matches!(wire.try_recv(), Ok(Frame::Event { .. })));
        assert_eq!(sessions.len(), 1);

        // Abandoning the dial releases its session
        drop(dial);
        assert!(sessions.is_empty());
        assert_eq!(channel.open_sources(), 0);
    }

    #[tokio::test]
    async fn test_close_during_dial_wins() {
        let (channel, mut wire) = attached();
        let sessions = SessionTable::new();

        let dialer = {
            let (channel, sessions) = (channel.clone(), sessions.clone());
            tokio::spawn(async move {
                dial_outbound(&channel, &sessions, &addr(LOCAL), &addr(REMOTE)).await
            })
        };

        let _ = next_dial(&mut wire).await;
        sessions.clear();
        channel.disconnect();

        assert_eq!(dialer.await.unwrap().unwrap_err(), TransportError::Closed);
        assert_eq!(channel.open_sources(), 0);
    }

    #[tokio::test]
    async fn test_inbound_acks_before_opening() {
        let (channel, mut wire) = attached();
        let sessions = SessionTable::new();
        let dial = DialId::generate();

        // Capture the responder the way the request layer would hand it over
        let slot = Arc::new(Mutex::new(None));
        let protocol = Arc::new(crate::transport::rpc::Protocol::new());
        {
            let slot = Arc::clone(&slot);
            protocol.add_request("probe", &[crate::transport::rpc::ArgKind::Callback], move |_, r| {
                *slot.lock() = r;
            });
        }
        protocol.handle_socket(&channel);
        channel.handle_frame(Frame::Event {
            name: "probe".to_string(),
            args: vec![],
            ack: Some(11),
        });
        let responder = slot.lock().take().unwrap();

        let mut conn =
            accept_inbound(&channel, &sessions, dial, addr(REMOTE), addr(LOCAL), responder).unwrap();

        match wire.recv().await.unwrap() {
            Frame::Ack { id, args } => {
                assert_eq!(id, 11);
                assert_eq!(parse_ack(args).unwrap(), Ok(vec![]));
            }
            other => panic!("expected ack first, got {:?}", other),
        }

        channel.handle_frame(Frame::Data {
            stream: StreamId::dialer(dial),
            payload: b"ping".to_vec(),
        });
        assert_eq!(conn.recv().await, Some(b"ping".to_vec()));

        conn.send(b"pong".to_vec()).unwrap();
        assert_eq!(
            wire.recv().await.unwrap(),
            Frame::Data {
                stream: StreamId::listener(dial),
                payload: b"pong".to_vec()
            }
        );
        assert_eq!(conn.info().direction, Direction::Inbound);
    }

    #[tokio::test]
    async fn test_split_halves_keep_session_alive() {
        let (channel, mut wire) = attached();
        let sessions = SessionTable::new();

        let dialer = {
            let (channel, sessions) = (channel.clone(), sessions.clone());
            tokio::spawn(async move {
                dial_outbound(&channel, &sessions, &addr(LOCAL), &addr(REMOTE)).await
            })
        };
        let (id, dial) = next_dial(&mut wire).await;
        channel.handle_frame(Frame::Ack { id, args: ack_ok(vec![]) });

        let (sink, source) = dialer.await.unwrap().unwrap().split();
        drop(sink);
        assert!(sessions.contains(&dial));
        drop(source);
        assert!(sessions.is_empty());
    }

    #[test]
    fn test_dial_ids_are_unique() {
        let ids: HashSet<DialId> = (0..10_000).map(|_| DialId::generate()).collect();
        assert_eq!(ids.len(), 10_000);
    }
}
