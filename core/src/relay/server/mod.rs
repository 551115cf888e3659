//! Signaling server: the rendezvous hub peers join, discover each other
//! through, and relay dial streams across.
//!
//! The hub is transport-agnostic: a front end (see [`ws`]) registers each
//! accepted connection with [`SignalServer::connect`], feeds it decoded
//! frames, and reports its loss with [`SignalServer::disconnect`].

pub mod ws;

use super::protocol::{
    ack_err, ack_ok, parse_ack, DialId, Frame, JoinCredential, JoinProof, StreamId, StreamRole,
    Value, EVENT_DIAL, EVENT_INCOMING, EVENT_JOIN, EVENT_PEER,
};
use crate::identity::{peer_id_from_public_key, IdentityKeys};
use crate::transport::addr;
use libp2p::Multiaddr;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Identifier of one accepted connection
pub type ConnId = u64;

/// Signaling server configuration
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SignalServerConfig {
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Require a signed challenge before an address may join
    pub require_proof: bool,
    /// Outstanding challenges kept per address; the oldest is evicted first
    pub max_challenges: usize,
}

impl Default for SignalServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            require_proof: false,
            max_challenges: 4,
        }
    }
}

/// Statistics about signaling server operations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalServerStats {
    /// Number of active connections
    pub connections_active: usize,
    /// Addresses currently joined
    pub peers_joined: usize,
    /// Dials the hub has completed between two peers
    pub dials_relayed: u64,
    /// Total sub-channel payload bytes relayed
    pub bytes_relayed: u64,
}

/// Signaling server error types
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignalServerError {
    #[error("Connection limit exceeded")]
    ConnectionLimitExceeded,
    #[error("Unknown connection {0}")]
    UnknownConnection(ConnId),
}

/// An `ss-incoming` sent to a dial target, awaiting its acknowledgement
#[derive(Debug, Clone, Copy)]
struct PendingIncoming {
    dial: DialId,
    dialer: ConnId,
    dialer_ack: u64,
}

/// A challenge handed out for an address and the connection it went to
#[derive(Debug)]
struct IssuedChallenge {
    challenge: String,
    conn: ConnId,
}

/// An established relay between two connections
#[derive(Debug)]
struct Route {
    dialer: ConnId,
    listener: ConnId,
    dialer_ended: bool,
    listener_ended: bool,
}

impl Route {
    /// Connection a frame on `role` must come from, and the one it goes to
    fn direction(&self, role: StreamRole) -> (ConnId, ConnId) {
        match role {
            StreamRole::Dialer => (self.dialer, self.listener),
            StreamRole::Listener => (self.listener, self.dialer),
        }
    }
}

struct ServerConn {
    outbound: mpsc::UnboundedSender<Frame>,
    joined: Vec<Multiaddr>,
    /// `ss-incoming` acknowledgements owed by this connection
    incoming: HashMap<u64, PendingIncoming>,
}

impl ServerConn {
    fn send(&self, frame: Frame) {
        let _ = self.outbound.send(frame);
    }
}

#[derive(Default)]
struct HubState {
    conns: HashMap<ConnId, ServerConn>,
    /// The room: joined address -> owning connection
    room: HashMap<Multiaddr, ConnId>,
    /// Challenges issued per address and not yet answered, oldest first
    challenges: HashMap<Multiaddr, VecDeque<IssuedChallenge>>,
    /// Latest accepted proof per address, recognised again on reconnect
    proofs: HashMap<Multiaddr, String>,
    routes: HashMap<DialId, Route>,
    /// Pending dials whose dialer ended its stream before the target acked
    ended_early: HashSet<DialId>,
}

enum JoinDecision {
    Accept,
    Challenge(String),
    Reject(String),
}

/// The signaling hub
pub struct SignalServer {
    config: SignalServerConfig,
    next_conn: AtomicU64,
    next_ack: AtomicU64,
    state: Mutex<HubState>,
    stats: RwLock<SignalServerStats>,
}

impl SignalServer {
    /// Create a new signaling server with default configuration
    pub fn new() -> Self {
        Self::with_config(SignalServerConfig::default())
    }

    /// Create a new signaling server with custom configuration
    pub fn with_config(config: SignalServerConfig) -> Self {
        Self {
            config,
            next_conn: AtomicU64::new(1),
            next_ack: AtomicU64::new(1),
            state: Mutex::new(HubState::default()),
            stats: RwLock::new(SignalServerStats::default()),
        }
    }

    pub fn config(&self) -> &SignalServerConfig {
        &self.config
    }

    /// Register a new connection; frames for it are pushed into `outbound`
    pub fn connect(&self, outbound: mpsc::UnboundedSender<Frame>) -> Result<ConnId, SignalServerError> {
        let mut state = self.state.lock();

        if state.conns.len() >= self.config.max_connections {
            warn!("Refusing connection: limit of {} reached", self.config.max_connections);
            return Err(SignalServerError::ConnectionLimitExceeded);
        }

        let id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        state.conns.insert(
            id,
            ServerConn {
                outbound,
                joined: Vec::new(),
                incoming: HashMap::new(),
            },
        );
        self.stats.write().connections_active = state.conns.len();
        debug!("Connection {} registered", id);
        Ok(id)
    }

    /// Drop a connection: its addresses leave the room and its relays end
    pub fn disconnect(&self, conn: ConnId) {
        let mut state = self.state.lock();
        let Some(gone) = state.conns.remove(&conn) else {
            return;
        };

        for joined in &gone.joined {
            if state.room.get(joined) == Some(&conn) {
                state.room.remove(joined);
                info!("{} left the room", joined);
            }
        }

        // Challenges issued to it can no longer be answered
        state.challenges.retain(|_, issued| {
            issued.retain(|c| c.conn != conn);
            !issued.is_empty()
        });

        // Dials this connection was asked to accept fail for their dialers
        for pending in gone.incoming.values() {
            state.ended_early.remove(&pending.dial);
            if let Some(dialer) = state.conns.get(&pending.dialer) {
                dialer.send(Frame::Ack {
                    id: pending.dialer_ack,
                    args: ack_err("peer disconnected"),
                });
            }
        }

        let broken: Vec<DialId> = state
            .routes
            .iter()
            .filter(|(_, r)| r.dialer == conn || r.listener == conn)
            .map(|(id, _)| *id)
            .collect();
        for dial in broken {
            if let Some(route) = state.routes.remove(&dial) {
                // The survivor sees the stream the gone side was writing end
                let (survivor, role) = if route.dialer == conn {
                    (route.listener, StreamRole::Dialer)
                } else {
                    (route.dialer, StreamRole::Listener)
                };
                if let Some(peer) = state.conns.get(&survivor) {
                    peer.send(Frame::End {
                        stream: StreamId { dial, role },
                    });
                }
            }
        }

        let mut stats = self.stats.write();
        stats.connections_active = state.conns.len();
        stats.peers_joined = state.room.len();
        debug!("Connection {} dropped", conn);
    }

    /// Process one frame received from `conn`
    pub fn handle_frame(&self, conn: ConnId, frame: Frame) {
        match frame {
            Frame::Event { name, args, ack } => match name.as_str() {
                EVENT_JOIN => self.on_join(conn, args, ack),
                EVENT_DIAL => self.on_dial(conn, args, ack),
                other => {
                    warn!("Connection {} sent unknown event '{}'", conn, other);
                    if let Some(id) = ack {
                        self.send_to(conn, Frame::Ack {
                            id,
                            args: ack_err(format!("unknown event '{}'", other)),
                        });
                    }
                }
            },
            Frame::Ack { id, args } => self.on_incoming_ack(conn, id, args),
            Frame::Data { stream, payload } => self.relay(conn, stream, Some(payload)),
            Frame::End { stream } => self.relay(conn, stream, None),
        }
    }

    /// Get current server statistics
    pub fn get_stats(&self) -> SignalServerStats {
        self.stats.read().clone()
    }

    /// Addresses currently joined
    pub fn peers(&self) -> Vec<Multiaddr> {
        self.state.lock().room.keys().cloned().collect()
    }

    /// Number of relays currently established
    pub fn active_routes(&self) -> usize {
        self.state.lock().routes.len()
    }

    fn send_to(&self, conn: ConnId, frame: Frame) {
        if let Some(target) = self.state.lock().conns.get(&conn) {
            target.send(frame);
        }
    }

    fn on_join(&self, conn: ConnId, args: Vec<Value>, ack: Option<u64>) {
        let Some(ack) = ack else {
            warn!("Connection {} sent join without acknowledgement", conn);
            return;
        };
        let reply = |args: Vec<Value>| self.send_to(conn, Frame::Ack { id: ack, args });

        let (addr, credential) = match args.as_slice() {
            [Value::Str(addr), Value::Str(credential)] => (addr.clone(), credential.clone()),
            _ => return reply(ack_err("join expects (address, credential)")),
        };
        let addr: Multiaddr = match addr.parse() {
            Ok(addr) if addr::is_rendezvous(&addr) => addr,
            _ => return reply(ack_err(format!("invalid address {}", addr))),
        };
        let credential = match JoinCredential::from_wire(&credential) {
            Ok(credential) => credential,
            Err(e) => return reply(ack_err(e.to_string())),
        };

        let mut state = self.state.lock();
        match self.authorize(&mut state, conn, &addr, credential) {
            JoinDecision::Accept => {
                drop(state);
                reply(ack_ok(Vec::new()));
                self.admit(conn, addr);
            }
            JoinDecision::Challenge(challenge) => {
                drop(state);
                debug!("Challenging {}", addr);
                reply(ack_ok(vec![Value::Str(challenge)]));
            }
            JoinDecision::Reject(reason) => {
                drop(state);
                warn!("Rejected join for {}: {}", addr, reason);
                reply(ack_err(reason));
            }
        }
    }

    fn authorize(
        &self,
        state: &mut HubState,
        conn: ConnId,
        addr: &Multiaddr,
        credential: JoinCredential,
    ) -> JoinDecision {
        if !self.config.require_proof {
            return JoinDecision::Accept;
        }

        match credential {
            JoinCredential::None => self.issue_challenge(state, conn, addr),
            JoinCredential::PublicKey(public_key) => match check_key(&public_key, addr) {
                Ok(()) => self.issue_challenge(state, conn, addr),
                Err(reason) => JoinDecision::Reject(reason),
            },
            JoinCredential::Proof(proof) => {
                if let Err(reason) = check_key(&proof.public_key, addr) {
                    return JoinDecision::Reject(reason);
                }
                let wire = JoinCredential::Proof(proof.clone()).to_wire();
                if state.proofs.get(addr) == Some(&wire) {
                    return JoinDecision::Accept;
                }

                let issued = state
                    .challenges
                    .get(addr)
                    .map_or(false, |c| c.iter().any(|c| c.challenge == proof.challenge));
                if !issued {
                    return self.issue_challenge(state, conn, addr);
                }
                if !verify_proof(&proof) {
                    return JoinDecision::Reject("invalid signature".to_string());
                }

                if let Some(outstanding) = state.challenges.get_mut(addr) {
                    outstanding.retain(|c| c.challenge != proof.challenge);
                    if outstanding.is_empty() {
                        state.challenges.remove(addr);
                    }
                }
                state.proofs.insert(addr.clone(), wire);
                JoinDecision::Accept
            }
        }
    }

    fn issue_challenge(&self, state: &mut HubState, conn: ConnId, addr: &Multiaddr) -> JoinDecision {
        let outstanding = state.challenges.entry(addr.clone()).or_default();
        while outstanding.len() >= self.config.max_challenges.max(1) {
            if let Some(evicted) = outstanding.pop_front() {
                debug!("Evicting challenge for {} issued to connection {}", addr, evicted.conn);
            }
        }
        let challenge = hex::encode(rand::random::<[u8; 16]>());
        outstanding.push_back(IssuedChallenge {
            challenge: challenge.clone(),
            conn,
        });
        JoinDecision::Challenge(challenge)
    }

    /// Put `addr` in the room and exchange announcements with the others
    fn admit(&self, conn: ConnId, addr: Multiaddr) {
        let mut state = self.state.lock();
        if !state.conns.contains_key(&conn) {
            return;
        }

        if let Some(previous) = state.room.insert(addr.clone(), conn) {
            if previous != conn {
                debug!("{} moved from connection {} to {}", addr, previous, conn);
            }
        }
        if let Some(joiner) = state.conns.get_mut(&conn) {
            if !joiner.joined.contains(&addr) {
                joiner.joined.push(addr.clone());
            }
        }

        let announce = |peer: &Multiaddr| Frame::Event {
            name: EVENT_PEER.to_string(),
            args: vec![Value::Str(peer.to_string())],
            ack: None,
        };
        if let Some(joiner) = state.conns.get(&conn) {
            for (existing, owner) in &state.room {
                if *owner != conn {
                    joiner.send(announce(existing));
                }
            }
        }
        for (id, other) in &state.conns {
            if *id != conn && !other.joined.is_empty() {
                other.send(announce(&addr));
            }
        }

        self.stats.write().peers_joined = state.room.len();
        info!("{} joined the room", addr);
    }

    fn on_dial(&self, conn: ConnId, args: Vec<Value>, ack: Option<u64>) {
        let Some(dialer_ack) = ack else {
            warn!("Connection {} sent dial without acknowledgement", conn);
            return;
        };
        let reply = |args: Vec<Value>| self.send_to(conn, Frame::Ack { id: dialer_ack, args });

        let (from, to, dial) = match args.as_slice() {
            [Value::Str(from), Value::Str(to), Value::Str(dial)] => (from.clone(), to.clone(), dial.clone()),
            _ => return reply(ack_err("dial expects (from, to, dial id)")),
        };
        let dial = match DialId::parse(&dial) {
            Ok(dial) => dial,
            Err(e) => return reply(ack_err(e.to_string())),
        };
        let Ok(to) = to.parse::<Multiaddr>() else {
            return reply(ack_err("peer not found"));
        };

        let mut state = self.state.lock();
        let Some(target) = state.room.get(&to).copied() else {
            drop(state);
            debug!("Dial {} to unknown peer {}", dial, to);
            return reply(ack_err("peer not found"));
        };

        let id = self.next_ack.fetch_add(1, Ordering::Relaxed);
        if let Some(listener) = state.conns.get_mut(&target) {
            listener.incoming.insert(
                id,
                PendingIncoming {
                    dial,
                    dialer: conn,
                    dialer_ack,
                },
            );
            listener.send(Frame::Event {
                name: EVENT_INCOMING.to_string(),
                args: vec![Value::Str(dial.to_string()), Value::Str(from.clone())],
                ack: Some(id),
            });
            debug!("Relaying dial {} from {} to {}", dial, from, to);
        }
    }

    fn on_incoming_ack(&self, conn: ConnId, id: u64, args: Vec<Value>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let pending = match state.conns.get_mut(&conn).and_then(|c| c.incoming.remove(&id)) {
            Some(pending) => pending,
            None => {
                debug!("Ignoring unexpected acknowledgement {} from connection {}", id, conn);
                return;
            }
        };

        let ended_early = state.ended_early.remove(&pending.dial);
        let reply = parse_ack(args);
        let accepted = matches!(reply, Ok(Ok(_)));

        let Some(dialer) = state.conns.get(&pending.dialer) else {
            debug!("Dialer of {} is gone", pending.dial);
            // The target already opened its side; end the stream it reads
            if accepted {
                if let Some(target) = state.conns.get(&conn) {
                    target.send(Frame::End {
                        stream: StreamId::dialer(pending.dial),
                    });
                }
            }
            return;
        };

        match reply {
            Ok(Ok(_)) => {
                dialer.send(Frame::Ack {
                    id: pending.dialer_ack,
                    args: ack_ok(Vec::new()),
                });
                state.routes.insert(
                    pending.dial,
                    Route {
                        dialer: pending.dialer,
                        listener: conn,
                        dialer_ended: ended_early,
                        listener_ended: false,
                    },
                );
                if ended_early {
                    debug!("Dial {} was ended by its dialer before being accepted", pending.dial);
                    if let Some(target) = state.conns.get(&conn) {
                        target.send(Frame::End {
                            stream: StreamId::dialer(pending.dial),
                        });
                    }
                }
                self.stats.write().dials_relayed += 1;
                debug!("Dial {} established", pending.dial);
            }
            Ok(Err(reason)) => dialer.send(Frame::Ack {
                id: pending.dialer_ack,
                args: ack_err(reason),
            }),
            Err(e) => dialer.send(Frame::Ack {
                id: pending.dialer_ack,
                args: ack_err(e.to_string()),
            }),
        }
    }

    /// Forward sub-channel traffic; `None` payload means end-of-stream
    fn relay(&self, conn: ConnId, stream: StreamId, payload: Option<Vec<u8>>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(route) = state.routes.get_mut(&stream.dial) else {
            let awaiting_ack = payload.is_none()
                && stream.role == StreamRole::Dialer
                && state.conns.values().any(|c| {
                    c.incoming
                        .values()
                        .any(|p| p.dial == stream.dial && p.dialer == conn)
                });
            if awaiting_ack {
                // Replayed to the target once it accepts
                state.ended_early.insert(stream.dial);
            } else {
                debug!("Dropping traffic for unknown stream {}", stream);
            }
            return;
        };

        let (writer, reader) = route.direction(stream.role);
        if writer != conn {
            warn!("Connection {} wrote to stream {} it does not own", conn, stream);
            return;
        }

        let frame = match payload {
            Some(payload) => {
                self.stats.write().bytes_relayed += payload.len() as u64;
                Frame::Data { stream, payload }
            }
            None => {
                match stream.role {
                    StreamRole::Dialer => route.dialer_ended = true,
                    StreamRole::Listener => route.listener_ended = true,
                }
                if route.dialer_ended && route.listener_ended {
                    state.routes.remove(&stream.dial);
                    debug!("Dial {} finished", stream.dial);
                }
                Frame::End { stream }
            }
        };

        if let Some(peer) = state.conns.get(&reader) {
            peer.send(frame);
        }
    }
}

impl Default for SignalServer {
    fn default() -> Self {
        Self::new()
    }
}

/// The public key must decode and own the address's peer id
fn check_key(public_key: &str, addr: &Multiaddr) -> Result<(), String> {
    let bytes = hex::decode(public_key).map_err(|_| "malformed public key".to_string())?;
    let peer_id = peer_id_from_public_key(&bytes).map_err(|e| e.to_string())?;
    match addr::peer_id_of(addr) {
        Some(claimed) if claimed == peer_id => Ok(()),
        Some(_) => Err("public key does not match address".to_string()),
        None => Err("address carries no peer id".to_string()),
    }
}

fn verify_proof(proof: &JoinProof) -> bool {
    let (Ok(public_key), Ok(signature)) = (hex::decode(&proof.public_key), hex::decode(&proof.signature)) else {
        return false;
    };
    IdentityKeys::verify(proof.challenge.as_bytes(), &signature, &public_key).unwrap_or(false)
}

// ============================================================================
// TESTS
// ============================================================================
