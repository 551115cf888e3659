//! Listener: one announced rendezvous address and the control channel
//! behind it.
//!
//! `listen` drives `Idle → Connecting → Joining → Listening`. Afterwards a
//! supervisor task follows the channel: a reconnect re-runs the join with the
//! cached proof (`Reconnecting → Listening`), a lost channel or a fatal
//! handshake fault ends in `Error`, and `close` ends in `Closed`.

use super::addr;
use super::discovery::Discovery;
use super::error::TransportError;
use super::facade::Registry;
use super::handshake::JoinHandshake;
use super::mux::{self, Connection, ConnectionInfo, SessionTable};
use super::rpc::{Arg, ArgKind, Protocol};
use crate::channel::{Channel, ChannelEvent, ChannelEvents, Connector, Responder};
use crate::config::TransportConfig;
use crate::identity::IdentityKeys;
use crate::relay::protocol::{DialId, EVENT_INCOMING, EVENT_PEER};
use libp2p::Multiaddr;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Called with every accepted inbound connection. Runs on the channel's
/// reader, so long work belongs in a spawned task.
pub type ConnectionHandler = Arc<dyn Fn(Connection) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Connecting,
    Joining,
    Listening,
    Reconnecting,
    Closed,
    Error,
}

impl ListenerState {
    /// Holding (or working towards) a place in the room
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ListenerState::Connecting
                | ListenerState::Joining
                | ListenerState::Listening
                | ListenerState::Reconnecting
        )
    }
}

/// Lifecycle events observed through [`Listener::subscribe`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    Listening,
    Connection(ConnectionInfo),
    Error(String),
    Close,
    Reconnected,
}

pub(crate) struct ListenerInner {
    connector: Arc<dyn Connector>,
    handler: ConnectionHandler,
    discovery: Discovery,
    registry: Registry,
    state: RwLock<ListenerState>,
    addr: RwLock<Option<Multiaddr>>,
    channel: Mutex<Option<Channel>>,
    handshake: tokio::sync::Mutex<JoinHandshake>,
    sessions: SessionTable,
    events: broadcast::Sender<ListenerEvent>,
}

/// Cloneable handle to a listener
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl Listener {
    pub(crate) fn new(
        config: &TransportConfig,
        connector: Arc<dyn Connector>,
        identity: Option<IdentityKeys>,
        handler: ConnectionHandler,
        discovery: Discovery,
        registry: Registry,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            inner: Arc::new(ListenerInner {
                connector,
                handler,
                discovery,
                registry,
                state: RwLock::new(ListenerState::Idle),
                addr: RwLock::new(None),
                channel: Mutex::new(None),
                handshake: tokio::sync::Mutex::new(JoinHandshake::new(identity, config.max_challenge_rounds)),
                sessions: SessionTable::new(),
                events,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ListenerInner>) -> Self {
        Self { inner }
    }

    pub fn state(&self) -> ListenerState {
        self.inner.state()
    }

    /// Lifecycle events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ListenerEvent> {
        self.inner.events.subscribe()
    }

    /// The announced address once listening; empty before that
    pub fn get_addrs(&self) -> Vec<Multiaddr> {
        match self.state() {
            ListenerState::Listening | ListenerState::Reconnecting => {
                self.inner.addr.read().iter().cloned().collect()
            }
            _ => Vec::new(),
        }
    }

    /// Dial sessions currently tracked
    pub fn active_dials(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Announce `addr` on the signaling server it names. Resolves once the
    /// join completes, or with the error that ended the attempt.
    pub async fn listen(&self, addr: Multiaddr) -> Result<(), TransportError> {
        let inner = &self.inner;
        let key = addr::server_key(&addr)?;
        let url = addr::server_url(&addr)?;

        match inner.state() {
            ListenerState::Idle => {}
            // A dead listener is not reusable
            ListenerState::Closed | ListenerState::Error => return Err(TransportError::Closed),
            _ => return Err(TransportError::AlreadyListening(addr.to_string())),
        }
        inner.registry.claim(&key, inner)?;
        if !inner.transition(&[ListenerState::Idle], ListenerState::Connecting) {
            inner.registry.release(&key, inner);
            return Err(TransportError::AlreadyListening(addr.to_string()));
        }
        *inner.addr.write() = Some(addr.clone());
        info!("Connecting to {} to announce {}", url, addr);

        let (channel, events) = match inner.connector.connect(&url).await {
            Ok(connected) => connected,
            Err(e) => {
                error!("Failed to connect to {}: {}", url, e);
                inner.fail(Some(e.to_string()));
                return Err(e.into());
            }
        };

        *inner.channel.lock() = Some(channel.clone());
        if !inner.transition(&[ListenerState::Connecting], ListenerState::Joining) {
            channel.disconnect();
            return Err(TransportError::Closed);
        }
        inner.bind_protocol(&channel);

        let joined = inner.handshake.lock().await.join(&channel, &addr).await;
        match joined {
            Ok(()) => {
                if !inner.transition(&[ListenerState::Joining], ListenerState::Listening) {
                    channel.disconnect();
                    return Err(TransportError::Closed);
                }
                tokio::spawn(supervise(Arc::downgrade(inner), events));
                inner.emit(ListenerEvent::Listening);
                Ok(())
            }
            Err(_) if inner.state() == ListenerState::Closed => Err(TransportError::Closed),
            Err(e) => {
                error!("Join as {} failed: {}", addr, e);
                inner.fail(Some(e.to_string()));
                Err(e.into())
            }
        }
    }

    /// Dial `target` through this listener's control channel
    pub async fn dial(&self, target: &Multiaddr) -> Result<Connection, TransportError> {
        let (channel, local) = self.inner.ready(target)?;
        mux::dial_outbound(&channel, &self.inner.sessions, &local, target).await
    }

    /// Tear the listener down. Closing twice is a no-op.
    pub async fn close(&self) {
        let previous = {
            let mut state = self.inner.state.write();
            std::mem::replace(&mut *state, ListenerState::Closed)
        };

        match previous {
            ListenerState::Closed => debug!("Listener already closed"),
            // Error already tore down and reported
            ListenerState::Error => {}
            _ => {
                self.inner.teardown();
                info!("Listener closed");
                self.inner.emit(ListenerEvent::Close);
            }
        }
        tokio::task::yield_now().await;
    }
}

impl ListenerInner {
    fn state(&self) -> ListenerState {
        *self.state.read()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state().is_active()
    }

    fn transition(&self, from: &[ListenerState], to: ListenerState) -> bool {
        let mut state = self.state.write();
        if from.contains(&*state) {
            debug!("Listener {:?} -> {:?}", *state, to);
            *state = to;
            true
        } else {
            false
        }
    }

    fn emit(&self, event: ListenerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Channel and local address to dial with, if listening on `target`'s server
    fn ready(&self, target: &Multiaddr) -> Result<(Channel, Multiaddr), TransportError> {
        let target_key = addr::server_key(target)?;
        if self.state() != ListenerState::Listening {
            return Err(TransportError::NoSignalingConnection);
        }

        let local = self.addr.read().clone();
        let channel = self.channel.lock().clone();
        match (channel, local) {
            (Some(channel), Some(local)) if channel.is_connected() => {
                if addr::server_key(&local)? != target_key {
                    return Err(TransportError::NoListenerForServer(target_key));
                }
                Ok((channel, local))
            }
            _ => Err(TransportError::NoSignalingConnection),
        }
    }

    /// Release the channel, the sessions and the registry slot
    fn teardown(&self) {
        self.sessions.clear();
        if let Some(channel) = self.channel.lock().take() {
            channel.disconnect();
        }
        if let Some(addr) = self.addr.read().as_ref() {
            if let Ok(key) = addr::server_key(addr) {
                self.registry.release(&key, self);
            }
        }
    }

    /// Unrecoverable fault: tear down, then report `error` (if any) and `close`
    fn fail(&self, reason: Option<String>) {
        {
            let mut state = self.state.write();
            if matches!(*state, ListenerState::Closed | ListenerState::Error) {
                return;
            }
            *state = ListenerState::Error;
        }
        self.teardown();
        if let Some(reason) = reason {
            self.emit(ListenerEvent::Error(reason));
        }
        self.emit(ListenerEvent::Close);
    }

    fn bind_protocol(self: &Arc<Self>, channel: &Channel) {
        let protocol = Arc::new(Protocol::new());

        let discovery = self.discovery.clone();
        protocol.add_request(EVENT_PEER, &[ArgKind::Multiaddr], move |args, _| {
            if let [Arg::Addr(announced)] = args.as_slice() {
                discovery.peer_discovered(announced);
            }
        });

        let listener = Arc::downgrade(self);
        protocol.add_request(
            EVENT_INCOMING,
            &[ArgKind::String, ArgKind::Multiaddr, ArgKind::Callback],
            move |args, responder| {
                let Some(responder) = responder else {
                    return;
                };
                match listener.upgrade() {
                    Some(inner) => inner.on_incoming(args, responder),
                    None => responder.reject("listener gone"),
                }
            },
        );

        protocol.handle_socket(channel);
    }

    fn on_incoming(&self, args: Vec<Arg>, responder: Responder) {
        let (dial, remote) = match args.as_slice() {
            [Arg::Str(dial), Arg::Addr(remote)] => (dial.clone(), remote.clone()),
            _ => return responder.reject("malformed incoming dial"),
        };
        let dial = match DialId::parse(&dial) {
            Ok(dial) => dial,
            Err(e) => return responder.reject(e.to_string()),
        };

        if !matches!(
            self.state(),
            ListenerState::Joining | ListenerState::Listening | ListenerState::Reconnecting
        ) {
            return responder.reject("not listening");
        }
        let channel = self.channel.lock().clone();
        let local = self.addr.read().clone();
        let (Some(channel), Some(local)) = (channel, local) else {
            return responder.reject("not listening");
        };

        match mux::accept_inbound(&channel, &self.sessions, dial, remote, local, responder) {
            Ok(conn) => {
                self.emit(ListenerEvent::Connection(conn.info().clone()));
                (self.handler)(conn);
            }
            Err(e) => warn!("Refused dial {}: {}", dial, e),
        }
    }

    /// Re-run the join after the channel reconnected
    async fn rejoin(&self) {
        if !self.transition(
            &[ListenerState::Listening, ListenerState::Reconnecting],
            ListenerState::Reconnecting,
        ) {
            return;
        }
        // Sub-channels did not survive the drop
        self.sessions.clear();

        let channel = self.channel.lock().clone();
        let addr = self.addr.read().clone();
        let (Some(channel), Some(addr)) = (channel, addr) else {
            return;
        };
        info!("Control channel reconnected, rejoining as {}", addr);

        let joined = self.handshake.lock().await.join(&channel, &addr).await;
        match joined {
            Ok(()) => {
                if self.transition(&[ListenerState::Reconnecting], ListenerState::Listening) {
                    self.emit(ListenerEvent::Reconnected);
                }
            }
            Err(e) if e.is_fatal() => {
                error!("Rejoin as {} failed fatally: {}", addr, e);
                self.fail(Some(e.to_string()));
            }
            Err(e) => {
                warn!("Rejoin as {} failed: {}", addr, e);
                if self.state() == ListenerState::Reconnecting {
                    self.emit(ListenerEvent::Error(e.to_string()));
                }
            }
        }
    }
}

impl Drop for ListenerInner {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.get_mut().take() {
            channel.disconnect();
        }
    }
}

/// Follow the channel's lifecycle for as long as the listener lives
async fn supervise(listener: Weak<ListenerInner>, mut events: ChannelEvents) {
    let mut reported = false;

    while let Some(event) = events.recv().await {
        let Some(inner) = listener.upgrade() else {
            return;
        };

        match event {
            ChannelEvent::Connect => {}
            ChannelEvent::Reconnect => {
                reported = false;
                inner.rejoin().await;
            }
            ChannelEvent::ConnectError(msg) | ChannelEvent::Error(msg) => {
                warn!("Control channel error: {}", msg);
                reported = true;
                inner.emit(ListenerEvent::Error(msg));
            }
            ChannelEvent::Disconnect => {
                if inner.state().is_active() {
                    let reason = (!reported).then(|| "control channel lost".to_string());
                    inner.fail(reason);
                }
                return;
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
