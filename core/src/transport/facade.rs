//! Transport facade: creates listeners, routes dials to the listener that
//! holds a channel to the target's server, and filters addresses.

use super::addr;
use super::discovery::Discovery;
use super::error::TransportError;
use super::listener::{Listener, ListenerInner};
use super::mux::Connection;
use crate::channel::{Connector, WsConnector};
use crate::config::TransportConfig;
use crate::identity::IdentityKeys;
use libp2p::Multiaddr;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Listeners by normalized server address. Entries are weak so a dropped
/// listener never pins itself in place.
#[derive(Clone, Default)]
pub(crate) struct Registry {
    listeners: Arc<RwLock<HashMap<String, Weak<ListenerInner>>>>,
}

impl Registry {
    /// Take the slot for `key`, unless another active listener holds it
    pub(crate) fn claim(&self, key: &str, listener: &Arc<ListenerInner>) -> Result<(), TransportError> {
        let mut listeners = self.listeners.write();
        if let Some(existing) = listeners.get(key).and_then(Weak::upgrade) {
            if !Arc::ptr_eq(&existing, listener) && existing.is_active() {
                return Err(TransportError::AlreadyListening(key.to_string()));
            }
        }
        listeners.insert(key.to_string(), Arc::downgrade(listener));
        debug!("Registered listener for {}", key);
        Ok(())
    }

    /// Give up the slot for `key` if `listener` holds it
    pub(crate) fn release(&self, key: &str, listener: &ListenerInner) {
        let mut listeners = self.listeners.write();
        let held = listeners
            .get(key)
            .map_or(false, |w| std::ptr::eq(w.as_ptr(), listener));
        if held {
            listeners.remove(key);
            debug!("Released listener for {}", key);
        }
    }

    pub(crate) fn lookup(&self, key: &str) -> Option<Listener> {
        self.listeners
            .read()
            .get(key)
            .and_then(Weak::upgrade)
            .map(Listener::from_inner)
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners
            .read()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

/// The rendezvous transport
pub struct WebSocketStar {
    config: TransportConfig,
    connector: Arc<dyn Connector>,
    identity: Option<IdentityKeys>,
    registry: Registry,
    discovery: Discovery,
}

impl WebSocketStar {
    /// Transport that reaches signaling servers over WebSocket
    pub fn new(config: TransportConfig) -> Self {
        let connector = Arc::new(WsConnector::new(config.clone()));
        Self::with_connector(config, connector)
    }

    /// Transport that opens control channels through `connector`
    pub fn with_connector(config: TransportConfig, connector: Arc<dyn Connector>) -> Self {
        let discovery = Discovery::new(config.event_buffer);
        Self {
            config,
            connector,
            identity: None,
            registry: Registry::default(),
            discovery,
        }
    }

    /// Identity used to answer join challenges
    pub fn with_identity(mut self, identity: IdentityKeys) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn identity(&self) -> Option<&IdentityKeys> {
        self.identity.as_ref()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// New idle listener; nothing connects until [`Listener::listen`]
    pub fn create_listener<F>(&self, handler: F) -> Listener
    where
        F: Fn(Connection) + Send + Sync + 'static,
    {
        Listener::new(
            &self.config,
            Arc::clone(&self.connector),
            self.identity.clone(),
            Arc::new(handler),
            self.discovery.clone(),
            self.registry.clone(),
        )
    }

    /// Dial `addr` through the listener registered for its server
    pub async fn dial(&self, addr: &Multiaddr) -> Result<Connection, TransportError> {
        let key = addr::server_key(addr)?;
        let listener = self
            .registry
            .lookup(&key)
            .ok_or(TransportError::NoListenerForServer(key))?;
        listener.dial(addr).await
    }

    /// The rendezvous addresses among `addrs`, in order
    pub fn filter(&self, addrs: &[Multiaddr]) -> Vec<Multiaddr> {
        addr::filter(addrs)
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    /// Listener registered for `addr`'s server, if any
    pub fn listener_for(&self, addr: &Multiaddr) -> Option<Listener> {
        let key = addr::server_key(addr).ok()?;
        self.registry.lookup(&key)
    }

    /// Number of live registered listeners
    pub fn listener_count(&self) -> usize {
        self.registry.len()
    }
}

// ============================================================================
// TESTS
// ============================================================================
