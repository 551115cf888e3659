use super::addr::AddrError;
use super::handshake::HandshakeError;
use crate::channel::ChannelError;
use thiserror::Error;

/// Errors surfaced by the transport facade and its listeners
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("no listener for this server: {0}")]
    NoListenerForServer(String),
    #[error("no signaling connection available")]
    NoSignalingConnection,
    #[error("already listening on {0}")]
    AlreadyListening(String),
    #[error(transparent)]
    NotRendezvousAddr(#[from] AddrError),
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("dial rejected: {0}")]
    DialRejected(String),
    #[error("listener closed")]
    Closed,
}

impl TransportError {
    /// Precondition failures reported before any I/O happens
    pub fn is_policy(&self) -> bool {
        matches!(
            self,
            TransportError::NoListenerForServer(_)
                | TransportError::NoSignalingConnection
                | TransportError::AlreadyListening(_)
                | TransportError::NotRendezvousAddr(_)
        )
    }
}
