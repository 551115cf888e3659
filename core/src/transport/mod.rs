// Transport module: the rendezvous transport and its layers

pub mod addr;
pub mod discovery;
pub mod error;
pub mod facade;
pub mod handshake;
pub mod listener;
pub mod mux;
pub mod rpc;

pub use addr::AddrError;
pub use discovery::{Discovery, PeerInfo};
pub use error::TransportError;
pub use facade::WebSocketStar;
pub use handshake::{HandshakeError, JoinHandshake, JoinReply};
pub use listener::{ConnectionHandler, Listener, ListenerEvent, ListenerState};
pub use mux::{ConnSink, ConnSource, Connection, ConnectionInfo, DialSession, Direction, SessionTable};
pub use rpc::{Arg, ArgKind, Protocol, RpcError};
