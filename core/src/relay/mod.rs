//! Signaling relay: wire protocol and the rendezvous hub
//!
//! Peers hold one control channel to the hub. Through it they join the room,
//! learn about each other, and relay dial streams.

pub mod protocol;
pub mod server;

pub use protocol::{DialId, Frame, JoinCredential, JoinProof, StreamId, StreamRole, Value};
pub use server::{SignalServer, SignalServerConfig, SignalServerError, SignalServerStats};
