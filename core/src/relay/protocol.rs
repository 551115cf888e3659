//! Rendezvous wire protocol: frames, argument values and join credentials

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Join request (client → server): `[addr, credential]` + ack
pub const EVENT_JOIN: &str = "ss-join";
/// Relay dial request (client → server): `[from, to, dial_id]` + ack
pub const EVENT_DIAL: &str = "ss-dial";
/// Relayed inbound dial (server → client): `[dial_id, from]` + ack
pub const EVENT_INCOMING: &str = "ss-incoming";
/// Peer announcement (server → client): `[addr]`
pub const EVENT_PEER: &str = "ws-peer";

/// Largest frame accepted from the wire
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// A single event argument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
}

impl Value {
    /// Short name of the variant, used in validation errors
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Num(_) => "number",
            Value::Str(_) => "string",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

/// Correlation id of one dial attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DialId(Uuid);

impl DialId {
    /// Fresh random (v4) correlation id
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| ProtocolError::InvalidDialId(s.to_string()))
    }
}

impl fmt::Display for DialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which relay direction a sub-channel carries.
///
/// `Dialer` streams carry bytes written by the dialing peer, `Listener`
/// streams carry bytes written by the dialed peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamRole {
    Dialer,
    Listener,
}

/// Address of one sub-channel multiplexed over the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId {
    pub dial: DialId,
    pub role: StreamRole,
}

impl StreamId {
    pub fn dialer(dial: DialId) -> Self {
        Self {
            dial,
            role: StreamRole::Dialer,
        }
    }

    pub fn listener(dial: DialId) -> Self {
        Self {
            dial,
            role: StreamRole::Listener,
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.role {
            StreamRole::Dialer => write!(f, "{}.dialer", self.dial),
            StreamRole::Listener => write!(f, "{}.listener", self.dial),
        }
    }
}

/// A frame on the control channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// Named application event; `ack` is set when the sender expects an `Ack`
    Event {
        name: String,
        args: Vec<Value>,
        ack: Option<u64>,
    },
    /// Acknowledgement: `args[0]` is `Null` on success or the error string
    Ack { id: u64, args: Vec<Value> },
    /// Sub-channel payload
    Data { stream: StreamId, payload: Vec<u8> },
    /// Sub-channel end-of-stream
    End { stream: StreamId },
}

/// Protocol errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("Invalid dial id: {0}")]
    InvalidDialId(String),
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),
    #[error("Malformed acknowledgement")]
    MalformedAck,
}

impl Frame {
    /// Serialize a frame to bytes using bincode
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serialize(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize a frame from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge(bytes.len()));
        }
        bincode::deserialize(bytes).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// Get a human-readable description of the frame type
    pub fn frame_type(&self) -> &'static str {
        match self {
            Frame::Event { .. } => "Event",
            Frame::Ack { .. } => "Ack",
            Frame::Data { .. } => "Data",
            Frame::End { .. } => "End",
        }
    }
}

/// Successful acknowledgement arguments
pub fn ack_ok(payload: Vec<Value>) -> Vec<Value> {
    let mut args = Vec::with_capacity(payload.len() + 1);
    args.push(Value::Null);
    args.extend(payload);
    args
}

/// Failed acknowledgement arguments
pub fn ack_err(message: impl Into<String>) -> Vec<Value> {
    vec![Value::Str(message.into())]
}

/// Split acknowledgement arguments into `Ok(payload)` or `Err(remote error)`
pub fn parse_ack(mut args: Vec<Value>) -> Result<Result<Vec<Value>, String>, ProtocolError> {
    if args.is_empty() {
        return Ok(Ok(Vec::new()));
    }
    match args.remove(0) {
        Value::Null => Ok(Ok(args)),
        Value::Str(err) => Ok(Err(err)),
        _ => Err(ProtocolError::MalformedAck),
    }
}

/// Signed answer to a join challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinProof {
    /// Hex-encoded Ed25519 public key
    pub public_key: String,
    /// Challenge token as issued by the server
    pub challenge: String,
    /// Hex-encoded signature over the challenge bytes
    pub signature: String,
}

/// Credential carried by a join request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinCredential {
    /// Anonymous join
    None,
    /// Marshaled public key, asking the server for a challenge
    PublicKey(String),
    /// Signed challenge
    Proof(JoinProof),
}

impl JoinCredential {
    pub fn to_wire(&self) -> String {
        match self {
            JoinCredential::None => String::new(),
            JoinCredential::PublicKey(pk) => format!("pubkey:{}", pk),
            JoinCredential::Proof(p) => {
                format!("proof:{}:{}:{}", p.public_key, p.challenge, p.signature)
            }
        }
    }

    pub fn from_wire(s: &str) -> Result<Self, ProtocolError> {
        if s.is_empty() {
            return Ok(JoinCredential::None);
        }
        if let Some(pk) = s.strip_prefix("pubkey:") {
            if pk.is_empty() {
                return Err(ProtocolError::InvalidCredential(s.to_string()));
            }
            return Ok(JoinCredential::PublicKey(pk.to_string()));
        }
        if let Some(rest) = s.strip_prefix("proof:") {
            let parts: Vec<&str> = rest.split(':').collect();
            if let [public_key, challenge, signature] = parts.as_slice() {
                if !public_key.is_empty() && !challenge.is_empty() && !signature.is_empty() {
                    return Ok(JoinCredential::Proof(JoinProof {
                        public_key: public_key.to_string(),
                        challenge: challenge.to_string(),
                        signature: signature.to_string(),
                    }));
                }
            }
        }
        Err(ProtocolError::InvalidCredential(s.to_string()))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_frame_serialization() {
        let frame = Frame::Event {
            name: EVENT_JOIN.to_string(),
            args: vec![Value::from("/ip4/127.0.0.1/tcp/9090/ws/p2p-websocket-star"), Value::Null],
            ack: Some(7),
        };

        let bytes = frame.to_bytes().expect("Failed to serialize");
        let restored = Frame::from_bytes(&bytes).expect("Failed to deserialize");

        assert_eq!(frame, restored);
        assert_eq!(restored.frame_type(), "Event");
    }

    #[test]
    fn test_data_frame_keeps_stream_role() {
        let dial = DialId::generate();
        let frame = Frame::Data {
            stream: StreamId::listener(dial),
            payload: vec![1, 2, 3],
        };

        let restored = Frame::from_bytes(&frame.to_bytes().unwrap()).unwrap();
        match restored {
            Frame::Data { stream, payload } => {
                assert_eq!(stream.dial, dial);
                assert_eq!(stream.role, StreamRole::Listener);
                assert_eq!(payload, vec![1, 2, 3]);
            }
            _ => panic!("Wrong frame type"),
        }
    }

    #[test]
    fn test_invalid_deserialization() {
        let result = Frame::from_bytes(&[255, 254, 253]);
        assert!(result.is_err());
    }

    #[test]
    fn test_stream_id_display() {
        let dial = DialId::parse("6f1c0c0e-5a4e-4a3b-9b7e-1f2d3c4b5a69").unwrap();
        assert_eq!(
            StreamId::dialer(dial).to_string(),
            "6f1c0c0e-5a4e-4a3b-9b7e-1f2d3c4b5a69.dialer"
        );
        assert_eq!(
            StreamId::listener(dial).to_string(),
            "6f1c0c0e-5a4e-4a3b-9b7e-1f2d3c4b5a69.listener"
        );
    }

    #[test]
    fn test_dial_id_parse_rejects_garbage() {
        assert!(DialId::parse("not-a-uuid").is_err());
        let id = DialId::generate();
        assert_eq!(DialId::parse(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn test_parse_ack() {
        assert_eq!(parse_ack(ack_ok(vec![])).unwrap(), Ok(vec![]));
        assert_eq!(
            parse_ack(ack_ok(vec![Value::from("tok")])).unwrap(),
            Ok(vec![Value::from("tok")])
        );
        assert_eq!(
            parse_ack(ack_err("peer not found")).unwrap(),
            Err("peer not found".to_string())
        );
        assert!(parse_ack(vec![Value::Num(1.0)]).is_err());
        // An empty ack is a bare success
        assert_eq!(parse_ack(vec![]).unwrap(), Ok(vec![]));
    }

    #[test]
    fn test_join_credential_wire_format() {
        assert_eq!(JoinCredential::from_wire("").unwrap(), JoinCredential::None);
        assert_eq!(JoinCredential::None.to_wire(), "");

        let pk = JoinCredential::PublicKey("abcd".to_string());
        assert_eq!(pk.to_wire(), "pubkey:abcd");
        assert_eq!(JoinCredential::from_wire("pubkey:abcd").unwrap(), pk);

        let proof = JoinCredential::Proof(JoinProof {
            public_key: "aa".to_string(),
            challenge: "bb".to_string(),
            signature: "cc".to_string(),
        });
        assert_eq!(JoinCredential::from_wire(&proof.to_wire()).unwrap(), proof);
    }

    #[test]
    fn test_join_credential_rejects_malformed() {
        assert!(JoinCredential::from_wire("pubkey:").is_err());
        assert!(JoinCredential::from_wire("proof:aa:bb").is_err());
        assert!(JoinCredential::from_wire("proof:aa::cc").is_err());
        assert!(JoinCredential::from_wire("garbage").is_err());
    }
}
