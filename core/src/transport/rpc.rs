//! Request/reply dispatch over a control channel
//!
//! Inbound events are looked up by name, their arguments checked against the
//! registered shape, and only then handed to the handler as typed [`Arg`]s.
//! A mismatched event never reaches its handler: it is rejected through its
//! acknowledgement if it carries one and dropped otherwise.

use crate::channel::{Channel, Responder};
use crate::relay::protocol::Value;
use libp2p::Multiaddr;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Expected shape of one event argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Opaque string
    String,
    /// String that parses as a multiaddr
    Multiaddr,
    /// Number
    Number,
    /// Acknowledgement slot; only valid as the last kind
    Callback,
}

impl ArgKind {
    fn name(&self) -> &'static str {
        match self {
            ArgKind::String => "string",
            ArgKind::Multiaddr => "multiaddr",
            ArgKind::Number => "number",
            ArgKind::Callback => "callback",
        }
    }
}

/// A validated argument
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Str(String),
    Addr(Multiaddr),
    Num(f64),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("Unknown request '{0}'")]
    UnknownRequest(String),
    #[error("'{name}' expects {expected} arguments, got {got}")]
    ArgCount {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("'{name}' argument {index}: expected {expected}, got {got}")]
    ArgKind {
        name: String,
        index: usize,
        expected: &'static str,
        got: &'static str,
    },
    #[error("'{0}' requires an acknowledgement callback")]
    MissingCallback(String),
    #[error("'{0}' does not take an acknowledgement callback")]
    UnexpectedCallback(String),
}

type Handler = Arc<dyn Fn(Vec<Arg>, Option<Responder>) + Send + Sync>;

struct RequestSpec {
    kinds: Vec<ArgKind>,
    handler: Handler,
}

/// Table of inbound requests: name → (argument shape, handler)
#[derive(Default)]
pub struct Protocol {
    requests: RwLock<HashMap<String, RequestSpec>>,
}

impl Protocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events named `name` with argument shape `kinds`
    pub fn add_request<F>(&self, name: &str, kinds: &[ArgKind], handler: F)
    where
        F: Fn(Vec<Arg>, Option<Responder>) + Send + Sync + 'static,
    {
        debug_assert!(
            !kinds[..kinds.len().saturating_sub(1)].contains(&ArgKind::Callback),
            "callback must be the last argument kind"
        );
        self.requests.write().insert(
            name.to_string(),
            RequestSpec {
                kinds: kinds.to_vec(),
                handler: Arc::new(handler),
            },
        );
    }

    /// Bind every registered request to `channel`. Binding the same table to
    /// the same channel again is a no-op.
    pub fn handle_socket(self: &Arc<Self>, channel: &Channel) {
        if channel.bind(Arc::clone(self)) {
            debug!("Bound {} requests to control channel", self.requests.read().len());
        }
    }

    /// Registered request names
    pub fn names(&self) -> Vec<String> {
        self.requests.read().keys().cloned().collect()
    }

    /// Validate and deliver one inbound event
    pub fn dispatch(
        &self,
        name: &str,
        args: Vec<Value>,
        responder: Option<Responder>,
    ) -> Result<(), RpcError> {
        let found = self
            .requests
            .read()
            .get(name)
            .map(|spec| (spec.kinds.clone(), Arc::clone(&spec.handler)));

        let (kinds, handler) = match found {
            Some(found) => found,
            None => {
                let err = RpcError::UnknownRequest(name.to_string());
                reject(responder, &err);
                return Err(err);
            }
        };

        match validate(name, &kinds, args, responder.is_some()) {
            Ok(args) => {
                handler(args, responder);
                Ok(())
            }
            Err(err) => {
                reject(responder, &err);
                Err(err)
            }
        }
    }
}

fn reject(responder: Option<Responder>, err: &RpcError) {
    match responder {
        Some(responder) => {
            warn!("Rejecting event: {}", err);
            responder.reject(err.to_string());
        }
        None => warn!("Dropping event: {}", err),
    }
}

fn validate(
    name: &str,
    kinds: &[ArgKind],
    args: Vec<Value>,
    has_callback: bool,
) -> Result<Vec<Arg>, RpcError> {
    let wants_callback = kinds.last() == Some(&ArgKind::Callback);
    let value_kinds = if wants_callback {
        &kinds[..kinds.len() - 1]
    } else {
        kinds
    };

    match (wants_callback, has_callback) {
        (true, false) => return Err(RpcError::MissingCallback(name.to_string())),
        (false, true) => return Err(RpcError::UnexpectedCallback(name.to_string())),
        _ => {}
    }

    if args.len() != value_kinds.len() {
        return Err(RpcError::ArgCount {
            name: name.to_string(),
            expected: value_kinds.len(),
            got: args.len(),
        });
    }

    value_kinds
        .iter()
        .zip(args)
        .enumerate()
        .map(|(index, (kind, value))| {
            let mismatch = |got: &'static str| RpcError::ArgKind {
                name: name.to_string(),
                index,
                expected: kind.name(),
                got,
            };
            match (kind, value) {
                (ArgKind::String, Value::Str(s)) => Ok(Arg::Str(s)),
                (ArgKind::Number, Value::Num(n)) => Ok(Arg::Num(n)),
                (ArgKind::Multiaddr, Value::Str(s)) => s
                    .parse::<Multiaddr>()
                    .map(Arg::Addr)
                    .map_err(|_| mismatch("unparseable multiaddr")),
                (_, other) => Err(mismatch(other.kind())),
            }
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::protocol::{parse_ack, Frame};
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    const ADDR: &str = "/ip4/127.0.0.1/tcp/9090/ws/p2p-websocket-star";

    fn recording_protocol(kinds: &[ArgKind]) -> (Arc<Protocol>, Arc<Mutex<Vec<Vec<Arg>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let protocol = Arc::new(Protocol::new());
        let sink = Arc::clone(&seen);
        protocol.add_request("ev", kinds, move |args, responder| {
            sink.lock().push(args);
            if let Some(responder) = responder {
                responder.accept();
            }
        });
        (protocol, seen)
    }

    fn attached(protocol: &Arc<Protocol>) -> (Channel, mpsc::UnboundedReceiver<Frame>) {
        let (channel, _events) = Channel::new();
        let (tx, rx) = mpsc::unbounded_channel();
        channel.attach(tx);
        protocol.handle_socket(&channel);
        (channel, rx)
    }

    #[test]
    fn test_valid_event_reaches_handler_typed() {
        let (protocol, seen) = recording_protocol(&[ArgKind::Multiaddr, ArgKind::Number]);
        protocol
            .dispatch("ev", vec![Value::from(ADDR), Value::Num(3.0)], None)
            .unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0][0], Arg::Addr(ADDR.parse().unwrap()));
        assert_eq!(seen[0][1], Arg::Num(3.0));
    }

    #[test]
    fn test_mismatched_event_is_dropped() {
        let (protocol, seen) = recording_protocol(&[ArgKind::Multiaddr]);

        let err = protocol
            .dispatch("ev", vec![Value::from("not an address")], None)
            .unwrap_err();
        assert!(matches!(err, RpcError::ArgKind { index: 0, .. }));

        let err = protocol.dispatch("ev", vec![], None).unwrap_err();
        assert!(matches!(err, RpcError::ArgCount { expected: 1, got: 0, .. }));

        let err = protocol.dispatch("ev", vec![Value::Num(1.0)], None).unwrap_err();
        assert!(matches!(err, RpcError::ArgKind { got: "number", .. }));

        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_unknown_request() {
        let (protocol, _) = recording_protocol(&[]);
        assert_eq!(
            protocol.dispatch("nope", vec![], None),
            Err(RpcError::UnknownRequest("nope".to_string()))
        );
    }

    #[tokio::test]
    async fn test_mismatch_with_ack_is_rejected_through_ack() {
        let (protocol, seen) = recording_protocol(&[ArgKind::String, ArgKind::Callback]);
        let (channel, mut wire) = attached(&protocol);

        channel.handle_frame(Frame::Event {
            name: "ev".to_string(),
            args: vec![Value::Num(1.0)],
            ack: Some(4),
        });

        match wire.recv().await.unwrap() {
            Frame::Ack { id, args } => {
                assert_eq!(id, 4);
                assert!(parse_ack(args).unwrap().is_err());
            }
            other => panic!("unexpected frame {:?}", other),
        }
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_callback_presence_is_checked() {
        let (protocol, seen) = recording_protocol(&[ArgKind::String, ArgKind::Callback]);
        assert_eq!(
            protocol.dispatch("ev", vec![Value::from("x")], None),
            Err(RpcError::MissingCallback("ev".to_string()))
        );

        let (plain, plain_seen) = recording_protocol(&[ArgKind::String]);
        let (channel, mut wire) = attached(&plain);
        channel.handle_frame(Frame::Event {
            name: "ev".to_string(),
            args: vec![Value::from("x")],
            ack: Some(1),
        });
        match wire.recv().await.unwrap() {
            Frame::Ack { args, .. } => assert!(parse_ack(args).unwrap().is_err()),
            other => panic!("unexpected frame {:?}", other),
        }

        assert!(seen.lock().is_empty());
        assert!(plain_seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_events_dispatch_in_arrival_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let protocol = Arc::new(Protocol::new());
        for name in ["a", "b"] {
            let order = Arc::clone(&order);
            protocol.add_request(name, &[ArgKind::Number], move |args, _| {
                if let [Arg::Num(n)] = args.as_slice() {
                    order.lock().push((name, *n as u32));
                }
            });
        }
        let (channel, _wire) = attached(&protocol);

        for (i, name) in ["a", "b", "a", "b", "b"].iter().enumerate() {
            channel.handle_frame(Frame::Event {
                name: name.to_string(),
                args: vec![Value::Num(i as f64)],
                ack: None,
            });
        }

        assert_eq!(
            *order.lock(),
            vec![("a", 0), ("b", 1), ("a", 2), ("b", 3), ("b", 4)]
        );
    }

    #[test]
    fn test_handle_socket_is_idempotent() {
        let (protocol, _) = recording_protocol(&[]);
        let (channel, _events) = Channel::new();
        assert!(channel.bind(Arc::clone(&protocol)));
        protocol.handle_socket(&channel);
        assert!(!channel.bind(Arc::clone(&protocol)));
    }
}
