//! Control channel: one persistent, message-oriented link to a signaling server
//!
//! A [`Channel`] is the shared core every connector drives: it numbers and
//! tracks outbound acknowledgements, demultiplexes sub-channel traffic by
//! [`StreamId`], and dispatches inbound events through the bound
//! [`Protocol`] in arrival order. Connectors only move [`Frame`]s: they
//! `attach` an outbound pipe, feed inbound frames to `handle_frame`, and
//! `detach` when the link drops.

pub mod memory;
pub mod ws;

use crate::relay::protocol::{ack_err, ack_ok, Frame, StreamId, Value};
use crate::transport::rpc::Protocol;
use async_trait::async_trait;
use futures::Stream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

pub use memory::MemoryConnector;
pub use ws::WsConnector;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Connection failed: {0}")]
    ConnectFailed(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Sub-channel closed")]
    Closed,
    #[error("Disconnected before acknowledgement")]
    AckLost,
}

/// Lifecycle signals raised by the channel collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Link established
    Connect,
    /// Link could not be established
    ConnectError(String),
    /// Link-level error
    Error(String),
    /// Link re-established after an unexpected drop
    Reconnect,
    /// Link is gone for good
    Disconnect,
}

/// Receiving half of a channel's lifecycle signals
pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

/// Opens control channels to signaling servers
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `url`; resolves once the first link is up
    async fn connect(&self, url: &str) -> Result<(Channel, ChannelEvents), ChannelError>;
}

struct ChannelInner {
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    next_ack: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Vec<Value>>>>,
    streams: Mutex<HashMap<StreamId, mpsc::UnboundedSender<Vec<u8>>>>,
    protocol: Mutex<Option<Arc<Protocol>>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    closed: AtomicBool,
}

/// Cloneable handle to a control channel
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Create a detached channel and the receiver for its lifecycle signals
    pub fn new() -> (Self, ChannelEvents) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let channel = Self {
            inner: Arc::new(ChannelInner {
                outbound: Mutex::new(None),
                next_ack: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                streams: Mutex::new(HashMap::new()),
                protocol: Mutex::new(None),
                events,
                closed: AtomicBool::new(false),
            }),
        };
        (channel, events_rx)
    }

    /// Install the outbound pipe of a freshly established link
    pub fn attach(&self, outbound: mpsc::UnboundedSender<Frame>) {
        *self.inner.outbound.lock() = Some(outbound);
    }

    /// Drop the current link: pending acknowledgements are lost and every
    /// open source ends.
    pub fn detach(&self) {
        self.inner.outbound.lock().take();
        let lost = {
            let mut pending = self.inner.pending.lock();
            let lost = pending.len();
            pending.clear();
            lost
        };
        self.inner.streams.lock().clear();
        if lost > 0 {
            debug!("Link dropped with {} acknowledgements outstanding", lost);
        }
    }

    /// Tear the channel down; no reconnection follows
    pub fn disconnect(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.detach();
        self.notify(ChannelEvent::Disconnect);
    }

    /// Whether the owner tore the channel down
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Whether a link is currently attached
    pub fn is_connected(&self) -> bool {
        self.inner.outbound.lock().is_some()
    }

    /// Raise a lifecycle signal to the channel owner
    pub fn notify(&self, event: ChannelEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Bind the request table inbound events are dispatched through.
    /// Returns `false` when that table was already bound.
    pub(crate) fn bind(&self, protocol: Arc<Protocol>) -> bool {
        let mut bound = self.inner.protocol.lock();
        if let Some(existing) = bound.as_ref() {
            if Arc::ptr_eq(existing, &protocol) {
                return false;
            }
            warn!("Replacing request table bound to control channel");
        }
        *bound = Some(protocol);
        true
    }

    /// Number of sources currently registered
    pub fn open_sources(&self) -> usize {
        self.inner.streams.lock().len()
    }

    fn send_frame(&self, frame: Frame) -> Result<(), ChannelError> {
        let outbound = self.inner.outbound.lock();
        match outbound.as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| ChannelError::NotConnected),
            None => Err(ChannelError::NotConnected),
        }
    }

    /// Fire-and-forget event
    pub fn emit(&self, name: &str, args: Vec<Value>) -> Result<(), ChannelError> {
        self.send_frame(Frame::Event {
            name: name.to_string(),
            args,
            ack: None,
        })
    }

    /// Event with a one-shot acknowledgement; resolves with the raw ack
    /// arguments, or [`ChannelError::AckLost`] if the link drops first.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Vec<Value>, ChannelError> {
        let id = self.inner.next_ack.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id, tx);

        let sent = self.send_frame(Frame::Event {
            name: name.to_string(),
            args,
            ack: Some(id),
        });
        if let Err(e) = sent {
            self.inner.pending.lock().remove(&id);
            return Err(e);
        }

        rx.await.map_err(|_| ChannelError::AckLost)
    }

    /// Outbound half of a sub-channel
    pub fn open_sink(&self, stream: StreamId) -> SubSink {
        SubSink {
            channel: self.clone(),
            stream,
            ended: false,
        }
    }

    /// Inbound half of a sub-channel; frames for `stream` are queued from now on
    pub fn open_source(&self, stream: StreamId) -> SubSource {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.streams.lock().insert(stream, tx);
        SubSource {
            channel: self.clone(),
            stream,
            rx,
        }
    }

    fn close_source(&self, stream: &StreamId) {
        self.inner.streams.lock().remove(stream);
    }

    /// Process one inbound frame
    pub fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Event { name, args, ack } => {
                let responder = ack.map(|id| Responder {
                    channel: self.clone(),
                    id,
                });
                let protocol = self.inner.protocol.lock().clone();
                match protocol {
                    Some(protocol) => {
                        let _ = protocol.dispatch(&name, args, responder);
                    }
                    None => {
                        warn!("Dropping event '{}': no request table bound", name);
                        if let Some(responder) = responder {
                            responder.reject("no handler bound");
                        }
                    }
                }
            }
            Frame::Ack { id, args } => {
                let waiter = self.inner.pending.lock().remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(args);
                    }
                    None => debug!("Ignoring late or duplicate acknowledgement {}", id),
                }
            }
            Frame::Data { stream, payload } => {
                let streams = self.inner.streams.lock();
                match streams.get(&stream) {
                    Some(tx) => {
                        let _ = tx.send(payload);
                    }
                    None => debug!("Dropping {} bytes for unknown stream {}", payload.len(), stream),
                }
            }
            Frame::End { stream } => {
                if self.inner.streams.lock().remove(&stream).is_some() {
                    debug!("Stream {} ended by remote", stream);
                }
            }
        }
    }
}

/// One-shot reply slot for an inbound event that asked for acknowledgement
pub struct Responder {
    channel: Channel,
    id: u64,
}

impl Responder {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Send the acknowledgement; consumes the slot so it can fire only once
    pub fn reply(self, args: Vec<Value>) {
        if let Err(e) = self.channel.send_frame(Frame::Ack { id: self.id, args }) {
            debug!("Acknowledgement {} not delivered: {}", self.id, e);
        }
    }

    pub fn accept(self) {
        self.reply(ack_ok(Vec::new()))
    }

    pub fn reject(self, message: impl Into<String>) {
        self.reply(ack_err(message))
    }
}

/// Outbound half of a sub-channel. Dropping it ends the stream.
pub struct SubSink {
    channel: Channel,
    stream: StreamId,
    ended: bool,
}

impl SubSink {
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    /// Write one chunk; chunks arrive in the order they were sent
    pub fn send(&mut self, payload: Vec<u8>) -> Result<(), ChannelError> {
        if self.ended {
            return Err(ChannelError::Closed);
        }
        self.channel.send_frame(Frame::Data {
            stream: self.stream,
            payload,
        })
    }

    /// Signal end-of-stream to the remote side
    pub fn end(&mut self) {
        if !self.ended {
            self.ended = true;
            let _ = self.channel.send_frame(Frame::End {
                stream: self.stream,
            });
        }
    }

    /// Release without telling the remote (the stream was never established)
    pub(crate) fn discard(mut self) {
        self.ended = true;
    }
}

impl Drop for SubSink {
    fn drop(&mut self) {
        self.end();
    }
}

/// Inbound half of a sub-channel. Yields chunks in arrival order and ends
/// when the remote ends the stream or the link drops.
pub struct SubSource {
    channel: Channel,
    stream: StreamId,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl SubSource {
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

impl Stream for SubSource {
    type Item = Vec<u8>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for SubSource {
    fn drop(&mut self) {
        self.channel.close_source(&self.stream);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::protocol::{parse_ack, DialId};

    fn attached() -> (Channel, ChannelEvents, mpsc::UnboundedReceiver<Frame>) {
        let (channel, events) = Channel::new();
        let (tx, rx) = mpsc::unbounded_channel();
        channel.attach(tx);
        (channel, events, rx)
    }

    #[tokio::test]
    async fn test_call_resolves_with_ack() {
        let (channel, _events, mut wire) = attached();

        let caller = channel.clone();
        let call = tokio::spawn(async move { caller.call("ss-join", vec![Value::from("a")]).await });

        let id = match wire.recv().await.unwrap() {
            Frame::Event { name, ack, .. } => {
                assert_eq!(name, "ss-join");
                ack.expect("call must request an ack")
            }
            other => panic!("unexpected frame {:?}", other),
        };
        channel.handle_frame(Frame::Ack {
            id,
            args: ack_ok(vec![]),
        });

        let args = call.await.unwrap().unwrap();
        assert_eq!(parse_ack(args).unwrap(), Ok(vec![]));
    }

    #[tokio::test]
    async fn test_duplicate_ack_is_ignored() {
        let (channel, _events, mut wire) = attached();
        let caller = channel.clone();
        let call = tokio::spawn(async move { caller.call("x", vec![]).await });

        let id = match wire.recv().await.unwrap() {
            Frame::Event { ack: Some(id), .. } => id,
            other => panic!("unexpected frame {:?}", other),
        };
        channel.handle_frame(Frame::Ack {
            id,
            args: ack_err("first"),
        });
        channel.handle_frame(Frame::Ack {
            id,
            args: ack_err("second"),
        });

        let args = call.await.unwrap().unwrap();
        assert_eq!(parse_ack(args).unwrap(), Err("first".to_string()));
    }

    #[tokio::test]
    async fn test_detach_fails_pending_calls() {
        let (channel, _events, mut wire) = attached();
        let caller = channel.clone();
        let call = tokio::spawn(async move { caller.call("x", vec![]).await });

        let _ = wire.recv().await.unwrap();
        channel.detach();

        assert_eq!(call.await.unwrap(), Err(ChannelError::AckLost));
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn test_call_without_link_fails_fast() {
        let (channel, _events) = Channel::new();
        assert_eq!(
            channel.call("x", vec![]).await,
            Err(ChannelError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_source_receives_in_order_and_ends() {
        let (channel, _events, _wire) = attached();
        let stream = StreamId::dialer(DialId::generate());
        let mut source = channel.open_source(stream);

        for i in 0..3u8 {
            channel.handle_frame(Frame::Data {
                stream,
                payload: vec![i],
            });
        }
        channel.handle_frame(Frame::End { stream });

        assert_eq!(source.recv().await, Some(vec![0]));
        assert_eq!(source.recv().await, Some(vec![1]));
        assert_eq!(source.recv().await, Some(vec![2]));
        assert_eq!(source.recv().await, None);
    }

    #[tokio::test]
    async fn test_sink_ends_on_drop() {
        let (channel, _events, mut wire) = attached();
        let stream = StreamId::listener(DialId::generate());

        let mut sink = channel.open_sink(stream);
        sink.send(b"hi".to_vec()).unwrap();
        drop(sink);

        assert_eq!(
            wire.recv().await.unwrap(),
            Frame::Data {
                stream,
                payload: b"hi".to_vec()
            }
        );
        assert_eq!(wire.recv().await.unwrap(), Frame::End { stream });
    }

    #[tokio::test]
    async fn test_discarded_sink_stays_silent() {
        let (channel, _events, mut wire) = attached();
        let sink = channel.open_sink(StreamId::dialer(DialId::generate()));
        sink.discard();
        channel.emit("marker", vec![]).unwrap();

        match wire.recv().await.unwrap() {
            Frame::Event { name, .. } => assert_eq!(name, "marker"),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unbound_event_with_ack_is_rejected() {
        let (channel, _events, mut wire) = attached();
        channel.handle_frame(Frame::Event {
            name: "ws-peer".to_string(),
            args: vec![],
            ack: Some(9),
        });

        match wire.recv().await.unwrap() {
            Frame::Ack { id, args } => {
                assert_eq!(id, 9);
                assert!(parse_ack(args).unwrap().is_err());
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (channel, mut events, _wire) = attached();
        channel.disconnect();
        channel.disconnect();

        assert!(channel.is_closed());
        assert_eq!(events.recv().await, Some(ChannelEvent::Disconnect));
        assert!(events.try_recv().is_err());
    }
}
