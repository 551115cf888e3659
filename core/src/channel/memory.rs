//! In-process connector that pipes frames straight into a [`SignalServer`]

use super::{Channel, ChannelError, ChannelEvent, ChannelEvents, Connector};
use crate::relay::protocol::Frame;
use crate::relay::server::SignalServer;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Connects channels to an in-process hub. [`MemoryConnector::drop_connection`]
/// cuts every live link and reconnects it, the way a network blip would.
#[derive(Clone)]
pub struct MemoryConnector {
    server: Option<Arc<SignalServer>>,
    links: Arc<Mutex<Vec<mpsc::UnboundedSender<()>>>>,
}

impl MemoryConnector {
    pub fn new(server: Arc<SignalServer>) -> Self {
        Self {
            server: Some(server),
            links: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A connector whose server can never be reached
    pub fn unreachable() -> Self {
        Self {
            server: None,
            links: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Drop and re-establish every live link made by this connector
    pub fn drop_connection(&self) {
        self.links.lock().retain(|reset| reset.send(()).is_ok());
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<(Channel, ChannelEvents), ChannelError> {
        let server = self
            .server
            .clone()
            .ok_or_else(|| ChannelError::ConnectFailed(format!("{} unreachable", url)))?;

        let (from_server_tx, from_server) = mpsc::unbounded_channel();
        let conn = server
            .connect(from_server_tx)
            .map_err(|e| ChannelError::ConnectFailed(e.to_string()))?;

        let (channel, events) = Channel::new();
        let (tx, outbound) = mpsc::unbounded_channel();
        channel.attach(tx);
        channel.notify(ChannelEvent::Connect);

        let (reset_tx, reset) = mpsc::unbounded_channel();
        self.links.lock().push(reset_tx);

        tokio::spawn(run_link(
            channel.clone(),
            server,
            Link {
                conn,
                outbound,
                from_server,
            },
            reset,
        ));
        Ok((channel, events))
    }
}

struct Link {
    conn: u64,
    outbound: mpsc::UnboundedReceiver<Frame>,
    from_server: mpsc::UnboundedReceiver<Frame>,
}

async fn run_link(
    channel: Channel,
    server: Arc<SignalServer>,
    mut link: Link,
    mut reset: mpsc::UnboundedReceiver<()>,
) {
    loop {
        tokio::select! {
            frame = link.outbound.recv() => match frame {
                Some(frame) => server.handle_frame(link.conn, frame),
                None => {
                    debug!("Memory link {} closed", link.conn);
                    server.disconnect(link.conn);
                    return;
                }
            },
            frame = link.from_server.recv() => match frame {
                Some(frame) => channel.handle_frame(frame),
                None => {
                    channel.disconnect();
                    return;
                }
            },
            Some(()) = reset.recv() => {
                channel.detach();
                server.disconnect(link.conn);

                let (from_server_tx, from_server) = mpsc::unbounded_channel();
                let conn = match server.connect(from_server_tx) {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Memory link could not reconnect: {}", e);
                        channel.notify(ChannelEvent::Error(e.to_string()));
                        channel.disconnect();
                        return;
                    }
                };
                let (tx, outbound) = mpsc::unbounded_channel();
                channel.attach(tx);
                link = Link { conn, outbound, from_server };
                debug!("Memory link reconnected as {}", conn);
                channel.notify(ChannelEvent::Reconnect);
            },
        }
    }
}
