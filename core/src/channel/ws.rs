//! WebSocket connector with automatic reconnection

use super::{Channel, ChannelError, ChannelEvent, ChannelEvents, Connector};
use crate::config::TransportConfig;
use crate::relay::protocol::Frame;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens control channels over WebSocket; an unexpected drop is retried with
/// exponential backoff up to `max_reconnect_attempts`.
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    config: TransportConfig,
}

impl WsConnector {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<(Channel, ChannelEvents), ChannelError> {
        let ws = open(url).await?;
        let (channel, events) = Channel::new();

        let (tx, rx) = mpsc::unbounded_channel();
        channel.attach(tx);
        channel.notify(ChannelEvent::Connect);
        info!("Connected to {}", url);

        tokio::spawn(drive(channel.clone(), url.to_string(), self.config.clone(), ws, rx));
        Ok((channel, events))
    }
}

async fn open(url: &str) -> Result<WsStream, ChannelError> {
    connect_async(url)
        .await
        .map(|(ws, _)| ws)
        .map_err(|e| ChannelError::ConnectFailed(e.to_string()))
}

/// Own the link for the channel's whole life, reconnecting after drops
async fn drive(
    channel: Channel,
    url: String,
    config: TransportConfig,
    mut ws: WsStream,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
) {
    loop {
        let reason = pump(&channel, ws, outbound).await;
        channel.detach();
        if channel.is_closed() {
            debug!("Control channel to {} closed", url);
            return;
        }
        warn!("Control channel to {} dropped: {}", url, reason);

        let mut attempt = 0u32;
        ws = loop {
            if attempt >= config.max_reconnect_attempts {
                let msg = format!("Reconnection to {} failed after {} attempts", url, attempt);
                warn!("{}", msg);
                channel.notify(ChannelEvent::Error(msg));
                channel.disconnect();
                return;
            }
            tokio::time::sleep(config.backoff_duration(attempt)).await;
            attempt += 1;
            if channel.is_closed() {
                return;
            }
            match open(&url).await {
                Ok(ws) => break ws,
                Err(e) => debug!("Reconnect attempt {} to {} failed: {}", attempt, url, e),
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        channel.attach(tx);
        outbound = rx;
        info!("Reconnected to {} after {} attempts", url, attempt);
        channel.notify(ChannelEvent::Reconnect);
    }
}

/// Move frames both ways until the link ends; returns why it ended
async fn pump(channel: &Channel, ws: WsStream, mut outbound: mpsc::UnboundedReceiver<Frame>) -> String {
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => match frame.to_bytes() {
                    Ok(bytes) => {
                        if let Err(e) = write.send(Message::Binary(bytes)).await {
                            return e.to_string();
                        }
                    }
                    Err(e) => warn!("Failed to encode {} frame: {}", frame.frame_type(), e),
                },
                None => {
                    let _ = write.close().await;
                    return "closed locally".to_string();
                }
            },
            msg = read.next() => match msg {
                Some(Ok(Message::Binary(data))) => match Frame::from_bytes(&data) {
                    Ok(frame) => channel.handle_frame(frame),
                    Err(e) => warn!("Malformed frame from server: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => return "closed by server".to_string(),
                Some(Ok(_)) => {}
                Some(Err(e)) => return e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_server_fails_fast() {
        let connector = WsConnector::default();
        // Port 9 on loopback is discard; nothing listens in test environments
        let result = connector.connect("ws://127.0.0.1:9").await;
        assert!(matches!(result, Err(ChannelError::ConnectFailed(_))));
    }
}
