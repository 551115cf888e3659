//! WebSocket front end for the signaling hub

use super::SignalServer;
use crate::relay::protocol::Frame;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Accept WebSocket connections on `listener` forever, feeding each into `server`
pub async fn serve(listener: TcpListener, server: Arc<SignalServer>) -> std::io::Result<()> {
    if let Ok(local) = listener.local_addr() {
        info!("Signaling server listening on {}", local);
    }

    loop {
        let (stream, peer) = listener.accept().await?;
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, server).await {
                debug!("Connection from {} ended with error: {}", peer, e);
            }
        });
    }
}

/// Bind `addr` and run [`serve`] in the background; returns the bound address
pub async fn spawn_server(
    addr: &str,
    server: Arc<SignalServer>,
) -> std::io::Result<(SocketAddr, JoinHandle<std::io::Result<()>>)> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    Ok((local, tokio::spawn(serve(listener, server))))
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    server: Arc<SignalServer>,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let ws_stream = accept_async(stream).await?;
    let (mut write, mut read) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let conn = match server.connect(tx) {
        Ok(conn) => conn,
        Err(e) => {
            warn!("Refusing {}: {}", peer, e);
            let _ = write.send(Message::Close(None)).await;
            return Ok(());
        }
    };
    debug!("Connection {} from {}", conn, peer);

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let bytes = match frame.to_bytes() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Failed to encode {} frame: {}", frame.frame_type(), e);
                    continue;
                }
            };
            if write.send(Message::Binary(bytes)).await.is_err() {
                break;
            }
        }
        let _ = write.close().await;
    });

    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Binary(data)) => match Frame::from_bytes(&data) {
                Ok(frame) => server.handle_frame(conn, frame),
                Err(e) => warn!("Malformed frame from {}: {}", peer, e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                server.disconnect(conn);
                let _ = writer.await;
                return Err(e);
            }
        }
    }

    // Dropping the hub's sender lets the writer drain and close
    server.disconnect(conn);
    let _ = writer.await;
    Ok(())
}
