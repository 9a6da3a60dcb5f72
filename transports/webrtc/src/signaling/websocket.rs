//! WebSocket signaling channel
//!
//! Connects to a signaling relay over WebSocket. Outbound messages go through
//! an unbounded channel to a writer task, so [`SignalingChannel::send`] can be
//! called from any thread without blocking. Inbound frames are read by
//! [`SignalingReceiver`], which hands text frames (and binary frames decoded
//! as UTF-8) to the engine.

use crate::engine::FanoutEngine;
use crate::transport::SignalingChannel;
use crate::{Error, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Outbound half of a WebSocket signaling connection
pub struct WebSocketSignaling {
    url: String,
    tx: mpsc::UnboundedSender<Message>,
    connected: Arc<AtomicBool>,
}

/// Inbound half of a WebSocket signaling connection
pub struct SignalingReceiver {
    read: SplitStream<WsStream>,
    connected: Arc<AtomicBool>,
}

impl WebSocketSignaling {
    /// Connect to the relay at `url` (ws:// or wss://)
    pub async fn connect(url: &str) -> Result<(Arc<Self>, SignalingReceiver)> {
        info!("Connecting to signaling server: {}", url);

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::WebSocketError(format!("Failed to connect: {}", e)))?;

        info!("Connected to signaling server");

        let (write, read) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));

        tokio::spawn(Self::writer_task(write, rx, Arc::clone(&connected)));

        let channel = Arc::new(Self {
            url: url.to_string(),
            tx,
            connected: Arc::clone(&connected),
        });
        Ok((channel, SignalingReceiver { read, connected }))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Send a close frame; the writer task exits afterwards
    pub fn close(&self) {
        let _ = self.tx.send(Message::Close(None));
    }

    async fn writer_task(
        mut write: SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
        connected: Arc<AtomicBool>,
    ) {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = write.send(msg).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
            if closing {
                break;
            }
        }

        connected.store(false, Ordering::Release);
        debug!("Signaling writer task terminated");
    }
}

impl SignalingChannel for WebSocketSignaling {
    fn send(&self, text: String) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::WebSocketError("Signaling connection closed".to_string()));
        }
        self.tx
            .send(Message::Text(text))
            .map_err(|_| Error::WebSocketError("Signaling writer stopped".to_string()))
    }
}

impl SignalingReceiver {
    /// Next inbound message as text; `None` once the connection ends
    pub async fn next_text(&mut self) -> Option<String> {
        while let Some(msg_result) = self.read.next().await {
            match msg_result {
                Ok(Message::Text(text)) => return Some(text),
                Ok(Message::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => return Some(text),
                    Err(_) => debug!("Ignoring non-UTF-8 binary signaling frame"),
                },
                Ok(Message::Close(_)) => {
                    info!("Signaling connection closed by server");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Signaling connection error: {}", e);
                    break;
                }
            }
        }

        self.connected.store(false, Ordering::Release);
        None
    }

    /// Feed every inbound message to `engine` until the connection ends
    pub async fn run(mut self, engine: Arc<FanoutEngine>) {
        while let Some(text) = self.next_text().await {
            engine.on_signaling_message(&text).await;
        }
        debug!("Signaling receiver terminated");
    }
}
