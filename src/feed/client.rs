//! Tick feed connection
//!
//! Wraps one tungstenite stream. Incoming frames are sorted by [`classify`]
//! so the manager only ever sees payload text or a hint that the link is
//! alive.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What one read from the feed produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedFrame {
    /// Payload to hand to the parser
    Data(String),
    /// Ping, pong or raw frame; the link is alive but carried no payload
    Control,
}

#[derive(Debug, PartialEq, Eq)]
enum Incoming {
    Frame(FeedFrame),
    /// Ping that must be answered with this pong payload
    Pong(Vec<u8>),
    Closed(String),
}

fn classify(message: Message) -> Incoming {
    match message {
        Message::Text(text) => Incoming::Frame(FeedFrame::Data(text)),
        Message::Binary(data) => match String::from_utf8(data) {
            Ok(text) => Incoming::Frame(FeedFrame::Data(text)),
            Err(e) => {
                warn!(bytes = e.as_bytes().len(), "Dropping non UTF-8 binary frame");
                Incoming::Frame(FeedFrame::Control)
            }
        },
        Message::Ping(payload) => Incoming::Pong(payload),
        Message::Pong(_) | Message::Frame(_) => Incoming::Frame(FeedFrame::Control),
        Message::Close(frame) => Incoming::Closed(match frame {
            Some(frame) => format!("closed by feed: {} {}", frame.code, frame.reason),
            None => "closed by feed".to_string(),
        }),
    }
}

/// Request sent right after connecting
fn subscription_message(symbols: &[String]) -> String {
    serde_json::json!({
        "type": "subscribe",
        "symbols": symbols,
    })
    .to_string()
}

pub struct WebSocketClient {
    stream: Option<WsStream>,
    endpoint: String,
    symbols: Vec<String>,
}

impl WebSocketClient {
    pub fn new(endpoint: &str, symbols: Vec<String>) -> Self {
        Self {
            stream: None,
            endpoint: endpoint.to_string(),
            symbols,
        }
    }

    /// Open the connection and subscribe to the configured symbols
    pub async fn connect(&mut self) -> Result<()> {
        info!(url = %self.endpoint, symbols = ?self.symbols, "Connecting to tick feed");

        let (mut stream, response) = connect_async(self.endpoint.as_str())
            .await
            .map_err(|e| CoreError::WebSocketConnection(format!("Failed to connect: {}", e)))?;
        stream
            .send(Message::Text(subscription_message(&self.symbols)))
            .await?;

        info!(status = ?response.status(), "Tick feed connected and subscribed");
        self.stream = Some(stream);
        Ok(())
    }

    /// Wait for the next frame. Any failure or close drops the stream, so
    /// the caller has to [`connect`](Self::connect) again.
    pub async fn recv(&mut self) -> Result<FeedFrame> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| CoreError::WebSocketConnection("Not connected".to_string()))?;

        let incoming = match stream.next().await {
            Some(Ok(message)) => classify(message),
            Some(Err(e)) => {
                self.stream = None;
                return Err(CoreError::WebSocketMessage(e.to_string()));
            }
            None => Incoming::Closed("stream ended".to_string()),
        };

        match incoming {
            Incoming::Frame(frame) => Ok(frame),
            Incoming::Pong(payload) => {
                debug!("Answering feed ping");
                stream
                    .send(Message::Pong(payload))
                    .await
                    .map_err(|e| CoreError::WebSocketMessage(e.to_string()))?;
                Ok(FeedFrame::Control)
            }
            Incoming::Closed(reason) => {
                warn!(reason = %reason, "Tick feed closed");
                self.stream = None;
                Err(CoreError::WebSocketConnection(reason))
            }
        }
    }

    /// Keepalive; a no-op while disconnected
    pub async fn ping(&mut self) -> Result<()> {
        match self.stream.as_mut() {
            Some(stream) => stream
                .send(Message::Ping(Vec::new()))
                .await
                .map_err(|e| CoreError::WebSocketMessage(e.to_string())),
            None => Ok(()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.close(None).await {
                debug!(error = %e, "Tick feed close handshake failed");
            }
        }
    }
}
