//! Bidirectional streaming transport over WebSocket
//!
//! Speaks the Live API JSON protocol: a `setup` message answered by
//! `setupComplete`, `realtimeInput` for media, `clientContent` for text and
//! turn completion, and `serverContent` carrying model parts and the
//! turn-complete flag.

use async_trait::async_trait;
use base64::Engine;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::TransportConfig;

use super::{EventSink, TransportError, TransportEvent, TurnTransport};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct LiveTransport {
    config: TransportConfig,
    sink: Option<SplitSink<WsStream, Message>>,
    reader: Option<JoinHandle<()>>,
}

impl LiveTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            sink: None,
            reader: None,
        }
    }

    fn endpoint(&self) -> String {
        match &self.config.api_key {
            Some(key) => format!("{}?key={}", self.config.url, key),
            None => self.config.url.clone(),
        }
    }

    async fn send_json(&mut self, message: Value) -> Result<(), TransportError> {
        let sink = self.sink.as_mut().ok_or(TransportError::NotConnected)?;
        let text = serde_json::to_string(&message)?;
        sink.send(Message::text(text))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

#[async_trait]
impl TurnTransport for LiveTransport {
    async fn open(&mut self, events: EventSink) -> Result<(), TransportError> {
        if self.sink.is_some() {
            self.close().await;
        }

        // Runs on the event loop, so an unreachable host must not stall it
        let (ws, _response) = timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(self.endpoint()),
        )
        .await
        .map_err(|_| {
            TransportError::Connect(format!(
                "timed out after {}ms",
                self.config.connect_timeout.as_millis()
            ))
        })?
        .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let setup = serde_json::to_string(&setup_message(&self.config))?;
        sink.send(Message::text(setup))
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        // Wait for setupComplete before streaming anything
        let handshake = async {
            while let Some(message) = stream.next().await {
                let message = message.map_err(|e| TransportError::Handshake(e.to_string()))?;
                if let Message::Close(frame) = &message {
                    return Err(TransportError::Handshake(format!("closed during setup: {frame:?}")));
                }
                if !(message.is_text() || message.is_binary()) {
                    continue;
                }
                let parsed: ServerMessage = serde_json::from_slice(&message.into_data())
                    .map_err(|e| TransportError::Handshake(e.to_string()))?;
                if parsed.setup_complete.is_some() {
                    return Ok(());
                }
            }
            Err(TransportError::Handshake("stream ended during setup".to_string()))
        };
        timeout(HANDSHAKE_TIMEOUT, handshake)
            .await
            .map_err(|_| TransportError::Handshake("timed out waiting for setupComplete".to_string()))??;

        self.reader = Some(tokio::spawn(async move {
            let reason = loop {
                let Some(message) = stream.next().await else {
                    break "stream ended".to_string();
                };
                let message = match message {
                    Ok(message) => message,
                    Err(e) => break e.to_string(),
                };
                if let Message::Close(frame) = &message {
                    break format!("closed by server: {frame:?}");
                }
                if !(message.is_text() || message.is_binary()) {
                    continue;
                }
                match decode_server_message(&message.into_data()) {
                    Ok(decoded) => {
                        for event in decoded {
                            if !events.send(event).await {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!(%e, "unparseable server message"),
                }
            };
            debug!(%reason, "transport reader finished");
            events.send(TransportEvent::Closed { reason }).await;
        }));
        self.sink = Some(sink);

        info!(model = %self.config.model, "transport connected");
        Ok(())
    }

    async fn send_content(&mut self, text: &str, turn_complete: bool) -> Result<(), TransportError> {
        self.send_json(client_content(text, turn_complete)).await
    }

    async fn send_turn_complete(&mut self) -> Result<(), TransportError> {
        self.send_json(turn_complete_message()).await
    }

    async fn send_media_chunk(&mut self, data: &[u8], mime_type: &str) -> Result<(), TransportError> {
        self.send_json(media_chunk(data, mime_type)).await
    }

    async fn close(&mut self) {
        // Stop the reader first so our own close reply is never reported
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(mut sink) = self.sink.take() {
            let _ = sink.close().await;
        }
        debug!("transport closed");
    }
}

fn setup_message(config: &TransportConfig) -> Value {
    let mut setup = json!({
        "model": config.model,
        "generationConfig": { "responseModalities": ["TEXT"] },
    });
    if let Some(instruction) = &config.system_instruction {
        setup["systemInstruction"] = json!({ "parts": [{ "text": instruction }] });
    }
    json!({ "setup": setup })
}

fn client_content(text: &str, turn_complete: bool) -> Value {
    if text.is_empty() {
        return json!({ "clientContent": { "turnComplete": turn_complete } });
    }
    json!({
        "clientContent": {
            "turns": [{ "role": "user", "parts": [{ "text": text }] }],
            "turnComplete": turn_complete,
        }
    })
}

fn turn_complete_message() -> Value {
    json!({ "clientContent": { "turnComplete": true } })
}

fn media_chunk(data: &[u8], mime_type: &str) -> Value {
    let encoded = base64::engine::general_purpose::STANDARD.encode(data);
    json!({
        "realtimeInput": {
            "mediaChunks": [{ "mimeType": mime_type, "data": encoded }]
        }
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<Value>,
    server_content: Option<ServerContent>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelContent>,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ModelContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
struct Part {
    text: Option<String>,
}

/// Map one server frame to transport events (parts before completion)
fn decode_server_message(data: &[u8]) -> Result<Vec<TransportEvent>, serde_json::Error> {
    let message: ServerMessage = serde_json::from_slice(data)?;
    let mut events = Vec::new();
    if let Some(content) = message.server_content {
        if let Some(turn) = content.model_turn {
            let parts: Vec<String> = turn.parts.into_iter().filter_map(|p| p.text).collect();
            if !parts.is_empty() {
                events.push(TransportEvent::ModelTurn(parts));
            }
        }
        if content.turn_complete {
            events.push(TransportEvent::TurnComplete);
        }
    }
    Ok(events)
}
