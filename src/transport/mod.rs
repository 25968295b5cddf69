//! Turn-based AI transport boundary
//!
//! The controller streams media into the transport continuously and closes
//! each command with a two-phase send: content first, then an explicit
//! turn-completion signal. Inbound model output arrives as
//! [`TransportEvent`]s through the [`EventSink`] handed to
//! [`TurnTransport::open`], stamped with the connection that produced them.

mod live;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use live::LiveTransport;

/// Inbound events from the model side
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Text parts of a (partial) model turn
    ModelTurn(Vec<String>),
    /// The model finished its turn
    TurnComplete,
    /// The connection ended
    Closed { reason: String },
}

/// One `open` of a transport. Events tagged with an older id are stale.
pub type ConnectionId = u64;

/// Inbound event with the connection it came from
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub connection: ConnectionId,
    pub event: TransportEvent,
}

/// Delivery handle for one connection's inbound events
#[derive(Debug, Clone)]
pub struct EventSink {
    connection: ConnectionId,
    tx: mpsc::Sender<Inbound>,
}

impl EventSink {
    pub fn new(connection: ConnectionId, tx: mpsc::Sender<Inbound>) -> Self {
        Self { connection, tx }
    }

    /// Deliver one event; false once the receiving side is gone
    pub async fn send(&self, event: TransportEvent) -> bool {
        let inbound = Inbound {
            connection: self.connection,
            event,
        };
        self.tx.send(inbound).await.is_ok()
    }
}

/// Errors that can occur talking to the transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("setup handshake failed: {0}")]
    Handshake(String),

    #[error("failed to send: {0}")]
    Send(String),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait TurnTransport: Send {
    /// Connect and start delivering inbound events to `events`
    async fn open(&mut self, events: EventSink) -> Result<(), TransportError>;

    /// Send text content, optionally closing the turn
    async fn send_content(&mut self, text: &str, turn_complete: bool) -> Result<(), TransportError>;

    /// Close the current turn without further content
    async fn send_turn_complete(&mut self) -> Result<(), TransportError> {
        self.send_content("", true).await
    }

    /// Stream one chunk of realtime media
    async fn send_media_chunk(&mut self, data: &[u8], mime_type: &str) -> Result<(), TransportError>;

    /// Disconnect; no further events are delivered for this connection
    async fn close(&mut self);
}
