//! IPC message protocol definitions
//!
//! All messages are JSON-encoded, prefixed with a 4-byte little-endian length.
//! Subscribed clients receive [`Notification`]s interleaved with responses on
//! the same connection; the `type` tags of the two enums never overlap.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::SessionEvent;
use crate::orchestrator::LoopStatus;
use crate::state::RecordingMode;

/// Requests from a client to the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Request current daemon status
    GetStatus,

    /// Ping to check connectivity
    Ping,

    /// Subscribe to session events, overlay updates and responses
    Subscribe,

    /// End the current session (manual stop)
    Stop,

    /// Try to install the key monitor again after granting permission
    RetryKeyMonitor,
}

/// Responses from the daemon to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Current daemon status
    Status(DaemonStatus),

    /// Pong response to ping
    Pong,

    /// Subscription confirmed
    Subscribed,

    /// Stop handled; `was_active` is false when nothing was running
    Stopped { was_active: bool },

    /// Key monitor state after a retry
    KeyMonitor { running: bool },

    /// Error response
    Error { code: String, message: String },
}

impl Response {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Response::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Push notification from daemon to subscribed clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// A session event occurred
    Event { event: SessionEvent },

    /// Show the recording/processing overlay
    OverlayShow {
        mode: RecordingMode,
        screen_capture: bool,
    },

    OverlayHide,

    /// Short result text for the overlay
    OverlayResult { preview: String },

    /// Full model response for the client to apply
    Response {
        session_id: Uuid,
        turn_id: u64,
        text: String,
        focused_app_name: String,
    },
}

/// Full daemon status snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonStatus {
    /// Daemon version
    pub version: String,

    /// Current mode
    pub mode: RecordingMode,

    /// Mode restored once the outstanding turn resolves
    pub resume_mode: Option<RecordingMode>,

    pub session_id: Option<Uuid>,

    pub pending_turn: Option<u64>,

    /// Whether the global key monitor is installed
    pub key_monitor_running: bool,

    /// Uptime in seconds
    pub uptime_secs: u64,
}

impl DaemonStatus {
    pub fn new(status: LoopStatus, uptime_secs: u64) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            mode: status.mode,
            resume_mode: status.resume_mode,
            session_id: status.session_id,
            pending_turn: status.pending_turn,
            key_monitor_running: status.key_monitor_running,
            uptime_secs,
        }
    }
}
