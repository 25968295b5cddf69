//! Events module for the session event bus
//!
//! Every mode transition and every turn outcome is published as a
//! [`SessionEvent`] on a broadcast channel. The IPC server forwards them to
//! subscribed clients; nothing in the core consumes them for control flow.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::RecordingMode;

/// Events emitted by the state machine and the session controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A recording mode became active
    RecordingStarted { mode: RecordingMode },

    /// The session returned to Idle
    RecordingStopped {
        /// The active variant the session ended in
        mode: RecordingMode,
        /// Duration in milliseconds that the session was active
        duration_ms: u64,
    },

    /// Hold upgraded to multimodal or downgraded to speech-only
    ModeChanged {
        from: RecordingMode,
        to: RecordingMode,
    },

    /// A turn was committed and a response is outstanding
    ProcessingStarted { resume: RecordingMode },

    /// The outstanding turn resolved
    ProcessingFinished { resumed: RecordingMode },

    /// Screen capture was switched on mid-session
    ScreenCaptureUpgraded { session_id: Uuid },

    /// Video capture failed; the session continues with audio only
    CaptureDegraded { reason: String },

    TurnCommitted { session_id: Uuid, turn_id: u64 },

    TurnCompleted {
        session_id: Uuid,
        turn_id: u64,
        response_chars: usize,
    },

    TurnTimedOut { session_id: Uuid, turn_id: u64 },

    /// Malformed or out-of-order exchange with the transport
    ProtocolViolation { reason: String },

    /// A session could not start or was torn down early
    SessionAborted { reason: String },

    /// A permission the daemon cannot acquire itself is missing
    PermissionRequired { reason: String },
}

impl std::fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::RecordingStarted { mode } => write!(f, "RECORDING_STARTED ({mode})"),
            SessionEvent::RecordingStopped { mode, duration_ms } => {
                write!(f, "RECORDING_STOPPED ({mode}, {duration_ms}ms)")
            }
            SessionEvent::ModeChanged { from, to } => write!(f, "MODE_CHANGED ({from} -> {to})"),
            SessionEvent::ProcessingStarted { resume } => {
                write!(f, "PROCESSING_STARTED (resume {resume})")
            }
            SessionEvent::ProcessingFinished { resumed } => {
                write!(f, "PROCESSING_FINISHED ({resumed})")
            }
            SessionEvent::ScreenCaptureUpgraded { .. } => write!(f, "SCREEN_CAPTURE_UPGRADED"),
            SessionEvent::CaptureDegraded { reason } => write!(f, "CAPTURE_DEGRADED ({reason})"),
            SessionEvent::TurnCommitted { turn_id, .. } => write!(f, "TURN_COMMITTED (#{turn_id})"),
            SessionEvent::TurnCompleted {
                turn_id,
                response_chars,
                ..
            } => write!(f, "TURN_COMPLETED (#{turn_id}, {response_chars} chars)"),
            SessionEvent::TurnTimedOut { turn_id, .. } => write!(f, "TURN_TIMED_OUT (#{turn_id})"),
            SessionEvent::ProtocolViolation { reason } => {
                write!(f, "PROTOCOL_VIOLATION ({reason})")
            }
            SessionEvent::SessionAborted { reason } => write!(f, "SESSION_ABORTED ({reason})"),
            SessionEvent::PermissionRequired { reason } => {
                write!(f, "PERMISSION_REQUIRED ({reason})")
            }
        }
    }
}
