use std::time::Instant;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::state::RecordingMode;

/// Monotonic identifier of a committed turn
pub type TurnId = u64;

/// Everything captured at session start
///
/// The focus snapshot is read once and never refreshed. The screen flag
/// is fixed for the session except for the single audited upgrade in
/// [`SessionContext::upgrade_screen_capture`].
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub id: Uuid,
    /// Active mode the session is currently in
    pub mode: RecordingMode,
    pub is_toggle_mode: bool,
    pub enable_screen_capture: bool,
    pub selected_text_snapshot: String,
    pub focused_app_name: String,
    /// Key event time that began the session
    pub started_at: Instant,
    screen_upgraded: bool,
}

impl SessionContext {
    pub fn new(
        mode: RecordingMode,
        selected_text_snapshot: String,
        focused_app_name: String,
        started_at: Instant,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            mode,
            is_toggle_mode: mode.is_toggle(),
            enable_screen_capture: mode.wants_screen(),
            selected_text_snapshot,
            focused_app_name,
            started_at,
            screen_upgraded: false,
        }
    }

    /// Turn screen capture on mid-session. Allowed once, false to true only.
    pub fn upgrade_screen_capture(&mut self) -> bool {
        if self.enable_screen_capture || self.screen_upgraded {
            return false;
        }
        self.enable_screen_capture = true;
        self.screen_upgraded = true;
        true
    }

    pub fn screen_upgraded(&self) -> bool {
        self.screen_upgraded
    }
}

/// A committed turn waiting for the model
#[derive(Debug)]
pub struct PendingTurn {
    pub session_id: Uuid,
    pub turn_id: TurnId,
    pub committed_at: Instant,
    timeout: JoinHandle<()>,
}

impl PendingTurn {
    pub fn new(session_id: Uuid, turn_id: TurnId, timeout: JoinHandle<()>) -> Self {
        Self {
            session_id,
            turn_id,
            committed_at: Instant::now(),
            timeout,
        }
    }

    /// Clear the response timer
    pub fn cancel(self) {
        self.timeout.abort();
    }
}

/// A completed model response
#[derive(Debug, Clone, PartialEq)]
pub struct TurnResponse {
    pub session_id: Uuid,
    pub turn_id: TurnId,
    pub text: String,
    /// App that had focus when the session began
    pub focused_app_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_flags_follow_mode() {
        let now = Instant::now();
        let hold = SessionContext::new(RecordingMode::SttHold, String::new(), String::new(), now);
        assert!(!hold.is_toggle_mode);
        assert!(!hold.enable_screen_capture);

        let toggle = SessionContext::new(
            RecordingMode::MultimodalToggle,
            "sel".to_string(),
            "Editor".to_string(),
            now,
        );
        assert!(toggle.is_toggle_mode);
        assert!(toggle.enable_screen_capture);
        assert_ne!(hold.id, toggle.id);
    }

    #[test]
    fn test_screen_upgrade_happens_once() {
        let mut ctx = SessionContext::new(
            RecordingMode::SttHold,
            String::new(),
            String::new(),
            Instant::now(),
        );
        assert!(ctx.upgrade_screen_capture());
        assert!(ctx.enable_screen_capture);
        assert!(ctx.screen_upgraded());
        assert!(!ctx.upgrade_screen_capture());

        let mut multimodal = SessionContext::new(
            RecordingMode::MultimodalHold,
            String::new(),
            String::new(),
            Instant::now(),
        );
        assert!(!multimodal.upgrade_screen_capture());
        assert!(!multimodal.screen_upgraded());
    }
}
