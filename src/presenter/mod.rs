//! Outbound surfaces of a session
//!
//! The overlay and the response consumer are external collaborators. The
//! daemon ships one implementation of each that pushes notifications to
//! subscribed IPC clients, which draw the overlay and apply responses.

use tokio::sync::broadcast;
use tracing::debug;

use crate::ipc::Notification;
use crate::session::TurnResponse;
use crate::state::RecordingMode;

/// Longest preview pushed with a result notification
const PREVIEW_CHARS: usize = 280;

/// Recording/processing overlay
pub trait Presenter: Send + Sync {
    fn show(&self, mode: RecordingMode, screen_capture: bool);
    fn hide(&self);
    fn show_result(&self, preview: &str);
}

/// Consumer of completed model responses
pub trait ResponseHandler: Send + Sync {
    fn handle(&self, response: &TurnResponse);
}

/// Presenter and response handler backed by IPC notifications
#[derive(Clone)]
pub struct IpcPresenter {
    notify_tx: broadcast::Sender<Notification>,
}

impl IpcPresenter {
    pub fn new(notify_tx: broadcast::Sender<Notification>) -> Self {
        Self { notify_tx }
    }

    fn push(&self, notification: Notification) {
        if self.notify_tx.send(notification).is_err() {
            debug!("no IPC subscribers");
        }
    }
}

impl Presenter for IpcPresenter {
    fn show(&self, mode: RecordingMode, screen_capture: bool) {
        self.push(Notification::OverlayShow {
            mode,
            screen_capture,
        });
    }

    fn hide(&self) {
        self.push(Notification::OverlayHide);
    }

    fn show_result(&self, preview: &str) {
        self.push(Notification::OverlayResult {
            preview: preview_of(preview),
        });
    }
}

impl ResponseHandler for IpcPresenter {
    fn handle(&self, response: &TurnResponse) {
        self.push(Notification::Response {
            session_id: response.session_id,
            turn_id: response.turn_id,
            text: response.text.clone(),
            focused_app_name: response.focused_app_name.clone(),
        });
    }
}

/// Truncate on a char boundary
pub fn preview_of(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}…", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}
