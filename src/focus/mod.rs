//! Point-in-time snapshot of the focused application
//!
//! Read once per session, before any capture device starts, so the editor
//! that owns the selection still has focus.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

/// Source of the selected text and the frontmost application's name
#[async_trait]
pub trait FocusSnapshot: Send + Sync {
    /// Selected text in the focused UI element, empty if none
    async fn selected_text(&self) -> String;

    /// Name of the frontmost application, empty if unknown
    async fn focused_app_name(&self) -> String;
}

const SCRIPT_TIMEOUT: Duration = Duration::from_secs(1);

const FRONT_APP_SCRIPT: &str =
    r#"tell application "System Events" to get name of first application process whose frontmost is true"#;

const SELECTED_TEXT_SCRIPT: &str = r#"tell application "System Events"
    set frontApp to first application process whose frontmost is true
    try
        return value of attribute "AXSelectedText" of (value of attribute "AXFocusedUIElement" of frontApp)
    on error
        return ""
    end try
end tell"#;

/// Reads focus through the Accessibility API via `osascript`
#[derive(Debug, Default)]
pub struct AccessibilitySnapshot;

impl AccessibilitySnapshot {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FocusSnapshot for AccessibilitySnapshot {
    async fn selected_text(&self) -> String {
        run_osascript(SELECTED_TEXT_SCRIPT).await
    }

    async fn focused_app_name(&self) -> String {
        run_osascript(FRONT_APP_SCRIPT).await
    }
}

/// Run a script, returning its stdout or an empty string on any failure
async fn run_osascript(script: &str) -> String {
    let child = tokio::process::Command::new("osascript")
        .args(["-e", script])
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(SCRIPT_TIMEOUT, child).await {
        Ok(Ok(output)) if output.status.success() => {
            strip_trailing_newline(&String::from_utf8_lossy(&output.stdout)).to_string()
        }
        Ok(Ok(output)) => {
            debug!(
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "osascript failed"
            );
            String::new()
        }
        Ok(Err(e)) => {
            debug!(%e, "osascript unavailable");
            String::new()
        }
        Err(_) => {
            debug!("osascript timed out");
            String::new()
        }
    }
}

/// osascript terminates its result with one newline; selections keep
/// their own leading and inner whitespace
fn strip_trailing_newline(output: &str) -> &str {
    output
        .strip_suffix('\n')
        .map(|s| s.strip_suffix('\r').unwrap_or(s))
        .unwrap_or(output)
}
