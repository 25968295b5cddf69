//! Periodic screen capture
//!
//! Grabs the main display with the macOS `screencapture` tool at a fixed
//! interval and forwards each JPEG as a video frame. The first grab happens
//! inside `start()` so a missing Screen Recording grant is reported there.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::capture::{CaptureError, MediaFrame, MediaSource, VideoFrame};

pub struct ScreenCapture {
    interval: Duration,
    frame_path: PathBuf,
    task: Option<JoinHandle<()>>,
}

impl ScreenCapture {
    /// `frame_path` is scratch space reused for every grab
    pub fn new(interval: Duration, frame_path: PathBuf) -> Self {
        Self {
            interval,
            frame_path,
            task: None,
        }
    }
}

#[async_trait]
impl MediaSource for ScreenCapture {
    fn name(&self) -> &'static str {
        "screen"
    }

    async fn start(&mut self, media_tx: mpsc::Sender<MediaFrame>) -> Result<(), CaptureError> {
        if self.task.is_some() {
            return Err(CaptureError::AlreadyRunning("screen capture"));
        }

        let first = grab(&self.frame_path).await?;
        let _ = media_tx.try_send(MediaFrame::Video(first));

        let interval = self.interval;
        let path = self.frame_path.clone();
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match grab(&path).await {
                    Ok(frame) => {
                        if let Err(mpsc::error::TrySendError::Closed(_)) =
                            media_tx.try_send(MediaFrame::Video(frame))
                        {
                            break;
                        }
                    }
                    Err(e) => debug!(%e, "screen grab failed"),
                }
            }
        }));
        info!(interval_ms = interval.as_millis() as u64, "screen capture started");
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
            debug!("screen capture stopped");
        }
    }
}

#[cfg(target_os = "macos")]
async fn grab(path: &Path) -> Result<VideoFrame, CaptureError> {
    use tokio::process::Command;

    let status = Command::new("screencapture")
        .arg("-x")
        .args(["-t", "jpg"])
        .arg(path)
        .status()
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CaptureError::Unsupported("screen"),
            _ => CaptureError::Device(e.to_string()),
        })?;
    if !status.success() {
        // screencapture exits non-zero when Screen Recording is denied
        return Err(CaptureError::PermissionDenied("screen recording"));
    }
    let jpeg = tokio::fs::read(path)
        .await
        .map_err(|e| CaptureError::Device(format!("reading {}: {e}", path.display())))?;
    if jpeg.is_empty() {
        tracing::warn!("screencapture produced an empty image");
        return Err(CaptureError::Device("empty screen image".to_string()));
    }
    Ok(VideoFrame {
        jpeg,
        captured_at: std::time::Instant::now(),
    })
}

#[cfg(not(target_os = "macos"))]
async fn grab(_path: &Path) -> Result<VideoFrame, CaptureError> {
    Err(CaptureError::Unsupported("screen"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(target_os = "macos"))]
    #[tokio::test]
    async fn test_start_fails_without_screencapture() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut screen = ScreenCapture::new(Duration::from_secs(1), PathBuf::from("/tmp/frame.jpg"));
        assert_eq!(
            screen.start(tx).await,
            Err(CaptureError::Unsupported("screen"))
        );
        assert!(rx.try_recv().is_err());
        // Stopping a source that never started is harmless
        screen.stop().await;
    }

    #[test]
    fn test_screen_name() {
        let screen = ScreenCapture::new(Duration::from_secs(1), PathBuf::from("/tmp/frame.jpg"));
        assert_eq!(screen.name(), "screen");
    }
}
