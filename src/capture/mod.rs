//! Media capture sources
//!
//! Audio and video producers run independently and push frames into one
//! bounded channel drained by the event loop. Frame order is preserved per
//! producer; nothing is guaranteed between the two.

use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// MIME type of the PCM produced by the microphone
pub const AUDIO_MIME: &str = "audio/pcm;rate=16000";
/// MIME type of screen frames
pub const VIDEO_MIME: &str = "image/jpeg";

/// 20ms of 16kHz mono little-endian PCM16
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub pcm: Vec<u8>,
    /// RMS energy of the frame in [0, 1]
    pub rms: f32,
    pub captured_at: Instant,
}

/// One encoded screen image
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub jpeg: Vec<u8>,
    pub captured_at: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MediaFrame {
    Audio(AudioFrame),
    Video(VideoFrame),
}

/// Errors that can occur while starting or running a capture source
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("{0} permission not granted")]
    PermissionDenied(&'static str),

    #[error("no {0} device available")]
    NoDevice(&'static str),

    #[error("capture device error: {0}")]
    Device(String),

    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    #[error("{0} capture is not supported on this platform")]
    Unsupported(&'static str),
}

/// A producer of media frames with explicit start/stop
#[async_trait]
pub trait MediaSource: Send {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Start producing frames into `media_tx`. Returns once the device is
    /// confirmed running or has failed.
    async fn start(&mut self, media_tx: mpsc::Sender<MediaFrame>) -> Result<(), CaptureError>;

    /// Stop producing. After this returns no further frame is sent.
    async fn stop(&mut self);
}
