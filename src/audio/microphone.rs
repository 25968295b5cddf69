//! System microphone capture via CPAL
//!
//! The cpal stream is not `Send`, so it lives on a dedicated thread for the
//! whole session. The data callback frames samples and hands them to the
//! event loop with `try_send`; it never blocks the audio thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::capture::{CaptureError, MediaFrame, MediaSource};

/// How long `start()` waits for the device to open
const OPEN_TIMEOUT: Duration = Duration::from_secs(3);

/// Default input device as a [`MediaSource`]
#[derive(Default)]
pub struct Microphone {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Microphone {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MediaSource for Microphone {
    fn name(&self) -> &'static str {
        "microphone"
    }

    async fn start(&mut self, media_tx: mpsc::Sender<MediaFrame>) -> Result<(), CaptureError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(CaptureError::AlreadyRunning("microphone"));
        }

        let running = Arc::clone(&self.running);
        let (ready_tx, ready_rx) = oneshot::channel();
        let spawned = std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || run_capture(media_tx, running, ready_tx));

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(CaptureError::Device(e.to_string()));
            }
        };
        self.thread = Some(handle);

        let outcome = match tokio::time::timeout(OPEN_TIMEOUT, ready_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CaptureError::Device("capture thread exited".to_string())),
            Err(_) => Err(CaptureError::Device("timed out opening microphone".to_string())),
        };
        if outcome.is_err() {
            self.stop().await;
        } else {
            info!("microphone capture started");
        }
        outcome
    }

    async fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            // Joining guarantees the stream is dropped and no frame follows
            match tokio::task::spawn_blocking(move || handle.join()).await {
                Ok(Ok(())) => debug!("microphone capture stopped"),
                Ok(Err(_)) => warn!("audio capture thread panicked"),
                Err(e) => warn!(?e, "failed to join audio capture thread"),
            }
        }
    }
}

#[cfg(target_os = "macos")]
fn run_capture(
    media_tx: mpsc::Sender<MediaFrame>,
    running: Arc<AtomicBool>,
    ready_tx: oneshot::Sender<Result<(), CaptureError>>,
) {
    use cpal::traits::StreamTrait;

    let stream = match build_stream(media_tx) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(CaptureError::Device(e.to_string())));
        return;
    }
    let _ = ready_tx.send(Ok(()));

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(10));
    }
    drop(stream);
}

#[cfg(not(target_os = "macos"))]
fn run_capture(
    _media_tx: mpsc::Sender<MediaFrame>,
    _running: Arc<AtomicBool>,
    ready_tx: oneshot::Sender<Result<(), CaptureError>>,
) {
    let _ = ready_tx.send(Err(CaptureError::Unsupported("microphone")));
}

#[cfg(target_os = "macos")]
fn build_stream(media_tx: mpsc::Sender<MediaFrame>) -> Result<cpal::Stream, CaptureError> {
    use cpal::traits::{DeviceTrait, HostTrait};
    use cpal::SampleFormat;

    use super::FrameAssembler;

    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(CaptureError::NoDevice("microphone"))?;
    let supported = device
        .default_input_config()
        .map_err(|e| CaptureError::Device(e.to_string()))?;
    let format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();

    info!(
        device = device.name().unwrap_or_else(|_| "unknown".to_string()),
        sample_rate = config.sample_rate.0,
        channels = config.channels,
        ?format,
        "opening microphone"
    );

    let assembler = FrameAssembler::new(config.sample_rate.0, config.channels)
        .map_err(|e| CaptureError::Device(format!("no resampler for device rate: {e}")))?;
    match format {
        SampleFormat::F32 => input_stream::<f32>(&device, &config, assembler, media_tx, |s| s),
        SampleFormat::I16 => input_stream::<i16>(&device, &config, assembler, media_tx, |s| {
            s as f32 / 32_768.0
        }),
        SampleFormat::U16 => input_stream::<u16>(&device, &config, assembler, media_tx, |s| {
            (s as f32 - 32_768.0) / 32_768.0
        }),
        other => Err(CaptureError::Device(format!(
            "unsupported sample format {other:?}"
        ))),
    }
}

#[cfg(target_os = "macos")]
fn input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut assembler: super::FrameAssembler,
    media_tx: mpsc::Sender<MediaFrame>,
    to_f32: fn(T) -> f32,
) -> Result<cpal::Stream, CaptureError>
where
    T: cpal::SizedSample + Send + 'static,
{
    use cpal::traits::DeviceTrait;

    let mut dropped: u64 = 0;
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                for frame in assembler.push(data, to_f32, std::time::Instant::now()) {
                    if media_tx.try_send(MediaFrame::Audio(frame)).is_err() {
                        dropped += 1;
                        if dropped % 50 == 1 {
                            warn!(dropped, "media channel full, dropping audio");
                        }
                    }
                }
            },
            |err| warn!(%err, "microphone stream error"),
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => CaptureError::NoDevice("microphone"),
            other => CaptureError::Device(other.to_string()),
        })
}
