//! Configuration loading and management
//!
//! Everything comes from the environment with sensible defaults; there is no
//! settings file. Every `VCD_*` variable is optional.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Timing windows for double-tap recognition
#[derive(Debug, Clone, PartialEq)]
pub struct GestureConfig {
    /// Shortest press that still counts as a tap
    pub min_tap: Duration,
    /// Longest press that still counts as a tap
    pub max_tap: Duration,
    /// Maximum distance between the two tap releases
    pub double_tap_window: Duration,
}

impl Default for GestureConfig {
    fn default() -> Self {
        Self {
            min_tap: Duration::from_millis(50),
            max_tap: Duration::from_millis(200),
            double_tap_window: Duration::from_millis(400),
        }
    }
}

/// Energy-based voice activity detection parameters
#[derive(Debug, Clone, PartialEq)]
pub struct VadConfig {
    /// Average RMS above which a frame counts as speech
    pub silence_threshold: f32,
    /// How long silence must last before the segment is considered finished
    pub silence_duration: Duration,
    /// Minimum speech length for a segment to trigger a send
    pub min_speech_duration: Duration,
    /// Minimum peak average energy for a segment to trigger a send
    pub min_peak_energy: f32,
    /// Number of frames in the rolling energy window
    pub energy_window_size: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            silence_threshold: 0.02,
            silence_duration: Duration::from_millis(1500),
            min_speech_duration: Duration::from_millis(1500),
            min_peak_energy: 0.05,
            energy_window_size: 5,
        }
    }
}

/// Session controller behaviour
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// How long to wait for the transport to complete a turn
    pub response_timeout: Duration,
    /// Holds released sooner than this are treated as taps and never sent
    pub min_hold: Duration,
    /// Commit a turn when the VAD detects the end of an utterance (toggle modes)
    pub auto_send_on_silence: bool,
    /// Interval between screen frames while screen capture is enabled
    pub screen_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(10),
            min_hold: Duration::from_millis(200),
            auto_send_on_silence: true,
            screen_interval: Duration::from_millis(1000),
        }
    }
}

/// Connection settings for the streaming model endpoint
#[derive(Clone, PartialEq)]
pub struct TransportConfig {
    pub url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub system_instruction: Option<String>,
    /// Bound on TCP connect, TLS and the WebSocket upgrade
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
            model: "models/gemini-2.0-flash-exp".to_string(),
            api_key: None,
            system_instruction: None,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

// Keeps the API key out of logs.
impl std::fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConfig")
            .field("url", &self.url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("system_instruction", &self.system_instruction.is_some())
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the Unix domain socket for IPC
    pub socket_path: PathBuf,

    /// Directory for runtime data
    pub data_dir: PathBuf,

    pub gesture: GestureConfig,
    pub vad: VadConfig,
    pub session: SessionConfig,
    pub transport: TransportConfig,
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self> {
        let home = std::env::var("HOME").context("HOME is not set")?;
        let data_dir = PathBuf::from(&home)
            .join(".local")
            .join("share")
            .join("voice-command-daemon");

        let mut config = Self::with_data_dir(data_dir);

        let gesture = &mut config.gesture;
        if let Some(ms) = env_parse::<u64>("VCD_TAP_MIN_MS")? {
            gesture.min_tap = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("VCD_TAP_MAX_MS")? {
            gesture.max_tap = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("VCD_DOUBLE_TAP_WINDOW_MS")? {
            gesture.double_tap_window = Duration::from_millis(ms);
        }

        let vad = &mut config.vad;
        if let Some(threshold) = env_parse::<f32>("VCD_VAD_THRESHOLD")? {
            vad.silence_threshold = threshold;
        }
        if let Some(ms) = env_parse::<u64>("VCD_VAD_SILENCE_MS")? {
            vad.silence_duration = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("VCD_VAD_MIN_SPEECH_MS")? {
            vad.min_speech_duration = Duration::from_millis(ms);
        }
        if let Some(peak) = env_parse::<f32>("VCD_VAD_MIN_PEAK")? {
            vad.min_peak_energy = peak;
        }
        if let Some(window) = env_parse::<usize>("VCD_VAD_WINDOW")? {
            vad.energy_window_size = window;
        }

        let session = &mut config.session;
        if let Some(ms) = env_parse::<u64>("VCD_RESPONSE_TIMEOUT_MS")? {
            session.response_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("VCD_MIN_HOLD_MS")? {
            session.min_hold = Duration::from_millis(ms);
        }
        if let Some(enabled) = env_parse::<bool>("VCD_AUTO_SEND")? {
            session.auto_send_on_silence = enabled;
        }
        if let Some(ms) = env_parse::<u64>("VCD_SCREEN_INTERVAL_MS")? {
            session.screen_interval = Duration::from_millis(ms);
        }

        let transport = &mut config.transport;
        if let Some(url) = env_string("VCD_TRANSPORT_URL") {
            transport.url = url;
        }
        if let Some(model) = env_string("VCD_MODEL") {
            transport.model = model;
        }
        transport.api_key = env_string("VCD_API_KEY").or_else(|| env_string("GEMINI_API_KEY"));
        transport.system_instruction = env_string("VCD_SYSTEM_INSTRUCTION");
        if let Some(ms) = env_parse::<u64>("VCD_CONNECT_TIMEOUT_MS")? {
            transport.connect_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Default settings rooted at `data_dir`
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            socket_path: data_dir.join("daemon.sock"),
            data_dir,
            gesture: GestureConfig::default(),
            vad: VadConfig::default(),
            session: SessionConfig::default(),
            transport: TransportConfig::default(),
        }
    }

    /// Reject combinations that would make the input pipeline misbehave
    pub fn validate(&self) -> Result<()> {
        if self.gesture.min_tap > self.gesture.max_tap {
            bail!(
                "tap window is inverted: min {:?} > max {:?}",
                self.gesture.min_tap,
                self.gesture.max_tap
            );
        }
        if self.gesture.double_tap_window.is_zero() {
            bail!("double-tap window must be non-zero");
        }
        if self.vad.energy_window_size == 0 {
            bail!("VAD energy window must hold at least one frame");
        }
        for (name, value) in [
            ("silence threshold", self.vad.silence_threshold),
            ("minimum peak energy", self.vad.min_peak_energy),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                bail!("VAD {name} must be in (0, 1], got {value}");
            }
        }
        if self.session.response_timeout.is_zero() {
            bail!("response timeout must be non-zero");
        }
        if self.session.screen_interval.is_zero() {
            bail!("screen capture interval must be non-zero");
        }
        if self.transport.connect_timeout.is_zero() {
            bail!("transport connect timeout must be non-zero");
        }
        Ok(())
    }

    /// Ensure data directory exists
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("failed to create {}", self.data_dir.display()))?;
        Ok(())
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_string(name) {
        Some(raw) => parse_value(name, &raw).map(Some),
        None => Ok(None),
    }
}

fn parse_value<T>(name: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("{e}"))
        .with_context(|| format!("invalid value {raw:?} for {name}"))
}
