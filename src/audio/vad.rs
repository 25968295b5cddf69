//! Energy-based voice activity detection
//!
//! Classifies per-frame RMS energy into speech and silence using a rolling
//! average, and fires a one-shot signal once an utterance has clearly ended.
//! Brief ambient noise (too short or too quiet) never fires, and a single
//! silence period never fires twice.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::VadConfig;

/// Signals produced while processing frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    /// Average energy crossed the threshold after a silence
    SpeechStarted,
    /// A qualifying utterance was followed by enough silence
    SilenceDetected {
        /// Length of the utterance that just ended
        speech: Duration,
    },
}

/// Speech segment in progress
#[derive(Debug, Clone, Copy)]
struct Segment {
    started_at: Instant,
    last_speech_at: Instant,
    peak: f32,
    silence_since: Option<Instant>,
}

impl Segment {
    fn speech_duration(&self) -> Duration {
        self.last_speech_at.saturating_duration_since(self.started_at)
    }
}

pub struct VoiceActivityDetector {
    config: VadConfig,
    window: VecDeque<f32>,
    segment: Option<Segment>,
    /// Set once the current segment has fired; cleared on the next onset
    fired: bool,
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig) -> Self {
        let capacity = config.energy_window_size.max(1);
        Self {
            config,
            window: VecDeque::with_capacity(capacity),
            segment: None,
            fired: false,
        }
    }

    /// Feed one frame's RMS energy observed at `at`
    pub fn process(&mut self, energy: f32, at: Instant) -> Option<VadEvent> {
        let average = self.push_energy(energy);

        if average > self.config.silence_threshold {
            return self.on_speech(average, at);
        }
        self.on_silence(at)
    }

    /// Whether a speech segment is currently open
    #[cfg(test)]
    fn in_speech(&self) -> bool {
        self.segment.is_some()
    }

    /// Current rolling average energy
    pub fn average_energy(&self) -> f32 {
        if self.window.is_empty() {
            0.0
        } else {
            self.window.iter().sum::<f32>() / self.window.len() as f32
        }
    }

    /// Clear all state
    pub fn reset(&mut self) {
        self.window.clear();
        self.segment = None;
        self.fired = false;
    }

    fn push_energy(&mut self, energy: f32) -> f32 {
        let energy = if energy.is_finite() { energy.max(0.0) } else { 0.0 };
        self.window.push_back(energy);
        while self.window.len() > self.config.energy_window_size.max(1) {
            self.window.pop_front();
        }
        self.average_energy()
    }

    fn on_speech(&mut self, average: f32, at: Instant) -> Option<VadEvent> {
        match self.segment.as_mut() {
            Some(segment) => {
                segment.last_speech_at = at;
                segment.peak = segment.peak.max(average);
                segment.silence_since = None;
                None
            }
            None => {
                self.fired = false;
                self.segment = Some(Segment {
                    started_at: at,
                    last_speech_at: at,
                    peak: average,
                    silence_since: None,
                });
                debug!(energy = average, "speech onset");
                Some(VadEvent::SpeechStarted)
            }
        }
    }

    fn on_silence(&mut self, at: Instant) -> Option<VadEvent> {
        let segment = self.segment.as_mut()?;
        let since = *segment.silence_since.get_or_insert(at);
        if at.saturating_duration_since(since) < self.config.silence_duration {
            return None;
        }

        let finished = *segment;
        self.segment = None;
        let speech = finished.speech_duration();

        if speech < self.config.min_speech_duration || finished.peak < self.config.min_peak_energy {
            debug!(
                speech_ms = speech.as_millis() as u64,
                peak = finished.peak,
                "discarding segment below speech thresholds"
            );
            return None;
        }
        if self.fired {
            return None;
        }
        self.fired = true;
        debug!(speech_ms = speech.as_millis() as u64, peak = finished.peak, "silence detected");
        Some(VadEvent::SilenceDetected { speech })
    }
}
