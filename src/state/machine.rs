//! Core state machine implementation
//!
//! Owns the single authoritative [`RecordingMode`]. Key snapshots, gestures
//! and manual stops move it between Idle, the two hold modes and the two
//! toggle modes. Processing is an overlay requested by the session
//! controller around a turn; the machine remembers which mode to resume.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::events::SessionEvent;
use crate::gesture::{GestureEvent, GestureKind};
use crate::hotkey::KeyState;

/// The possible recording modes of the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingMode {
    /// No session, waiting for a key
    #[default]
    Idle,
    /// Speech only, while fn is held
    SttHold,
    /// Speech plus screen, while fn+ctrl are held
    MultimodalHold,
    /// Speech only, toggled by a fn double-tap
    SttToggle,
    /// Speech plus screen, toggled by a fn+ctrl double-tap
    MultimodalToggle,
    /// A turn is outstanding
    Processing,
}

impl RecordingMode {
    /// Hold or toggle mode with a live session
    pub fn is_active(self) -> bool {
        self.is_hold() || self.is_toggle()
    }

    pub fn is_hold(self) -> bool {
        matches!(self, RecordingMode::SttHold | RecordingMode::MultimodalHold)
    }

    pub fn is_toggle(self) -> bool {
        matches!(self, RecordingMode::SttToggle | RecordingMode::MultimodalToggle)
    }

    /// Whether this mode asks for screen capture
    pub fn wants_screen(self) -> bool {
        matches!(
            self,
            RecordingMode::MultimodalHold | RecordingMode::MultimodalToggle
        )
    }
}

impl std::fmt::Display for RecordingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordingMode::Idle => write!(f, "Idle"),
            RecordingMode::SttHold => write!(f, "SttHold"),
            RecordingMode::MultimodalHold => write!(f, "MultimodalHold"),
            RecordingMode::SttToggle => write!(f, "SttToggle"),
            RecordingMode::MultimodalToggle => write!(f, "MultimodalToggle"),
            RecordingMode::Processing => write!(f, "Processing"),
        }
    }
}

/// A mode change handed back to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: RecordingMode,
    pub to: RecordingMode,
}

impl Transition {
    /// A session began
    pub fn is_start(&self) -> bool {
        self.from == RecordingMode::Idle && self.to.is_active()
    }

    /// A live mode returned to Idle
    pub fn is_stop(&self) -> bool {
        self.to == RecordingMode::Idle && self.from != RecordingMode::Idle
    }
}

/// The state machine that manages mode transitions
pub struct StateMachine {
    /// Current mode
    mode: RecordingMode,
    /// Mode to restore when Processing ends
    resume: RecordingMode,
    /// Mode that was current when Processing began
    processing_from: RecordingMode,
    /// Last active variant of the current session, for reporting
    session_mode: RecordingMode,
    /// Previous key snapshot (for edge detection)
    prev_keys: KeyState,
    /// Time when the current session started
    session_started_at: Option<Instant>,
    /// Channel for emitting session events
    event_tx: broadcast::Sender<SessionEvent>,
}

impl StateMachine {
    /// Create a new state machine
    pub fn new(event_tx: broadcast::Sender<SessionEvent>) -> Self {
        Self {
            mode: RecordingMode::Idle,
            resume: RecordingMode::Idle,
            processing_from: RecordingMode::Idle,
            session_mode: RecordingMode::Idle,
            prev_keys: KeyState::released(Instant::now()),
            session_started_at: None,
            event_tx,
        }
    }

    /// Get the current mode
    pub fn mode(&self) -> RecordingMode {
        self.mode
    }

    pub fn is_processing(&self) -> bool {
        self.mode == RecordingMode::Processing
    }

    /// Mode that will be restored once the outstanding turn resolves
    pub fn resume_mode(&self) -> Option<RecordingMode> {
        self.is_processing().then_some(self.resume)
    }

    /// Last key snapshot seen by the machine
    pub fn keys(&self) -> KeyState {
        self.prev_keys
    }

    /// Handle a modifier state change
    pub fn handle_keys(&mut self, keys: KeyState) -> Option<Transition> {
        let prev = std::mem::replace(&mut self.prev_keys, keys);
        if prev.same_keys(&keys) {
            return None;
        }
        self.apply("keys", |base| next_from_keys(base, &prev, &keys))
    }

    /// Handle a recognized double-tap
    pub fn handle_gesture(&mut self, gesture: GestureEvent) -> Option<Transition> {
        self.apply("gesture", |base| next_from_gesture(base, gesture.kind))
    }

    /// Manual stop / explicit exit: any active mode goes back to Idle
    pub fn stop(&mut self) -> Option<Transition> {
        self.apply("manual stop", |base| {
            if base.is_active() {
                RecordingMode::Idle
            } else {
                base
            }
        })
    }

    /// Enter Processing on behalf of the session controller
    pub fn enter_processing(&mut self) -> Option<Transition> {
        if self.is_processing() {
            warn!("already processing, ignoring second request");
            return None;
        }
        self.processing_from = self.mode;
        self.resume = self.mode;
        Some(self.transition_to(RecordingMode::Processing))
    }

    /// Leave Processing and restore the resume mode
    pub fn exit_processing(&mut self) -> Option<Transition> {
        if !self.is_processing() {
            debug!(mode = %self.mode, "exit requested while not processing");
            return None;
        }
        let target = self.resume;
        Some(self.transition_to(target))
    }

    /// Run a trigger against the current mode, or against the resume mode
    /// while a turn is outstanding
    fn apply(
        &mut self,
        trigger: &'static str,
        next: impl Fn(RecordingMode) -> RecordingMode,
    ) -> Option<Transition> {
        if self.is_processing() {
            let base = self.resume;
            let target = next(base);
            if target == base {
                return None;
            }
            if base == RecordingMode::Idle {
                warn!(
                    trigger,
                    requested = %target,
                    "turn outstanding, refusing to start a new session"
                );
                return None;
            }
            debug!(trigger, from = %base, to = %target, "deferred until turn resolves");
            self.resume = target;
            return None;
        }

        let target = next(self.mode);
        if target == self.mode {
            return None;
        }
        Some(self.transition_to(target))
    }

    /// Perform a state transition
    fn transition_to(&mut self, new_mode: RecordingMode) -> Transition {
        let old_mode = self.mode;
        info!(from = %old_mode, to = %new_mode, "state transition");
        self.mode = new_mode;

        match (old_mode, new_mode) {
            (RecordingMode::Idle, to) if to.is_active() => {
                self.session_started_at = Some(Instant::now());
                self.session_mode = to;
                self.emit(SessionEvent::RecordingStarted { mode: to });
            }
            (from, RecordingMode::Idle) if from.is_active() => {
                self.emit_stopped(from);
            }
            (from, to) if from.is_active() && to.is_active() => {
                self.session_mode = to;
                self.emit(SessionEvent::ModeChanged { from, to });
            }
            (_, RecordingMode::Processing) => {
                self.emit(SessionEvent::ProcessingStarted {
                    resume: self.resume,
                });
            }
            (RecordingMode::Processing, to) => {
                self.emit(SessionEvent::ProcessingFinished { resumed: to });
                let from = self.processing_from;
                if from.is_active() {
                    if to == RecordingMode::Idle {
                        self.emit_stopped(self.session_mode);
                    } else if to != from {
                        self.session_mode = to;
                        self.emit(SessionEvent::ModeChanged { from, to });
                    }
                }
                self.processing_from = RecordingMode::Idle;
            }
            _ => {}
        }

        Transition {
            from: old_mode,
            to: new_mode,
        }
    }

    fn emit_stopped(&mut self, mode: RecordingMode) {
        let duration_ms = self
            .session_started_at
            .take()
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        self.emit(SessionEvent::RecordingStopped { mode, duration_ms });
    }

    fn emit(&self, event: SessionEvent) {
        debug!(%event, "emitting session event");
        let _ = self.event_tx.send(event);
    }
}

/// Compute the next mode from a key change
fn next_from_keys(base: RecordingMode, prev: &KeyState, keys: &KeyState) -> RecordingMode {
    match base {
        RecordingMode::Idle => {
            // fn chords with command belong to the system
            if keys.cmd_pressed || !keys.fn_pressed {
                return RecordingMode::Idle;
            }
            let fn_edge = !prev.fn_pressed;
            let ctrl_edge = keys.ctrl_pressed && !prev.ctrl_pressed;
            if keys.ctrl_pressed && (fn_edge || ctrl_edge) {
                RecordingMode::MultimodalHold
            } else if !keys.ctrl_pressed && fn_edge {
                RecordingMode::SttHold
            } else {
                RecordingMode::Idle
            }
        }
        RecordingMode::SttHold => {
            if !keys.fn_pressed {
                RecordingMode::Idle
            } else if keys.ctrl_pressed {
                RecordingMode::MultimodalHold
            } else {
                RecordingMode::SttHold
            }
        }
        RecordingMode::MultimodalHold => {
            if !keys.fn_pressed {
                RecordingMode::Idle
            } else if !keys.ctrl_pressed {
                RecordingMode::SttHold
            } else {
                RecordingMode::MultimodalHold
            }
        }
        // Toggles only respond to their own gesture
        RecordingMode::SttToggle | RecordingMode::MultimodalToggle | RecordingMode::Processing => {
            base
        }
    }
}

/// Compute the next mode from a double-tap
fn next_from_gesture(base: RecordingMode, kind: GestureKind) -> RecordingMode {
    match (base, kind) {
        (RecordingMode::Idle, GestureKind::DoubleTapFn) => RecordingMode::SttToggle,
        (RecordingMode::Idle, GestureKind::DoubleTapFnCtrl) => RecordingMode::MultimodalToggle,
        (RecordingMode::SttToggle, GestureKind::DoubleTapFn) => RecordingMode::Idle,
        (RecordingMode::MultimodalToggle, GestureKind::DoubleTapFnCtrl) => RecordingMode::Idle,
        _ => {
            debug!(mode = %base, ?kind, "gesture ignored in this mode");
            base
        }
    }
}
