//! Double-tap recognition on the fn key
//!
//! A tap is one fn press/release whose held duration falls inside the
//! configured tap window. Two taps whose releases are close enough form a
//! gesture. Only one pending tap is remembered at a time.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::GestureConfig;
use crate::hotkey::KeyState;

/// Which double-tap was recognized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GestureKind {
    /// fn tapped twice
    DoubleTapFn,
    /// fn tapped twice with ctrl held during at least one of the taps
    DoubleTapFnCtrl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GestureEvent {
    pub kind: GestureKind,
    /// Release time of the second tap
    pub timestamp: Instant,
}

/// fn press currently in progress
#[derive(Debug, Clone, Copy)]
struct Press {
    at: Instant,
    ctrl: bool,
}

/// Completed qualifying tap waiting for a partner
#[derive(Debug, Clone, Copy)]
struct Tap {
    released_at: Instant,
    ctrl: bool,
}

pub struct GestureDetector {
    config: GestureConfig,
    press: Option<Press>,
    pending_tap: Option<Tap>,
}

impl GestureDetector {
    pub fn new(config: GestureConfig) -> Self {
        Self {
            config,
            press: None,
            pending_tap: None,
        }
    }

    /// A key went down. `fn_pressed`/`ctrl` are the flags after the change.
    pub fn on_press(&mut self, fn_pressed: bool, ctrl: bool, timestamp: Instant) {
        match self.press.as_mut() {
            Some(press) => press.ctrl |= ctrl,
            None if fn_pressed => {
                self.press = Some(Press {
                    at: timestamp,
                    ctrl,
                });
            }
            None => {}
        }
    }

    /// A key went up. `fn_pressed`/`ctrl` are the flags after the change.
    pub fn on_release(
        &mut self,
        fn_pressed: bool,
        ctrl: bool,
        timestamp: Instant,
    ) -> Option<GestureEvent> {
        if fn_pressed {
            // ctrl let go while fn is still down; the tap keeps its ctrl mark
            return None;
        }
        let press = self.press.take()?;
        let held = timestamp.saturating_duration_since(press.at);
        let tap_ctrl = press.ctrl || ctrl;

        if !self.is_tap(held) {
            debug!(held_ms = held.as_millis() as u64, "press outside tap window");
            self.pending_tap = None;
            return None;
        }

        match self.pending_tap.take() {
            Some(first)
                if timestamp.saturating_duration_since(first.released_at)
                    <= self.config.double_tap_window =>
            {
                let kind = if first.ctrl || tap_ctrl {
                    GestureKind::DoubleTapFnCtrl
                } else {
                    GestureKind::DoubleTapFn
                };
                debug!(?kind, "double tap recognized");
                Some(GestureEvent { kind, timestamp })
            }
            _ => {
                self.pending_tap = Some(Tap {
                    released_at: timestamp,
                    ctrl: tap_ctrl,
                });
                None
            }
        }
    }

    /// Derive press/release edges from two consecutive key snapshots
    pub fn observe(&mut self, prev: &KeyState, next: &KeyState) -> Option<GestureEvent> {
        let pressed = (!prev.fn_pressed && next.fn_pressed) || (!prev.ctrl_pressed && next.ctrl_pressed);
        let released = (prev.fn_pressed && !next.fn_pressed) || (prev.ctrl_pressed && !next.ctrl_pressed);

        if pressed {
            self.on_press(next.fn_pressed, next.ctrl_pressed, next.timestamp);
        }
        if released {
            return self.on_release(next.fn_pressed, next.ctrl_pressed, next.timestamp);
        }
        None
    }

    /// Forget any half-finished gesture
    pub fn reset(&mut self) {
        self.press = None;
        self.pending_tap = None;
    }

    fn is_tap(&self, held: Duration) -> bool {
        held >= self.config.min_tap && held <= self.config.max_tap
    }
}
