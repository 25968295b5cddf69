//! Gesture module for double-tap detection
//!
//! Turns raw fn/ctrl press and release edges into double-tap gestures that
//! toggle the recording modes on and off.

mod detector;

pub use detector::{GestureDetector, GestureEvent, GestureKind};
