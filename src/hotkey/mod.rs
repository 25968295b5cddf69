//! Hotkey module for global keyboard event listening
//!
//! Uses macOS CGEventTap to monitor the fn, control and command modifier
//! flags and forwards normalized [`KeyState`] snapshots to the event loop.

mod keys;
mod listener;

pub use keys::KeyState;
pub use listener::{HotkeyEvent, KeyMonitor, MonitorError};
