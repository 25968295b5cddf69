//! Modifier key definitions and state tracking
//!
//! Provides the macOS modifier flag masks the daemon cares about and an
//! immutable snapshot of those three keys.

use std::time::Instant;

/// Modifier key flag masks from macOS CGEventFlags
pub mod flags {
    /// Function / globe key (kCGEventFlagMaskSecondaryFn)
    pub const SECONDARY_FN: u64 = 0x0080_0000;
    /// Control key (kCGEventFlagMaskControl)
    pub const CONTROL: u64 = 0x0004_0000;
    /// Command key (kCGEventFlagMaskCommand)
    pub const COMMAND: u64 = 0x0010_0000;
    /// Every bit the monitor reports on
    pub const TRACKED: u64 = SECONDARY_FN | CONTROL | COMMAND;
}

/// Snapshot of the tracked modifier keys at one flag change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyState {
    /// Function key is held
    pub fn_pressed: bool,
    /// Control key is held
    pub ctrl_pressed: bool,
    /// Command key is held
    pub cmd_pressed: bool,
    /// Monotonic time the change was observed
    pub timestamp: Instant,
}

impl KeyState {
    /// All keys up at the given instant
    pub fn released(timestamp: Instant) -> Self {
        Self {
            fn_pressed: false,
            ctrl_pressed: false,
            cmd_pressed: false,
            timestamp,
        }
    }

    /// Decode raw event flag bits, ignoring everything but the tracked keys
    pub fn from_bits(bits: u64, timestamp: Instant) -> Self {
        Self {
            fn_pressed: bits & flags::SECONDARY_FN != 0,
            ctrl_pressed: bits & flags::CONTROL != 0,
            cmd_pressed: bits & flags::COMMAND != 0,
            timestamp,
        }
    }

    /// Compare the key flags only, not the timestamp
    pub fn same_keys(&self, other: &KeyState) -> bool {
        self.fn_pressed == other.fn_pressed
            && self.ctrl_pressed == other.ctrl_pressed
            && self.cmd_pressed == other.cmd_pressed
    }
}

/// Drops flag events in which none of the tracked keys changed.
///
/// macOS reports a FlagsChanged event for every modifier (shift, caps lock,
/// option...). Only transitions of fn/ctrl/cmd are forwarded.
#[derive(Debug, Default)]
pub struct KeyFlagFilter {
    last_bits: u64,
}

impl KeyFlagFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot when a tracked key changed since the last accepted event
    pub fn accept(&mut self, bits: u64, timestamp: Instant) -> Option<KeyState> {
        let tracked = bits & flags::TRACKED;
        if tracked == self.last_bits {
            return None;
        }
        self.last_bits = tracked;
        Some(KeyState::from_bits(tracked, timestamp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHIFT: u64 = 0x0002_0000;
    const OPTION: u64 = 0x0008_0000;

    #[test]
    fn test_released_state() {
        let state = KeyState::released(Instant::now());
        assert!(!state.fn_pressed && !state.ctrl_pressed && !state.cmd_pressed);
    }

    #[test]
    fn test_decodes_tracked_bits() {
        let now = Instant::now();
        let state = KeyState::from_bits(flags::SECONDARY_FN | flags::CONTROL | SHIFT, now);
        assert!(state.fn_pressed);
        assert!(state.ctrl_pressed);
        assert!(!state.cmd_pressed);
        assert_eq!(state.timestamp, now);
    }

    #[test]
    fn test_filter_ignores_untracked_modifiers() {
        let now = Instant::now();
        let mut filter = KeyFlagFilter::new();

        assert!(filter.accept(SHIFT, now).is_none());
        assert!(filter.accept(SHIFT | OPTION, now).is_none());

        let pressed = filter.accept(SHIFT | flags::SECONDARY_FN, now).unwrap();
        assert!(pressed.fn_pressed);

        // Releasing shift while fn stays down is not a tracked change
        assert!(filter.accept(flags::SECONDARY_FN, now).is_none());

        let released = filter.accept(0, now).unwrap();
        assert!(released.same_keys(&KeyState::released(now)));
    }

    #[test]
    fn test_same_keys_ignores_timestamp() {
        let a = KeyState::from_bits(flags::CONTROL, Instant::now());
        let b = KeyState {
            timestamp: a.timestamp + std::time::Duration::from_millis(5),
            ..a
        };
        assert!(a.same_keys(&b));
        assert!(!a.same_keys(&KeyState::released(a.timestamp)));
    }
}
