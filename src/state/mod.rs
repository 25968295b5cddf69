//! State machine module for recording mode management
//!
//! Provides an explicit state machine with six modes:
//! - Idle: Default mode, no session
//! - SttHold / MultimodalHold: Momentary, while fn (and ctrl) are held
//! - SttToggle / MultimodalToggle: Toggled by a double-tap, persists
//! - Processing: Transient overlay while a turn is outstanding

mod machine;

pub use machine::{RecordingMode, StateMachine, Transition};
