//! Streaming session module
//!
//! One session spans Idle to Idle. It owns the focus snapshot, the capture
//! sources and the transport, and at most one outstanding turn.

mod context;
mod controller;
mod error;

#[cfg(test)]
pub(crate) mod testing;

pub use context::{PendingTurn, SessionContext, TurnId, TurnResponse};
pub use controller::{Collaborators, SessionController};
pub use error::SessionError;
