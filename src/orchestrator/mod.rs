//! Daemon event loop
//!
//! A single task owns the state machine, the gesture detector, the session
//! controller and the key monitor. Key changes, captured media, transport
//! traffic, response timeouts and IPC commands are all serialized through
//! it, so no two handlers ever race on the recording mode.

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::events::SessionEvent;
use crate::gesture::GestureDetector;
use crate::hotkey::{HotkeyEvent, KeyMonitor, KeyState, MonitorError};
use crate::session::{Collaborators, SessionController, TurnId};
use crate::state::{RecordingMode, StateMachine};
use crate::transport::Inbound;

/// Buffered key changes between the monitor thread and the loop
const HOTKEY_QUEUE: usize = 64;
const TRANSPORT_QUEUE: usize = 64;

/// Requests from the IPC server into the loop
#[derive(Debug)]
pub enum ControlCommand {
    Status {
        reply: oneshot::Sender<LoopStatus>,
    },
    /// Manual stop; replies whether anything was active
    Stop { reply: oneshot::Sender<bool> },
    /// Try to install the key monitor again, e.g. after a permission grant
    RetryKeyMonitor {
        reply: oneshot::Sender<Result<(), MonitorError>>,
    },
}

/// Snapshot of the loop's state
#[derive(Debug, Clone, PartialEq)]
pub struct LoopStatus {
    pub mode: RecordingMode,
    pub resume_mode: Option<RecordingMode>,
    pub session_id: Option<Uuid>,
    pub pending_turn: Option<TurnId>,
    pub key_monitor_running: bool,
}

pub struct Orchestrator {
    machine: StateMachine,
    gestures: GestureDetector,
    controller: SessionController,
    monitor: KeyMonitor,
    hotkey_rx: mpsc::Receiver<HotkeyEvent>,
    control_rx: mpsc::Receiver<ControlCommand>,
    transport_rx: mpsc::Receiver<Inbound>,
    timeout_rx: mpsc::Receiver<TurnId>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        io: Collaborators,
        event_tx: broadcast::Sender<SessionEvent>,
        control_rx: mpsc::Receiver<ControlCommand>,
    ) -> Self {
        let (hotkey_tx, hotkey_rx) = mpsc::channel(HOTKEY_QUEUE);
        let (transport_tx, transport_rx) = mpsc::channel(TRANSPORT_QUEUE);
        let (timeout_tx, timeout_rx) = mpsc::channel(4);

        let controller = SessionController::new(
            config.session.clone(),
            config.vad.clone(),
            io,
            transport_tx,
            timeout_tx,
            event_tx.clone(),
        );

        Self {
            machine: StateMachine::new(event_tx.clone()),
            gestures: GestureDetector::new(config.gesture.clone()),
            controller,
            monitor: KeyMonitor::new(hotkey_tx),
            hotkey_rx,
            control_rx,
            transport_rx,
            timeout_rx,
            event_tx,
        }
    }

    /// Install the key monitor. Failure is not fatal: the daemon keeps
    /// serving IPC and a client can ask for a retry.
    pub fn start_key_monitor(&mut self) -> Result<(), MonitorError> {
        match self.monitor.start() {
            Ok(()) => {
                info!("key monitor started");
                Ok(())
            }
            Err(MonitorError::AlreadyRunning) => Ok(()),
            Err(e) => {
                warn!(%e, "key monitor unavailable");
                if e == MonitorError::PermissionDenied {
                    let _ = self.event_tx.send(SessionEvent::PermissionRequired {
                        reason: e.to_string(),
                    });
                }
                Err(e)
            }
        }
    }

    /// Run until every input channel has closed
    pub async fn run(&mut self) {
        info!("event loop running");
        loop {
            tokio::select! {
                Some(event) = self.hotkey_rx.recv() => self.on_hotkey(event).await,
                Some(command) = self.control_rx.recv() => self.on_control(command).await,
                Some(frame) = self.controller.next_media() => {
                    self.controller.on_media(&mut self.machine, frame).await
                }
                Some(event) = self.transport_rx.recv() => {
                    self.controller.on_transport_event(&mut self.machine, event).await
                }
                Some(turn_id) = self.timeout_rx.recv() => {
                    self.controller.on_timeout(&mut self.machine, turn_id).await
                }
                else => break,
            }
        }
        info!("event loop exited");
    }

    /// End any live session and release the key monitor
    pub async fn shutdown(&mut self) {
        self.controller.shutdown().await;
        self.monitor.stop();
    }

    pub fn status(&self) -> LoopStatus {
        LoopStatus {
            mode: self.machine.mode(),
            resume_mode: self.machine.resume_mode(),
            session_id: self.controller.session().map(|s| s.id),
            pending_turn: self.controller.pending_turn().map(|p| p.turn_id),
            key_monitor_running: self.monitor.is_running(),
        }
    }

    async fn on_hotkey(&mut self, event: HotkeyEvent) {
        match event {
            HotkeyEvent::KeyChanged(keys) => self.on_keys(keys).await,
            HotkeyEvent::TapDisabled => {
                warn!("event tap was disabled by the system and re-enabled");
                self.gestures.reset();
            }
        }
    }

    /// Hold logic first, then double-tap recognition on the same change
    async fn on_keys(&mut self, keys: KeyState) {
        let prev = self.machine.keys();
        if let Some(transition) = self.machine.handle_keys(keys) {
            self.controller
                .on_transition(&mut self.machine, transition)
                .await;
        }
        if let Some(gesture) = self.gestures.observe(&prev, &keys) {
            debug!(kind = ?gesture.kind, "gesture recognized");
            if let Some(transition) = self.machine.handle_gesture(gesture) {
                self.controller
                    .on_transition(&mut self.machine, transition)
                    .await;
            }
        }
    }

    async fn on_control(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            ControlCommand::Stop { reply } => {
                let was_active = self.machine.mode() != RecordingMode::Idle;
                info!(mode = %self.machine.mode(), "manual stop requested");
                if let Some(transition) = self.machine.stop() {
                    self.controller
                        .on_transition(&mut self.machine, transition)
                        .await;
                }
                let _ = reply.send(was_active);
            }
            ControlCommand::RetryKeyMonitor { reply } => {
                let _ = reply.send(self.start_key_monitor());
            }
        }
    }
}
