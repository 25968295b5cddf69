//! Streaming session controller
//!
//! Reacts to mode transitions from the state machine and drives one session
//! at a time: focus snapshot, transport, video, then audio on start; media
//! forwarding and voice activity while live; the two-phase turn send on
//! commit; and recovery when a turn completes, fails or times out.
//!
//! All methods run on the daemon's event loop. Timeouts and inbound
//! transport traffic come back through channels, never through callbacks.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio::{VadEvent, VoiceActivityDetector};
use crate::capture::{AudioFrame, MediaFrame, MediaSource, AUDIO_MIME, VIDEO_MIME};
use crate::config::{SessionConfig, VadConfig};
use crate::events::SessionEvent;
use crate::focus::FocusSnapshot;
use crate::presenter::{Presenter, ResponseHandler};
use crate::state::{RecordingMode, StateMachine, Transition};
use crate::transport::{
    ConnectionId, EventSink, Inbound, TransportError, TransportEvent, TurnTransport,
};

use super::{PendingTurn, SessionContext, SessionError, TurnId, TurnResponse};

/// Frames buffered between the capture threads and the loop
const MEDIA_QUEUE: usize = 256;

/// External collaborators of a session
pub struct Collaborators {
    pub transport: Box<dyn TurnTransport>,
    pub audio: Box<dyn MediaSource>,
    pub video: Box<dyn MediaSource>,
    pub snapshot: Arc<dyn FocusSnapshot>,
    pub presenter: Arc<dyn Presenter>,
    pub responses: Arc<dyn ResponseHandler>,
}

/// Runtime state of the live session
struct LiveSession {
    context: SessionContext,
    /// Transport connection opened for this session
    connection: ConnectionId,
    audio_running: bool,
    video_running: bool,
    transport_open: bool,
    /// Selection already sent as turn content
    snapshot_sent: bool,
    /// Audio forwarded since the last commit
    streamed_audio: bool,
    /// Speech onset seen since the last commit
    uncommitted_speech: bool,
    /// Model parts of the outstanding turn
    response: String,
}

impl LiveSession {
    fn new(context: SessionContext, connection: ConnectionId) -> Self {
        Self {
            context,
            connection,
            audio_running: false,
            video_running: false,
            transport_open: true,
            snapshot_sent: false,
            streamed_audio: false,
            uncommitted_speech: false,
            response: String::new(),
        }
    }
}

pub struct SessionController {
    config: SessionConfig,
    io: Collaborators,
    vad: VoiceActivityDetector,
    media_tx: mpsc::Sender<MediaFrame>,
    media_rx: mpsc::Receiver<MediaFrame>,
    transport_tx: mpsc::Sender<Inbound>,
    timeout_tx: mpsc::Sender<TurnId>,
    event_tx: broadcast::Sender<SessionEvent>,
    session: Option<LiveSession>,
    pending: Option<PendingTurn>,
    next_turn_id: TurnId,
    next_connection: ConnectionId,
}

impl SessionController {
    /// Inbound transport events are delivered to `transport_tx` and fired
    /// response timeouts to `timeout_tx`; the owner feeds both back in.
    pub fn new(
        config: SessionConfig,
        vad: VadConfig,
        io: Collaborators,
        transport_tx: mpsc::Sender<Inbound>,
        timeout_tx: mpsc::Sender<TurnId>,
        event_tx: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let (media_tx, media_rx) = mpsc::channel(MEDIA_QUEUE);
        Self {
            config,
            io,
            vad: VoiceActivityDetector::new(vad),
            media_tx,
            media_rx,
            transport_tx,
            timeout_tx,
            event_tx,
            session: None,
            pending: None,
            next_turn_id: 1,
            next_connection: 1,
        }
    }

    /// Context of the live session, if any
    pub fn session(&self) -> Option<&SessionContext> {
        self.session.as_ref().map(|s| &s.context)
    }

    pub fn pending_turn(&self) -> Option<&PendingTurn> {
        self.pending.as_ref()
    }

    /// Next captured frame. Never yields `None` while the controller lives.
    pub async fn next_media(&mut self) -> Option<MediaFrame> {
        self.media_rx.recv().await
    }

    /// React to a transition reported by the state machine
    pub async fn on_transition(&mut self, machine: &mut StateMachine, transition: Transition) {
        match (transition.from, transition.to) {
            (_, to) if transition.is_start() => self.start_session(machine, to).await,
            (RecordingMode::Processing, to) => self.resume_after_turn(to).await,
            (_, RecordingMode::Processing) => {}
            (from, to) if from.is_active() && to.is_active() => self.change_mode(to).await,
            (from, _) if transition.is_stop() => self.finish_session(machine, from).await,
            (from, to) => debug!(%from, %to, "transition needs no session work"),
        }
    }

    /// Handle one captured frame
    pub async fn on_media(&mut self, machine: &mut StateMachine, frame: MediaFrame) {
        // Nothing is forwarded while a response is outstanding
        if self.session.is_none() || self.pending.is_some() {
            return;
        }

        let vad_input = match &frame {
            MediaFrame::Audio(audio) => Some((audio.rms, audio.captured_at)),
            MediaFrame::Video(_) => None,
        };
        if let Err(e) = self.forward(frame).await {
            self.fail_session(machine, e.into()).await;
            return;
        }
        let Some((rms, at)) = vad_input else {
            return;
        };

        match self.vad.process(rms, at) {
            Some(VadEvent::SpeechStarted) => {
                if let Some(session) = self.session.as_mut() {
                    session.uncommitted_speech = true;
                }
            }
            Some(VadEvent::SilenceDetected { speech }) => {
                if machine.mode().is_toggle() && self.config.auto_send_on_silence {
                    info!(
                        speech_ms = speech.as_millis() as u64,
                        "silence after speech, sending turn"
                    );
                    self.commit_turn(machine).await;
                }
            }
            None => {}
        }
    }

    /// Handle one inbound transport event
    ///
    /// Events from any connection but the live session's are dropped; a
    /// previous session's reader may still be draining into the queue.
    pub async fn on_transport_event(&mut self, machine: &mut StateMachine, inbound: Inbound) {
        let live = self
            .session
            .as_ref()
            .is_some_and(|s| s.connection == inbound.connection);
        if !live {
            debug!(
                connection = inbound.connection,
                event = ?inbound.event,
                "dropping event from a closed connection"
            );
            return;
        }

        match inbound.event {
            TransportEvent::ModelTurn(parts) => {
                if self.pending.is_some() {
                    if let Some(session) = self.session.as_mut() {
                        for part in parts {
                            session.response.push_str(&part);
                        }
                        return;
                    }
                }
                self.protocol_violation("model output with no outstanding turn");
            }
            TransportEvent::TurnComplete => self.complete_turn(machine).await,
            TransportEvent::Closed { reason } => {
                if let Some(session) = self.session.as_mut() {
                    session.transport_open = false;
                }
                warn!(%reason, "transport closed mid-session");

                if self.pending.is_some() {
                    let err = SessionError::ProtocolViolation(format!(
                        "connection closed with a turn outstanding: {reason}"
                    ));
                    self.recover(machine, err).await;
                }
                // Resumed into a live mode with no connection left
                if self.session.is_some() {
                    self.emit(SessionEvent::SessionAborted {
                        reason: format!("transport closed: {reason}"),
                    });
                    let _ = machine.stop();
                    self.teardown().await;
                }
            }
        }
    }

    /// A response timer fired
    pub async fn on_timeout(&mut self, machine: &mut StateMachine, turn_id: TurnId) {
        let current = self.pending.as_ref().is_some_and(|p| p.turn_id == turn_id);
        if !current {
            debug!(turn_id, "stale response timeout");
            return;
        }
        let err = SessionError::ResponseTimeout(self.config.response_timeout);
        self.recover(machine, err).await;
    }

    /// Release everything on daemon shutdown
    pub async fn shutdown(&mut self) {
        if self.session.is_some() {
            info!("ending session for shutdown");
        }
        self.teardown().await;
    }

    async fn start_session(&mut self, machine: &mut StateMachine, mode: RecordingMode) {
        if self.session.is_some() || self.pending.is_some() {
            warn!(%mode, error = %SessionError::SessionActive, "ignoring session start");
            return;
        }

        // Read focus before any device can steal it
        let selected = self.io.snapshot.selected_text().await;
        let app = self.io.snapshot.focused_app_name().await;
        let context = SessionContext::new(mode, selected, app, machine.keys().timestamp);
        info!(
            session_id = %context.id,
            %mode,
            app = %context.focused_app_name,
            selected_chars = context.selected_text_snapshot.chars().count(),
            "session starting"
        );

        let connection = self.next_connection;
        self.next_connection += 1;
        let events = EventSink::new(connection, self.transport_tx.clone());
        if let Err(e) = self.io.transport.open(events).await {
            self.abort_start(machine, e.into()).await;
            return;
        }
        self.session = Some(LiveSession::new(context, connection));
        self.vad.reset();

        // Video before audio so the first spoken words have a frame
        if mode.wants_screen() {
            self.start_video().await;
        }
        if let Err(e) = self.io.audio.start(self.media_tx.clone()).await {
            self.abort_start(machine, e.into()).await;
            return;
        }

        debug!(source = self.io.audio.name(), "capture started");

        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.audio_running = true;
        let screen = session.video_running;
        self.io.presenter.show(mode, screen);
    }

    async fn start_video(&mut self) {
        match self.io.video.start(self.media_tx.clone()).await {
            Ok(()) => {
                debug!(source = self.io.video.name(), "capture started");
                if let Some(session) = self.session.as_mut() {
                    session.video_running = true;
                }
            }
            Err(e) => {
                let err = SessionError::from(e);
                warn!(%err, "screen capture unavailable, continuing with audio only");
                self.report_permission(&err);
                self.emit(SessionEvent::CaptureDegraded {
                    reason: err.to_string(),
                });
            }
        }
    }

    async fn abort_start(&mut self, machine: &mut StateMachine, err: SessionError) {
        warn!(%err, "session start aborted");
        self.report_permission(&err);
        self.emit(SessionEvent::SessionAborted {
            reason: err.to_string(),
        });
        self.teardown().await;
        // The session is already gone, so the resulting stop needs no handling
        if let Some(transition) = machine.stop() {
            debug!(from = %transition.from, "state reset after aborted start");
        }
    }

    async fn change_mode(&mut self, to: RecordingMode) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.context.mode = to;
        let session_id = session.context.id;
        if to.wants_screen() && session.context.upgrade_screen_capture() {
            info!(%session_id, "screen capture enabled mid-session");
            self.emit(SessionEvent::ScreenCaptureUpgraded { session_id });
            self.start_video().await;
        }
        let screen = self.session.as_ref().is_some_and(|s| s.video_running);
        self.io.presenter.show(to, screen);
    }

    /// A live mode returned to Idle by key release, double-tap or manual stop
    async fn finish_session(&mut self, machine: &mut StateMachine, from: RecordingMode) {
        let Some(session) = self.session.as_ref() else {
            return;
        };

        let commit = if from.is_hold() {
            let keys = machine.keys();
            // A manual stop leaves fn down; measure to now instead
            let ended_at = if keys.fn_pressed {
                std::time::Instant::now()
            } else {
                keys.timestamp
            };
            let held = ended_at.saturating_duration_since(session.context.started_at);
            if held < self.config.min_hold {
                debug!(held_ms = held.as_millis() as u64, "hold too short, discarding");
            }
            held >= self.config.min_hold
        } else {
            session.uncommitted_speech
        };

        if !commit || !session.transport_open {
            self.teardown().await;
            return;
        }

        // Final turn: capture stops before anything is committed
        self.stop_capture().await;
        self.commit_turn(machine).await;
        if self.pending.is_none() {
            self.teardown().await;
        }
    }

    /// Two-phase send: content, then Processing and the response timer,
    /// then the turn-completion signal
    async fn commit_turn(&mut self, machine: &mut StateMachine) {
        if self.pending.is_some() {
            warn!("turn already outstanding, not committing");
            return;
        }
        if let Err(e) = self.flush_media().await {
            self.fail_session(machine, e.into()).await;
            return;
        }

        let Some(session) = self.session.as_ref() else {
            return;
        };
        let session_id = session.context.id;
        let text = if session.snapshot_sent {
            String::new()
        } else {
            session.context.selected_text_snapshot.clone()
        };
        if text.is_empty() && !session.streamed_audio {
            self.protocol_violation("turn has neither selected text nor audio");
            return;
        }

        if let Err(e) = self.io.transport.send_content(&text, false).await {
            self.fail_session(machine, e.into()).await;
            return;
        }

        let turn_id = self.next_turn_id;
        self.next_turn_id += 1;
        let _ = machine.enter_processing();
        self.pending = Some(PendingTurn::new(
            session_id,
            turn_id,
            self.spawn_timeout(turn_id),
        ));
        let screen = match self.session.as_mut() {
            Some(session) => {
                session.snapshot_sent = true;
                session.streamed_audio = false;
                session.uncommitted_speech = false;
                session.response.clear();
                session.video_running
            }
            None => false,
        };
        self.vad.reset();
        info!(%session_id, turn_id, "turn committed");
        self.emit(SessionEvent::TurnCommitted {
            session_id,
            turn_id,
        });
        self.io.presenter.show(RecordingMode::Processing, screen);

        if let Err(e) = self.io.transport.send_turn_complete().await {
            self.recover(machine, e.into()).await;
        }
    }

    async fn complete_turn(&mut self, machine: &mut StateMachine) {
        let Some(pending) = self.pending.take() else {
            self.protocol_violation("turn completion with no outstanding turn");
            return;
        };
        let (session_id, turn_id, latency) = (
            pending.session_id,
            pending.turn_id,
            pending.committed_at.elapsed(),
        );
        pending.cancel();

        let (text, focused_app_name) = match self.session.as_mut() {
            Some(session) => (
                std::mem::take(&mut session.response),
                session.context.focused_app_name.clone(),
            ),
            None => (String::new(), String::new()),
        };
        let response = TurnResponse {
            session_id,
            turn_id,
            text,
            focused_app_name,
        };
        info!(
            %session_id,
            turn_id,
            latency_ms = latency.as_millis() as u64,
            response_chars = response.text.chars().count(),
            "turn completed"
        );

        self.io.responses.handle(&response);
        self.io.presenter.show_result(&response.text);
        self.emit(SessionEvent::TurnCompleted {
            session_id,
            turn_id,
            response_chars: response.text.chars().count(),
        });

        if let Some(transition) = machine.exit_processing() {
            self.resume_after_turn(transition.to).await;
        }
    }

    /// Resolve the outstanding turn as failed and restore the resume mode
    async fn recover(&mut self, machine: &mut StateMachine, err: SessionError) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let (session_id, turn_id) = (pending.session_id, pending.turn_id);
        pending.cancel();
        warn!(%session_id, turn_id, %err, "turn failed, restoring mode");

        match &err {
            SessionError::ResponseTimeout(_) => {
                self.emit(SessionEvent::TurnTimedOut {
                    session_id,
                    turn_id,
                })
            }
            other => self.emit(SessionEvent::ProtocolViolation {
                reason: other.to_string(),
            }),
        }
        self.io.presenter.show_result(&err.to_string());
        if let Some(session) = self.session.as_mut() {
            session.response.clear();
        }

        if let Some(transition) = machine.exit_processing() {
            self.resume_after_turn(transition.to).await;
        }
    }

    async fn resume_after_turn(&mut self, to: RecordingMode) {
        if to == RecordingMode::Idle {
            self.teardown().await;
        } else {
            self.change_mode(to).await;
        }
    }

    /// End a session that cannot continue, outside of any pending turn
    async fn fail_session(&mut self, machine: &mut StateMachine, err: SessionError) {
        warn!(%err, "session failed");
        self.emit(SessionEvent::SessionAborted {
            reason: err.to_string(),
        });
        if let Some(session) = self.session.as_mut() {
            session.transport_open = false;
        }
        let _ = machine.stop();
        self.teardown().await;
    }

    async fn stop_capture(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let video = std::mem::take(&mut session.video_running);
        let audio = std::mem::take(&mut session.audio_running);
        if video {
            self.io.video.stop().await;
            debug!(source = self.io.video.name(), "capture stopped");
        }
        if audio {
            self.io.audio.stop().await;
            debug!(source = self.io.audio.name(), "capture stopped");
        }
    }

    async fn teardown(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.cancel();
        }
        self.stop_capture().await;
        if let Some(session) = self.session.take() {
            self.io.transport.close().await;
            info!(
                session_id = %session.context.id,
                mode = %session.context.mode,
                screen_upgraded = session.context.screen_upgraded(),
                "session ended"
            );
            self.io.presenter.hide();
        }
        self.discard_media();
        self.vad.reset();
    }

    async fn forward(&mut self, frame: MediaFrame) -> Result<(), TransportError> {
        match frame {
            MediaFrame::Audio(audio) => self.forward_audio(&audio).await,
            MediaFrame::Video(video) => {
                self.io
                    .transport
                    .send_media_chunk(&video.jpeg, VIDEO_MIME)
                    .await
            }
        }
    }

    async fn forward_audio(&mut self, frame: &AudioFrame) -> Result<(), TransportError> {
        self.io
            .transport
            .send_media_chunk(&frame.pcm, AUDIO_MIME)
            .await?;
        if let Some(session) = self.session.as_mut() {
            session.streamed_audio = true;
        }
        Ok(())
    }

    /// Forward every frame already queued
    async fn flush_media(&mut self) -> Result<(), TransportError> {
        while let Ok(frame) = self.media_rx.try_recv() {
            self.forward(frame).await?;
        }
        Ok(())
    }

    fn discard_media(&mut self) {
        let mut dropped = 0usize;
        while self.media_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "discarded frames from ended session");
        }
    }

    fn spawn_timeout(&self, turn_id: TurnId) -> JoinHandle<()> {
        let timeout_tx = self.timeout_tx.clone();
        let after = self.config.response_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = timeout_tx.send(turn_id).await;
        })
    }

    fn report_permission(&self, err: &SessionError) {
        if let SessionError::PermissionDenied(what) = err {
            self.emit(SessionEvent::PermissionRequired {
                reason: format!("{what} permission not granted"),
            });
        }
    }

    fn protocol_violation(&self, reason: &str) {
        let err = SessionError::ProtocolViolation(reason.to_string());
        warn!(%err, "dropped");
        self.emit(SessionEvent::ProtocolViolation {
            reason: reason.to_string(),
        });
    }

    fn emit(&self, event: SessionEvent) {
        debug!(%event, "emitting session event");
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::capture::CaptureError;
    use crate::gesture::GestureKind;
    use crate::session::testing::{Call, Harness, HarnessOptions};

    fn position(calls: &[Call], call: &Call) -> usize {
        calls
            .iter()
            .position(|c| c == call)
            .unwrap_or_else(|| panic!("{call:?} not in {calls:?}"))
    }

    #[tokio::test]
    async fn test_stt_hold_never_starts_video() {
        let mut h = Harness::new(HarnessOptions::default());
        h.keys(true, false, 0).await;

        assert_eq!(h.machine.mode(), RecordingMode::SttHold);
        let calls = h.calls();
        assert!(calls.contains(&Call::Start("microphone")));
        assert!(!calls.contains(&Call::Start("screen")));
        assert!(calls.contains(&Call::Show(RecordingMode::SttHold, false)));
    }

    #[tokio::test]
    async fn test_multimodal_hold_snapshot_then_video_then_audio() {
        let mut h = Harness::new(HarnessOptions {
            selected_text: "Hello world",
            ..HarnessOptions::default()
        });
        h.keys(true, true, 0).await;

        assert_eq!(h.machine.mode(), RecordingMode::MultimodalHold);
        let calls = h.calls();
        let snapshot = position(&calls, &Call::Snapshot);
        let open = position(&calls, &Call::Open);
        let video = position(&calls, &Call::Start("screen"));
        let audio = position(&calls, &Call::Start("microphone"));
        assert!(snapshot < open && open < video && video < audio);

        let ctx = h.controller.session().unwrap();
        assert!(ctx.enable_screen_capture);
        assert!(!ctx.is_toggle_mode);
        assert_eq!(ctx.selected_text_snapshot, "Hello world");
    }

    #[tokio::test]
    async fn test_multimodal_hold_two_phase_send_then_idle() {
        let mut h = Harness::new(HarnessOptions {
            selected_text: "Hello world",
            ..HarnessOptions::default()
        });
        h.keys(true, true, 0).await;
        h.speak(0.08, 0, 400).await;
        // Queued but not yet forwarded when the keys come up
        h.queue_audio(2);
        h.keys(false, false, 1000).await;

        let calls = h.calls();
        let stop_audio = position(&calls, &Call::Stop("microphone"));
        let stop_video = position(&calls, &Call::Stop("screen"));
        let content = position(&calls, &Call::Content("Hello world".to_string(), false));
        let complete = position(&calls, &Call::TurnComplete);
        assert!(stop_video < content && stop_audio < content);
        assert!(content < complete);
        let last_audio = calls.iter().rposition(|c| *c == Call::Media("audio")).unwrap();
        assert!(last_audio < content);
        assert_eq!(calls.iter().filter(|c| **c == Call::Media("audio")).count(), 22);

        assert_eq!(h.machine.mode(), RecordingMode::Processing);
        assert_eq!(h.machine.resume_mode(), Some(RecordingMode::Idle));
        assert!(h.controller.pending_turn().is_some());

        h.model(TransportEvent::ModelTurn(vec!["Do".to_string(), "ne".to_string()]))
            .await;
        h.model(TransportEvent::TurnComplete).await;

        assert_eq!(h.machine.mode(), RecordingMode::Idle);
        assert!(h.controller.pending_turn().is_none());
        assert!(h.controller.session().is_none());
        let calls = h.calls();
        assert!(calls.contains(&Call::Response("Done".to_string())));
        assert!(calls.contains(&Call::Close));
        assert_eq!(calls.last(), Some(&Call::Hide));
        assert!(h.events().iter().any(|e| matches!(
            e,
            SessionEvent::TurnCompleted { turn_id: 1, response_chars: 4, .. }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_timeout_restores_and_accepts_new_session() {
        let mut h = Harness::new(HarnessOptions {
            selected_text: "fix this",
            ..HarnessOptions::default()
        });
        h.keys(true, false, 0).await;
        h.keys(false, false, 500).await;
        assert_eq!(h.machine.mode(), RecordingMode::Processing);

        // A fresh press is refused while the turn is outstanding
        h.keys(true, false, 600).await;
        assert_eq!(h.machine.mode(), RecordingMode::Processing);
        h.keys(false, false, 700).await;

        tokio::time::advance(Duration::from_millis(9_900)).await;
        tokio::task::yield_now().await;
        tokio_test::assert_err!(h.timeout_rx.try_recv());

        tokio::time::advance(Duration::from_millis(200)).await;
        let turn_id = h.timeout_rx.recv().await.unwrap();
        h.controller.on_timeout(&mut h.machine, turn_id).await;

        assert_eq!(h.machine.mode(), RecordingMode::Idle);
        assert!(h.controller.pending_turn().is_none());
        assert!(h.controller.session().is_none());
        assert!(h
            .events()
            .iter()
            .any(|e| matches!(e, SessionEvent::TurnTimedOut { turn_id: 1, .. })));

        h.keys(true, false, 11_000).await;
        assert_eq!(h.machine.mode(), RecordingMode::SttHold);
        assert!(h.controller.session().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timeout_is_ignored() {
        let mut h = Harness::new(HarnessOptions {
            selected_text: "text",
            ..HarnessOptions::default()
        });
        h.keys(true, false, 0).await;
        h.keys(false, false, 500).await;
        h.model(TransportEvent::TurnComplete).await;
        assert_eq!(h.machine.mode(), RecordingMode::Idle);

        h.controller.on_timeout(&mut h.machine, 1).await;
        assert_eq!(h.machine.mode(), RecordingMode::Idle);
        assert!(!h
            .events()
            .iter()
            .any(|e| matches!(e, SessionEvent::TurnTimedOut { .. })));

        // The completed turn's timer was cleared
        tokio::time::advance(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;
        assert!(h.timeout_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stt_toggle_continues_until_second_double_tap() {
        let mut h = Harness::new(HarnessOptions::default());
        h.gesture(GestureKind::DoubleTapFn, 0).await;
        assert_eq!(h.machine.mode(), RecordingMode::SttToggle);
        assert!(h.controller.session().unwrap().is_toggle_mode);

        h.speak(0.08, 0, 2000).await;
        h.speak(0.0, 2000, 1600).await;

        let calls = h.calls();
        assert!(calls.contains(&Call::Content(String::new(), false)));
        assert!(calls.contains(&Call::TurnComplete));
        assert_eq!(h.machine.mode(), RecordingMode::Processing);
        assert_eq!(h.machine.resume_mode(), Some(RecordingMode::SttToggle));

        // Frames during Processing are dropped
        let forwarded = h.media_count();
        h.speak(0.08, 3600, 200).await;
        assert_eq!(h.media_count(), forwarded);

        h.model(TransportEvent::ModelTurn(vec!["ok".to_string()])).await;
        h.model(TransportEvent::TurnComplete).await;
        assert_eq!(h.machine.mode(), RecordingMode::SttToggle);
        assert!(h.controller.session().is_some());
        assert!(!h.calls().contains(&Call::Stop("microphone")));

        // Second turn in the same session
        h.speak(0.08, 4000, 2000).await;
        h.speak(0.0, 6000, 1600).await;
        assert_eq!(h.machine.mode(), RecordingMode::Processing);
        h.model(TransportEvent::TurnComplete).await;
        assert_eq!(h.machine.mode(), RecordingMode::SttToggle);

        h.gesture(GestureKind::DoubleTapFn, 8000).await;
        assert_eq!(h.machine.mode(), RecordingMode::Idle);
        assert!(h.controller.session().is_none());
        let calls = h.calls();
        assert!(calls.contains(&Call::Stop("microphone")));
        assert_eq!(calls.iter().filter(|c| **c == Call::TurnComplete).count(), 2);
    }

    #[tokio::test]
    async fn test_toggle_exit_with_uncommitted_speech_sends_final_turn() {
        let mut h = Harness::new(HarnessOptions::default());
        h.gesture(GestureKind::DoubleTapFnCtrl, 0).await;
        assert_eq!(h.machine.mode(), RecordingMode::MultimodalToggle);

        h.speak(0.08, 0, 600).await;
        h.gesture(GestureKind::DoubleTapFnCtrl, 700).await;

        assert_eq!(h.machine.mode(), RecordingMode::Processing);
        assert_eq!(h.machine.resume_mode(), Some(RecordingMode::Idle));
        let calls = h.calls();
        assert!(position(&calls, &Call::Stop("microphone")) < position(&calls, &Call::TurnComplete));

        h.model(TransportEvent::TurnComplete).await;
        assert_eq!(h.machine.mode(), RecordingMode::Idle);
        assert!(h.controller.session().is_none());
    }

    #[tokio::test]
    async fn test_toggle_exit_during_processing_is_deferred() {
        let mut h = Harness::new(HarnessOptions::default());
        h.gesture(GestureKind::DoubleTapFn, 0).await;
        h.speak(0.08, 0, 2000).await;
        h.speak(0.0, 2000, 1600).await;
        assert_eq!(h.machine.mode(), RecordingMode::Processing);

        h.gesture(GestureKind::DoubleTapFn, 3700).await;
        assert_eq!(h.machine.mode(), RecordingMode::Processing);
        assert_eq!(h.machine.resume_mode(), Some(RecordingMode::Idle));
        assert!(!h.calls().contains(&Call::Close));

        h.model(TransportEvent::TurnComplete).await;
        assert_eq!(h.machine.mode(), RecordingMode::Idle);
        assert!(h.calls().contains(&Call::Stop("microphone")));
        assert!(h.calls().contains(&Call::Close));
    }

    #[tokio::test]
    async fn test_duplicate_completion_is_ignored() {
        let mut h = Harness::new(HarnessOptions::default());
        h.gesture(GestureKind::DoubleTapFn, 0).await;
        h.speak(0.08, 0, 2000).await;
        h.speak(0.0, 2000, 1600).await;
        h.model(TransportEvent::TurnComplete).await;
        assert_eq!(h.machine.mode(), RecordingMode::SttToggle);
        h.events();

        h.model(TransportEvent::TurnComplete).await;
        h.model(TransportEvent::ModelTurn(vec!["late".to_string()])).await;

        assert_eq!(h.machine.mode(), RecordingMode::SttToggle);
        assert!(h.controller.session().is_some());
        let violations = h
            .events()
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::ProtocolViolation { .. }))
            .count();
        assert_eq!(violations, 2);
    }

    #[tokio::test]
    async fn test_video_failure_degrades_to_audio_only() {
        let mut h = Harness::new(HarnessOptions {
            video_error: Some(CaptureError::PermissionDenied("screen recording")),
            ..HarnessOptions::default()
        });
        h.keys(true, true, 0).await;

        assert_eq!(h.machine.mode(), RecordingMode::MultimodalHold);
        assert!(h.controller.session().is_some());
        let calls = h.calls();
        assert!(calls.contains(&Call::Start("microphone")));
        assert!(calls.contains(&Call::Show(RecordingMode::MultimodalHold, false)));
        let events = h.events();
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::CaptureDegraded { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::PermissionRequired { .. })));
    }

    #[tokio::test]
    async fn test_audio_failure_aborts_session() {
        let mut h = Harness::new(HarnessOptions {
            audio_error: Some(CaptureError::PermissionDenied("microphone")),
            ..HarnessOptions::default()
        });
        h.keys(true, true, 0).await;

        assert_eq!(h.machine.mode(), RecordingMode::Idle);
        assert!(h.controller.session().is_none());
        let calls = h.calls();
        assert!(calls.contains(&Call::Stop("screen")));
        assert!(calls.contains(&Call::Close));
        assert!(h
            .events()
            .iter()
            .any(|e| matches!(e, SessionEvent::SessionAborted { .. })));

        // Releasing the keys afterwards is a no-op
        h.keys(false, false, 300).await;
        assert_eq!(h.machine.mode(), RecordingMode::Idle);
    }

    #[tokio::test]
    async fn test_transport_open_failure_aborts_before_capture() {
        let mut h = Harness::new(HarnessOptions {
            fail_open: true,
            ..HarnessOptions::default()
        });
        h.keys(true, false, 0).await;

        assert_eq!(h.machine.mode(), RecordingMode::Idle);
        assert!(!h.calls().iter().any(|c| matches!(c, Call::Start(_))));
    }

    #[tokio::test]
    async fn test_short_hold_is_not_committed() {
        let mut h = Harness::new(HarnessOptions {
            selected_text: "text",
            ..HarnessOptions::default()
        });
        h.keys(true, false, 0).await;
        h.speak(0.08, 0, 100).await;
        h.keys(false, false, 120).await;

        assert_eq!(h.machine.mode(), RecordingMode::Idle);
        assert!(h.controller.session().is_none());
        let calls = h.calls();
        assert!(!calls.iter().any(|c| matches!(c, Call::Content(..))));
        assert!(calls.contains(&Call::Close));
    }

    #[tokio::test]
    async fn test_empty_turn_is_a_protocol_violation() {
        let mut h = Harness::new(HarnessOptions::default());
        h.keys(true, false, 0).await;
        h.keys(false, false, 800).await;

        assert_eq!(h.machine.mode(), RecordingMode::Idle);
        assert!(!h.calls().iter().any(|c| matches!(c, Call::Content(..))));
        assert!(h
            .events()
            .iter()
            .any(|e| matches!(e, SessionEvent::ProtocolViolation { .. })));
    }

    #[tokio::test]
    async fn test_ctrl_upgrade_starts_video_once() {
        let mut h = Harness::new(HarnessOptions {
            selected_text: "abc",
            ..HarnessOptions::default()
        });
        h.keys(true, false, 0).await;
        h.keys(true, true, 100).await;
        assert_eq!(h.machine.mode(), RecordingMode::MultimodalHold);
        h.keys(true, false, 200).await;
        h.keys(true, true, 300).await;

        let calls = h.calls();
        assert_eq!(calls.iter().filter(|c| **c == Call::Snapshot).count(), 1);
        assert_eq!(calls.iter().filter(|c| **c == Call::Start("screen")).count(), 1);
        // Downgrading does not stop the stream
        assert!(!calls.contains(&Call::Stop("screen")));
        let ctx = h.controller.session().unwrap();
        assert!(ctx.enable_screen_capture);
        assert!(ctx.screen_upgraded());
        assert_eq!(
            h.events()
                .iter()
                .filter(|e| matches!(e, SessionEvent::ScreenCaptureUpgraded { .. }))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_transport_close_during_turn_recovers() {
        let mut h = Harness::new(HarnessOptions::default());
        h.gesture(GestureKind::DoubleTapFn, 0).await;
        h.speak(0.08, 0, 2000).await;
        h.speak(0.0, 2000, 1600).await;
        assert_eq!(h.machine.mode(), RecordingMode::Processing);

        h.model(TransportEvent::Closed {
            reason: "going away".to_string(),
        })
        .await;

        assert_eq!(h.machine.mode(), RecordingMode::Idle);
        assert!(h.controller.pending_turn().is_none());
        assert!(h.controller.session().is_none());
        assert!(h.events().iter().any(|e| matches!(
            e,
            SessionEvent::ProtocolViolation { reason } if reason.contains("going away")
        )));
    }

    #[tokio::test]
    async fn test_transport_close_without_turn_ends_session() {
        let mut h = Harness::new(HarnessOptions::default());
        h.keys(true, false, 0).await;
        assert_eq!(h.machine.mode(), RecordingMode::SttHold);
        h.events();

        h.model(TransportEvent::Closed {
            reason: "going away".to_string(),
        })
        .await;

        assert_eq!(h.machine.mode(), RecordingMode::Idle);
        assert!(h.controller.session().is_none());
        assert!(h
            .events()
            .iter()
            .any(|e| matches!(e, SessionEvent::SessionAborted { .. })));
        let calls = h.calls();
        assert!(calls.contains(&Call::Stop("microphone")));
        assert!(calls.contains(&Call::Close));
        assert!(!calls.contains(&Call::TurnComplete));
    }

    #[tokio::test]
    async fn test_events_from_previous_connection_are_dropped() {
        let mut h = Harness::new(HarnessOptions::default());
        h.gesture(GestureKind::DoubleTapFn, 0).await;
        h.gesture(GestureKind::DoubleTapFn, 1000).await;
        assert!(h.controller.session().is_none());

        h.gesture(GestureKind::DoubleTapFn, 2000).await;
        assert_eq!(h.machine.mode(), RecordingMode::SttToggle);
        let connections = h.connections();
        assert_eq!(connections.len(), 2);
        h.events();

        // The first session's reader reports its close late
        h.model_on(
            &connections[0],
            TransportEvent::Closed {
                reason: "closed by server".to_string(),
            },
        )
        .await;
        h.model_on(&connections[0], TransportEvent::TurnComplete).await;

        assert_eq!(h.machine.mode(), RecordingMode::SttToggle);
        assert!(h.controller.session().is_some());
        assert!(h.events().is_empty());
        assert_eq!(h.calls().iter().filter(|c| **c == Call::Close).count(), 1);

        // The live connection is still honoured
        h.model_on(
            &connections[1],
            TransportEvent::Closed {
                reason: "closed by server".to_string(),
            },
        )
        .await;
        assert_eq!(h.machine.mode(), RecordingMode::Idle);
        assert!(h.controller.session().is_none());
    }

    #[tokio::test]
    async fn test_manual_stop_of_hold_commits() {
        let mut h = Harness::new(HarnessOptions {
            selected_text: "summarize",
            ..HarnessOptions::default()
        });
        h.keys(true, false, 0).await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        let transition = h.machine.stop().unwrap();
        h.controller.on_transition(&mut h.machine, transition).await;

        assert_eq!(h.machine.mode(), RecordingMode::Processing);
        assert!(h
            .calls()
            .contains(&Call::Content("summarize".to_string(), false)));
    }
}
