//! In-memory collaborators for exercising the controller and event loop

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::capture::{AudioFrame, CaptureError, MediaFrame, MediaSource, AUDIO_MIME};
use crate::config::{SessionConfig, VadConfig};
use crate::events::SessionEvent;
use crate::focus::FocusSnapshot;
use crate::gesture::{GestureEvent, GestureKind};
use crate::hotkey::KeyState;
use crate::presenter::{Presenter, ResponseHandler};
use crate::state::{RecordingMode, StateMachine};
use crate::transport::{EventSink, Inbound, TransportError, TransportEvent, TurnTransport};

use super::{Collaborators, SessionController, TurnId, TurnResponse};

/// Everything a collaborator was asked to do, in order
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Snapshot,
    Open,
    Content(String, bool),
    TurnComplete,
    Media(&'static str),
    Close,
    Start(&'static str),
    Stop(&'static str),
    Show(RecordingMode, bool),
    Hide,
    Result(String),
    Response(String),
}

pub type CallLog = Arc<Mutex<Vec<Call>>>;
pub type SenderSlot = Arc<Mutex<Option<mpsc::Sender<MediaFrame>>>>;
/// Event sinks handed to every successful `open`, oldest first
pub type ConnectionLog = Arc<Mutex<Vec<EventSink>>>;

fn record(log: &CallLog, call: Call) {
    log.lock().unwrap().push(call);
}

struct FakeTransport {
    log: CallLog,
    connections: ConnectionLog,
    fail_open: bool,
}

#[async_trait]
impl TurnTransport for FakeTransport {
    async fn open(&mut self, events: EventSink) -> Result<(), TransportError> {
        record(&self.log, Call::Open);
        if self.fail_open {
            return Err(TransportError::Connect("connection refused".to_string()));
        }
        self.connections.lock().unwrap().push(events);
        Ok(())
    }

    async fn send_content(&mut self, text: &str, turn_complete: bool) -> Result<(), TransportError> {
        record(&self.log, Call::Content(text.to_string(), turn_complete));
        Ok(())
    }

    async fn send_turn_complete(&mut self) -> Result<(), TransportError> {
        record(&self.log, Call::TurnComplete);
        Ok(())
    }

    async fn send_media_chunk(&mut self, _data: &[u8], mime_type: &str) -> Result<(), TransportError> {
        let kind = if mime_type == AUDIO_MIME { "audio" } else { "video" };
        record(&self.log, Call::Media(kind));
        Ok(())
    }

    async fn close(&mut self) {
        record(&self.log, Call::Close);
    }
}

struct FakeSource {
    name: &'static str,
    log: CallLog,
    error: Option<CaptureError>,
    sender: SenderSlot,
}

#[async_trait]
impl MediaSource for FakeSource {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn start(&mut self, media_tx: mpsc::Sender<MediaFrame>) -> Result<(), CaptureError> {
        record(&self.log, Call::Start(self.name));
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        *self.sender.lock().unwrap() = Some(media_tx);
        Ok(())
    }

    async fn stop(&mut self) {
        record(&self.log, Call::Stop(self.name));
        self.sender.lock().unwrap().take();
    }
}

struct FakeSnapshot {
    log: CallLog,
    text: &'static str,
}

#[async_trait]
impl FocusSnapshot for FakeSnapshot {
    async fn selected_text(&self) -> String {
        record(&self.log, Call::Snapshot);
        self.text.to_string()
    }

    async fn focused_app_name(&self) -> String {
        "Editor".to_string()
    }
}

struct FakePresenter {
    log: CallLog,
}

impl Presenter for FakePresenter {
    fn show(&self, mode: RecordingMode, screen_capture: bool) {
        record(&self.log, Call::Show(mode, screen_capture));
    }

    fn hide(&self) {
        record(&self.log, Call::Hide);
    }

    fn show_result(&self, preview: &str) {
        record(&self.log, Call::Result(preview.to_string()));
    }
}

impl ResponseHandler for FakePresenter {
    fn handle(&self, response: &TurnResponse) {
        record(&self.log, Call::Response(response.text.clone()));
    }
}

#[derive(Debug, Clone, Default)]
pub struct HarnessOptions {
    pub selected_text: &'static str,
    pub fail_open: bool,
    pub audio_error: Option<CaptureError>,
    pub video_error: Option<CaptureError>,
}

pub struct Fakes {
    pub collaborators: Collaborators,
    pub log: CallLog,
    pub mic: SenderSlot,
    pub connections: ConnectionLog,
}

pub fn fakes(options: HarnessOptions) -> Fakes {
    let log = CallLog::default();
    let mic = SenderSlot::default();
    let connections = ConnectionLog::default();
    let presenter = Arc::new(FakePresenter {
        log: Arc::clone(&log),
    });
    let collaborators = Collaborators {
        transport: Box::new(FakeTransport {
            log: Arc::clone(&log),
            connections: Arc::clone(&connections),
            fail_open: options.fail_open,
        }),
        audio: Box::new(FakeSource {
            name: "microphone",
            log: Arc::clone(&log),
            error: options.audio_error,
            sender: Arc::clone(&mic),
        }),
        video: Box::new(FakeSource {
            name: "screen",
            log: Arc::clone(&log),
            error: options.video_error,
            sender: SenderSlot::default(),
        }),
        snapshot: Arc::new(FakeSnapshot {
            log: Arc::clone(&log),
            text: options.selected_text,
        }),
        presenter: presenter.clone(),
        responses: presenter,
    };
    Fakes {
        collaborators,
        log,
        mic,
        connections,
    }
}

/// 20ms of silent PCM carrying the given energy reading
pub fn audio_frame(rms: f32, captured_at: Instant) -> MediaFrame {
    MediaFrame::Audio(AudioFrame {
        pcm: vec![0u8; 640],
        rms,
        captured_at,
    })
}

/// Drain every event currently on the bus
pub fn drain_events(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return events,
        }
    }
}

/// A controller and state machine wired to fakes, driven by hand
pub struct Harness {
    pub controller: SessionController,
    pub machine: StateMachine,
    pub timeout_rx: mpsc::Receiver<TurnId>,
    pub log: CallLog,
    mic: SenderSlot,
    connections: ConnectionLog,
    events_rx: broadcast::Receiver<SessionEvent>,
    transport_rx: mpsc::Receiver<Inbound>,
    t0: Instant,
}

impl Harness {
    pub fn new(options: HarnessOptions) -> Self {
        let (event_tx, events_rx) = broadcast::channel(256);
        let (transport_tx, transport_rx) = mpsc::channel(16);
        let (timeout_tx, timeout_rx) = mpsc::channel(4);
        let Fakes {
            collaborators,
            log,
            mic,
            connections,
        } = fakes(options);
        let controller = SessionController::new(
            SessionConfig::default(),
            VadConfig::default(),
            collaborators,
            transport_tx,
            timeout_tx,
            event_tx.clone(),
        );
        Self {
            controller,
            machine: StateMachine::new(event_tx),
            timeout_rx,
            log,
            mic,
            connections,
            events_rx,
            transport_rx,
            t0: Instant::now(),
        }
    }

    pub fn at(&self, ms: u64) -> Instant {
        self.t0 + Duration::from_millis(ms)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.log.lock().unwrap().clone()
    }

    pub fn media_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Media(_)))
            .count()
    }

    pub fn events(&mut self) -> Vec<SessionEvent> {
        drain_events(&mut self.events_rx)
    }

    /// Report a key snapshot at `ms`
    pub async fn keys(&mut self, fn_pressed: bool, ctrl_pressed: bool, ms: u64) {
        let keys = KeyState {
            fn_pressed,
            ctrl_pressed,
            cmd_pressed: false,
            timestamp: self.at(ms),
        };
        if let Some(transition) = self.machine.handle_keys(keys) {
            self.controller
                .on_transition(&mut self.machine, transition)
                .await;
        }
    }

    pub async fn gesture(&mut self, kind: GestureKind, ms: u64) {
        let event = GestureEvent {
            kind,
            timestamp: self.at(ms),
        };
        if let Some(transition) = self.machine.handle_gesture(event) {
            self.controller
                .on_transition(&mut self.machine, transition)
                .await;
        }
    }

    /// Deliver constant-energy audio frames straight to the controller
    pub async fn speak(&mut self, rms: f32, from_ms: u64, duration_ms: u64) {
        for i in 0..duration_ms / 20 {
            let frame = audio_frame(rms, self.at(from_ms + i * 20));
            self.controller.on_media(&mut self.machine, frame).await;
        }
    }

    /// Leave frames in the capture channel without delivering them
    pub fn queue_audio(&self, count: usize) {
        let sender = self.mic.lock().unwrap().clone().expect("microphone not running");
        for _ in 0..count {
            sender.try_send(audio_frame(0.08, Instant::now())).unwrap();
        }
    }

    /// Sinks of every connection opened so far, oldest first
    pub fn connections(&self) -> Vec<EventSink> {
        self.connections.lock().unwrap().clone()
    }

    /// Model output on the most recent connection
    pub async fn model(&mut self, event: TransportEvent) {
        let sink = self.connections().pop().expect("no connection opened");
        self.model_on(&sink, event).await;
    }

    /// Send through a connection's sink and deliver what the loop would read
    pub async fn model_on(&mut self, sink: &EventSink, event: TransportEvent) {
        assert!(sink.send(event).await);
        let inbound = self.transport_rx.recv().await.unwrap();
        self.controller
            .on_transport_event(&mut self.machine, inbound)
            .await;
    }
}
