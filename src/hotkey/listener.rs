//! Global key-state monitor using macOS CGEventTap
//!
//! Monitors system-wide FlagsChanged events for the fn, control and command
//! keys. Runs on a dedicated thread with its own CFRunLoop and hands every
//! tracked change to the event loop through a bounded channel. The observer
//! thread never touches session state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::keys::{KeyFlagFilter, KeyState};

/// How long `start()` waits for the observer thread to report the tap status
const STARTUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Events sent from the key monitor to the event loop
#[derive(Debug, Clone)]
pub enum HotkeyEvent {
    /// A tracked modifier changed
    KeyChanged(KeyState),
    /// Event tap was disabled by macOS and has been re-enabled
    TapDisabled,
}

/// Errors that can occur in the key monitor
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MonitorError {
    #[error("key monitor is already running")]
    AlreadyRunning,

    #[error("input monitoring permission not granted - enable the daemon under Privacy & Security > Accessibility")]
    PermissionDenied,

    #[error("failed to spawn monitor thread: {0}")]
    ThreadSpawn(String),

    #[error("monitor thread did not report readiness in time")]
    StartupTimeout,

    #[error("global key monitoring is not supported on this platform")]
    Unsupported,
}

/// Owned key-state monitor with explicit start/stop
pub struct KeyMonitor {
    event_tx: mpsc::Sender<HotkeyEvent>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl KeyMonitor {
    /// Create a new key monitor
    pub fn new(event_tx: mpsc::Sender<HotkeyEvent>) -> Self {
        Self {
            event_tx,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    /// Start the key monitor
    ///
    /// Spawns a dedicated thread that runs a CFRunLoop to receive CGEventTap
    /// callbacks and blocks until that thread reports whether the tap could
    /// be created. A missing Accessibility grant yields
    /// [`MonitorError::PermissionDenied`]; the caller decides when to retry.
    pub fn start(&mut self) -> Result<(), MonitorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(MonitorError::AlreadyRunning);
        }
        // A previous thread may have exited on its own (channel closed)
        if let Some(stale) = self.thread.take() {
            let _ = stale.join();
        }

        let event_tx = self.event_tx.clone();
        let running = Arc::clone(&self.running);
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel(1);

        let handle = thread::Builder::new()
            .name("key-monitor".to_string())
            .spawn(move || {
                info!("key monitor thread started");
                run_event_loop(event_tx, Arc::clone(&running), ready_tx);
                running.store(false, Ordering::SeqCst);
                info!("key monitor thread stopped");
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                MonitorError::ThreadSpawn(e.to_string())
            })?;

        match ready_rx.recv_timeout(STARTUP_TIMEOUT) {
            Ok(Ok(())) => {
                self.thread = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                self.thread = Some(handle);
                Err(MonitorError::StartupTimeout)
            }
        }
    }

    /// Stop the key monitor and wait for its thread to exit
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            // The run loop wakes at least every POLL_INTERVAL
            if handle.join().is_err() {
                warn!("key monitor thread panicked");
            }
        }
    }

    /// Check if the monitor is currently running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for KeyMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Result of handing one raw flag word to the event loop
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
#[derive(Debug, PartialEq, Eq)]
enum Dispatch {
    /// No tracked key changed
    Filtered,
    Sent,
    /// Loop is behind; the change is dropped rather than blocking the tap
    Dropped,
    Closed,
}

#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn dispatch(
    filter: &mut KeyFlagFilter,
    event_tx: &mpsc::Sender<HotkeyEvent>,
    bits: u64,
    at: Instant,
) -> Dispatch {
    let Some(state) = filter.accept(bits, at) else {
        return Dispatch::Filtered;
    };
    debug!(
        fn_pressed = state.fn_pressed,
        ctrl_pressed = state.ctrl_pressed,
        cmd_pressed = state.cmd_pressed,
        "modifier state changed"
    );
    match event_tx.try_send(HotkeyEvent::KeyChanged(state)) {
        Ok(()) => Dispatch::Sent,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("event loop is behind, dropping key change");
            Dispatch::Dropped
        }
        Err(mpsc::error::TrySendError::Closed(_)) => Dispatch::Closed,
    }
}

#[cfg(target_os = "macos")]
fn run_event_loop(
    event_tx: mpsc::Sender<HotkeyEvent>,
    running: Arc<AtomicBool>,
    ready_tx: std::sync::mpsc::SyncSender<Result<(), MonitorError>>,
) {
    use core_foundation::runloop::{kCFRunLoopCommonModes, kCFRunLoopDefaultMode, CFRunLoop};
    use core_graphics::event::{
        CGEvent, CGEventTap, CGEventTapLocation, CGEventTapOptions, CGEventTapPlacement,
        CGEventTapProxy, CGEventType,
    };
    use tracing::error;

    /// Upper bound on how long the run loop sleeps between stop checks
    const POLL_INTERVAL: Duration = Duration::from_millis(100);

    let mut filter = KeyFlagFilter::new();
    let tap_disabled = Arc::new(AtomicBool::new(false));
    let (callback_tx, callback_rx) = std::sync::mpsc::channel::<(u64, Instant)>();

    // CGEventTap callback - must be fast and non-blocking
    let disabled_flag = Arc::clone(&tap_disabled);
    let callback = move |_proxy: CGEventTapProxy,
                         event_type: CGEventType,
                         event: &CGEvent|
                         -> Option<CGEvent> {
        match event_type {
            CGEventType::FlagsChanged => {
                let _ = callback_tx.send((event.get_flags().bits(), Instant::now()));
            }
            CGEventType::TapDisabledByTimeout | CGEventType::TapDisabledByUserInput => {
                disabled_flag.store(true, Ordering::SeqCst);
            }
            _ => {}
        }
        None
    };

    let tap = match CGEventTap::new(
        CGEventTapLocation::Session,
        CGEventTapPlacement::HeadInsertEventTap,
        CGEventTapOptions::ListenOnly,
        vec![CGEventType::FlagsChanged],
        callback,
    ) {
        Ok(tap) => tap,
        Err(()) => {
            error!("failed to create event tap - is Accessibility permission granted?");
            let _ = ready_tx.send(Err(MonitorError::PermissionDenied));
            return;
        }
    };

    let Ok(run_loop_source) = tap.mach_port.create_runloop_source(0) else {
        error!("failed to create run loop source for event tap");
        let _ = ready_tx.send(Err(MonitorError::PermissionDenied));
        return;
    };
    let run_loop = CFRunLoop::get_current();
    unsafe {
        run_loop.add_source(&run_loop_source, kCFRunLoopCommonModes);
    }
    tap.enable();

    info!("event tap created and enabled");
    let _ = ready_tx.send(Ok(()));

    'outer: while running.load(Ordering::SeqCst) {
        unsafe {
            CFRunLoop::run_in_mode(kCFRunLoopDefaultMode, POLL_INTERVAL, true);
        }

        if tap_disabled.swap(false, Ordering::SeqCst) {
            warn!("event tap disabled by the system, re-enabling");
            tap.enable();
            if event_tx.try_send(HotkeyEvent::TapDisabled).is_err() {
                debug!("could not report tap re-enable");
            }
        }

        while let Ok((bits, at)) = callback_rx.try_recv() {
            if dispatch(&mut filter, &event_tx, bits, at) == Dispatch::Closed {
                warn!("key event channel closed, stopping monitor");
                break 'outer;
            }
        }
    }
}

#[cfg(not(target_os = "macos"))]
fn run_event_loop(
    _event_tx: mpsc::Sender<HotkeyEvent>,
    _running: Arc<AtomicBool>,
    ready_tx: std::sync::mpsc::SyncSender<Result<(), MonitorError>>,
) {
    let _ = ready_tx.send(Err(MonitorError::Unsupported));
}
