//! voice-command-daemon: hold-to-talk multimodal voice commands for macOS
//!
//! This daemon runs as a LaunchAgent and provides:
//! - Global fn/ctrl monitoring via CGEventTap, with hold and double-tap
//!   gestures
//! - A single-owner state machine over the recording modes
//! - Streaming sessions: selected text, microphone audio and optional
//!   screen frames sent to a turn-based model transport
//! - IPC for status queries, manual stop and overlay/response notifications

mod audio;
mod capture;
mod config;
mod events;
mod focus;
mod gesture;
mod hotkey;
mod ipc;
mod lifecycle;
mod orchestrator;
mod presenter;
mod screen;
mod session;
mod state;
mod transport;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::audio::Microphone;
use crate::config::Config;
use crate::events::SessionEvent;
use crate::focus::AccessibilitySnapshot;
use crate::ipc::{Notification, Server};
use crate::lifecycle::ShutdownSignal;
use crate::orchestrator::Orchestrator;
use crate::presenter::IpcPresenter;
use crate::screen::ScreenCapture;
use crate::session::Collaborators;
use crate::transport::LiveTransport;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "voice-command-daemon starting"
    );

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls CryptoProvider was already installed");
    }

    // Load configuration
    let config = Config::load()?;
    config.ensure_dirs()?;
    info!(?config.socket_path, transport = ?config.transport, "configuration loaded");
    if config.transport.api_key.is_none() {
        warn!("no API key configured, sessions will fail to connect");
    }

    // Create shutdown signal handler
    let shutdown = ShutdownSignal::new();

    // Create channels for inter-component communication
    // State machine and session controller -> event forwarder (session events)
    let (event_tx, _event_rx) = broadcast::channel::<SessionEvent>(256);
    // Presenter and event forwarder -> IPC server (for pushing to subscribed clients)
    let (notify_tx, _notify_rx) = broadcast::channel::<Notification>(256);
    // IPC server -> event loop
    let (control_tx, control_rx) = mpsc::channel(16);

    let presenter = Arc::new(IpcPresenter::new(notify_tx.clone()));
    let collaborators = Collaborators {
        transport: Box::new(LiveTransport::new(config.transport.clone())),
        audio: Box::new(Microphone::new()),
        video: Box::new(ScreenCapture::new(
            config.session.screen_interval,
            config.data_dir.join("screen-frame.jpg"),
        )),
        snapshot: Arc::new(AccessibilitySnapshot::new()),
        presenter: presenter.clone(),
        responses: presenter,
    };

    let mut orchestrator = Orchestrator::new(&config, collaborators, event_tx.clone(), control_rx);

    // Missing permission is reported to clients; the daemon keeps running
    if orchestrator.start_key_monitor().is_err() {
        warn!("continuing without key monitoring - grant Accessibility access and retry over IPC");
    }

    let server = Server::new(&config.socket_path, control_tx, notify_tx.clone())?;

    // Forward session events to subscribed clients
    let mut forward_rx = event_tx.subscribe();

    info!("daemon initialized, entering main loop");

    tokio::select! {
        _ = orchestrator.run() => {
            info!("event loop exited");
        }

        result = server.run() => {
            if let Err(e) = result {
                error!(?e, "IPC server error");
            }
        }

        _ = async {
            loop {
                match forward_rx.recv().await {
                    Ok(event) => {
                        info!(%event, "session event");
                        let _ = notify_tx.send(Notification::Event { event });
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "session event forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        } => {
            info!("session event forwarder exited");
        }

        _ = shutdown.wait() => {
            info!("shutdown signal received");
        }
    }

    // Cleanup
    info!("shutting down...");

    orchestrator.shutdown().await;
    server.shutdown().await;

    info!("voice-command-daemon stopped");

    Ok(())
}
