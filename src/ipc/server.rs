//! Unix domain socket server for IPC
//!
//! Provides request-response communication and pushes notifications to
//! subscribed clients. Requests that touch session state are forwarded to
//! the event loop as [`ControlCommand`]s and answered from its reply.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::OwnedReadHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::hotkey::MonitorError;
use crate::orchestrator::ControlCommand;

use super::protocol::{DaemonStatus, Notification, Request, Response};

/// Largest accepted request body
const MAX_MESSAGE: usize = 1024 * 1024;

/// IPC Server handling client connections
pub struct Server {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    context: ClientContext,
    shutdown_tx: broadcast::Sender<()>,
}

/// What every client handler needs
#[derive(Clone)]
struct ClientContext {
    control_tx: mpsc::Sender<ControlCommand>,
    notify_tx: broadcast::Sender<Notification>,
    started_at: Instant,
}

impl Server {
    /// Bind the socket. `control_tx` reaches the event loop; subscribers are
    /// fed from `notify_tx`.
    pub fn new(
        socket_path: &Path,
        control_tx: mpsc::Sender<ControlCommand>,
        notify_tx: broadcast::Sender<Notification>,
    ) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create socket directory")?;
        }

        // Remove stale socket if it exists
        if socket_path.exists() {
            std::fs::remove_file(socket_path).context("failed to remove stale socket")?;
        }

        let listener = UnixListener::bind(socket_path).context("failed to bind Unix socket")?;

        // Set socket permissions to owner-only (0600)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        info!(?socket_path, "IPC server listening");

        Ok(Self {
            socket_path: socket_path.to_owned(),
            listener: Some(listener),
            context: ClientContext {
                control_tx,
                notify_tx,
                started_at: Instant::now(),
            },
            shutdown_tx,
        })
    }

    /// Run the server, accepting connections
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref().context("server not initialized")?;

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("client connected");
                    let context = self.context.clone();
                    let mut shutdown_rx = self.shutdown_tx.subscribe();

                    tokio::spawn(async move {
                        tokio::select! {
                            result = Self::handle_client(stream, context) => {
                                if let Err(e) = result {
                                    warn!(?e, "client handler error");
                                }
                            }
                            _ = shutdown_rx.recv() => {
                                debug!("client handler shutting down");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(?e, "accept error");
                }
            }
        }
    }

    /// Handle a single client connection
    ///
    /// Frames are read on a separate task so a pending read is never
    /// cancelled halfway by a notification.
    async fn handle_client(stream: UnixStream, context: ClientContext) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let (request_tx, mut request_rx) = mpsc::channel(8);
        let reader_task = tokio::spawn(Self::read_requests(reader, request_tx));
        let mut notifications: Option<broadcast::Receiver<Notification>> = None;

        let result = loop {
            tokio::select! {
                inbound = request_rx.recv() => {
                    let response = match inbound {
                        Some(Ok(Request::Subscribe)) => {
                            if notifications.is_none() {
                                notifications = Some(context.notify_tx.subscribe());
                                debug!("client subscribed to notifications");
                            }
                            Response::Subscribed
                        }
                        Some(Ok(request)) => {
                            debug!(?request, "received request");
                            Self::process_request(request, &context).await
                        }
                        Some(Err(message)) => Response::error("bad_request", message),
                        None => break Ok(()),
                    };
                    if let Err(e) = Self::send_message(&mut writer, &response).await {
                        break Err(e);
                    }
                }
                pushed = next_notification(&mut notifications) => match pushed {
                    Ok(notification) => {
                        if let Err(e) = Self::send_message(&mut writer, &notification).await {
                            break Err(e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "subscriber lagged, notifications dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => notifications = None,
                },
            }
        };

        reader_task.abort();
        result
    }

    /// Parse length-prefixed requests until EOF
    async fn read_requests(
        mut reader: OwnedReadHalf,
        request_tx: mpsc::Sender<Result<Request, String>>,
    ) -> Result<()> {
        while let Some(body) = read_frame(&mut reader).await? {
            let parsed = serde_json::from_slice::<Request>(&body).map_err(|e| e.to_string());
            if request_tx.send(parsed).await.is_err() {
                break;
            }
        }
        debug!("client disconnected");
        Ok(())
    }

    /// Send a length-prefixed JSON message
    async fn send_message<W, T>(writer: &mut W, msg: &T) -> Result<()>
    where
        W: AsyncWrite + Unpin,
        T: serde::Serialize,
    {
        let msg_bytes = serde_json::to_vec(msg)?;
        let msg_len = (msg_bytes.len() as u32).to_le_bytes();

        writer.write_all(&msg_len).await?;
        writer.write_all(&msg_bytes).await?;

        Ok(())
    }

    /// Process a request and return a response
    async fn process_request(request: Request, context: &ClientContext) -> Response {
        match request {
            Request::Ping => Response::Pong,

            Request::Subscribe => Response::Subscribed,

            Request::GetStatus => {
                match ask(&context.control_tx, |reply| ControlCommand::Status { reply }).await {
                    Some(status) => Response::Status(DaemonStatus::new(
                        status,
                        context.started_at.elapsed().as_secs(),
                    )),
                    None => Response::error("unavailable", "event loop is not running"),
                }
            }

            Request::Stop => {
                match ask(&context.control_tx, |reply| ControlCommand::Stop { reply }).await {
                    Some(was_active) => Response::Stopped { was_active },
                    None => Response::error("unavailable", "event loop is not running"),
                }
            }

            Request::RetryKeyMonitor => {
                match ask(&context.control_tx, |reply| ControlCommand::RetryKeyMonitor { reply })
                    .await
                {
                    Some(Ok(())) => Response::KeyMonitor { running: true },
                    Some(Err(MonitorError::PermissionDenied)) => Response::error(
                        "permission_denied",
                        MonitorError::PermissionDenied.to_string(),
                    ),
                    Some(Err(e)) => Response::error("key_monitor", e.to_string()),
                    None => Response::error("unavailable", "event loop is not running"),
                }
            }
        }
    }

    /// Gracefully shutdown the server
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        // Remove socket file
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(?e, "failed to remove socket file");
            }
        }

        info!("IPC server shutdown complete");
    }
}

/// Send a command carrying a reply channel and wait for the answer
async fn ask<T>(
    control_tx: &mpsc::Sender<ControlCommand>,
    command: impl FnOnce(oneshot::Sender<T>) -> ControlCommand,
) -> Option<T> {
    let (reply_tx, reply_rx) = oneshot::channel();
    control_tx.send(command(reply_tx)).await.ok()?;
    reply_rx.await.ok()
}

async fn next_notification(
    notifications: &mut Option<broadcast::Receiver<Notification>>,
) -> Result<Notification, broadcast::error::RecvError> {
    match notifications {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Read one length-prefixed frame; `None` on a clean EOF
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_MESSAGE {
        anyhow::bail!("message of {len} bytes exceeds limit");
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}
