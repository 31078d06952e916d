//! Daemon server - IPC listener and main event loop

use std::sync::Arc;
use std::time::{Duration, Instant};

use interprocess::local_socket::traits::tokio::Listener as ListenerTrait;
use tokio::io::BufReader;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::common::{config::Config, error::IpcError, paths, Error, Result};
use crate::coordinator::{CoordinatorHandle, CoordinatorState};
use crate::ipc::{
    protocol::{Command, Request, Response},
    transport,
};

use super::handler;

/// How long the coordinator gets to release the hardware on exit
const STOP_GRACE: Duration = Duration::from_secs(10);

/// How long a signal waits for a running cycle before giving up on it
const ACTION_PATIENCE: Duration = Duration::from_secs(60);

/// A connection with no request for this long is dropped
const CLIENT_TIMEOUT: Duration = Duration::from_secs(300);

/// Main daemon server
pub struct Daemon {
    config: Arc<Config>,
    handle: CoordinatorHandle,
    coordinator: JoinHandle<()>,
    /// Time of the last request on any connection
    activity: watch::Sender<Instant>,
    /// Raised by a connection after a successful `shutdown` command
    stop: Arc<Notify>,
}

impl Daemon {
    pub fn new(config: Arc<Config>, handle: CoordinatorHandle, coordinator: JoinHandle<()>) -> Self {
        let (activity, _) = watch::channel(Instant::now());
        Self {
            config,
            handle,
            coordinator,
            activity,
            stop: Arc::new(Notify::new()),
        }
    }

    /// Serve connections until shutdown, a signal, or the idle timeout
    pub async fn run(self) -> Result<()> {
        let listener = transport::create_listener().await?;
        tracing::info!("Daemon listening on {}", paths::socket_name());

        let idle_timeout = match self.config.daemon.idle_timeout_minutes {
            0 => None,
            minutes => Some(Duration::from_secs(minutes * 60)),
        };
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        let signal = wait_for_signal();
        tokio::pin!(signal);

        loop {
            tokio::select! {
                received = &mut signal => {
                    match received {
                        Ok(name) => tracing::info!("Received {}, shutting down gracefully", name),
                        Err(e) => tracing::error!("Signal handler failed, shutting down: {}", e),
                    }
                    self.stop_coordinator().await;
                    break;
                }
                _ = self.stop.notified() => {
                    tracing::info!("Shutdown requested, exiting");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok(stream) => {
                            self.activity.send_replace(Instant::now());
                            tokio::spawn(serve_client(
                                stream,
                                self.handle.clone(),
                                self.activity.clone(),
                                self.stop.clone(),
                            ));
                        }
                        Err(e) => tracing::error!("Accept error: {}", e),
                    }
                }
                _ = tick.tick() => {
                    if let Some(timeout) = idle_timeout {
                        if self.is_idle(timeout) {
                            tracing::info!("Idle timeout reached, shutting down daemon");
                            self.stop_coordinator().await;
                            break;
                        }
                    }
                }
            }
        }

        tracing::info!("Cleaning up daemon resources");
        let Daemon {
            handle,
            mut coordinator,
            ..
        } = self;
        drop(handle);
        if tokio::time::timeout(STOP_GRACE, &mut coordinator).await.is_err() {
            tracing::warn!("Coordinator did not stop in time, aborting");
            coordinator.abort();
        }

        paths::remove_socket()?;
        tracing::info!("Daemon shutdown complete");
        Ok(())
    }

    /// No session, nothing running and no request for `timeout`
    fn is_idle(&self, timeout: Duration) -> bool {
        self.handle.status().state == CoordinatorState::Idle
            && !self.handle.is_busy()
            && self.activity.borrow().elapsed() > timeout
    }

    /// Let a running action finish so unsaved records reach the store
    async fn stop_coordinator(&self) {
        match self.handle.shutdown_when_idle(ACTION_PATIENCE).await {
            Ok(()) => {}
            Err(Error::ControlDisabled(action)) => {
                let unsaved = self
                    .handle
                    .status()
                    .session
                    .map(|s| s.unsaved)
                    .unwrap_or(0);
                tracing::warn!(
                    action = %action,
                    unsaved,
                    "Action still running after {:?}; unsaved DUT records will be lost",
                    ACTION_PATIENCE
                );
            }
            Err(e) => tracing::warn!("Coordinator did not stop cleanly: {}", e),
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigint.recv() => Ok("SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl+C")
}

/// Serve one client connection until it disconnects
///
/// Connections run on their own tasks, so `status` answers while another
/// client waits for a full cycle.
async fn serve_client(
    stream: transport::platform::Stream,
    handle: CoordinatorHandle,
    activity: watch::Sender<Instant>,
    stop: Arc<Notify>,
) {
    if let Err(e) = client_loop(stream, &handle, &activity, &stop).await {
        tracing::error!("Error handling client: {}", e);
    }
}

async fn client_loop(
    stream: transport::platform::Stream,
    handle: &CoordinatorHandle,
    activity: &watch::Sender<Instant>,
    stop: &Notify,
) -> Result<()> {
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    loop {
        let data = match tokio::time::timeout(CLIENT_TIMEOUT, transport::recv_message(&mut reader)).await {
            Ok(Ok(data)) => data,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                tracing::debug!("Client disconnected");
                break;
            }
            Ok(Err(e)) => {
                tracing::error!("Error reading request: {}", e);
                break;
            }
            Err(_) => {
                tracing::debug!("Client timeout");
                break;
            }
        };

        let request: Request = match serde_json::from_slice(&data) {
            Ok(request) => request,
            Err(e) => {
                tracing::error!("Invalid request: {}", e);
                let response = Response::error(
                    0,
                    IpcError {
                        code: "INVALID_REQUEST".to_string(),
                        message: e.to_string(),
                    },
                );
                transport::send_message(&mut writer, &serde_json::to_vec(&response)?).await?;
                continue;
            }
        };

        if request.command.is_query() {
            tracing::trace!("Received query: {:?}", request.command);
        } else {
            tracing::debug!("Received command: {:?}", request.command);
        }
        activity.send_replace(Instant::now());

        let shutdown = matches!(request.command, Command::Shutdown);
        let response = handler::handle_command(handle, request.id, request.command).await;
        let stopping = shutdown && response.success;

        transport::send_message(&mut writer, &serde_json::to_vec(&response)?).await?;
        activity.send_replace(Instant::now());

        if stopping {
            stop.notify_one();
            break;
        }
    }

    Ok(())
}
