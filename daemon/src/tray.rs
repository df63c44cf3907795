//! Presentation sink: the tray surface contract and its controlling handle.
//!
//! Rendering internals are host-specific glue behind the [`TraySurface`]
//! trait; the daemon only depends on the start/ready-handshake, set-icon and
//! stop operations.

use core::time::Duration;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tracing::{info, warn};

use crate::mapper::DomainState;

/// Depth of the surface command channel. Surfaces are expected to drain
/// commands promptly; icon updates are latest-wins anyway.
const COMMAND_CHANNEL_DEPTH: usize = 8;

/// Icon variants the surface can display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrayIcon {
    Open,
    Closed,
    Unknown,
}

impl From<DomainState> for TrayIcon {
    fn from(state: DomainState) -> Self {
        match state {
            DomainState::Open => Self::Open,
            DomainState::Closed => Self::Closed,
            DomainState::Unknown => Self::Unknown,
        }
    }
}

/// Commands the handle sends to a running surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrayCommand {
    SetIcon(TrayIcon),
}

/// A host tray surface.
///
/// Implementations bring up their rendering loop on their own execution
/// context, send on `ready` once the surface is initialized, then consume
/// `commands` until the channel closes (which is the stop signal).
pub trait TraySurface: Send + Sync {
    fn spawn(&self, title: String, ready: oneshot::Sender<()>, commands: mpsc::Receiver<TrayCommand>);
}

/// Errors surfaced by the tray handle.
#[derive(Debug, Error)]
pub enum TrayError {
    #[error("tray surface did not become ready within {0:?}")]
    ReadyTimeout(Duration),
    #[error("tray surface exited before signalling readiness")]
    SurfaceFailed,
    #[error("tray is not active")]
    NotActive,
}

/// Controlling handle for the tray surface.
///
/// Owned by the lifecycle controller; active between a successful `start` and
/// the next `stop`.
pub struct Tray {
    surface: Arc<dyn TraySurface>,
    ready_timeout: Duration,
    commands: Option<mpsc::Sender<TrayCommand>>,
}

impl Tray {
    pub fn new(surface: Arc<dyn TraySurface>, ready_timeout: Duration) -> Self {
        Self {
            surface,
            ready_timeout,
            commands: None,
        }
    }

    /// Spawns the surface and waits for its ready signal.
    ///
    /// On timeout the command channel is retained, so a surface that comes up
    /// late still shuts down on the next `stop`.
    ///
    /// # Errors
    ///
    /// Fails with [`TrayError::ReadyTimeout`] when no readiness signal arrives
    /// in time, or [`TrayError::SurfaceFailed`] when the surface drops the
    /// ready channel without signalling.
    pub async fn start(&mut self, title: &str) -> Result<(), TrayError> {
        if self.commands.is_some() {
            warn!("tray surface is already active");
            return Ok(());
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_DEPTH);
        self.surface.spawn(title.to_string(), ready_tx, command_rx);
        self.commands = Some(command_tx);

        match time::timeout(self.ready_timeout, ready_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TrayError::SurfaceFailed),
            Err(_) => Err(TrayError::ReadyTimeout(self.ready_timeout)),
        }
    }

    /// Updates the displayed icon.
    ///
    /// # Errors
    ///
    /// Fails with [`TrayError::NotActive`] before `start` or after `stop`.
    pub fn set_icon(&self, icon: TrayIcon) -> Result<(), TrayError> {
        let commands = self.commands.as_ref().ok_or(TrayError::NotActive)?;
        match commands.try_send(TrayCommand::SetIcon(icon)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                // The surface is lagging; the queued icons still converge to
                // the latest state, so dropping this update is acceptable.
                warn!(?icon, "tray surface is not draining commands, dropping icon update");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(TrayError::NotActive),
        }
    }

    /// Spawns the consumer side of the handoff queue: each received state is
    /// forwarded to the surface as an icon update. The forwarder ends when the
    /// producer drops the queue or the surface stops.
    ///
    /// # Errors
    ///
    /// Fails with [`TrayError::NotActive`] when the surface is not running.
    pub fn attach_updates(&self, mut updates: mpsc::Receiver<DomainState>) -> Result<(), TrayError> {
        let commands = self
            .commands
            .as_ref()
            .ok_or(TrayError::NotActive)?
            .clone();
        tokio::spawn(async move {
            while let Some(state) = updates.recv().await {
                if commands.send(TrayCommand::SetIcon(state.into())).await.is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    /// Stops the surface by closing its command channel. Idempotent; safe to
    /// call even when `start` never completed.
    pub fn stop(&mut self) {
        self.commands = None;
    }
}

/// Headless default surface: logs icon changes instead of rendering them.
/// Real rendering backends are wired in by platform glue.
pub struct LogSurface;

impl TraySurface for LogSurface {
    fn spawn(&self, title: String, ready: oneshot::Sender<()>, mut commands: mpsc::Receiver<TrayCommand>) {
        tokio::spawn(async move {
            info!(%title, "tray surface started");
            let _ = ready.send(());
            while let Some(TrayCommand::SetIcon(icon)) = commands.recv().await {
                info!(?icon, "tray icon updated");
            }
            info!("tray surface stopped");
        });
    }
}

#[cfg(test)]
pub(crate) mod test_surfaces {
    use std::sync::Mutex;

    use super::*;

    /// Records every command it receives; signals readiness immediately.
    pub struct RecordingSurface {
        pub icons: Arc<Mutex<Vec<TrayIcon>>>,
    }

    impl RecordingSurface {
        pub fn new() -> (Self, Arc<Mutex<Vec<TrayIcon>>>) {
            let icons = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    icons: Arc::clone(&icons),
                },
                icons,
            )
        }
    }

    impl TraySurface for RecordingSurface {
        fn spawn(
            &self,
            _title: String,
            ready: oneshot::Sender<()>,
            mut commands: mpsc::Receiver<TrayCommand>,
        ) {
            let icons = Arc::clone(&self.icons);
            tokio::spawn(async move {
                let _ = ready.send(());
                while let Some(TrayCommand::SetIcon(icon)) = commands.recv().await {
                    icons.lock().unwrap().push(icon);
                }
            });
        }
    }

    /// Holds the ready channel open forever without ever signalling.
    pub struct NeverReadySurface;

    impl TraySurface for NeverReadySurface {
        fn spawn(
            &self,
            _title: String,
            ready: oneshot::Sender<()>,
            mut commands: mpsc::Receiver<TrayCommand>,
        ) {
            tokio::spawn(async move {
                // Keep `ready` alive so the caller observes a timeout rather
                // than a dropped channel, and stay stoppable via `commands`.
                let _ready = ready;
                while commands.recv().await.is_some() {}
            });
        }
    }
}
