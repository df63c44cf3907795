//! The lifecycle controller: owns the `AppState` machine and supervises the
//! event bridge and presentation sink.
//!
//! All transitions are serialized by one state lock. Public operations acquire
//! the write lock exactly once and delegate to already-locked internals, so
//! composed operations like `reload` never re-enter a public locking method.
//! The current state is mirrored into a watch channel, so state reads never
//! wait on a transition in flight.

mod state;

pub use state::{AppState, LifecycleError, Transition};

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc, watch};
use tokio::time;
use tracing::{error, info, warn};

use crate::bridge::{BridgeError, EventBridge};
use crate::config::{self, Config};
use crate::mapper::DomainState;
use crate::tray::Tray;

/// Depth of the handoff queue between the event bridge and the tray sink.
pub const HANDOFF_QUEUE_DEPTH: usize = 8;

/// Owns the lifecycle state and every collaborator that must follow it.
pub struct Controller {
    inner: RwLock<Inner>,
    state: watch::Receiver<AppState>,
}

struct Inner {
    /// Written only under the outer write lock; mirrored out for lock-free reads.
    state: watch::Sender<AppState>,
    config: Arc<Config>,
    config_path: PathBuf,
    tray: Tray,
    bridge: Option<EventBridge>,
    /// Terminal bridge failures go here; the service adapter's restart policy
    /// listens on the other end.
    faults: mpsc::Sender<BridgeError>,
}

impl Controller {
    pub fn new(
        config: Arc<Config>,
        config_path: PathBuf,
        tray: Tray,
        faults: mpsc::Sender<BridgeError>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(AppState::Stopped);
        Self {
            inner: RwLock::new(Inner {
                state: state_tx,
                config,
                config_path,
                tray,
                bridge: None,
                faults,
            }),
            state: state_rx,
        }
    }

    /// Current lifecycle state, served from the watch mirror. Never waits on
    /// the transition lock or on I/O.
    pub fn state(&self) -> AppState {
        *self.state.borrow()
    }

    /// Transitions to `Running` immediately and brings the event bridge up in
    /// a detached task.
    ///
    /// The lock is released before the connect begins, and the connect itself
    /// is time-bounded, so later transitions queue behind it for at most the
    /// configured connect timeout. Bring-up failures are only logged here;
    /// service adapters use [`resume`] instead, which reports its outcome to
    /// the caller.
    ///
    /// [`resume`]: Controller::resume
    ///
    /// # Errors
    ///
    /// Fails with `IllegalTransition` when already running.
    pub async fn start(self: &Arc<Self>) -> Result<(), LifecycleError> {
        {
            let inner = self.inner.write().await;
            let current = *inner.state.borrow();
            match current {
                AppState::Running => {
                    return Err(LifecycleError::IllegalTransition {
                        current,
                        requested: Transition::Start,
                    });
                }
                AppState::Stopped | AppState::Paused => {}
            }
            inner.state.send_replace(AppState::Running);
            info!(state = %AppState::Running, "started, bringing collaborators up in the background");
        }

        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut inner = controller.inner.write().await;
            // A concurrent pause/stop may have won the lock in the meantime.
            if *inner.state.borrow() != AppState::Running || inner.bridge.is_some() {
                return;
            }
            if let Err(error) = inner.bring_up().await {
                error!(%error, "background bring-up after start failed");
            }
        });

        Ok(())
    }

    /// Disconnects from the event source and stops the tray surface.
    ///
    /// # Errors
    ///
    /// Fails with `IllegalTransition` from `Stopped`. Pausing while already
    /// paused is an idempotent success.
    pub async fn pause(&self) -> Result<(), LifecycleError> {
        let mut inner = self.inner.write().await;
        inner.pause_locked().await
    }

    /// Validates the configuration, starts the tray surface, connects to the
    /// event source and pushes the entity's current state before returning.
    ///
    /// Any failure leaves the state unchanged and tears down whatever
    /// partially started; whether to retry is the caller's decision.
    ///
    /// # Errors
    ///
    /// `ConfigInvalid`, `Presentation` (including the ready-handshake
    /// timeout) or `Connection`, depending on the failing step.
    pub async fn resume(&self) -> Result<(), LifecycleError> {
        let mut inner = self.inner.write().await;
        inner.resume_locked().await
    }

    /// Pauses, re-reads the configuration file, then resumes, atomically with
    /// respect to other transitions.
    ///
    /// # Errors
    ///
    /// Fails with `IllegalTransition` unless running. A pause failure aborts
    /// the reload without attempting to resume.
    pub async fn reload(&self) -> Result<(), LifecycleError> {
        let mut inner = self.inner.write().await;
        let current = *inner.state.borrow();
        match current {
            AppState::Running => {}
            AppState::Stopped | AppState::Paused => {
                return Err(LifecycleError::IllegalTransition {
                    current,
                    requested: Transition::Reload,
                });
            }
        }

        inner.pause_locked().await?;

        let fresh = config::load(&inner.config_path)
            .await
            .map_err(|error| LifecycleError::ConfigInvalid(format!("{error:#}")))?;
        inner.config = Arc::new(fresh);
        info!("configuration reloaded");

        inner.resume_locked().await
    }

    /// Tears everything down and transitions to `Stopped`.
    ///
    /// # Errors
    ///
    /// Fails with `IllegalTransition` when already stopped.
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        let mut inner = self.inner.write().await;
        let current = *inner.state.borrow();
        match current {
            AppState::Stopped => Err(LifecycleError::IllegalTransition {
                current,
                requested: Transition::Stop,
            }),
            AppState::Running | AppState::Paused => {
                inner.tear_down().await;
                inner.state.send_replace(AppState::Stopped);
                info!(state = %AppState::Stopped, "stopped");
                Ok(())
            }
        }
    }
}

impl Inner {
    async fn pause_locked(&mut self) -> Result<(), LifecycleError> {
        let current = *self.state.borrow();
        match current {
            AppState::Paused => {
                warn!("already paused");
                return Ok(());
            }
            AppState::Stopped => {
                return Err(LifecycleError::IllegalTransition {
                    current,
                    requested: Transition::Pause,
                });
            }
            AppState::Running => {}
        }

        self.tear_down().await;
        self.state.send_replace(AppState::Paused);
        info!(state = %AppState::Paused, "paused");
        Ok(())
    }

    async fn resume_locked(&mut self) -> Result<(), LifecycleError> {
        match *self.state.borrow() {
            AppState::Running => {
                warn!("already running");
                return Ok(());
            }
            AppState::Paused | AppState::Stopped => {}
        }

        self.bring_up().await?;
        self.state.send_replace(AppState::Running);
        info!(state = %AppState::Running, "resumed");
        Ok(())
    }

    /// Brings up the tray and the event bridge, rolling both back on failure.
    async fn bring_up(&mut self) -> Result<(), LifecycleError> {
        self.config
            .validate()
            .map_err(LifecycleError::ConfigInvalid)?;

        if let Err(error) = self.tray.start(&self.config.tray.title).await {
            self.tray.stop();
            return Err(error.into());
        }
        // The icon stays on Unknown until the first fetch lands.
        if let Err(error) = self.tray.set_icon(crate::tray::TrayIcon::Unknown) {
            self.tray.stop();
            return Err(error.into());
        }

        match self.connect_bridge().await {
            Ok(()) => Ok(()),
            Err(error) => {
                self.tear_down().await;
                Err(error)
            }
        }
    }

    async fn connect_bridge(&mut self) -> Result<(), LifecycleError> {
        let address = self.config.server.address.clone();
        let token = self
            .config
            .server
            .token
            .clone()
            .ok_or_else(|| LifecycleError::ConfigInvalid("server token missing".to_string()))?;
        let entity = self.config.sensor.entity.clone();
        let connect_timeout = self.config.server.connect_timeout();

        // The whole networked handshake is bounded; transitions queued on the
        // state lock wait at most this long behind a stuck connect.
        let (mut bridge, raw) = time::timeout(connect_timeout, async {
            let mut bridge = EventBridge::open(&address, &token).await?;
            bridge.subscribe().await?;
            let raw = bridge.current_state(&entity).await?;
            Ok::<_, BridgeError>((bridge, raw))
        })
        .await
        .map_err(|_| BridgeError::ConnectTimeout(connect_timeout))??;

        let (updates_tx, updates_rx) = mpsc::channel(HANDOFF_QUEUE_DEPTH);
        self.tray.attach_updates(updates_rx)?;

        let initial = DomainState::from_raw(&raw);
        let _ = updates_tx.send(initial).await;

        bridge.spawn_listener(entity, updates_tx, self.faults.clone())?;
        self.bridge = Some(bridge);
        Ok(())
    }

    /// Idempotent teardown of bridge and tray, in that order.
    async fn tear_down(&mut self) {
        if let Some(mut bridge) = self.bridge.take() {
            if let Err(error) = bridge.close().await {
                warn!(%error, "event bridge teardown failed");
            }
        }
        self.tray.stop();
    }
}
