//! Service adapters: the glue between the lifecycle controller and the host's
//! service management.
//!
//! Two adapters exist, one per host protocol. Both own the fault channel's
//! receiving end and share one bounded restart policy, which is the only
//! place in the daemon that retries anything.

pub mod control_manager;
#[cfg(unix)]
pub mod init_system;

use core::time::Duration;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::time;

use crate::app::{Controller, LifecycleError};
use crate::config::ServiceConfig;

/// A host-facing service adapter. Runs until the host asks for a stop or the
/// restart budget is exhausted.
pub trait ServiceHost {
    async fn run(self) -> eyre::Result<()>;
}

/// Coarse service status reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    StartPending,
    Running,
    PausePending,
    Paused,
    ContinuePending,
    StopPending,
    Stopped,
}

/// Bounded, fixed-delay restart budget for retryable failures.
///
/// Consulted once per failure; it never schedules anything itself. With a
/// stability window configured, surviving that long since the previous
/// failure refunds the full budget.
pub struct RestartPolicy {
    max_restarts: u32,
    restart_delay: Duration,
    reset_after: Option<Duration>,
    restarts: u32,
    last_failure: Option<Instant>,
}

impl RestartPolicy {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(
            config.max_restarts,
            config.restart_delay(),
            config.restart_reset(),
        )
    }

    pub fn new(max_restarts: u32, restart_delay: Duration, reset_after: Option<Duration>) -> Self {
        Self {
            max_restarts,
            restart_delay,
            reset_after,
            restarts: 0,
            last_failure: None,
        }
    }

    /// Registers a failure. Returns the delay to wait before the next restart
    /// attempt, or `None` once the budget is spent.
    pub fn next_attempt(&mut self) -> Option<Duration> {
        let now = Instant::now();
        if let Some(reset_after) = self.reset_after
            && let Some(last_failure) = self.last_failure
            && now.duration_since(last_failure) >= reset_after
        {
            self.restarts = 0;
        }
        self.last_failure = Some(now);

        if self.restarts >= self.max_restarts {
            return None;
        }
        self.restarts += 1;
        Some(self.restart_delay)
    }

    /// Failures counted against the current budget.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }
}

/// Spawns a background resume, optionally delayed, reporting the outcome on
/// `results`. The adapter's control loop stays responsive while the resume
/// (and any restart delay) is in flight.
pub(crate) fn spawn_resume(
    controller: &Arc<Controller>,
    results: &mpsc::Sender<Result<(), LifecycleError>>,
    delay: Option<Duration>,
) {
    let controller = Arc::clone(controller);
    let results = results.clone();
    tokio::spawn(async move {
        if let Some(delay) = delay {
            time::sleep(delay).await;
        }
        let outcome = controller.resume().await;
        drop(results.send(outcome).await);
    });
}
