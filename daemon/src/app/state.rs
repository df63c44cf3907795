//! Lifecycle state values and transition errors.

use core::fmt;

use thiserror::Error;

use crate::bridge::BridgeError;
use crate::tray::TrayError;

/// The three-valued lifecycle status of the daemon.
///
/// Exactly one instance exists, owned by the controller and guarded by its
/// state lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Stopped,
    Paused,
    Running,
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Paused => "paused",
            Self::Running => "running",
        };
        f.write_str(name)
    }
}

/// The requested lifecycle transition, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Start,
    Pause,
    Resume,
    Reload,
    Stop,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Reload => "reload",
            Self::Stop => "stop",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by lifecycle transitions.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The requested transition is not legal from the current state. Never
    /// retried; always surfaced to the caller.
    #[error("cannot {requested} while {current}")]
    IllegalTransition {
        current: AppState,
        requested: Transition,
    },
    /// The configuration misses something `resume` depends on. Requires
    /// operator intervention; not retried.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    /// The event bridge could not be brought up or lost its connection.
    /// Retried by the service adapter's bounded restart policy.
    #[error(transparent)]
    Connection(#[from] BridgeError),
    /// The presentation sink failed, including the ready-handshake timeout.
    /// Surfaced as a `resume` failure; not retried automatically.
    #[error(transparent)]
    Presentation(#[from] TrayError),
}

impl LifecycleError {
    /// Whether the service adapter may spend restart budget on this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}
