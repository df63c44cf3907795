//! Shared service-management helpers for the doortray binaries.
//!
//! Provides init-system detection and systemd service installation used by the
//! daemon's `install` subcommand.

mod service_install;

pub use service_install::*;
