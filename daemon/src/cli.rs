//! Command-line interface definitions for the daemon.

use clap::{Parser, Subcommand, ValueEnum};

/// Top-level command-line interface definition.
#[derive(Debug, Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands for the daemon.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the daemon under the host's service manager.
    Service(ServiceArgs),

    #[cfg(target_os = "linux")]
    /// Install the daemon as a system service starting on boot.
    Install(crate::install::Args),
}

/// Arguments for the service command.
#[derive(Debug, Parser)]
pub struct ServiceArgs {
    /// Path to the configuration file
    #[arg(short, long, default_value = "doortray.toml")]
    pub config: String,

    #[arg(long, value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,

    /// Override the host service-control binding (defaults to the platform's native one).
    #[arg(long, value_enum)]
    pub host: Option<HostBinding>,
}

/// Output format for process logs.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    Compact,
    Json,
    Pretty,
}

/// Which host service-control protocol the daemon answers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HostBinding {
    /// Notification messages and signals of a managed init system (systemd-style).
    InitSystem,
    /// Discrete control codes of a service control manager (Windows SCM-style).
    ControlManager,
}
