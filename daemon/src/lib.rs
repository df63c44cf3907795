//! Library entry for the doortray daemon.
//!
//! Mirrors the state of one external sensor into a host tray indicator while
//! answering the host's native service-control protocol. Exposes `inner_main`
//! so the workspace-level shim binary can call into the daemon logic.

pub mod app;
pub mod bridge;
pub mod cli;
pub mod config;
#[cfg(target_os = "linux")]
mod install;
pub mod mapper;
pub mod service;
pub mod tray;

use std::fs;
use std::path::Path;
use std::sync::{Arc, Once};

use eyre::{Result, WrapErr as _};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::app::Controller;
use crate::cli::{Cli, Command, HostBinding, LogFormat};
use crate::service::control_manager::{ControlCode, ControlManagerService, control_channel};
#[cfg(unix)]
use crate::service::init_system::InitSystemService;
use crate::service::{RestartPolicy, ServiceHost as _};
use crate::tray::{LogSurface, Tray};

static INIT_TRACING: Once = Once::new();

/// The daemon's main function; can be called from a shim binary.
///
/// Parses CLI and dispatches install or service startup.
///
/// # Errors
///
/// Returns an error if installation fails or if the service fails to start.
pub async fn inner_main(invocation: Cli) -> Result<()> {
    match invocation.command {
        #[cfg(target_os = "linux")]
        Command::Install(args) => {
            install::setup(&args)?;
            Ok(())
        }
        Command::Service(args) => {
            INIT_TRACING.call_once(|| {
                let builder = tracing_subscriber::fmt().with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
                );

                match args.log_format {
                    LogFormat::Compact => builder.compact().init(),
                    LogFormat::Json => builder.json().init(),
                    LogFormat::Pretty => builder.pretty().init(),
                }
            });

            let config = &args.config;
            let config_path =
                fs::canonicalize(config).wrap_err(format!("Config file not found at: {config}"))?;

            info!(
                ?config_path,
                pid = std::process::id(),
                version = env!("CARGO_PKG_VERSION"),
                "starting doortray"
            );

            run_service(&config_path, args.host).await
        }
    }
}

/// The host binding used when the CLI does not force one.
fn native_binding() -> HostBinding {
    if cfg!(unix) {
        HostBinding::InitSystem
    } else {
        HostBinding::ControlManager
    }
}

/// Wires the lifecycle controller to the selected service adapter and runs it
/// until the host requests shutdown or the restart budget is exhausted.
async fn run_service(config_path: &Path, host: Option<HostBinding>) -> Result<()> {
    let config = Arc::new(config::load(config_path).await?);

    let tray = Tray::new(Arc::new(LogSurface), config.tray.ready_timeout());
    let (fault_tx, fault_rx) = mpsc::channel(4);
    let controller = Arc::new(Controller::new(
        Arc::clone(&config),
        config_path.to_path_buf(),
        tray,
        fault_tx,
    ));
    let policy = RestartPolicy::from_config(&config.service);
    let heartbeat = config.service.heartbeat();

    match host.unwrap_or_else(native_binding) {
        HostBinding::InitSystem => {
            #[cfg(unix)]
            {
                InitSystemService::new(controller, fault_rx, policy, heartbeat)
                    .run()
                    .await
            }
            #[cfg(not(unix))]
            {
                eyre::bail!("the init-system binding is only available on unix hosts")
            }
        }
        HostBinding::ControlManager => {
            let (handle, requests) = control_channel(4);

            // Interrupt glue: a plain Ctrl-C submits a Stop control code, so the
            // daemon remains stoppable even without a service manager attached.
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    let _ = handle.submit(ControlCode::Stop).await;
                }
            });

            ControlManagerService::new(controller, requests, fault_rx, policy, heartbeat)
                .run()
                .await
        }
    }
}
