//! Daemon installer: sets up the daemon as a systemd service and scaffolds a
//! per-user config file.

use std::{
    fs::File,
    io::Write as _,
    os::unix::fs::{self, PermissionsExt as _},
    path::{Path, PathBuf},
};

use clap::Parser;
use eyre::WrapErr as _;
use nix::unistd::User;

use doortray_common::is_systemd;

const SERVICE_FILE_TEMPLATE: &str = include_str!("doortrayd.service.tmpl.ini");

/// Matches the name of the installed binary.
const SERVICE_NAME: &str = "doortrayd";

const CONFIG_TEMPLATE: &str = "\
[server]
address = \"{ address }\"
# Long-lived access token for the event source. May instead be supplied via
# the DOORTRAY_TOKEN environment variable.
# token = \"...\"

[sensor]
entity = \"{ entity }\"

# [service]
# heartbeat_secs = 30
# max_restarts = 3
# restart_delay_secs = 5
# restart_reset_secs = 300

# [tray]
# ready_timeout_secs = 5
";

/// Arguments for the `install` subcommand.
#[derive(Debug, Parser)]
pub struct Args {
    /// Username to own the generated config file and run the service.
    #[arg(env = "SUDO_USER")]
    user: String,

    /// WebSocket address of the event source.
    #[arg(long, default_value = "ws://homeassistant.local:8123/api/websocket")]
    address: String,

    /// Entity identifier to mirror into the tray.
    #[arg(long, default_value = "binary_sensor.front_door")]
    entity: String,
}

/// Installs the daemon as a systemd service and creates its config file.
///
/// # Errors
///
/// Returns `Err` when the host does not run systemd or when a filesystem or
/// service management step fails.
pub(crate) fn setup(args: &Args) -> eyre::Result<()> {
    if !is_systemd() {
        eyre::bail!("Unsupported init system: expected systemd.");
    }

    let user = &args.user;

    // sadly, due to the installation running under sudo, I can't use $XDG_CONFIG_HOME
    let config_location = PathBuf::from(format!("/home/{user}/.config/doortray/config.toml"));

    let unit_content = SERVICE_FILE_TEMPLATE
        .replace("{ description }", env!("CARGO_PKG_DESCRIPTION"))
        .replace("{ user }", user)
        .replace("{ config_location }", &config_location.to_string_lossy());

    doortray_common::systemd::install_self_as_service(SERVICE_NAME, &unit_content)
        .map_err(eyre::Report::msg)?;

    if Path::new(&config_location).exists() {
        println!("Config file already exists at {config_location:?}, not overwriting.");
    } else {
        write_config_scaffold(args, &config_location)?;
    }

    doortray_common::systemd::start_and_enable_self_as_service(SERVICE_NAME)
        .map_err(eyre::Report::msg)?;

    Ok(())
}

fn write_config_scaffold(args: &Args, config_location: &Path) -> eyre::Result<()> {
    let user = &args.user;

    let created_dir = if let Some(parent_dir) = config_location.parent()
        && !parent_dir.exists()
    {
        std::fs::create_dir_all(parent_dir).wrap_err("Failed to create config directory")?;
        true
    } else {
        false
    };

    let mut config_file = File::create(config_location).wrap_err(format!(
        "Failed to create config file at {}",
        config_location.display()
    ))?;
    let config_content = CONFIG_TEMPLATE
        .replace("{ address }", &args.address)
        .replace("{ entity }", &args.entity);
    config_file
        .write_all(config_content.as_bytes())
        .wrap_err("Failed to write config file")?;

    // The token may end up in this file, so keep it readable by the owner only.
    std::fs::set_permissions(config_location, std::fs::Permissions::from_mode(0o600))?;

    println!("Created config file at {config_location:?}");
    let user_info = User::from_name(user)
        .wrap_err("Failed to get user info")?
        .ok_or_else(|| eyre::eyre!("User {user} not found"))?;

    if created_dir && let Some(parent_dir) = config_location.parent() {
        std::fs::set_permissions(parent_dir, std::fs::Permissions::from_mode(0o700))?;
        fs::chown(
            parent_dir,
            Some(user_info.uid.into()),
            Some(user_info.gid.into()),
        )?;

        println!("Chowned config directory at {parent_dir:?} for {user}",);
    }

    fs::chown(
        config_location,
        Some(user_info.uid.into()),
        Some(user_info.gid.into()),
    )?;

    println!("Chowned config file at {config_location:?} for {user}",);
    Ok(())
}
