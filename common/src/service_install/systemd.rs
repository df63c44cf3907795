//! Installation of the current binary as a systemd service.

use std::{
    env,
    fs::{self, File},
    io::Write as _,
    path::PathBuf,
    process::{Command, Stdio},
};

use crate::is_superuser;

/// Copies the current binary to `/usr/local/bin` and writes a systemd unit for it.
///
/// `unit_content` may contain a `{binary}` placeholder which is replaced with
/// the installed binary path. Any already-running instance of the service is
/// stopped before the binary is overwritten.
///
/// # Errors
///
/// Returns `Err` when not running as superuser or when a filesystem or
/// `systemctl` step fails.
pub fn install_self_as_service(name: &str, unit_content: &str) -> Result<(), String> {
    if !is_superuser() {
        return Err("You must run this command as root or with sudo.".to_string());
    }

    let binary_path = env::current_exe().map_err(|e| e.to_string())?;
    let target_bin = PathBuf::from("/usr/local/bin/").join(name);
    let service_name = format!("{name}.service");

    // Stop a potentially existing service before overwriting its binary
    drop(
        Command::new("systemctl")
            .arg("stop")
            .arg(&service_name)
            .stderr(Stdio::null())
            .status(),
    );

    fs::copy(binary_path, &target_bin).map_err(|e| e.to_string())?;
    println!("Installed binary to {target_bin:?}");

    let unit_path = format!("/etc/systemd/system/{service_name}");
    let unit_content = unit_content.replace("{binary}", &target_bin.to_string_lossy());

    let mut unit_file = File::create(&unit_path).map_err(|e| e.to_string())?;
    unit_file
        .write_all(unit_content.as_bytes())
        .map_err(|e| e.to_string())?;
    println!("Created systemd service file at {unit_path}");

    drop(unit_file);

    Command::new("systemctl")
        .arg("daemon-reload")
        .output()
        .map_err(|e| e.to_string())?;

    Ok(())
}

/// Enables the installed service to start on boot and starts it now.
///
/// # Errors
///
/// Returns `Err` when a `systemctl` invocation fails.
pub fn start_and_enable_self_as_service(name: &str) -> Result<(), String> {
    let service_name = format!("{name}.service");

    for action in ["enable", "start"] {
        Command::new("systemctl")
            .arg(action)
            .arg(&service_name)
            .output()
            .map_err(|e| e.to_string())?;
    }

    println!("Service {service_name} started and enabled.");
    Ok(())
}
