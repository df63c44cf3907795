//! Utilities to detect service management capabilities on the host system.

#[cfg(target_os = "linux")]
pub mod systemd;

/// Returns `true` if the current process is running as superuser (root).
#[cfg(unix)]
pub fn is_superuser() -> bool {
    nix::unistd::geteuid().as_raw() == 0
}

/// Returns `true` if the system uses systemd (detects `/run/systemd/system`).
#[cfg(target_os = "linux")]
pub fn is_systemd() -> bool {
    std::path::Path::new("/run/systemd/system").exists()
}
