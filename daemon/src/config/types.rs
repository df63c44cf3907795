//! Configuration data types for the daemon.

use core::time::Duration;

use secrecy::{ExposeSecret as _, SecretString};
use serde::Deserialize;

/// Top-level daemon configuration, loaded from a TOML file.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Connection parameters of the external event source.
    pub server: ServerConfig,
    /// The single sensor entity mirrored into the tray.
    pub sensor: SensorConfig,
    /// Service-adapter tuning (heartbeat, restart policy).
    #[serde(default)]
    pub service: ServiceConfig,
    /// Presentation-sink tuning.
    #[serde(default)]
    pub tray: TrayConfig,
}

impl Config {
    /// Checks the parts of the config that `resume` depends on.
    ///
    /// # Errors
    ///
    /// Returns a description of the first missing or empty field.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.address.trim().is_empty() {
            return Err("server.address must not be empty".to_string());
        }
        match self.server.token {
            None => {
                return Err(format!(
                    "server token missing (set server.token or the {} environment variable)",
                    super::TOKEN_ENV_VAR
                ));
            }
            Some(ref token) if token.expose_secret().is_empty() => {
                return Err("server.token must not be empty".to_string());
            }
            Some(_) => {}
        }
        if self.sensor.entity.trim().is_empty() {
            return Err("sensor.entity must not be empty".to_string());
        }
        Ok(())
    }
}

/// Event-source connection section.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// WebSocket address of the event source, e.g. `ws://hass.local:8123/api/websocket`.
    pub address: String,
    /// Bearer credential for the event source. May be omitted in the file and
    /// supplied via the environment instead.
    #[serde(default)]
    pub token: Option<SecretString>,
    /// Seconds allowed for the full connect handshake (open, authenticate,
    /// subscribe, initial fetch) before the attempt counts as failed.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl ServerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// The tracked entity.
#[derive(Debug, Deserialize)]
pub struct SensorConfig {
    /// Entity identifier on the event source, e.g. `binary_sensor.front_door`.
    pub entity: String,
}

/// Service-adapter tuning section.
#[derive(Debug, Deserialize)]
pub struct ServiceConfig {
    /// Seconds between liveness reports to the host while running.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// How many times a failed background resume is retried before the adapter
    /// reports a fatal status and exits.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Fixed delay in seconds between restart attempts.
    #[serde(default = "default_restart_delay_secs")]
    pub restart_delay_secs: u64,
    /// Optional stability window in seconds after which the restart counter
    /// resets. Absent means the counter never resets.
    #[serde(default)]
    pub restart_reset_secs: Option<u64>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
            max_restarts: default_max_restarts(),
            restart_delay_secs: default_restart_delay_secs(),
            restart_reset_secs: None,
        }
    }
}

impl ServiceConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }

    pub fn restart_reset(&self) -> Option<Duration> {
        self.restart_reset_secs.map(Duration::from_secs)
    }
}

/// Presentation-sink tuning section.
#[derive(Debug, Deserialize)]
pub struct TrayConfig {
    /// Title handed to the tray surface on start.
    #[serde(default = "default_tray_title")]
    pub title: String,
    /// Seconds to wait for the surface's ready signal before `resume` fails.
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
}

impl Default for TrayConfig {
    fn default() -> Self {
        Self {
            title: default_tray_title(),
            ready_timeout_secs: default_ready_timeout_secs(),
        }
    }
}

impl TrayConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_max_restarts() -> u32 {
    3
}

fn default_restart_delay_secs() -> u64 {
    5
}

fn default_tray_title() -> String {
    format!("doortray v{}", env!("CARGO_PKG_VERSION"))
}

fn default_ready_timeout_secs() -> u64 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            server: ServerConfig {
                address: "ws://127.0.0.1:8123/api/websocket".to_string(),
                token: Some(SecretString::from("t0ken")),
                connect_timeout_secs: default_connect_timeout_secs(),
            },
            sensor: SensorConfig {
                entity: "binary_sensor.front_door".to_string(),
            },
            service: ServiceConfig::default(),
            tray: TrayConfig::default(),
        }
    }

    #[test]
    fn valid_config_passes_validation() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn empty_address_is_rejected() {
        let mut cfg = valid_config();
        cfg.server.address = "  ".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("server.address"), "unexpected message: {err}");
    }

    #[test]
    fn missing_token_is_rejected() {
        let mut cfg = valid_config();
        cfg.server.token = None;
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("token"), "unexpected message: {err}");
    }

    #[test]
    fn empty_token_is_rejected() {
        let mut cfg = valid_config();
        cfg.server.token = Some(SecretString::from(""));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_entity_is_rejected() {
        let mut cfg = valid_config();
        cfg.sensor.entity = String::new();
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("sensor.entity"), "unexpected message: {err}");
    }

    #[test]
    fn service_defaults_match_design_values() {
        let cfg = ServiceConfig::default();
        assert_eq!(cfg.heartbeat(), Duration::from_secs(30));
        assert_eq!(cfg.max_restarts, 3);
        assert_eq!(cfg.restart_delay(), Duration::from_secs(5));
        assert_eq!(cfg.restart_reset(), None);
    }

    #[test]
    fn connect_timeout_defaults_to_ten_seconds() {
        let cfg = valid_config();
        assert_eq!(cfg.server.connect_timeout(), Duration::from_secs(10));
    }
}
