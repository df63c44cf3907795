//! Configuration loading for the daemon.

use std::env;
use std::path::Path;

use eyre::WrapErr as _;
use secrecy::SecretString;
use tokio::fs;

use crate::config::Config;

/// Environment variable consulted for the event-source credential when the
/// config file does not carry one.
pub const TOKEN_ENV_VAR: &str = "DOORTRAY_TOKEN";

/// Reads and parses the daemon config from a TOML file.
///
/// A token from the config file takes precedence over the environment.
///
/// # Errors
///
/// Returns an error if the config file cannot be read or parsed.
pub async fn load<P: AsRef<Path>>(path: P) -> eyre::Result<Config> {
    let path_ref = path.as_ref();
    let content = fs::read_to_string(&path).await.wrap_err(format!(
        "Failed to read config file at: {}",
        path_ref.display()
    ))?;
    let mut config: Config = toml::from_str(&content).wrap_err(format!(
        "Failed to parse config as TOML at: {}",
        path_ref.display()
    ))?;
    if config.server.token.is_none()
        && let Ok(token) = env::var(TOKEN_ENV_VAR)
    {
        config.server.token = Some(SecretString::from(token));
    }
    Ok(config)
}
