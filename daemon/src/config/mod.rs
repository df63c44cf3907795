//! Configuration handling for the daemon.
//!
//! Split into data types and the file loader, which also applies the
//! environment credential override.

mod loader;
mod types;

pub use loader::{TOKEN_ENV_VAR, load};
pub use types::{Config, SensorConfig, ServerConfig, ServiceConfig, TrayConfig};
