//! Mapping from raw upstream sensor payloads to semantic states.

use tracing::warn;

/// Semantic state of the tracked sensor, derived per update and never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    Open,
    Closed,
    Unknown,
}

impl DomainState {
    /// Derives the semantic state from the upstream raw state string.
    ///
    /// Anything other than `"on"`/`"off"` is an anomaly: it is logged and maps
    /// to `Unknown`.
    pub fn from_raw(raw: &str) -> Self {
        match raw {
            "on" => Self::Open,
            "off" => Self::Closed,
            other => {
                warn!(payload = other, "unrecognized sensor payload");
                Self::Unknown
            }
        }
    }
}
