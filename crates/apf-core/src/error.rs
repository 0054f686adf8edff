//! Unified error handling for the APF runtime.
//!
//! Registry mutation keeps its boolean contract (`register` returns `false`
//! on a rejected duplicate); everything else that can fail for more than one
//! reason reports it through this type.

use std::path::PathBuf;

use crate::module::Version;

/// Unified error type for the runtime.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Capability-id not registered, or cast target not supported.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Registration or binding collided with an existing entry.
    #[error("Duplicate: {0}")]
    Duplicate(String),

    /// Module version range does not include the host version.
    #[error("Incompatible module {path:?}: host version {host} outside its supported range")]
    Incompatible { path: PathBuf, host: Version },

    /// Library could not be opened, or a required symbol is missing.
    #[error("Failed to open module {path:?}: {reason}")]
    OpenFailure { path: PathBuf, reason: String },

    /// Operation attempted on an empty capability handle.
    #[error("Capability handle is empty")]
    Empty,

    /// The factory was found but produced no object.
    #[error("Factory for '{0}' returned no object")]
    CreationFailed(String),

    /// The path is already tracked as loaded.
    #[error("Module already loaded: {0:?}")]
    AlreadyLoaded(PathBuf),

    /// The path is not tracked as loaded.
    #[error("Module not loaded: {0:?}")]
    NotLoaded(PathBuf),

    /// `set_version` was never called on the loader.
    #[error("Host version not set; call set_version before loading modules")]
    VersionNotSet,

    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, Error>;

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(err.to_string())
    }
}
