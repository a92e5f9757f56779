//! Error types for Turnstile.

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Invalid configuration or a limiter built without a backend
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed policy tier arguments
    #[error("Policy error: {0}")]
    Policy(String),

    /// The shared store no longer knows the cached script handle
    #[error("Script not loaded in shared store")]
    ScriptNotLoaded,

    /// Transient shared store failure
    #[error("Backend error: {0}")]
    Backend(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Layered settings errors
    #[error("Settings error: {0}")]
    Settings(#[from] ::config::ConfigError),
}

impl TurnstileError {
    /// Whether a retry against the backend may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ScriptNotLoaded | Self::Backend(_))
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
