//! Error types and handling for the subtunnel engine subsystem

use thiserror::Error;

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Subscription or link decoding errors
    #[error("Parse error: {0}")]
    Parse(String),

    /// No engine is registered for the profile's protocol
    #[error("Unsupported profile type: {0}")]
    UnsupportedProfile(String),

    /// External binary could not be launched
    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    /// External binary exited before it became usable
    #[error("Process exited: {0}")]
    ProcessExited(String),

    /// Network errors
    #[error("Network error: {0}")]
    Network(String),

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Invalid state errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Platform-specific errors
    #[error("Platform error: {0}")]
    Platform(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Other errors
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Helper trait for converting errors to EngineError
pub trait IntoEngineError<T> {
    fn into_engine_error(self, context: &str) -> Result<T>;
}

impl<T, E> IntoEngineError<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn into_engine_error(self, context: &str) -> Result<T> {
        self.map_err(|e| EngineError::Other(format!("{context}: {e}")))
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(err: toml::de::Error) -> Self {
        EngineError::Config(format!("TOML parsing error: {err}"))
    }
}

impl From<regex::Error> for EngineError {
    fn from(err: regex::Error) -> Self {
        EngineError::Config(format!("Invalid readiness marker: {err}"))
    }
}
