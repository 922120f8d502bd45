//! Error types for the workout_core library.

use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for workout_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Wire frame could not be encoded or decoded
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Command could not be delivered to the machine
    #[error("Transport error: {0}")]
    Transport(String),

    /// An operation against the machine did not finish in time
    #[error("Timed out after {0} ms")]
    Timeout(u64),

    /// Command is not legal in the current session state
    #[error("State error: {0}")]
    State(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}
