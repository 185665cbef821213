//! Error types for pulsekit-core

use thiserror::Error;

/// Main error type for the pulsekit-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport-level failure (connection refused, timeout, unreadable body)
    #[error("HTTP error: {0}")]
    Http(String),

    /// The identify call did not produce a usable user id
    #[error("identity error: {0}")]
    Identity(String),

    /// An event API call was rejected before anything was queued
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// Push subscription or registration failure
    #[error("push error: {0}")]
    Push(String),

    /// Page/worker message channel failure
    #[error("worker bridge error: {0}")]
    Bridge(String),
}

/// Result type alias for pulsekit-core
pub type Result<T> = std::result::Result<T, Error>;
