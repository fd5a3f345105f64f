//! Unified error types for tzdispatch.

use thiserror::Error;

/// Result type alias using DispatchError.
pub type Result<T> = std::result::Result<T, DispatchError>;

#[derive(Error, Debug)]
pub enum DispatchError {
    // Input errors, raised before any store access
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unsupported time zone: {0}")]
    UnsupportedZone(String),

    // Persistence errors
    #[error("Store error: {0}")]
    Store(String),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // General errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl DispatchError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn unsupported_zone(zone: impl Into<String>) -> Self {
        Self::UnsupportedZone(zone.into())
    }

    /// True for errors caused by caller input rather than infrastructure.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::UnsupportedZone(_))
    }
}
