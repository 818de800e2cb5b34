//! Error types for the grid engine

use thiserror::Error;

/// Errors surfaced by exchange adapters.
///
/// Adapters translate venue-specific failures into this taxonomy so the
/// engine can pick a recovery path without string matching.
#[derive(Error, Debug, Clone)]
pub enum ExchangeError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("malformed response: {0}")]
    Parse(String),

    #[error("operation not supported by venue: {0}")]
    Unsupported(String),

    #[error("not connected")]
    NotConnected,
}

impl ExchangeError {
    /// True for failures worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::Transport(_) | ExchangeError::Timeout(_) | ExchangeError::NotConnected
        )
    }

    /// True when the venue has no record of the order (already gone).
    pub fn is_not_found(&self) -> bool {
        matches!(self, ExchangeError::NotFound(_))
    }
}

/// Errors that can occur in grid engine operations
#[derive(Error, Debug)]
pub enum GridError {
    #[error("invalid grid configuration: {0}")]
    InvalidConfig(String),

    #[error("grid level not found: index {0}")]
    LevelNotFound(u32),

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("order rejected: {0}")]
    OrderRejected(String),

    #[error("order placement failed after {attempts} attempts: {reason}")]
    OrderPlacementFailed { attempts: u32, reason: String },

    #[error("reset aborted at step '{step}': {reason}")]
    ResetFailed { step: String, reason: String },

    #[error("initialization error: {0}")]
    Initialization(String),

    #[error("engine is in invalid state for operation: {0}")]
    InvalidState(String),

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    ConfigFile(#[from] config::ConfigError),
}

/// Result type for grid operations
pub type GridResult<T> = std::result::Result<T, GridError>;
