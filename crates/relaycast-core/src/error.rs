//! Error types for Relaycast.

use thiserror::Error;

/// Unified error type across all Relaycast crates.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Send timed out after {0}s")]
    Timeout(u64),

    #[error("Campaign not found: {0}")]
    CampaignNotFound(String),

    #[error("Business account not found: {0}")]
    AccountNotFound(String),

    #[error("Campaign {0} is already being processed")]
    CampaignBusy(String),

    #[error("Invalid campaign state: {0}")]
    InvalidState(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Relaycast operations.
pub type Result<T> = std::result::Result<T, RelayError>;
