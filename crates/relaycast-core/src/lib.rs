//! # Relaycast Core
//!
//! Shared domain model for the campaign engine: campaigns, recipients,
//! business accounts and webhook status events, plus the two capability
//! traits the engine is written against (`CampaignStore`, `MessageTransport`).

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use traits::{CampaignStore, MessageTransport};
