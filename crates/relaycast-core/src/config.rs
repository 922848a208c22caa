//! Relaycast configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{RelayError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RelayConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub whatsapp: WhatsAppConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

impl RelayConfig {
    /// Load config from the default path (~/.relaycast/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| RelayError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.tick_interval_secs == 0 {
            return Err(RelayError::Config(
                "scheduler.tick_interval_secs must be greater than 0".into(),
            ));
        }
        if self.scheduler.send_timeout_secs == 0 {
            return Err(RelayError::Config(
                "scheduler.send_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.scheduler.retry_conflict_attempts == 0 {
            return Err(RelayError::Config(
                "scheduler.retry_conflict_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Relaycast home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".relaycast")
    }
}

/// Scheduler loop and dispatch pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Minimum gap between two sends on the same business account.
    #[serde(default = "default_send_delay")]
    pub send_delay_ms: u64,
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
    /// How many times the reconciler re-reads a recipient after a lost
    /// compare-and-set before giving up on an event.
    #[serde(default = "default_conflict_attempts")]
    pub retry_conflict_attempts: u32,
}

fn default_tick_interval() -> u64 { 60 }
fn default_send_delay() -> u64 { 1000 }
fn default_send_timeout() -> u64 { 30 }
fn default_conflict_attempts() -> u32 { 3 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            send_delay_ms: default_send_delay(),
            send_timeout_secs: default_send_timeout(),
            retry_conflict_attempts: default_conflict_attempts(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn send_delay(&self) -> Duration {
        Duration::from_millis(self.send_delay_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

/// WhatsApp Business Cloud API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Token Meta echoes back during webhook verification.
    #[serde(default)]
    pub webhook_verify_token: String,
    /// App secret for `X-Hub-Signature-256`; empty disables the check.
    #[serde(default)]
    pub app_secret: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_api_base() -> String { "https://graph.facebook.com".into() }
fn default_api_version() -> String { "v21.0".into() }
fn default_request_timeout() -> u64 { 30 }

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            api_version: default_api_version(),
            webhook_verify_token: String::new(),
            app_secret: String::new(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// HTTP gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 { 3000 }
fn default_host() -> String { "127.0.0.1".into() }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

/// SQLite store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.relaycast/campaigns.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

impl DatabaseConfig {
    /// Path with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}
