//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{path::PathBuf, time::Duration};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub federation: FederationConfig,
    #[serde(default)]
    pub blacklist: BlacklistConfig,
    pub archive: ArchiveConfig,
    pub admin: AdminConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain, with port when non-default (e.g., "board.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Base URL of the instance, which is also the id of the main actor.
    ///
    /// # Returns
    /// Full URL like "https://board.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Outbound delivery and signature settings
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Delivery attempts per recipient (default: 5)
    pub max_attempts: u32,
    /// Linear backoff unit; attempt N sleeps N units first (default: 60)
    pub backoff_unit_secs: u64,
    /// Pause between scheduling recipients (default: 150)
    pub spacing_ms: u64,
    /// Maximum clock skew for inbound `Date` headers (default: 75)
    pub replay_window_secs: u64,
    /// Per-request client timeout (default: 30)
    pub request_timeout_secs: u64,
    /// RSA modulus size for provisioned keys (default: 2048)
    pub key_bits: usize,
    /// Directory holding `<name>-private.pem` / `<name>-public.pem`
    pub key_directory: PathBuf,
    /// User-Agent for outbound requests
    pub user_agent: String,
}

impl FederationConfig {
    pub fn backoff_unit(&self) -> Duration {
        Duration::from_secs(self.backoff_unit_secs)
    }

    pub fn spacing(&self) -> Duration {
        Duration::from_millis(self.spacing_ms)
    }

    pub fn replay_window(&self) -> Duration {
        Duration::from_secs(self.replay_window_secs)
    }
}

/// Content denylist
#[derive(Debug, Clone, Deserialize, Default)]
pub struct BlacklistConfig {
    /// Regular expressions matched against post name and content
    #[serde(default)]
    pub patterns: Vec<String>,
}

/// Thread archival rotation
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// Live threads kept per board before older ones are archived (default: 165)
    pub thread_limit: i64,
}

/// Operator API access
#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    /// Bearer token required on /admin routes
    pub token: String,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (CHANFED__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("database.path", "data/chanfed.db")?
            .set_default("federation.max_attempts", 5)?
            .set_default("federation.backoff_unit_secs", 60)?
            .set_default("federation.spacing_ms", 150)?
            .set_default("federation.replay_window_secs", 75)?
            .set_default("federation.request_timeout_secs", 30)?
            .set_default("federation.key_bits", 2048)?
            .set_default("federation.key_directory", "keys")?
            .set_default(
                "federation.user_agent",
                format!("chanfed/{}", env!("CARGO_PKG_VERSION")),
            )?
            .set_default("archive.thread_limit", 165)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("CHANFED")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        let protocol = self.server.protocol.to_ascii_lowercase();
        if protocol != "http" && protocol != "https" {
            return Err(AppError::Config(
                "server.protocol must be http or https".to_string(),
            ));
        }

        if self.server.domain.trim().is_empty() {
            return Err(AppError::Config("server.domain must be set".to_string()));
        }

        if self.federation.max_attempts == 0 {
            return Err(AppError::Config(
                "federation.max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.admin.token.trim().is_empty() {
            return Err(AppError::Config("admin.token must be set".to_string()));
        }

        for pattern in &self.blacklist.patterns {
            regex::Regex::new(pattern).map_err(|e| {
                AppError::Config(format!("blacklist pattern {pattern:?} is invalid: {e}"))
            })?;
        }

        Ok(())
    }
}
