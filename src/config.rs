//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)
//!
//! Runtime-tunable options (delays, poll intervals, batch sizes) live in the
//! `settings` database table instead, so they can change without a restart;
//! see `data::settings`.

use serde::Deserialize;
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub platform: PlatformConfig,
    pub executor: ExecutorConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Remote platform configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
    /// Base URL of the platform API (e.g., "https://api.example.com")
    pub base_url: String,
    /// Signing-key cache lifetime in seconds (default: 86400 = 24h)
    pub signing_key_ttl_seconds: u64,
    /// Outbound request timeout in seconds
    pub request_timeout_seconds: u64,
    /// User agent sent when an account carries none
    pub default_user_agent: String,
}

/// Report executor configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// Consecutive signed-request failures before an account
    /// is demoted to invalid
    pub account_failure_threshold: u32,
    /// Per-account retry attempts within one execution
    pub max_attempt_retries: u32,
    /// Target-level re-queues before a target is marked failed
    pub max_target_retries: u32,
    /// Base backoff delay in milliseconds (doubled per retry)
    pub backoff_base_ms: u64,
    /// Backoff ceiling in milliseconds
    pub backoff_cap_ms: u64,
    /// Concurrent in-flight executions in a batch
    pub max_concurrency: usize,
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
    /// 4. Environment variables (MODPATROL_*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("platform.signing_key_ttl_seconds", 86_400)?
            .set_default("platform.request_timeout_seconds", 30)?
            .set_default(
                "platform.default_user_agent",
                "Mozilla/5.0 (X11; Linux x86_64) ModPatrol/0.1",
            )?
            .set_default("executor.account_failure_threshold", 3)?
            .set_default("executor.max_attempt_retries", 3)?
            .set_default("executor.max_target_retries", 3)?
            .set_default("executor.backoff_base_ms", 500)?
            .set_default("executor.backoff_cap_ms", 30_000)?
            .set_default("executor.max_concurrency", 4)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (MODPATROL_*)
            .add_source(
                Environment::with_prefix("MODPATROL")
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

    fn validate(&self) -> Result<(), crate::error::AppError> {
        let base_url = url::Url::parse(&self.platform.base_url).map_err(|e| {
            crate::error::AppError::Config(format!("platform.base_url is not a valid URL: {}", e))
        })?;

        match base_url.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(crate::error::AppError::Config(format!(
                    "platform.base_url must be http or https, got {}",
                    scheme
                )));
            }
        }

        if self.executor.account_failure_threshold == 0 {
            return Err(crate::error::AppError::Config(
                "executor.account_failure_threshold must be greater than 0".to_string(),
            ));
        }

        if self.executor.max_concurrency == 0 {
            return Err(crate::error::AppError::Config(
                "executor.max_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.executor.backoff_cap_ms < self.executor.backoff_base_ms {
            return Err(crate::error::AppError::Config(
                "executor.backoff_cap_ms must not be below executor.backoff_base_ms".to_string(),
            ));
        }

        Ok(())
    }
}
