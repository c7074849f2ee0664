// Configuration File Support
//
// TOML configuration for the metergate sidecar with environment variable
// overrides. Files are loaded from the XDG config directory
// (~/.config/metergate/config.toml) unless a path is given.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::credits::{RetryConfig, DEFAULT_ESTIMATED_TOKENS};
use crate::rate_limit::{RateLimitConfig, StoreBackend};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub rate_limit: RateLimitConfig,
    pub credits: CreditConfig,
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// HTTP sidecar configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// Whole-request timeout in seconds
    pub request_timeout_secs: u64,

    /// Expose the /admin routes
    pub admin_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout_secs: 30,
            admin_enabled: true,
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Credit metering configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CreditConfig {
    /// Estimate used when the caller does not send one
    pub default_estimated_tokens: u64,

    /// Timeout for a single ledger call in milliseconds
    pub ledger_timeout_ms: u64,

    /// Balances seeded into the in-memory ledger at start-up
    pub initial_balances: HashMap<String, i64>,

    /// How often failed deductions are retried
    pub reconciliation_interval_secs: u64,

    pub retry: RetryConfig,
}

impl Default for CreditConfig {
    fn default() -> Self {
        Self {
            default_estimated_tokens: DEFAULT_ESTIMATED_TOKENS,
            ledger_timeout_ms: 2000,
            initial_balances: HashMap::new(),
            reconciliation_interval_secs: 30,
            retry: RetryConfig::default(),
        }
    }
}

impl CreditConfig {
    pub fn ledger_timeout(&self) -> Duration {
        Duration::from_millis(self.ledger_timeout_ms)
    }

    pub fn reconciliation_interval(&self) -> Duration {
        Duration::from_secs(self.reconciliation_interval_secs)
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve Prometheus metrics on /metrics
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    /// Load configuration from the default XDG config directory
    ///
    /// A missing file yields the default configuration. Environment overrides
    /// are applied and the result is validated either way.
    pub fn load() -> Result<Self> {
        Self::load_from_path(Self::config_path())
    }

    /// Load from `path` when given, otherwise from the XDG location
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed, or if the
    /// resulting configuration is invalid.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path
    ///
    /// Returns `~/.config/metergate/config.toml` on Linux
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("dev", "metergate", "metergate") {
            proj_dirs.config_dir().join("config.toml")
        } else {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home)
                .join(".config")
                .join("metergate")
                .join("config.toml")
        }
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - METERGATE_LOG_LEVEL
    /// - METERGATE_LOG_FORMAT
    /// - METERGATE_HOST
    /// - METERGATE_PORT
    /// - METERGATE_DEFAULT_ESTIMATED_TOKENS
    /// - METERGATE_RATE_LIMIT_* and METERGATE_REDIS_URL (see [`RateLimitConfig`])
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(level) = std::env::var("METERGATE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("METERGATE_LOG_FORMAT") {
            self.logging.format = format;
        }

        if let Ok(host) = std::env::var("METERGATE_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("METERGATE_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                if port > 0 {
                    self.server.port = port;
                }
            }
        }

        if let Ok(tokens) = std::env::var("METERGATE_DEFAULT_ESTIMATED_TOKENS") {
            if let Ok(tokens) = tokens.parse::<u64>() {
                self.credits.default_estimated_tokens = tokens;
            }
        }

        if let Ok(enabled) = std::env::var("METERGATE_METRICS_ENABLED") {
            self.metrics.enabled = enabled.parse().unwrap_or(self.metrics.enabled);
        }

        self.rate_limit = self.rate_limit.with_env_overrides();
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        if self.server.port == 0 {
            anyhow::bail!("Server port must be > 0");
        }
        if self.server.request_timeout_secs == 0 {
            anyhow::bail!("Request timeout must be > 0");
        }

        if self.rate_limit.store_timeout_ms == 0 {
            anyhow::bail!("Rate limit store timeout must be > 0");
        }
        if self.rate_limit.store == StoreBackend::Redis {
            if self.rate_limit.redis_url.is_none() {
                anyhow::bail!("Redis store selected but no redis_url configured");
            }
            if !cfg!(feature = "redis") {
                anyhow::bail!(
                    "Redis store selected but metergate was built without the 'redis' feature"
                );
            }
        }

        if self.credits.ledger_timeout_ms == 0 {
            anyhow::bail!("Ledger timeout must be > 0");
        }
        if self.credits.reconciliation_interval_secs == 0 {
            anyhow::bail!("Reconciliation interval must be > 0");
        }
        if self.credits.retry.max_delay_ms < self.credits.retry.base_delay_ms {
            anyhow::bail!("Retry max_delay_ms must be >= base_delay_ms");
        }

        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }
}
