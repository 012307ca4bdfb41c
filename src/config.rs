use anyhow::{bail, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure for the course generation pipeline core
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Outbox dispatcher settings
    pub dispatcher: DispatcherConfig,
    /// Generation lock settings
    pub locks: LockConfig,
    /// Observability settings
    pub observability: ObservabilityConfig,
    /// Database settings (optional)
    pub database: Option<DatabaseConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Delay between polls of the outbox
    pub poll_interval_ms: u64,
    /// Maximum entries claimed per tick
    pub batch_size: usize,
    /// Attempts after which an entry is left for an operator
    pub max_attempts: u32,
    /// How long a claim stays exclusive before another dispatcher may retake it
    pub claim_timeout_seconds: u64,
    /// Random extra delay added to each poll so replicas drift apart
    pub poll_jitter_ms: u64,
    /// Identity recorded in logs; defaults to hostname and pid
    pub instance_id: Option<String>,
}

impl DispatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn claim_timeout(&self) -> chrono::Duration {
        seconds_to_delta(self.claim_timeout_seconds)
    }
}

/// Upper bound for lock lifetimes and claim leases (ten years)
pub const MAX_LEASE_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

/// Values past `MAX_LEASE_SECONDS` are clamped so `now + lease` stays in
/// chrono's date range
fn seconds_to_delta(seconds: u64) -> chrono::Duration {
    chrono::Duration::seconds(seconds.min(MAX_LEASE_SECONDS) as i64)
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            batch_size: 50,
            max_attempts: 5,
            claim_timeout_seconds: 300, // 5 minutes
            poll_jitter_ms: 100,
            instance_id: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lifetime of a generation lock before it may be stolen
    pub ttl_seconds: u64,
}

impl LockConfig {
    pub fn ttl(&self) -> chrono::Duration {
        seconds_to_delta(self.ttl_seconds)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 1800, // 30 minutes
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level
    pub log_level: String,
    /// Emit JSON lines instead of human-readable output
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Database URL (SQLite file path or connection string)
    pub url: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Enable automatic migrations
    pub auto_migrate: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://.coursegen/pipeline.db".to_string(),
            max_connections: 10,
            auto_migrate: true,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            locks: LockConfig::default(),
            observability: ObservabilityConfig::default(),
            database: Some(DatabaseConfig::default()),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration file (coursegen-pipeline.toml)
    /// 3. Environment variables (prefixed with COURSEGEN_PIPELINE__)
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("coursegen-pipeline.toml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if path.exists() {
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("COURSEGEN_PIPELINE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the dispatcher or lock service cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.dispatcher.batch_size == 0 {
            bail!("dispatcher.batch_size must be at least 1");
        }
        if self.dispatcher.max_attempts == 0 {
            bail!("dispatcher.max_attempts must be at least 1");
        }
        for (name, seconds) in [
            ("dispatcher.claim_timeout_seconds", self.dispatcher.claim_timeout_seconds),
            ("locks.ttl_seconds", self.locks.ttl_seconds),
        ] {
            if seconds == 0 || seconds > MAX_LEASE_SECONDS {
                bail!("{name} must be between 1 and {MAX_LEASE_SECONDS}, got {seconds}");
            }
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}
