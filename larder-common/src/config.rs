//! Configuration loading for the import pipeline
//!
//! Config file resolution follows a fixed priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`LARDER_CONFIG`)
//! 3. Platform config file (`<config dir>/larder/config.toml`)
//! 4. Compiled defaults (fallback)
//!
//! Every field carries a serde default, so a partial TOML file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "LARDER_CONFIG";

/// Environment variable overriding the database path
pub const DATABASE_ENV_VAR: &str = "LARDER_DATABASE";

/// Top-level pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// SQLite database holding the shared cache tier, progress and stage flags
    pub database_path: PathBuf,
    /// HTTP listen address
    pub bind_address: String,
    pub cache: CacheConfig,
    pub parser: ParserConfig,
    pub tracker: TrackerConfig,
    pub gate: GateConfig,
    pub workers: WorkerConfig,
    pub logging: LoggingConfig,
}

/// Result cache tiers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Shared (long-lived) tier TTL
    pub ttl_secs: u64,
    /// Process-local (short-lived) tier TTL
    pub memory_ttl_secs: u64,
    /// Maximum entries held by the process-local tier
    pub memory_capacity: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    /// Minimum heuristic confidence accepted without the full grammar
    pub confidence_threshold: f32,
    /// Memoize parse results through the result cache
    pub cache_results: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Idle time after which a note's progress is evicted
    pub eviction_timeout_secs: u64,
    /// How often the eviction sweeper runs
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Status checks per gate run before the stage is marked failed
    pub max_attempts: u32,
    /// Pause between gate checks
    pub retry_delay_ms: u64,
    /// Queue receiving the downstream stage job
    pub downstream_queue: String,
    pub downstream_attempts: u32,
    pub downstream_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Concurrent workers per queue
    pub pool_size: usize,
    /// Delivery attempts per unit job
    pub unit_attempts: u32,
    pub unit_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default tracing filter; `RUST_LOG` takes precedence
    pub level: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_path: default_data_dir().join("larder.db"),
            bind_address: "127.0.0.1:5740".to_string(),
            cache: CacheConfig::default(),
            parser: ParserConfig::default(),
            tracker: TrackerConfig::default(),
            gate: GateConfig::default(),
            workers: WorkerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 60 * 60,
            memory_ttl_secs: 5 * 60,
            memory_capacity: 10_000,
        }
    }
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.8,
            cache_results: true,
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            eviction_timeout_secs: 30 * 60,
            sweep_interval_secs: 60,
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 1000,
            downstream_queue: "instruction".to_string(),
            downstream_attempts: 3,
            downstream_backoff_ms: 1000,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            unit_attempts: 3,
            unit_backoff_ms: 500,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn memory_ttl(&self) -> Duration {
        Duration::from_secs(self.memory_ttl_secs)
    }
}

impl TrackerConfig {
    pub fn eviction_timeout(&self) -> Duration {
        Duration::from_secs(self.eviction_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl GateConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl PipelineConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Resolve configuration: CLI → ENV → platform file → defaults
    ///
    /// An explicitly named file (CLI or ENV) must exist; the platform file
    /// is optional. `LARDER_DATABASE` overrides the database path from any
    /// source.
    pub fn resolve(cli_path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = cli_path {
            tracing::info!(path = %path.display(), "Loading config from command line");
            Self::load_from_file(path)?
        } else if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            tracing::info!(path = %path, "Loading config from {}", CONFIG_ENV_VAR);
            Self::load_from_file(Path::new(&path))?
        } else if let Some(path) = default_config_path().filter(|p| p.exists()) {
            tracing::info!(path = %path.display(), "Loading config from platform config dir");
            Self::load_from_file(&path)?
        } else {
            tracing::info!("No config file found, using compiled defaults");
            Self::default()
        };

        if let Ok(db) = std::env::var(DATABASE_ENV_VAR) {
            config.database_path = PathBuf::from(db);
        }

        Ok(config)
    }

    /// Reject values that would make the pipeline spin or never finish
    pub fn validate(&self) -> Result<()> {
        if self.gate.max_attempts == 0 {
            return Err(Error::Config("gate.max_attempts must be at least 1".to_string()));
        }
        if self.cache.ttl_secs == 0 {
            return Err(Error::Config("cache.ttl_secs must be at least 1".to_string()));
        }
        if self.cache.memory_ttl_secs > self.cache.ttl_secs {
            return Err(Error::Config(format!(
                "cache.memory_ttl_secs ({}) must not exceed cache.ttl_secs ({})",
                self.cache.memory_ttl_secs, self.cache.ttl_secs
            )));
        }
        if self.workers.pool_size == 0 {
            return Err(Error::Config("workers.pool_size must be at least 1".to_string()));
        }
        if self.workers.unit_attempts == 0 {
            return Err(Error::Config("workers.unit_attempts must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.parser.confidence_threshold) {
            return Err(Error::Config(format!(
                "parser.confidence_threshold must be within [0, 1], got {}",
                self.parser.confidence_threshold
            )));
        }
        if self.gate.downstream_queue.trim().is_empty() {
            return Err(Error::Config("gate.downstream_queue must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Write configuration as TOML, via a temp file and rename
pub fn write_toml_config(config: &PipelineConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// `<config dir>/larder/config.toml`, when the platform has a config dir
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("larder").join("config.toml"))
}

/// OS-dependent default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("larder"))
        .unwrap_or_else(|| PathBuf::from("./larder_data"))
}
