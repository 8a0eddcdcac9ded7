//! Engine configuration
//!
//! Loaded from a TOML file (every field has a default), then overridden by
//! `STRAND_*` environment variables. All timeouts and thresholds here are
//! tuning defaults, not protocol constants.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::{DEFAULT_CONTENT_GATEWAYS, DEFAULT_NAME_GATEWAYS};
use crate::error::{Result, StrandError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub gateways: GatewayConfig,
    #[serde(default)]
    pub engine: GeneralConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Directory of the sled store; in-memory when unset
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Head start given to the local daemon before public backends start
    #[serde(default = "default_local_head_start")]
    pub local_head_start_ms: u64,

    /// Per-candidate timeout for content fetches
    #[serde(default = "default_content_timeout")]
    pub content_timeout_ms: u64,

    /// Per-candidate timeout for public name resolution
    #[serde(default = "default_name_timeout")]
    pub name_timeout_ms: u64,

    /// Fast-path timeout for name resolution against the local daemon
    #[serde(default = "default_local_name_timeout")]
    pub local_name_timeout_ms: u64,

    /// Delay between staggered candidates
    #[serde(default = "default_stagger_delay")]
    pub stagger_delay_ms: u64,

    /// Immutable content kept in memory
    #[serde(default = "default_content_cache_entries")]
    pub content_cache_entries: usize,

    /// Age below which a cached name answer counts as fresh
    #[serde(default = "default_name_fresh")]
    pub name_fresh_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            local_head_start_ms: default_local_head_start(),
            content_timeout_ms: default_content_timeout(),
            name_timeout_ms: default_name_timeout(),
            local_name_timeout_ms: default_local_name_timeout(),
            stagger_delay_ms: default_stagger_delay(),
            content_cache_entries: default_content_cache_entries(),
            name_fresh_ms: default_name_fresh(),
        }
    }
}

impl ResolverConfig {
    pub fn local_head_start(&self) -> Duration {
        Duration::from_millis(self.local_head_start_ms)
    }

    pub fn content_timeout(&self) -> Duration {
        Duration::from_millis(self.content_timeout_ms)
    }

    pub fn name_timeout(&self) -> Duration {
        Duration::from_millis(self.name_timeout_ms)
    }

    pub fn local_name_timeout(&self) -> Duration {
        Duration::from_millis(self.local_name_timeout_ms)
    }

    pub fn stagger_delay(&self) -> Duration {
        Duration::from_millis(self.stagger_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// How long an overloaded origin is excluded from ranking
    #[serde(default = "default_cooldown")]
    pub cooldown_ms: u64,

    /// Maximum length of a persisted preference list
    #[serde(default = "default_max_preferred")]
    pub max_preferred: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: default_cooldown(),
            max_preferred: default_max_preferred(),
        }
    }
}

impl HealthConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Penalty after the first failure
    #[serde(default = "default_backoff_base")]
    pub base_ms: i64,

    /// Penalty ceiling
    #[serde(default = "default_backoff_max")]
    pub max_ms: i64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_backoff_base(),
            max_ms: default_backoff_max(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Ceiling on fragments walked per aggregation
    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_chunks: default_max_chunks(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Entries a list field may hold in the head fragment before a new chunk starts
    #[serde(default = "default_chunk_threshold")]
    pub chunk_threshold: usize,

    /// Daemon key the state is published under
    #[serde(default = "default_name_key")]
    pub name_key: String,

    /// Timeout of the name publish call
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_ms: u64,

    /// Timeout of the content add call
    #[serde(default = "default_add_timeout")]
    pub add_timeout_ms: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            chunk_threshold: default_chunk_threshold(),
            name_key: default_name_key(),
            publish_timeout_ms: default_publish_timeout(),
            add_timeout_ms: default_add_timeout(),
        }
    }
}

impl PublishConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn add_timeout(&self) -> Duration {
        Duration::from_millis(self.add_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Attempts for heavy calls (add, publish, block put)
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// First retry delay, doubled per attempt
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,

    /// Timeout for calls that do not specify one
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl DaemonConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

/// Built-in gateway lists, used when user settings hold no override
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_content_gateways")]
    pub content: Vec<String>,
    #[serde(default = "default_name_gateways")]
    pub name: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            content: default_content_gateways(),
            name: default_name_gateways(),
        }
    }
}

fn default_log_level() -> String { "info".to_string() }
fn default_local_head_start() -> u64 { 400 }
fn default_content_timeout() -> u64 { 15_000 }
fn default_name_timeout() -> u64 { 10_000 }
fn default_local_name_timeout() -> u64 { 3_000 }
fn default_stagger_delay() -> u64 { 250 }
fn default_content_cache_entries() -> usize { 512 }
fn default_name_fresh() -> u64 { 60_000 }
fn default_cooldown() -> u64 { 60_000 }
fn default_max_preferred() -> usize { 8 }
fn default_backoff_base() -> i64 { 5_000 }
fn default_backoff_max() -> i64 { 600_000 }
fn default_max_chunks() -> usize { 64 }
fn default_chunk_threshold() -> usize { 5 }
fn default_name_key() -> String { "self".to_string() }
fn default_publish_timeout() -> u64 { 60_000 }
fn default_add_timeout() -> u64 { 30_000 }
fn default_retry_attempts() -> u32 { 3 }
fn default_retry_base_delay() -> u64 { 200 }
fn default_request_timeout() -> u64 { 30_000 }

fn default_content_gateways() -> Vec<String> {
    DEFAULT_CONTENT_GATEWAYS.iter().map(|s| s.to_string()).collect()
}

fn default_name_gateways() -> Vec<String> {
    DEFAULT_NAME_GATEWAYS.iter().map(|s| s.to_string()).collect()
}

impl EngineConfig {
    /// Load from a TOML file, falling back to defaults when it does not exist
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| StrandError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| StrandError::Config(e.to_string()))
    }

    /// Apply `STRAND_*` environment overrides
    pub fn with_env(mut self) -> Self {
        if let Ok(dir) = std::env::var("STRAND_DATA_DIR") {
            self.engine.data_dir = Some(PathBuf::from(dir));
        }
        if let Ok(level) = std::env::var("STRAND_LOG_LEVEL") {
            self.engine.log_level = level;
        }
        if let Some(threshold) = env_parse("STRAND_CHUNK_THRESHOLD") {
            self.publish.chunk_threshold = threshold;
        }
        if let Some(ms) = env_parse("STRAND_LOCAL_HEAD_START_MS") {
            self.resolver.local_head_start_ms = ms;
        }
        if let Some(secs) = env_parse::<u64>("STRAND_COOLDOWN_SECS") {
            self.health.cooldown_ms = secs * 1000;
        }
        if let Some(list) = env_list("STRAND_GATEWAYS") {
            self.gateways.content = list;
        }
        if let Some(list) = env_list("STRAND_NAME_GATEWAYS") {
            self.gateways.name = list;
        }
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.publish.chunk_threshold == 0 {
            return Err(StrandError::Config("chunk_threshold must be at least 1".into()));
        }
        if self.aggregator.max_chunks == 0 {
            return Err(StrandError::Config("max_chunks must be at least 1".into()));
        }
        if self.backoff.base_ms <= 0 || self.backoff.max_ms < self.backoff.base_ms {
            return Err(StrandError::Config(
                "backoff requires 0 < base_ms <= max_ms".into(),
            ));
        }
        if self.daemon.retry_attempts == 0 {
            return Err(StrandError::Config("retry_attempts must be at least 1".into()));
        }
        if self.health.max_preferred == 0 {
            return Err(StrandError::Config("max_preferred must be at least 1".into()));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn env_list(key: &str) -> Option<Vec<String>> {
    let raw = std::env::var(key).ok()?;
    let list: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if list.is_empty() {
        None
    } else {
        Some(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.publish.chunk_threshold, 5);
        assert_eq!(config.health.cooldown(), Duration::from_secs(60));
        assert_eq!(config.resolver.local_head_start(), Duration::from_millis(400));
        assert_eq!(config.gateways.content.len(), DEFAULT_CONTENT_GATEWAYS.len());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = EngineConfig::from_toml(
            r#"
[publish]
chunk_threshold = 10

[gateways]
content = ["https://my.gateway/ipfs/"]
"#,
        )
        .unwrap();

        assert_eq!(config.publish.chunk_threshold, 10);
        assert_eq!(config.publish.name_key, "self");
        assert_eq!(config.gateways.content, vec!["https://my.gateway/ipfs/"]);
        assert_eq!(config.gateways.name.len(), DEFAULT_NAME_GATEWAYS.len());
    }

    #[test]
    fn test_validate_rejects_bad_backoff() {
        let mut config = EngineConfig::default();
        config.backoff.max_ms = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = EngineConfig::load("/nonexistent/strand.toml").unwrap();
        assert_eq!(config.aggregator.max_chunks, 64);
    }
}
