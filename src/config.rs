use anyhow::{anyhow, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::scheduler::retry::RetryPolicy;

/// Upper bound for every TTL and backoff setting (one week)
pub const MAX_DURATION_SECS: u64 = 7 * 24 * 3600;

fn bounded_seconds(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

/// Configuration for the vidpair pipeline core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Job dispatch, leases and retries
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Review lock settings
    #[serde(default)]
    pub review: ReviewConfig,

    /// Chunk layout and duplicate detection
    #[serde(default)]
    pub merge: MergeConfig,

    /// Transcription API credentials
    #[serde(default)]
    pub credentials: CredentialsConfig,

    /// Where the reference store keeps its snapshot
    #[serde(default)]
    pub storage: StorageConfig,

    /// Output and logging
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How long a worker may hold a job before it is reclaimed
    pub lease_ttl_secs: u64,

    /// Attempts before a job is failed for good
    pub max_retries: u32,

    /// Backoff base; the delay is `base * 2^attempts`
    pub backoff_base_secs: u64,

    /// Upper bound for a single backoff delay
    pub backoff_cap_secs: u64,

    /// Interval of the lease/lock maintenance sweep
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    /// Review lock lifetime
    pub lock_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Planned chunk length in seconds
    pub chunk_secs: f64,

    /// Overlap between consecutive chunks in seconds
    pub seam_secs: f64,

    /// Similarity at or above which two seam segments are duplicates
    pub dedup_threshold: f64,

    /// Slack allowed when comparing offsets against chunk boundaries
    pub boundary_tolerance_secs: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// UTC hour at which daily usage counters reset
    #[serde(default)]
    pub reset_hour_utc: u32,

    #[serde(default)]
    pub keys: Vec<CredentialEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialEntry {
    pub id: String,
    pub key: String,
    /// Requests allowed per day (None = only the provider's quota signal applies)
    #[serde(default)]
    pub daily_limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// JSON snapshot of the reference store
    pub snapshot_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory for exported manifests
    pub export_dir: PathBuf,

    /// Log level
    pub log_level: String,

    /// Export formats
    pub formats: Vec<ExportFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Jsonl,
    Srt,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 900, // 15 minutes
            max_retries: 5,
            backoff_base_secs: 30,
            backoff_cap_secs: 3600,
            sweep_interval_secs: 60,
        }
    }
}

impl SchedulerConfig {
    pub fn lease_ttl(&self) -> Duration {
        bounded_seconds(self.lease_ttl_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            bounded_seconds(self.backoff_base_secs),
            bounded_seconds(self.backoff_cap_secs),
        )
    }

    /// Never zero, `tokio::time::interval` refuses a zero period
    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: 1800, // 30 minutes
        }
    }
}

impl ReviewConfig {
    pub fn lock_ttl(&self) -> Duration {
        bounded_seconds(self.lock_ttl_secs)
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            chunk_secs: 300.0,
            seam_secs: 10.0,
            dedup_threshold: 0.8,
            boundary_tolerance_secs: 0.25,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            snapshot_path: PathBuf::from("./data/vidpair-store.json"),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            export_dir: PathBuf::from("./output"),
            log_level: "info".to_string(),
            formats: vec![ExportFormat::Jsonl],
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load() -> Result<Self> {
        // Try to load from various locations
        let config_paths = [
            "vidpair.toml",
            "config/vidpair.toml",
            "/etc/vidpair/config.toml",
        ];

        for path in &config_paths {
            if let Ok(config_str) = std::fs::read_to_string(path) {
                match toml::from_str(&config_str) {
                    Ok(config) => {
                        tracing::info!("📄 Loaded configuration from: {}", path);
                        return Ok(config);
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse config file {}: {}", path, e);
                    }
                }
            }
        }

        // Try environment variables
        Self::from_env()
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Cannot read config {}: {}", path.display(), e))?;
        let config = toml::from_str(&config_str)?;
        tracing::info!("📄 Loaded configuration from: {}", path.display());
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(ttl) = std::env::var("VIDPAIR_LEASE_TTL_SECS") {
            config.scheduler.lease_ttl_secs = ttl.parse()?;
        }

        if let Ok(ttl) = std::env::var("VIDPAIR_LOCK_TTL_SECS") {
            config.review.lock_ttl_secs = ttl.parse()?;
        }

        if let Ok(retries) = std::env::var("VIDPAIR_MAX_RETRIES") {
            config.scheduler.max_retries = retries.parse()?;
        }

        if let Ok(threshold) = std::env::var("VIDPAIR_DEDUP_THRESHOLD") {
            config.merge.dedup_threshold = threshold.parse()?;
        }

        if let Ok(path) = std::env::var("VIDPAIR_SNAPSHOT_PATH") {
            config.storage.snapshot_path = PathBuf::from(path);
        }

        if let Ok(log_level) = std::env::var("VIDPAIR_LOG_LEVEL") {
            config.output.log_level = log_level;
        }

        if let Ok(keys) = std::env::var("VIDPAIR_API_KEYS") {
            config.credentials.keys = keys
                .split(',')
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .enumerate()
                .map(|(i, key)| CredentialEntry {
                    id: format!("env-{}", i + 1),
                    key: key.to_string(),
                    daily_limit: None,
                })
                .collect();
        }

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &str) -> Result<()> {
        let config_str = toml::to_string_pretty(self)?;
        std::fs::write(path, config_str)?;
        tracing::info!("💾 Configuration saved to: {}", path);
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.lease_ttl_secs == 0 {
            return Err(anyhow!("lease_ttl_secs must be greater than 0"));
        }

        if self.scheduler.sweep_interval_secs == 0 {
            return Err(anyhow!("sweep_interval_secs must be greater than 0"));
        }

        for (name, secs) in [
            ("lease_ttl_secs", self.scheduler.lease_ttl_secs),
            ("backoff_cap_secs", self.scheduler.backoff_cap_secs),
            ("sweep_interval_secs", self.scheduler.sweep_interval_secs),
            ("lock_ttl_secs", self.review.lock_ttl_secs),
        ] {
            if secs > MAX_DURATION_SECS {
                return Err(anyhow!("{} must not exceed {}s", name, MAX_DURATION_SECS));
            }
        }

        if self.scheduler.max_retries == 0 {
            return Err(anyhow!("max_retries must be greater than 0"));
        }

        if self.scheduler.backoff_cap_secs < self.scheduler.backoff_base_secs {
            return Err(anyhow!("backoff_cap_secs must not be smaller than backoff_base_secs"));
        }

        if self.review.lock_ttl_secs == 0 {
            return Err(anyhow!("lock_ttl_secs must be greater than 0"));
        }

        if !(0.0..=1.0).contains(&self.merge.dedup_threshold) {
            return Err(anyhow!("dedup_threshold must be within [0, 1]"));
        }

        if self.merge.seam_secs < 0.0 || self.merge.seam_secs >= self.merge.chunk_secs {
            return Err(anyhow!("seam_secs must be non-negative and shorter than chunk_secs"));
        }

        if self.credentials.reset_hour_utc > 23 {
            return Err(anyhow!("reset_hour_utc must be between 0 and 23"));
        }

        let mut ids: Vec<&str> = self.credentials.keys.iter().map(|k| k.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.credentials.keys.len() {
            return Err(anyhow!("credential ids must be unique"));
        }

        tracing::info!("✅ Configuration validation passed");
        Ok(())
    }

    /// Get runtime configuration summary
    pub fn summary(&self) -> String {
        format!(
            "vidpair Configuration:\n\
            - Lease TTL: {}s\n\
            - Max Retries: {}\n\
            - Backoff: {}s base, {}s cap\n\
            - Review Lock TTL: {}s\n\
            - Chunks: {}s with {}s seam\n\
            - Dedup Threshold: {:.2}\n\
            - Credentials: {}\n\
            - Snapshot: {}",
            self.scheduler.lease_ttl_secs,
            self.scheduler.max_retries,
            self.scheduler.backoff_base_secs,
            self.scheduler.backoff_cap_secs,
            self.review.lock_ttl_secs,
            self.merge.chunk_secs,
            self.merge.seam_secs,
            self.merge.dedup_threshold,
            self.credentials.keys.len(),
            self.storage.snapshot_path.display()
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            review: ReviewConfig::default(),
            merge: MergeConfig::default(),
            credentials: CredentialsConfig::default(),
            storage: StorageConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

/// Configuration builder for programmatic config creation
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn with_lease_ttl_secs(mut self, secs: u64) -> Self {
        self.config.scheduler.lease_ttl_secs = secs;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.config.scheduler.max_retries = retries;
        self
    }

    pub fn with_backoff(mut self, base_secs: u64, cap_secs: u64) -> Self {
        self.config.scheduler.backoff_base_secs = base_secs;
        self.config.scheduler.backoff_cap_secs = cap_secs;
        self
    }

    pub fn with_sweep_interval_secs(mut self, secs: u64) -> Self {
        self.config.scheduler.sweep_interval_secs = secs;
        self
    }

    pub fn with_lock_ttl_secs(mut self, secs: u64) -> Self {
        self.config.review.lock_ttl_secs = secs;
        self
    }

    pub fn with_seam_secs(mut self, secs: f64) -> Self {
        self.config.merge.seam_secs = secs;
        self
    }

    pub fn with_dedup_threshold(mut self, threshold: f64) -> Self {
        self.config.merge.dedup_threshold = threshold;
        self
    }

    pub fn with_credential(mut self, id: &str, key: &str, daily_limit: Option<u32>) -> Self {
        self.config.credentials.keys.push(CredentialEntry {
            id: id.to_string(),
            key: key.to_string(),
            daily_limit,
        });
        self
    }

    pub fn with_snapshot_path(mut self, path: PathBuf) -> Self {
        self.config.storage.snapshot_path = path;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
