//! Engine configuration.
//!
//! Every field has a default; a JSON file may override any subset of them.
//! The default file lives at `XDG_CONFIG_HOME/gridcache/engine.json`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::models::ImageKind;

/// Minimum cache memory budget in megabytes.
const MIN_MEMORY_MB: usize = 64;

/// Maximum cache memory budget in megabytes.
const MAX_MEMORY_MB: usize = 2048;

const CONFIG_FILE: &str = "engine.json";

/// Retry/timeout policy for a single image kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Budget for one attempt.
    pub timeout_ms: u64,
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn thumbnail() -> Self {
        Self {
            timeout_ms: 5_000,
            max_attempts: 4,
            base_delay_ms: 250,
            max_delay_ms: 4_000,
        }
    }

    pub fn original() -> Self {
        Self {
            timeout_ms: 20_000,
            max_attempts: 2,
            base_delay_ms: 500,
            max_delay_ms: 4_000,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delay before attempt `attempt + 1`: `base × 2^(attempt-1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Upper bound on how long a dispatch can stay in flight, backoff included.
    pub fn worst_case(&self) -> Duration {
        self.timeout() * self.max_attempts.max(1)
    }
}

/// Partially specified policy as read from a config file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RetryPolicyPatch {
    timeout_ms: Option<u64>,
    max_attempts: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
}

impl RetryPolicyPatch {
    fn apply(self, base: RetryPolicy) -> RetryPolicy {
        RetryPolicy {
            timeout_ms: self.timeout_ms.unwrap_or(base.timeout_ms),
            max_attempts: self.max_attempts.unwrap_or(base.max_attempts),
            base_delay_ms: self.base_delay_ms.unwrap_or(base.base_delay_ms),
            max_delay_ms: self.max_delay_ms.unwrap_or(base.max_delay_ms),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RetryConfigFile {
    thumbnail: RetryPolicyPatch,
    original: RetryPolicyPatch,
}

// Missing fields fall back to the defaults of their own kind.
impl From<RetryConfigFile> for RetryConfig {
    fn from(file: RetryConfigFile) -> Self {
        Self {
            thumbnail: file.thumbnail.apply(RetryPolicy::thumbnail()),
            original: file.original.apply(RetryPolicy::original()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RetryConfigFile")]
pub struct RetryConfig {
    pub thumbnail: RetryPolicy,
    pub original: RetryPolicy,
}

impl RetryConfig {
    pub fn for_kind(&self, kind: ImageKind) -> &RetryPolicy {
        match kind {
            ImageKind::Thumbnail => &self.thumbnail,
            ImageKind::Original => &self.original,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            thumbnail: RetryPolicy::thumbnail(),
            original: RetryPolicy::original(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Lanes for the viewport-visible pass.
    pub visible_concurrency: usize,
    /// Lanes per background chunk.
    pub background_concurrency: usize,
    /// Lanes for explicit passes while the user is interacting.
    pub interacting_concurrency: usize,
    /// Records per background chunk between idle yields.
    pub background_chunk: usize,
    pub idle_slice_ms: u64,
    pub interaction_poll_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            visible_concurrency: 6,
            background_concurrency: 2,
            interacting_concurrency: 2,
            background_chunk: 24,
            idle_slice_ms: 16,
            interaction_poll_ms: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewportConfig {
    pub gap_px: f32,
    /// Item height divided by item width.
    pub aspect_ratio: f32,
    pub overscan_rows: usize,
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            gap_px: 16.0,
            aspect_ratio: 0.75,
            overscan_rows: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaginationConfig {
    pub page_size: usize,
    /// Slice size used by load-all.
    pub load_all_slice: usize,
    /// Load-all publishes accumulated slices every this many fetches.
    pub load_all_batch_every: usize,
    pub leaf_size: usize,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            page_size: 200,
            load_all_slice: 500,
            load_all_batch_every: 4,
            leaf_size: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_memory_mb: usize,
    pub max_entries: usize,
}

impl CacheConfig {
    pub fn max_memory_bytes(&self) -> usize {
        self.max_memory_mb.clamp(MIN_MEMORY_MB, MAX_MEMORY_MB) * 1024 * 1024
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: 512,
            max_entries: 20_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvalidationConfig {
    pub throttle_ms: u64,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self { throttle_ms: 1_000 }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub retry: RetryConfig,
    pub pool: PoolConfig,
    pub viewport: ViewportConfig,
    pub pagination: PaginationConfig,
    pub cache: CacheConfig,
    pub invalidation: InvalidationConfig,
    /// Try zero-copy asset references before reading bytes.
    pub prefer_asset_urls: bool,
    /// Also resolve full-resolution handles for viewport-visible records.
    pub preload_originals: bool,
}

impl EngineConfig {
    /// Returns the default config path based on XDG directories.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let proj_dirs = ProjectDirs::from("", "", "gridcache").ok_or(ConfigError::NoProjectDirs)?;
        Ok(proj_dirs.config_dir().join(CONFIG_FILE))
    }

    /// Loads the default config file, falling back to defaults when absent.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = Self::default_path()?;
        if !path.exists() {
            debug!(?path, "No engine config file, using defaults");
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!(?path, "Loaded engine config");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::thumbnail();
        assert_eq!(policy.backoff(1), Duration::from_millis(250));
        assert_eq!(policy.backoff(2), Duration::from_millis(500));
        assert_eq!(policy.backoff(3), Duration::from_millis(1000));
        assert_eq!(policy.backoff(10), Duration::from_millis(4000));
        assert_eq!(policy.backoff(200), Duration::from_millis(4000));
    }

    #[test]
    fn test_worst_case_is_timeout_per_attempt() {
        assert_eq!(RetryPolicy::thumbnail().worst_case(), Duration::from_secs(20));
        let single = RetryPolicy { max_attempts: 0, ..RetryPolicy::original() };
        assert_eq!(single.worst_case(), single.timeout());
    }

    #[test]
    fn test_thumbnails_retry_more_than_originals() {
        let retry = RetryConfig::default();
        assert!(retry.thumbnail.max_attempts > retry.original.max_attempts);
        assert!(retry.thumbnail.timeout() < retry.original.timeout());
    }

    #[test]
    fn test_memory_budget_clamping() {
        let small = CacheConfig { max_memory_mb: 1, ..Default::default() };
        assert_eq!(small.max_memory_bytes(), MIN_MEMORY_MB * 1024 * 1024);
        let large = CacheConfig { max_memory_mb: 100_000, ..Default::default() };
        assert_eq!(large.max_memory_bytes(), MAX_MEMORY_MB * 1024 * 1024);
    }

    #[test]
    fn test_partial_file_overrides_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(
            &path,
            r#"{ "pagination": { "page_size": 50 }, "retry": { "thumbnail": { "max_attempts": 7 }, "original": { "max_attempts": 3 } } }"#,
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.pagination.page_size, 50);
        assert_eq!(config.pagination.leaf_size, 1000);
        assert_eq!(config.retry.thumbnail.max_attempts, 7);
        assert_eq!(config.retry.thumbnail.timeout_ms, 5_000);
        assert_eq!(config.retry.original.max_attempts, 3);
        assert_eq!(config.retry.original.timeout_ms, 20_000);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(EngineConfig::load(&path), Err(ConfigError::Parse { .. })));
    }
}
