//! Runtime configuration for the plugin subsystem.

use std::path::PathBuf;
use std::time::Duration;

/// Tunables for the plugin runtime.
///
/// Defaults match the production values; every knob can be overridden
/// through a `PLUGIN_*` environment variable.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Directory holding the on-disk compilation cache.
    pub cache_dir: PathBuf,
    /// Byte budget for the compilation cache, human-readable ("100MB").
    /// "0" or an unparseable value disables pruning.
    pub cache_size: String,
    /// Process-wide limit on simultaneous module compilations.
    pub max_parallel_compilations: usize,
    /// How long a caller waits for a background compilation to finish.
    pub compilation_timeout: Duration,
    /// Maximum live instances per plugin (pool capacity).
    pub pool_size: usize,
    /// Idle time after which a pooled instance is discarded.
    pub instance_ttl: Duration,
    /// How long a caller blocks for an instance when the pool is at capacity.
    pub get_timeout: Duration,
    /// Maximum guest memory in bytes.
    pub memory_limit: usize,
    /// Wall-clock timeout for a single guest call.
    pub call_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("cache/plugins"),
            cache_size: "100MB".to_string(),
            max_parallel_compilations: 2,
            compilation_timeout: Duration::from_secs(60),
            pool_size: 8,
            instance_ttl: Duration::from_secs(60),
            get_timeout: Duration::from_secs(5),
            memory_limit: 32 * 1024 * 1024,
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl RuntimeConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            cache_dir: std::env::var("PLUGIN_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            cache_size: std::env::var("PLUGIN_CACHE_SIZE").unwrap_or(defaults.cache_size),
            max_parallel_compilations: env_usize(
                "PLUGIN_MAX_PARALLEL_COMPILATIONS",
                defaults.max_parallel_compilations,
            ),
            compilation_timeout: env_secs(
                "PLUGIN_COMPILATION_TIMEOUT_SECS",
                defaults.compilation_timeout,
            ),
            pool_size: env_usize("PLUGIN_POOL_SIZE", defaults.pool_size),
            instance_ttl: env_secs("PLUGIN_INSTANCE_TTL_SECS", defaults.instance_ttl),
            get_timeout: env_secs("PLUGIN_GET_TIMEOUT_SECS", defaults.get_timeout),
            memory_limit: env_usize("PLUGIN_MEMORY_LIMIT_MB", defaults.memory_limit / 1024 / 1024)
                * 1024
                * 1024,
            call_timeout: env_secs("PLUGIN_CALL_TIMEOUT_SECS", defaults.call_timeout),
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
