//! Engine configuration loaded from environment variables.

use std::time::Duration;

use event_store::SnapshotPolicy;

/// Tunables for one engine instance, with sensible defaults.
///
/// Reads from environment variables:
/// - `ENGINE_SNAPSHOT_THRESHOLD` — events per stream before an automatic snapshot (default: `100`)
/// - `ENGINE_SNAPSHOT_RETAINED` — snapshots kept per stream (default: `5`)
/// - `ENGINE_SNAPSHOT_RETENTION_WINDOW` — per-stream events kept below the snapshot version (default: `10`)
/// - `ENGINE_COMMAND_TIMEOUT_MS` — default command deadline (default: `5000`)
/// - `ENGINE_MAX_CONCURRENT_COMMANDS` — command execution limit (default: `64`)
/// - `ENGINE_QUERY_CACHE_TTL_MS` — default query cache TTL (default: `500`)
/// - `RUST_LOG` — tracing filter directive (default: `"info"`)
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub snapshot_threshold: usize,
    pub snapshot_retained: usize,
    pub snapshot_retention_window: i64,
    pub command_timeout: Duration,
    pub max_concurrent_commands: usize,
    pub query_cache_ttl: Duration,
    pub log_level: String,
}

impl EngineConfig {
    /// Loads configuration from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            snapshot_threshold: parse_env("ENGINE_SNAPSHOT_THRESHOLD")
                .unwrap_or(defaults.snapshot_threshold),
            snapshot_retained: parse_env("ENGINE_SNAPSHOT_RETAINED")
                .unwrap_or(defaults.snapshot_retained),
            snapshot_retention_window: parse_env("ENGINE_SNAPSHOT_RETENTION_WINDOW")
                .unwrap_or(defaults.snapshot_retention_window),
            command_timeout: parse_env("ENGINE_COMMAND_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.command_timeout),
            max_concurrent_commands: parse_env("ENGINE_MAX_CONCURRENT_COMMANDS")
                .unwrap_or(defaults.max_concurrent_commands),
            query_cache_ttl: parse_env("ENGINE_QUERY_CACHE_TTL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.query_cache_ttl),
            log_level: std::env::var("RUST_LOG").unwrap_or(defaults.log_level),
        }
    }

    /// The snapshot policy this configuration describes.
    pub fn snapshot_policy(&self) -> SnapshotPolicy {
        SnapshotPolicy {
            threshold: self.snapshot_threshold,
            max_retained: self.snapshot_retained,
            retention_window: self.snapshot_retention_window,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            snapshot_threshold: 100,
            snapshot_retained: 5,
            snapshot_retention_window: 10,
            command_timeout: Duration::from_millis(5000),
            max_concurrent_commands: 64,
            query_cache_ttl: Duration::from_millis(500),
            log_level: "info".to_string(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.snapshot_threshold, 100);
        assert_eq!(config.snapshot_retained, 5);
        assert_eq!(config.snapshot_retention_window, 10);
        assert_eq!(config.command_timeout, Duration::from_millis(5000));
        assert_eq!(config.max_concurrent_commands, 64);
        assert_eq!(config.query_cache_ttl, Duration::from_millis(500));
    }

    #[test]
    fn snapshot_policy_mirrors_config() {
        let config = EngineConfig {
            snapshot_threshold: 10,
            snapshot_retained: 2,
            snapshot_retention_window: 3,
            ..EngineConfig::default()
        };
        let policy = config.snapshot_policy();
        assert_eq!(policy.threshold, 10);
        assert_eq!(policy.max_retained, 2);
        assert_eq!(policy.retention_window, 3);
    }
}
