//! Engine configuration.
//!
//! All knobs come from the environment (there is deliberately no config
//! file): connection strings, streaming capacities, runtime limits, retry
//! defaults and the encryption key set. [`EngineConfig::from_env`] is the
//! production path; [`EngineConfig::for_tests`] wires everything in-memory.

use std::time::Duration;
use thiserror::Error;
use valgraph_core::RetryPolicy;

/// Wire protocol version tagged on every outbound envelope
pub const PROTOCOL_VERSION: &str = "v1";

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required key is missing
    #[error("Missing required configuration: {0}")]
    Missing(&'static str),

    /// A key failed to parse
    #[error("Invalid value for {key}: {message}")]
    Invalid {
        /// The offending key
        key: &'static str,
        /// Parse failure detail
        message: String,
    },
}

/// Full engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Checkpoint store connection string
    pub database_url: String,
    /// Artifact blob store location (filesystem path or `memory:`)
    pub blob_store_url: String,
    /// Wire protocol version, constant per build
    pub protocol_version: String,
    /// Heartbeat cadence on quiet streams
    pub heartbeat_interval: Duration,
    /// Bounded per-subscriber queue length
    pub subscriber_queue_capacity: usize,
    /// Replay ring capacity per active execution
    pub replay_buffer_capacity: usize,
    /// Per-attempt node timeout default
    pub node_default_timeout: Option<Duration>,
    /// Wall-clock budget for a whole execution
    pub execution_timeout: Option<Duration>,
    /// Superstep budget per execution
    pub recursion_limit: usize,
    /// Default retry policy applied to nodes that declare none
    pub default_retry: Option<RetryPolicy>,
    /// Current encryption key (hex, 32 bytes); `None` disables sealing
    pub encryption_key_current: Option<String>,
    /// Retired keys still accepted for decryption
    pub encryption_key_retired: Vec<String>,
    /// Values above this many serialized bytes move to the artifact store
    pub artifact_inline_limit: usize,
    /// Grace period before an idle terminated execution is collected
    pub cleanup_grace: Duration,
}

fn env_parse<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                key,
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

impl EngineConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::Missing("DATABASE_URL"))?;
        let blob_store_url = std::env::var("BLOB_STORE_URL")
            .map_err(|_| ConfigError::Missing("BLOB_STORE_URL"))?;

        let heartbeat_s: u64 = env_parse("HEARTBEAT_INTERVAL_S")?.unwrap_or(15);
        let queue_capacity: usize = env_parse("SUBSCRIBER_QUEUE_CAPACITY")?.unwrap_or(256);
        let replay_capacity: usize = env_parse("REPLAY_BUFFER_CAPACITY")?.unwrap_or(10_000);
        let node_timeout_s: Option<u64> = env_parse("NODE_DEFAULT_TIMEOUT_S")?;
        let execution_timeout_s: Option<u64> = env_parse("EXECUTION_TIMEOUT_S")?;
        let recursion_limit: usize = env_parse("RECURSION_LIMIT")?.unwrap_or(25);

        let retry_attempts: Option<usize> = env_parse("RETRY_DEFAULT_MAX_ATTEMPTS")?;
        let default_retry = retry_attempts.map(|attempts| {
            let mut policy = RetryPolicy::new(attempts);
            if let Ok(Some(interval)) = env_parse::<f64>("RETRY_DEFAULT_INITIAL_INTERVAL_S") {
                policy = policy.with_initial_interval(interval);
            }
            if let Ok(Some(factor)) = env_parse::<f64>("RETRY_DEFAULT_BACKOFF_FACTOR") {
                policy = policy.with_backoff_factor(factor);
            }
            if let Ok(Some(jitter)) = env_parse::<bool>("RETRY_DEFAULT_JITTER") {
                policy = policy.with_jitter(jitter);
            }
            policy
        });

        let encryption_key_current = std::env::var("ENCRYPTION_KEY_CURRENT").ok();
        let encryption_key_retired = std::env::var("ENCRYPTION_KEY_RETIRED")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            database_url,
            blob_store_url,
            protocol_version: PROTOCOL_VERSION.to_string(),
            heartbeat_interval: Duration::from_secs(heartbeat_s),
            subscriber_queue_capacity: queue_capacity,
            replay_buffer_capacity: replay_capacity,
            node_default_timeout: node_timeout_s.map(Duration::from_secs),
            execution_timeout: execution_timeout_s.map(Duration::from_secs),
            recursion_limit,
            default_retry,
            encryption_key_current,
            encryption_key_retired,
            artifact_inline_limit: env_parse("ARTIFACT_INLINE_LIMIT")?.unwrap_or(8192),
            cleanup_grace: Duration::from_secs(env_parse("CLEANUP_GRACE_S")?.unwrap_or(300)),
        })
    }

    /// In-memory configuration for tests and embedded engines
    pub fn for_tests() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            blob_store_url: "memory:".to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            heartbeat_interval: Duration::from_secs(15),
            subscriber_queue_capacity: 64,
            replay_buffer_capacity: 1024,
            node_default_timeout: None,
            execution_timeout: None,
            recursion_limit: 25,
            default_retry: None,
            encryption_key_current: None,
            encryption_key_retired: Vec::new(),
            artifact_inline_limit: 8192,
            cleanup_grace: Duration::from_secs(300),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_config_defaults() {
        let config = EngineConfig::for_tests();
        assert_eq!(config.protocol_version, "v1");
        assert_eq!(config.replay_buffer_capacity, 1024);
        assert!(config.default_retry.is_none());
    }
}
