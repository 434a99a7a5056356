//! Runtime configuration: plain structs with defaults, injected at construction.
//!
//! There is no global configuration; every component receives its config
//! through the agent construction path.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the explore loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExploreConfig {
    /// Hard cap on LLM turns per explore invocation.
    pub max_turns: u32,
    /// Whether identical `(name, args)` tool calls within one invocation are
    /// served from the result cache instead of re-executing.
    pub dedup_enabled: bool,
    /// Default `on_stop` pass threshold when the block does not set one.
    pub default_threshold: f64,
    /// Default retry budget for `on_stop` handlers when the block does not set one.
    pub default_max_retries: u32,
    /// Timeout for a verifier agent run.
    #[serde(with = "duration_secs")]
    pub verifier_timeout: Duration,
}

impl Default for ExploreConfig {
    fn default() -> Self {
        Self {
            max_turns: 25,
            dedup_enabled: true,
            default_threshold: 0.5,
            default_max_retries: 1,
            verifier_timeout: Duration::from_secs(60),
        }
    }
}

/// Configuration for the OpenAI-style streaming driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Transient-failure retries before the stream starts.
    pub max_retries: u32,
    /// Base backoff between retries; doubles per attempt.
    #[serde(with = "duration_secs")]
    pub backoff: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            timeout: Duration::from_secs(120),
            max_retries: 2,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Configuration for the result cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Byte budget for cached raw results; LRU eviction above this.
    pub budget_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Configuration for snapshot garbage collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotGcConfig {
    /// Pending snapshots older than this are deleted on recovery.
    #[serde(with = "duration_secs")]
    pub pending_max_age: Duration,
}

impl Default for SnapshotGcConfig {
    fn default() -> Self {
        Self {
            pending_max_age: Duration::from_secs(3600),
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
