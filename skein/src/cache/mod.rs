//! Result cache: full raw skill outputs behind opaque reference IDs.
//!
//! Skill results can be large; the dispatcher stores the raw output here and
//! hands a [`ResultRecord`] reference around instead. Retention strategies
//! and `_get_result_detail` read back through the same cache. Eviction is
//! LRU under a byte budget; references pinned by a non-terminal frame are
//! never evicted.

mod error;
mod in_memory;

pub use error::CacheError;
pub use in_memory::InMemoryResultCache;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One cached result: origin plus the stringified raw output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub reference_id: String,
    pub skill_name: String,
    pub args: Value,
    /// Raw result, stringified for text storage.
    pub content: String,
    pub agent_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub size: usize,
}

/// Process-wide reference-id → record store.
#[async_trait]
pub trait ResultCache: Send + Sync {
    /// Stores a raw result and returns the new record with its reference id.
    async fn store(
        &self,
        skill_name: &str,
        args: &Value,
        raw: &Value,
        agent_name: Option<&str>,
    ) -> Result<ResultRecord, CacheError>;

    /// O(1) lookup by reference id.
    async fn get(&self, reference_id: &str) -> Option<ResultRecord>;

    /// Marks a reference as pinned; pinned references survive eviction.
    async fn pin(&self, reference_id: &str) -> Result<(), CacheError>;

    /// Drops one pin; a reference with no pins becomes evictable again.
    async fn unpin(&self, reference_id: &str) -> Result<(), CacheError>;

    /// Clears all unpinned entries.
    async fn clear(&self) -> Result<(), CacheError>;
}

/// Stringifies a raw result the way the cache stores it: strings verbatim,
/// everything else as compact JSON.
pub fn stringify_raw(raw: &Value) -> String {
    match raw {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
