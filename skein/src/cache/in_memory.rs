//! In-memory result cache with LRU eviction under a byte budget.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::config::CacheConfig;

use super::{stringify_raw, CacheError, ResultCache, ResultRecord};

struct Entry {
    record: ResultRecord,
    pins: usize,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, Entry>,
    /// Least-recently-used first.
    order: Vec<String>,
    total_bytes: usize,
}

/// Byte-budgeted LRU cache of result records.
pub struct InMemoryResultCache {
    budget_bytes: usize,
    inner: Mutex<CacheInner>,
}

impl InMemoryResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            budget_bytes: config.budget_bytes,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn touch(inner: &mut CacheInner, reference_id: &str) {
        inner.order.retain(|id| id != reference_id);
        inner.order.push(reference_id.to_string());
    }

    fn evict_to_budget(inner: &mut CacheInner, budget: usize) {
        while inner.total_bytes > budget {
            let victim = inner
                .order
                .iter()
                .find(|id| {
                    inner
                        .entries
                        .get(*id)
                        .map(|e| e.pins == 0)
                        .unwrap_or(false)
                })
                .cloned();
            let Some(id) = victim else {
                // Everything left is pinned; the budget is soft in that case.
                return;
            };
            if let Some(entry) = inner.entries.remove(&id) {
                inner.total_bytes -= entry.record.size;
            }
            inner.order.retain(|x| *x != id);
        }
    }
}

impl Default for InMemoryResultCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

#[async_trait]
impl ResultCache for InMemoryResultCache {
    async fn store(
        &self,
        skill_name: &str,
        args: &Value,
        raw: &Value,
        agent_name: Option<&str>,
    ) -> Result<ResultRecord, CacheError> {
        let content = stringify_raw(raw);
        let record = ResultRecord {
            reference_id: format!("ref_{}", Uuid::new_v4().simple()),
            skill_name: skill_name.to_string(),
            args: args.clone(),
            size: content.len(),
            content,
            agent_name: agent_name.map(str::to_string),
            created_at: Utc::now(),
        };
        let mut inner = self.lock();
        inner.total_bytes += record.size;
        inner.entries.insert(
            record.reference_id.clone(),
            Entry {
                record: record.clone(),
                pins: 0,
            },
        );
        inner.order.push(record.reference_id.clone());
        Self::evict_to_budget(&mut inner, self.budget_bytes);
        Ok(record)
    }

    async fn get(&self, reference_id: &str) -> Option<ResultRecord> {
        let mut inner = self.lock();
        let record = inner.entries.get(reference_id)?.record.clone();
        Self::touch(&mut inner, reference_id);
        Some(record)
    }

    async fn pin(&self, reference_id: &str) -> Result<(), CacheError> {
        let mut inner = self.lock();
        let entry = inner
            .entries
            .get_mut(reference_id)
            .ok_or_else(|| CacheError::NotFound(reference_id.to_string()))?;
        entry.pins += 1;
        Ok(())
    }

    async fn unpin(&self, reference_id: &str) -> Result<(), CacheError> {
        let mut inner = self.lock();
        let entry = inner
            .entries
            .get_mut(reference_id)
            .ok_or_else(|| CacheError::NotFound(reference_id.to_string()))?;
        entry.pins = entry.pins.saturating_sub(1);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let mut inner = self.lock();
        let pinned: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.pins > 0)
            .map(|(id, _)| id.clone())
            .collect();
        inner.entries.retain(|id, _| pinned.contains(id));
        inner.order.retain(|id| pinned.contains(id));
        inner.total_bytes = inner.entries.values().map(|e| e.record.size).sum();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn small_cache(budget: usize) -> InMemoryResultCache {
        InMemoryResultCache::new(CacheConfig {
            budget_bytes: budget,
        })
    }

    #[tokio::test]
    async fn store_and_get_roundtrip() {
        let cache = small_cache(1024);
        let record = cache
            .store("search", &json!({"q": "x"}), &json!("result text"), Some("agent"))
            .await
            .unwrap();
        assert!(record.reference_id.starts_with("ref_"));
        assert_eq!(record.content, "result text");
        assert_eq!(record.size, "result text".len());

        let fetched = cache.get(&record.reference_id).await.unwrap();
        assert_eq!(fetched, record);
        assert!(cache.get("ref_missing").await.is_none());
    }

    #[tokio::test]
    async fn lru_eviction_respects_budget_and_recency() {
        let cache = small_cache(10);
        let a = cache.store("s", &json!({}), &json!("aaaa"), None).await.unwrap();
        let b = cache.store("s", &json!({}), &json!("bbbb"), None).await.unwrap();
        // Touch `a` so `b` becomes the LRU victim.
        cache.get(&a.reference_id).await.unwrap();
        let c = cache.store("s", &json!({}), &json!("cccc"), None).await.unwrap();

        assert!(cache.get(&b.reference_id).await.is_none());
        assert!(cache.get(&a.reference_id).await.is_some());
        assert!(cache.get(&c.reference_id).await.is_some());
    }

    #[tokio::test]
    async fn pinned_references_survive_eviction() {
        let cache = small_cache(10);
        let a = cache.store("s", &json!({}), &json!("aaaa"), None).await.unwrap();
        cache.pin(&a.reference_id).await.unwrap();
        let _b = cache.store("s", &json!({}), &json!("bbbb"), None).await.unwrap();
        let _c = cache.store("s", &json!({}), &json!("cccc"), None).await.unwrap();
        assert!(cache.get(&a.reference_id).await.is_some());

        cache.unpin(&a.reference_id).await.unwrap();
        let _d = cache.store("s", &json!({}), &json!("dddd"), None).await.unwrap();
        assert!(cache.get(&a.reference_id).await.is_none());
    }

    #[tokio::test]
    async fn clear_keeps_pinned_entries() {
        let cache = small_cache(1024);
        let a = cache.store("s", &json!({}), &json!("a"), None).await.unwrap();
        let b = cache.store("s", &json!({}), &json!("b"), None).await.unwrap();
        cache.pin(&a.reference_id).await.unwrap();
        cache.clear().await.unwrap();
        assert!(cache.get(&a.reference_id).await.is_some());
        assert!(cache.get(&b.reference_id).await.is_none());
    }

    #[tokio::test]
    async fn pin_unknown_reference_errors() {
        let cache = small_cache(1024);
        assert_eq!(
            cache.pin("ref_x").await,
            Err(CacheError::NotFound("ref_x".into()))
        );
    }
}
