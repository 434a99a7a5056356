//! Skill dispatch: dedup, execute, cache the raw result.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tracing::debug;

use crate::cache::ResultRecord;

use super::{SkillContext, SkillError};

/// Canonical JSON text: object keys sorted recursively, no whitespace.
/// Identical argument objects hash identically regardless of key order.
pub fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&Value::String((*key).clone()).to_string());
                    out.push(':');
                    write(&map[*key], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }
    let mut out = String::new();
    write(value, &mut out);
    out
}

/// Duplicate detector scoped to one explore invocation.
///
/// Identity key is `(name, canonical_json(args))`. A hit returns the prior
/// reference id so the second call is served from the cache without
/// re-executing.
pub struct Deduplicator {
    enabled: bool,
    seen: Mutex<HashMap<String, String>>,
}

impl Deduplicator {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuilds a deduplicator from a serialized seen-map (snapshot resume).
    pub fn from_seen(enabled: bool, seen: HashMap<String, String>) -> Self {
        Self {
            enabled,
            seen: Mutex::new(seen),
        }
    }

    pub fn key(name: &str, args: &Value) -> String {
        format!("{name}\u{1f}{}", canonical_json(args))
    }

    pub fn check(&self, name: &str, args: &Value) -> Option<String> {
        if !self.enabled {
            return None;
        }
        let seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.get(&Self::key(name, args)).cloned()
    }

    pub fn record(&self, name: &str, args: &Value, reference_id: &str) {
        if !self.enabled {
            return;
        }
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.insert(Self::key(name, args), reference_id.to_string());
    }

    /// Serializable view of the seen-map for snapshots.
    pub fn seen(&self) -> HashMap<String, String> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Outcome of one dispatch.
pub enum InvokeOutcome {
    /// The skill ran; the raw result is cached under this record.
    Executed(ResultRecord),
    /// An identical call already ran this invocation; prior record returned.
    Deduplicated(ResultRecord),
}

impl InvokeOutcome {
    pub fn record(&self) -> &ResultRecord {
        match self {
            InvokeOutcome::Executed(r) | InvokeOutcome::Deduplicated(r) => r,
        }
    }

    pub fn was_deduplicated(&self) -> bool {
        matches!(self, InvokeOutcome::Deduplicated(_))
    }
}

/// Invokes a skill by name: dedup check, execution, result caching.
///
/// `ToolInterrupt` propagates untouched; every other failure surfaces as a
/// `SkillError` the caller turns into an error tool-response.
pub async fn invoke(
    sctx: &SkillContext,
    name: &str,
    args: Value,
    dedup: Option<&Deduplicator>,
) -> Result<InvokeOutcome, SkillError> {
    if let Some(d) = dedup {
        if let Some(reference_id) = d.check(name, &args) {
            if let Some(record) = sctx.cache().get(&reference_id).await {
                debug!(skill = %name, reference_id = %reference_id, "dedup hit");
                return Ok(InvokeOutcome::Deduplicated(record));
            }
        }
    }

    let skill = sctx
        .agent()
        .skills
        .resolve(name)
        .ok_or_else(|| SkillError::Unknown(name.to_string()))?;

    let raw = skill.call(args.clone(), sctx).await?;

    let record = sctx
        .cache()
        .store(name, &args, &raw, Some(sctx.agent_name()))
        .await?;
    if let Some(d) = dedup {
        d.record(name, &args, &record.reference_id);
    }
    Ok(InvokeOutcome::Executed(record))
}
