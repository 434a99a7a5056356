//! Variable pool: named, typed, concurrency-safe store with dotted-path access.
//!
//! Values are JSON-compatible (`serde_json::Value`). Insertion order is
//! preserved for snapshots. Names starting with `_` are reserved for runtime
//! output (`_progress`, `_artifacts`, `_plan`, `_hook_context`); user-facing
//! setters reject them, the runtime writes them through [`VariablePool::set_reserved`].
//!
//! Writes serialize under a short lock; readers get owned copies. Per-name
//! watch channels let stream subscribers observe updates in write order.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;

/// Errors raised by pool operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VarError {
    #[error("variable name '{0}' is reserved")]
    Reserved(String),

    #[error("path '{0}' traverses a non-container value")]
    PathIntoScalar(String),

    #[error("cannot append to '{path}': {reason}")]
    BadAppend { path: String, reason: String },

    #[error("empty variable path")]
    EmptyPath,
}

/// Write mode for `set`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetMode {
    Overwrite,
    Append,
}

/// Ordered capture of the whole pool; structurally roundtrips via serde.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VarSnapshot(pub Vec<(String, Value)>);

#[derive(Default)]
struct PoolInner {
    order: Vec<String>,
    map: HashMap<String, Value>,
}

/// Concurrency-safe variable store.
#[derive(Default)]
pub struct VariablePool {
    inner: RwLock<PoolInner>,
    subs: Mutex<HashMap<String, watch::Sender<Value>>>,
}

impl VariablePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a name is reserved for runtime output.
    pub fn is_reserved(name: &str) -> bool {
        name.starts_with('_')
    }

    /// Sets a value at a dotted path. The first segment names the variable;
    /// deeper segments navigate (and create) objects. Rejects reserved names.
    pub fn set(&self, path: &str, value: Value, mode: SetMode) -> Result<(), VarError> {
        let root = path.split('.').next().unwrap_or_default();
        if root.is_empty() {
            return Err(VarError::EmptyPath);
        }
        if Self::is_reserved(root) {
            return Err(VarError::Reserved(root.to_string()));
        }
        self.set_inner(path, value, mode)
    }

    /// Runtime-internal setter that may write reserved names.
    pub fn set_reserved(&self, path: &str, value: Value, mode: SetMode) -> Result<(), VarError> {
        if path.split('.').next().unwrap_or_default().is_empty() {
            return Err(VarError::EmptyPath);
        }
        self.set_inner(path, value, mode)
    }

    fn set_inner(&self, path: &str, value: Value, mode: SetMode) -> Result<(), VarError> {
        let segments: Vec<&str> = path.split('.').collect();
        let root = segments[0].to_string();
        let root_value = {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            if !inner.map.contains_key(&root) {
                inner.order.push(root.clone());
            }
            let slot = inner.map.entry(root.clone()).or_insert(Value::Null);
            let target = navigate_mut(slot, &segments[1..], path)?;
            apply(target, value, mode, path)?;
            inner.map.get(&root).cloned().unwrap_or(Value::Null)
        };
        self.notify(&root, root_value);
        Ok(())
    }

    /// Reads a value at a dotted path; returns an owned copy.
    pub fn get(&self, path: &str) -> Option<Value> {
        let segments: Vec<&str> = path.split('.').collect();
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut current = inner.map.get(segments[0])?;
        for seg in &segments[1..] {
            current = match current {
                Value::Object(map) => map.get(*seg)?,
                Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current.clone())
    }

    /// Deletes a root variable; returns its last value.
    pub fn delete(&self, name: &str) -> Option<Value> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.order.retain(|n| n != name);
        let removed = inner.map.remove(name);
        drop(inner);
        if removed.is_some() {
            self.notify(name, Value::Null);
        }
        removed
    }

    /// Ordered capture of every variable.
    pub fn snapshot(&self) -> VarSnapshot {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        VarSnapshot(
            inner
                .order
                .iter()
                .filter_map(|name| inner.map.get(name).map(|v| (name.clone(), v.clone())))
                .collect(),
        )
    }

    /// Replaces the whole pool with a snapshot.
    pub fn restore(&self, snapshot: &VarSnapshot) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.order = snapshot.0.iter().map(|(n, _)| n.clone()).collect();
        inner.map = snapshot.0.iter().cloned().collect();
        drop(inner);
        for (name, value) in &snapshot.0 {
            self.notify(name, value.clone());
        }
    }

    /// Watch channel for one variable; receives the current value immediately
    /// and every subsequent root write in order.
    pub fn subscribe(&self, name: &str) -> watch::Receiver<Value> {
        let current = self.get(name).unwrap_or(Value::Null);
        let mut subs = self.subs.lock().unwrap_or_else(|e| e.into_inner());
        subs.entry(name.to_string())
            .or_insert_with(|| watch::channel(current).0)
            .subscribe()
    }

    pub fn names(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.order.clone()
    }

    fn notify(&self, name: &str, value: Value) {
        let subs = self.subs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = subs.get(name) {
            let _ = tx.send(value);
        }
    }
}

/// Walks `segments` into `slot`, creating objects along the way.
fn navigate_mut<'a>(
    slot: &'a mut Value,
    segments: &[&str],
    path: &str,
) -> Result<&'a mut Value, VarError> {
    let mut current = slot;
    for seg in segments {
        if current.is_null() {
            *current = Value::Object(serde_json::Map::new());
        }
        current = match current {
            Value::Object(map) => map
                .entry(seg.to_string())
                .or_insert(Value::Null),
            Value::Array(items) => {
                let idx = seg
                    .parse::<usize>()
                    .map_err(|_| VarError::PathIntoScalar(path.to_string()))?;
                items
                    .get_mut(idx)
                    .ok_or_else(|| VarError::PathIntoScalar(path.to_string()))?
            }
            _ => return Err(VarError::PathIntoScalar(path.to_string())),
        };
    }
    Ok(current)
}

fn apply(target: &mut Value, value: Value, mode: SetMode, path: &str) -> Result<(), VarError> {
    match mode {
        SetMode::Overwrite => {
            *target = value;
            Ok(())
        }
        SetMode::Append => match target {
            Value::Null => {
                *target = value;
                Ok(())
            }
            Value::Array(items) => {
                items.push(value);
                Ok(())
            }
            Value::String(s) => match value {
                Value::String(new) => {
                    s.push_str(&new);
                    Ok(())
                }
                other => Err(VarError::BadAppend {
                    path: path.to_string(),
                    reason: format!("cannot append {} to a string", kind_of(&other)),
                }),
            },
            other => Err(VarError::BadAppend {
                path: path.to_string(),
                reason: format!("target is {}", kind_of(other)),
            }),
        },
    }
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}
