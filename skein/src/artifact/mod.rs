//! Artifact store: versioned records layered over the result cache.
//!
//! Artifacts carry their content by reference; the raw body lives in the
//! result cache. The `_artifacts` reserved variable mirrors the summary
//! list (never full content), and every mutation surfaces an
//! `artifact_event` through the sink.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use run_event::SinkEvent;

use crate::skill::{FnSkill, Skill, SkillContext, SkillError, Skillkit};
use crate::vars::SetMode;

/// One stored artifact version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArtifactVersion {
    pub version: u32,
    /// Reference into the result cache.
    pub content_ref: String,
    pub created_at: DateTime<Utc>,
}

/// A versioned artifact record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub artifact_type: String,
    pub title: String,
    pub version: u32,
    pub content_ref: String,
    pub media_type: String,
    pub metadata: serde_json::Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<ArtifactVersion>,
}

impl Artifact {
    /// Summary shape for `_artifacts`: no content, no history bodies.
    pub fn summary(&self) -> Value {
        json!({
            "id": self.id,
            "type": self.artifact_type,
            "title": self.title,
            "version": self.version,
            "media_type": self.media_type,
            "updated_at": self.updated_at,
        })
    }
}

/// In-memory artifact store.
#[derive(Default)]
pub struct ArtifactStore {
    records: Mutex<HashMap<String, Artifact>>,
    order: Mutex<Vec<String>>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &self,
        artifact_type: &str,
        title: &str,
        media_type: &str,
        content_ref: &str,
    ) -> Artifact {
        let now = Utc::now();
        let artifact = Artifact {
            id: format!("art_{}", Uuid::new_v4().simple()),
            artifact_type: artifact_type.to_string(),
            title: title.to_string(),
            version: 1,
            content_ref: content_ref.to_string(),
            media_type: media_type.to_string(),
            metadata: Default::default(),
            created_at: now,
            updated_at: now,
            history: vec![ArtifactVersion {
                version: 1,
                content_ref: content_ref.to_string(),
                created_at: now,
            }],
        };
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(artifact.id.clone(), artifact.clone());
        self.order
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(artifact.id.clone());
        artifact
    }

    /// Appends a new version; returns the updated record.
    pub fn update(&self, id: &str, content_ref: &str) -> Option<Artifact> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let artifact = records.get_mut(id)?;
        artifact.version += 1;
        artifact.content_ref = content_ref.to_string();
        artifact.updated_at = Utc::now();
        artifact.history.push(ArtifactVersion {
            version: artifact.version,
            content_ref: content_ref.to_string(),
            created_at: artifact.updated_at,
        });
        Some(artifact.clone())
    }

    pub fn get(&self, id: &str) -> Option<Artifact> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Summaries in creation order.
    pub fn summaries(&self) -> Vec<Value> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let order = self.order.lock().unwrap_or_else(|e| e.into_inner());
        order
            .iter()
            .filter_map(|id| records.get(id))
            .map(Artifact::summary)
            .collect()
    }
}

/// Skillkit exposing the artifact store to the agent.
pub struct ArtifactSkillkit {
    store: Arc<ArtifactStore>,
}

impl ArtifactSkillkit {
    pub fn new(store: Arc<ArtifactStore>) -> Self {
        Self { store }
    }
}

impl Skillkit for ArtifactSkillkit {
    fn name(&self) -> &str {
        "artifacts"
    }

    fn skills(&self) -> Vec<Arc<dyn Skill>> {
        let store = Arc::clone(&self.store);
        let create = {
            let store = Arc::clone(&store);
            FnSkill::new(
                "_create_artifact",
                "Create a versioned artifact from content.",
                move |args, sctx| {
                    let store = Arc::clone(&store);
                    async move {
                        let title = required_str(&args, "title")?;
                        let content = required_str(&args, "content")?;
                        let artifact_type = args
                            .get("type")
                            .and_then(Value::as_str)
                            .unwrap_or("document");
                        let media_type = args
                            .get("media_type")
                            .and_then(Value::as_str)
                            .unwrap_or("text/markdown");
                        let record = sctx
                            .cache()
                            .store(
                                "_create_artifact",
                                &args,
                                &Value::String(content),
                                Some(sctx.agent_name()),
                            )
                            .await?;
                        // Artifact content must outlive LRU pressure for as
                        // long as the artifact references it.
                        sctx.cache().pin(&record.reference_id).await?;
                        let artifact = store.create(
                            artifact_type,
                            &title,
                            media_type,
                            &record.reference_id,
                        );
                        publish(&store, &sctx, "created", &artifact);
                        Ok(json!({"artifact_id": artifact.id, "version": artifact.version}))
                    }
                },
            )
            .with_schema(json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string"},
                    "content": {"type": "string"},
                    "type": {"type": "string"},
                    "media_type": {"type": "string"}
                },
                "required": ["title", "content"]
            }))
        };
        let update = {
            let store = Arc::clone(&store);
            FnSkill::new(
                "_update_artifact",
                "Store a new version of an existing artifact.",
                move |args, sctx| {
                    let store = Arc::clone(&store);
                    async move {
                        let id = required_str(&args, "artifact_id")?;
                        let content = required_str(&args, "content")?;
                        let record = sctx
                            .cache()
                            .store(
                                "_update_artifact",
                                &args,
                                &Value::String(content),
                                Some(sctx.agent_name()),
                            )
                            .await?;
                        sctx.cache().pin(&record.reference_id).await?;
                        let superseded = store.get(&id).map(|a| a.content_ref);
                        let artifact = match store.update(&id, &record.reference_id) {
                            Some(artifact) => artifact,
                            None => {
                                // Unknown artifact: release the pin taken above.
                                let _ = sctx.cache().unpin(&record.reference_id).await;
                                return Err(SkillError::Execution {
                                    skill: "_update_artifact".into(),
                                    reason: format!("unknown artifact '{id}'"),
                                });
                            }
                        };
                        // The old version is no longer referenced by the
                        // artifact head; let it become evictable again.
                        if let Some(previous) = superseded {
                            let _ = sctx.cache().unpin(&previous).await;
                        }
                        publish(&store, &sctx, "updated", &artifact);
                        Ok(json!({"artifact_id": artifact.id, "version": artifact.version}))
                    }
                },
            )
            .with_schema(json!({
                "type": "object",
                "properties": {
                    "artifact_id": {"type": "string"},
                    "content": {"type": "string"}
                },
                "required": ["artifact_id", "content"]
            }))
        };
        let read = {
            let store = Arc::clone(&store);
            FnSkill::new(
                "_read_artifact",
                "Read the current content of an artifact.",
                move |args, sctx| {
                    let store = Arc::clone(&store);
                    async move {
                        let id = required_str(&args, "artifact_id")?;
                        let artifact = store.get(&id).ok_or_else(|| SkillError::Execution {
                            skill: "_read_artifact".into(),
                            reason: format!("unknown artifact '{id}'"),
                        })?;
                        let record = sctx
                            .cache()
                            .get(&artifact.content_ref)
                            .await
                            .ok_or_else(|| SkillError::Execution {
                                skill: "_read_artifact".into(),
                                reason: "artifact content was evicted".into(),
                            })?;
                        Ok(Value::String(record.content))
                    }
                },
            )
            .with_schema(json!({
                "type": "object",
                "properties": {"artifact_id": {"type": "string"}},
                "required": ["artifact_id"]
            }))
        };
        let list = {
            let store = Arc::clone(&store);
            FnSkill::new(
                "_list_artifacts",
                "List artifact summaries (no content).",
                move |_args, _sctx| {
                    let store = Arc::clone(&store);
                    async move { Ok(Value::Array(store.summaries())) }
                },
            )
        };
        vec![
            Arc::new(create),
            Arc::new(update),
            Arc::new(read),
            Arc::new(list),
        ]
    }
}

fn required_str(args: &Value, key: &str) -> Result<String, SkillError> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| SkillError::InvalidArgs {
            skill: "artifacts".to_string(),
            reason: format!("'{key}' is required"),
        })
}

/// Emits the artifact event and refreshes the `_artifacts` mirror variable.
fn publish(store: &ArtifactStore, sctx: &SkillContext, action: &str, artifact: &Artifact) {
    sctx.write_output(&SinkEvent::ArtifactEvent {
        action: action.to_string(),
        artifact_id: artifact.id.clone(),
        version: artifact.version,
        summary: artifact.title.clone(),
    });
    let _ = sctx.vars().set_reserved(
        "_artifacts",
        Value::Array(store.summaries()),
        SetMode::Overwrite,
    );
}
