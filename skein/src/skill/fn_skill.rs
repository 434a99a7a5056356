//! Closure-backed skills: the cheapest way to build a kit, used by the
//! built-in kits and heavily by tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Skill, SkillContext, SkillError, SkillSpec, Skillkit};

type SkillFuture = Pin<Box<dyn Future<Output = Result<Value, SkillError>> + Send>>;
type SkillFn = dyn Fn(Value, SkillContext) -> SkillFuture + Send + Sync;

/// A skill built from an async closure.
pub struct FnSkill {
    spec: SkillSpec,
    call: Arc<SkillFn>,
}

impl FnSkill {
    /// Builds a skill with an empty-object argument schema; refine with
    /// [`FnSkill::with_schema`] or [`FnSkill::set_spec`].
    pub fn new<F, Fut>(name: impl Into<String>, description: impl Into<String>, call: F) -> Self
    where
        F: Fn(Value, SkillContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, SkillError>> + Send + 'static,
    {
        Self {
            spec: SkillSpec {
                name: name.into(),
                description: description.into(),
                input_schema: json!({"type": "object", "properties": {}}),
                category: Default::default(),
                retention: None,
            },
            call: Arc::new(move |args, ctx| Box::pin(call(args, ctx))),
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.spec.input_schema = schema;
        self
    }

    pub fn with_retention(mut self, retention: super::RetentionPolicy) -> Self {
        self.spec.retention = Some(retention);
        self
    }

    pub fn set_spec(&mut self, spec: SkillSpec) {
        self.spec = spec;
    }
}

#[async_trait]
impl Skill for FnSkill {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn spec(&self) -> SkillSpec {
        self.spec.clone()
    }

    async fn call(&self, args: Value, ctx: &SkillContext) -> Result<Value, SkillError> {
        (self.call)(args, ctx.clone()).await
    }
}

/// A skillkit assembled from [`FnSkill`]s.
pub struct FnSkillkit {
    name: String,
    skills: Vec<Arc<dyn Skill>>,
    exclude_from_subtask: bool,
}

impl FnSkillkit {
    pub fn new(name: impl Into<String>, skills: Vec<FnSkill>) -> Self {
        Self {
            name: name.into(),
            skills: skills
                .into_iter()
                .map(|s| Arc::new(s) as Arc<dyn Skill>)
                .collect(),
            exclude_from_subtask: false,
        }
    }

    /// Marks this kit as unavailable inside plan subtasks.
    pub fn excluded_from_subtask(mut self) -> Self {
        self.exclude_from_subtask = true;
        self
    }

    pub fn push(&mut self, skill: Arc<dyn Skill>) {
        self.skills.push(skill);
    }
}

impl Skillkit for FnSkillkit {
    fn name(&self) -> &str {
        &self.name
    }

    fn skills(&self) -> Vec<Arc<dyn Skill>> {
        self.skills.clone()
    }

    fn exclude_from_subtask(&self) -> bool {
        self.exclude_from_subtask
    }
}
