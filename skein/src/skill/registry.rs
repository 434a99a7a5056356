//! Skill registry: register skillkits, resolve by name, generate tool schemas.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::{json, Value};

use super::detail::DetailSkill;
use super::{RetentionMode, RetentionPolicy, Skill, SkillError, Skillkit};

struct KitEntry {
    name: String,
    skill_names: Vec<String>,
    exclude_from_subtask: bool,
}

#[derive(Default)]
struct RegistryInner {
    skills: HashMap<String, Arc<dyn Skill>>,
    order: Vec<String>,
    kits: Vec<KitEntry>,
}

/// Registry of skills, organized in kits, with unique names per scope.
///
/// When any registered skill retains results as `summary` or `reference`,
/// the registry auto-injects the `_get_result_detail` system skill so the
/// LLM can always fetch the full content back.
#[derive(Default)]
pub struct SkillRegistry {
    inner: RwLock<RegistryInner>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every skill of a kit. Fails on the first duplicate name;
    /// nothing from the kit is registered in that case.
    pub fn register(&self, kit: Arc<dyn Skillkit>) -> Result<(), SkillError> {
        let skills = kit.skills();
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for skill in &skills {
            if inner.skills.contains_key(skill.name()) {
                return Err(SkillError::Duplicate(skill.name().to_string()));
            }
        }
        let mut names = Vec::with_capacity(skills.len());
        for skill in skills {
            let name = skill.name().to_string();
            inner.order.push(name.clone());
            inner.skills.insert(name.clone(), skill);
            names.push(name);
        }
        inner.kits.push(KitEntry {
            name: kit.name().to_string(),
            skill_names: names,
            exclude_from_subtask: kit.exclude_from_subtask(),
        });

        let needs_detail = inner.skills.values().any(|s| {
            matches!(
                s.spec().retention.map(|r| r.mode),
                Some(RetentionMode::Summary) | Some(RetentionMode::Reference)
            )
        });
        if needs_detail && !inner.skills.contains_key(DetailSkill::NAME) {
            let detail: Arc<dyn Skill> = Arc::new(DetailSkill);
            inner.order.push(DetailSkill::NAME.to_string());
            inner.skills.insert(DetailSkill::NAME.to_string(), detail);
            inner.kits.push(KitEntry {
                name: "system".to_string(),
                skill_names: vec![DetailSkill::NAME.to_string()],
                exclude_from_subtask: false,
            });
        }
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Skill>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.skills.get(name).cloned()
    }

    pub fn retention_for(&self, name: &str) -> Option<RetentionPolicy> {
        self.resolve(name).and_then(|s| s.spec().retention)
    }

    /// Registered skill names in registration order.
    pub fn names(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.order.clone()
    }

    /// Skill names belonging to the given kits, in registration order.
    pub fn names_in_kits(&self, kits: &[String]) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();
        for kit in &inner.kits {
            if kits.iter().any(|k| k == &kit.name) {
                out.extend(kit.skill_names.iter().cloned());
            }
        }
        out
    }

    /// Function-call tool schemas for the LLM request. `filter` restricts to
    /// the named skills; `None` exposes everything.
    pub fn tool_schemas(&self, filter: Option<&[String]>) -> Vec<Value> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .order
            .iter()
            .filter(|name| match filter {
                Some(allowed) => allowed.iter().any(|a| a == *name),
                None => true,
            })
            .filter_map(|name| inner.skills.get(name))
            .map(|skill| {
                let spec = skill.spec();
                json!({
                    "type": "function",
                    "function": {
                        "name": spec.name,
                        "description": spec.description,
                        "parameters": spec.input_schema,
                    }
                })
            })
            .collect()
    }

    /// A registry view for subtasks: every kit except those marked
    /// `exclude_from_subtask`.
    pub fn subtask_view(&self) -> SkillRegistry {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let view = SkillRegistry::new();
        {
            let mut view_inner = view.inner.write().unwrap_or_else(|e| e.into_inner());
            for kit in &inner.kits {
                if kit.exclude_from_subtask {
                    continue;
                }
                let mut names = Vec::new();
                for name in &kit.skill_names {
                    if let Some(skill) = inner.skills.get(name) {
                        view_inner.order.push(name.clone());
                        view_inner.skills.insert(name.clone(), Arc::clone(skill));
                        names.push(name.clone());
                    }
                }
                view_inner.kits.push(KitEntry {
                    name: kit.name.clone(),
                    skill_names: names,
                    exclude_from_subtask: false,
                });
            }
        }
        view
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skill::{FnSkill, FnSkillkit, SkillSpec};
    use serde_json::json;

    fn kit(name: &str, skills: Vec<FnSkill>) -> Arc<dyn Skillkit> {
        Arc::new(FnSkillkit::new(name, skills))
    }

    fn echo_skill(name: &str) -> FnSkill {
        FnSkill::new(name, format!("echo {name}"), |args, _ctx| async move {
            Ok(args)
        })
    }

    #[test]
    fn register_and_resolve() {
        let registry = SkillRegistry::new();
        registry.register(kit("base", vec![echo_skill("a"), echo_skill("b")])).unwrap();
        assert!(registry.resolve("a").is_some());
        assert!(registry.resolve("c").is_none());
        assert_eq!(registry.names(), vec!["a", "b"]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let registry = SkillRegistry::new();
        registry.register(kit("one", vec![echo_skill("a")])).unwrap();
        let err = registry
            .register(kit("two", vec![echo_skill("a")]))
            .unwrap_err();
        assert!(matches!(err, SkillError::Duplicate(name) if name == "a"));
    }

    #[test]
    fn tool_schemas_follow_function_call_shape() {
        let registry = SkillRegistry::new();
        registry.register(kit("base", vec![echo_skill("a")])).unwrap();
        let schemas = registry.tool_schemas(None);
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0]["type"], "function");
        assert_eq!(schemas[0]["function"]["name"], "a");

        let filtered = registry.tool_schemas(Some(&["missing".to_string()]));
        assert!(filtered.is_empty());
    }

    #[test]
    fn summary_retention_injects_detail_skill() {
        let registry = SkillRegistry::new();
        let mut skill = echo_skill("big");
        skill.set_spec(SkillSpec {
            name: "big".into(),
            description: "big results".into(),
            input_schema: json!({"type": "object"}),
            category: Default::default(),
            retention: Some(crate::skill::RetentionPolicy {
                mode: RetentionMode::Summary,
                max_length: 100,
                ttl_turns: None,
            }),
        });
        registry.register(kit("base", vec![skill])).unwrap();
        assert!(registry.resolve("_get_result_detail").is_some());
    }

    #[test]
    fn subtask_view_excludes_marked_kits() {
        let registry = SkillRegistry::new();
        registry.register(kit("base", vec![echo_skill("a")])).unwrap();
        let plan_kit = FnSkillkit::new("plan", vec![echo_skill("_plan_tasks")])
            .excluded_from_subtask();
        registry.register(Arc::new(plan_kit)).unwrap();

        let view = registry.subtask_view();
        assert!(view.resolve("a").is_some());
        assert!(view.resolve("_plan_tasks").is_none());
    }
}
