//! The plan skillkit: `_plan_tasks`, `_check_progress`, `_get_task_output`,
//! `_wait`, `_kill_task`, `_retry_task`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use uuid::Uuid;

use run_event::SinkEvent;

use crate::plan::{exec, ExecutionMode, TaskRegistry, TaskStatus};
use crate::skill::{FnSkill, Skill, SkillContext, SkillError, Skillkit};

/// Orchestration tools over the context's task registry. Always excluded
/// from subtask registries, so a subtask can never re-plan.
pub struct PlanSkillkit;

impl Skillkit for PlanSkillkit {
    fn name(&self) -> &str {
        "plan"
    }

    fn skills(&self) -> Vec<Arc<dyn Skill>> {
        vec![
            Arc::new(plan_tasks_skill()),
            Arc::new(check_progress_skill()),
            Arc::new(get_task_output_skill()),
            Arc::new(wait_skill()),
            Arc::new(kill_task_skill()),
            Arc::new(retry_task_skill()),
        ]
    }

    fn exclude_from_subtask(&self) -> bool {
        true
    }
}

fn invalid(reason: impl Into<String>) -> SkillError {
    SkillError::InvalidArgs {
        skill: "_plan_tasks".to_string(),
        reason: reason.into(),
    }
}

fn plan_tasks_skill() -> FnSkill {
    FnSkill::new(
        "_plan_tasks",
        "Register a list of tasks and start executing them. Each task needs id, name, prompt.",
        |args, sctx| async move { plan_tasks(args, &sctx).await },
    )
    .with_schema(json!({
        "type": "object",
        "properties": {
            "tasks": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "id": {"type": "string"},
                        "name": {"type": "string"},
                        "prompt": {"type": "string"}
                    },
                    "required": ["id", "name", "prompt"]
                }
            },
            "execution_mode": {"type": "string", "enum": ["sequential", "parallel"]},
            "max_concurrency": {"type": "integer", "minimum": 1}
        },
        "required": ["tasks"]
    }))
}

async fn plan_tasks(args: Value, sctx: &SkillContext) -> Result<Value, SkillError> {
    let tasks = args
        .get("tasks")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("tasks must be a list"))?;
    if tasks.is_empty() {
        return Err(invalid("tasks must not be empty"));
    }
    let mut parsed = Vec::with_capacity(tasks.len());
    for task in tasks {
        let field = |key: &str| {
            task.get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| invalid(format!("task is missing '{key}'")))
        };
        parsed.push((field("id")?, field("name")?, field("prompt")?));
    }

    let execution_mode = match args.get("execution_mode").and_then(Value::as_str) {
        Some("parallel") => ExecutionMode::Parallel,
        Some("sequential") | None => ExecutionMode::Sequential,
        Some(other) => return Err(invalid(format!("unknown execution_mode '{other}'"))),
    };
    let max_concurrency = args
        .get("max_concurrency")
        .and_then(Value::as_u64)
        .unwrap_or(3) as usize;

    let ctx = sctx.agent();
    let (plan_id, payload_mode, payload_conc) = {
        let mut guard = ctx.task_registry.lock().unwrap_or_else(|e| e.into_inner());
        // Lazy enable: create the registry on first use, reset after a
        // finished plan.
        let needs_new = !matches!(guard.as_ref(), Some(existing) if !existing.is_all_done());
        if needs_new {
            *guard = Some(TaskRegistry::new(
                format!("plan_{}", Uuid::new_v4().simple()),
                execution_mode,
                max_concurrency,
            ));
        }
        let registry = guard
            .as_mut()
            .ok_or_else(|| invalid("plan registry missing"))?;
        registry.register(parsed).map_err(invalid)?;
        (
            registry.plan_id.clone(),
            registry.execution_mode,
            registry.max_concurrency,
        )
    };

    sctx.write_output(&SinkEvent::PlanCreated {
        plan_id: plan_id.clone(),
        tasks: exec::tasks_payload(ctx),
        execution_mode: payload_mode.as_str().to_string(),
        max_concurrency: payload_conc,
    });
    exec::schedule_eligible(ctx);

    Ok(json!({
        "plan_id": plan_id,
        "registered": tasks.len(),
        "execution_mode": payload_mode.as_str(),
    }))
}

fn check_progress_skill() -> FnSkill {
    FnSkill::new(
        "_check_progress",
        "Return the status of every plan task with counters.",
        |_args, sctx| async move { Ok(Value::String(exec::progress_report(sctx.agent()))) },
    )
}

fn get_task_output_skill() -> FnSkill {
    FnSkill::new(
        "_get_task_output",
        "Return the full output of a completed task.",
        |args, sctx| async move {
            let task_id = args
                .get("task_id")
                .and_then(Value::as_str)
                .ok_or_else(|| SkillError::InvalidArgs {
                    skill: "_get_task_output".into(),
                    reason: "task_id is required".into(),
                })?;
            let guard = sctx
                .agent()
                .task_registry
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let registry = guard.as_ref().ok_or_else(|| SkillError::Execution {
                skill: "_get_task_output".into(),
                reason: "no active plan".into(),
            })?;
            let task = registry.get(task_id).ok_or_else(|| SkillError::Execution {
                skill: "_get_task_output".into(),
                reason: format!("unknown task '{task_id}'"),
            })?;
            match (task.status, &task.answer) {
                (TaskStatus::Completed, Some(answer)) => Ok(Value::String(answer.clone())),
                (status, _) => Err(SkillError::Execution {
                    skill: "_get_task_output".into(),
                    reason: format!("task '{task_id}' is {} and has no output", status.as_str()),
                }),
            }
        },
    )
    .with_schema(json!({
        "type": "object",
        "properties": {"task_id": {"type": "string"}},
        "required": ["task_id"]
    }))
}

fn wait_skill() -> FnSkill {
    FnSkill::new(
        "_wait",
        "Sleep for the given number of seconds, checking for interrupts.",
        |args, sctx| async move {
            let seconds = args
                .get("seconds")
                .and_then(Value::as_f64)
                .unwrap_or(15.0)
                .clamp(1.0, 300.0) as u64;
            // Cooperative: the interrupt is observed at least once a second.
            for _ in 0..seconds {
                sctx.check_interrupt()?;
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            sctx.check_interrupt()?;
            Ok(Value::String(format!("waited {seconds}s")))
        },
    )
    .with_schema(json!({
        "type": "object",
        "properties": {"seconds": {"type": "number", "minimum": 1}},
        "required": ["seconds"]
    }))
}

fn kill_task_skill() -> FnSkill {
    FnSkill::new(
        "_kill_task",
        "Cancel a running or pending task.",
        |args, sctx| async move {
            let task_id = required_task_id("_kill_task", &args)?;
            let ctx = sctx.agent();
            ctx.plan_runtime.abort(&task_id);
            let plan_id = {
                let mut guard = ctx.task_registry.lock().unwrap_or_else(|e| e.into_inner());
                let registry = guard.as_mut().ok_or_else(|| SkillError::Execution {
                    skill: "_kill_task".into(),
                    reason: "no active plan".into(),
                })?;
                if !registry.finish(&task_id, TaskStatus::Cancelled, None, None) {
                    return Err(SkillError::Execution {
                        skill: "_kill_task".into(),
                        reason: format!("task '{task_id}' cannot be cancelled"),
                    });
                }
                registry.plan_id.clone()
            };
            sctx.write_output(&SinkEvent::PlanTaskUpdate {
                plan_id,
                task_id: task_id.clone(),
                status: TaskStatus::Cancelled.as_str().to_string(),
            });
            exec::schedule_eligible(ctx);
            Ok(Value::String(format!("task '{task_id}' cancelled")))
        },
    )
    .with_schema(task_id_schema())
}

fn retry_task_skill() -> FnSkill {
    FnSkill::new(
        "_retry_task",
        "Reset a failed or cancelled task and run it again.",
        |args, sctx| async move {
            let task_id = required_task_id("_retry_task", &args)?;
            let ctx = sctx.agent();
            let plan_id = {
                let mut guard = ctx.task_registry.lock().unwrap_or_else(|e| e.into_inner());
                let registry = guard.as_mut().ok_or_else(|| SkillError::Execution {
                    skill: "_retry_task".into(),
                    reason: "no active plan".into(),
                })?;
                if !registry.reset(&task_id) {
                    return Err(SkillError::Execution {
                        skill: "_retry_task".into(),
                        reason: format!("task '{task_id}' is not terminal"),
                    });
                }
                registry.plan_id.clone()
            };
            sctx.write_output(&SinkEvent::PlanTaskUpdate {
                plan_id,
                task_id: task_id.clone(),
                status: TaskStatus::Pending.as_str().to_string(),
            });
            exec::schedule_eligible(ctx);
            Ok(Value::String(format!("task '{task_id}' queued for retry")))
        },
    )
    .with_schema(task_id_schema())
}

fn required_task_id(skill: &str, args: &Value) -> Result<String, SkillError> {
    args.get("task_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| SkillError::InvalidArgs {
            skill: skill.to_string(),
            reason: "task_id is required".to_string(),
        })
}

fn task_id_schema() -> Value {
    json!({
        "type": "object",
        "properties": {"task_id": {"type": "string"}},
        "required": ["task_id"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AgentContext;
    use crate::llm::{MockDriver, ScriptedTurn};
    use crate::skill::SkillRegistry;

    fn plan_ctx(turns: Vec<ScriptedTurn>) -> Arc<AgentContext> {
        let skills = SkillRegistry::new();
        skills.register(Arc::new(PlanSkillkit)).unwrap();
        AgentContext::builder("planner")
            .driver(Arc::new(MockDriver::script(turns)))
            .skills(Arc::new(skills))
            .build()
    }

    #[tokio::test]
    async fn empty_task_list_is_rejected() {
        let ctx = plan_ctx(vec![]);
        let sctx = SkillContext::new(ctx);
        let err = plan_tasks(json!({"tasks": []}), &sctx).await.unwrap_err();
        assert!(matches!(err, SkillError::InvalidArgs { .. }));
    }

    #[tokio::test]
    async fn plan_tasks_registers_and_starts() {
        // Subtask explores resolve against the mock driver: one stop turn each.
        let ctx = plan_ctx(vec![ScriptedTurn::text("t1 done"), ScriptedTurn::text("t2 done")]);
        let sctx = SkillContext::new(Arc::clone(&ctx));
        let out = plan_tasks(
            json!({
                "tasks": [
                    {"id": "t1", "name": "one", "prompt": "do one"},
                    {"id": "t2", "name": "two", "prompt": "do two"}
                ],
                "execution_mode": "parallel",
                "max_concurrency": 2
            }),
            &sctx,
        )
        .await
        .unwrap();
        assert_eq!(out["registered"], 2);
        assert!(ctx.has_active_plan());

        // Wait for both subtasks to finish.
        for _ in 0..100 {
            if !ctx.has_active_plan() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let guard = ctx.task_registry.lock().unwrap();
        let registry = guard.as_ref().unwrap();
        assert!(registry.is_all_done());
        assert_eq!(
            registry.get("t1").unwrap().status,
            TaskStatus::Completed
        );
        assert_eq!(registry.get("t1").unwrap().answer.as_deref(), Some("t1 done"));
    }

    #[tokio::test]
    async fn sequential_mode_runs_one_at_a_time() {
        let ctx = plan_ctx(vec![ScriptedTurn::text("a"), ScriptedTurn::text("b")]);
        let sctx = SkillContext::new(Arc::clone(&ctx));
        plan_tasks(
            json!({"tasks": [
                {"id": "t1", "name": "one", "prompt": "p"},
                {"id": "t2", "name": "two", "prompt": "p"}
            ]}),
            &sctx,
        )
        .await
        .unwrap();
        {
            let guard = ctx.task_registry.lock().unwrap();
            assert!(guard.as_ref().unwrap().running_count() <= 1);
        }
        for _ in 0..100 {
            if !ctx.has_active_plan() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!ctx.has_active_plan());
    }

    #[tokio::test]
    async fn wait_observes_interrupts() {
        let ctx = plan_ctx(vec![]);
        ctx.request_user_interrupt();
        let sctx = SkillContext::new(ctx);
        let err = wait_skill().call(json!({"seconds": 5}), &sctx).await.unwrap_err();
        assert!(matches!(err, SkillError::UserInterrupt));
    }

    #[tokio::test]
    async fn get_task_output_errors_for_unfinished_tasks() {
        let ctx = plan_ctx(vec![]);
        {
            let mut guard = ctx.task_registry.lock().unwrap();
            let mut registry = TaskRegistry::new("p1", ExecutionMode::Sequential, 1);
            registry
                .register(vec![("t1".into(), "one".into(), "p".into())])
                .unwrap();
            *guard = Some(registry);
        }
        let sctx = SkillContext::new(ctx);
        let err = get_task_output_skill()
            .call(json!({"task_id": "t1"}), &sctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("pending"));
    }
}
