//! Subtask execution: COW child contexts, scheduling, completion write-back.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use run_event::SinkEvent;
use skein_dsl::{Block, BlockKind};

use crate::context::AgentContext;
use crate::plan::{ExecutionMode, TaskStatus};

/// Starts every currently eligible task: up to `max_concurrency` in parallel
/// mode, exactly one in sequential mode.
pub fn schedule_eligible(ctx: &Arc<AgentContext>) {
    loop {
        let next = {
            let mut guard = ctx.task_registry.lock().unwrap_or_else(|e| e.into_inner());
            let Some(registry) = guard.as_mut() else {
                return;
            };
            let limit = match registry.execution_mode {
                ExecutionMode::Sequential => 1,
                ExecutionMode::Parallel => registry.max_concurrency,
            };
            if registry.running_count() >= limit {
                None
            } else {
                registry.next_pending().filter(|id| registry.mark_running(id))
            }
        };
        let Some(task_id) = next else {
            return;
        };
        spawn_task(ctx, &task_id);
    }
}

/// Spawns one subtask as a background tokio task.
fn spawn_task(ctx: &Arc<AgentContext>, task_id: &str) {
    let parent = Arc::clone(ctx);
    let task_id = task_id.to_string();
    info!(task_id = %task_id, "plan subtask starting");
    let handle = tokio::spawn({
        let task_id = task_id.clone();
        async move {
            run_subtask(parent, &task_id).await;
        }
    });
    ctx.plan_runtime.track(&task_id, handle);
}

/// Runs one subtask in a COW child context: reads through parent variables,
/// writes locally, subtask-local messages, sink writes tagged with
/// `task_id`/`plan_id`, and the plan kit itself filtered out of the skills.
async fn run_subtask(parent: Arc<AgentContext>, task_id: &str) {
    let (plan_id, prompt) = {
        let guard = parent.task_registry.lock().unwrap_or_else(|e| e.into_inner());
        let Some(registry) = guard.as_ref() else {
            return;
        };
        let Some(task) = registry.get(task_id) else {
            return;
        };
        (registry.plan_id.clone(), task.prompt.clone())
    };

    let child = parent.child_for_subtask(task_id, &plan_id);
    let block = Block {
        kind: BlockKind::Explore,
        params: Default::default(),
        body: prompt,
        output_var: None,
        line_range: (0, 0),
    };
    let result = crate::explore::run(&child, &block).await;

    let (status, answer, error) = match &result {
        Ok(outcome) => (
            TaskStatus::Completed,
            Some(outcome.answer.clone()),
            None,
        ),
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "plan subtask failed");
            (TaskStatus::Failed, None, Some(e.to_string()))
        }
    };

    {
        let mut guard = parent.task_registry.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(registry) = guard.as_mut() {
            registry.finish(task_id, status, answer.clone(), error);
        }
    }

    parent.write_output(&SinkEvent::PlanTaskUpdate {
        plan_id: plan_id.clone(),
        task_id: task_id.to_string(),
        status: status.as_str().to_string(),
    });
    if let Some(answer) = answer {
        parent.write_output(&SinkEvent::PlanTaskOutput {
            plan_id,
            task_id: task_id.to_string(),
            output: answer,
        });
    }

    // A finished slot may unblock the next eligible task.
    schedule_eligible(&parent);
}

/// Formats the `_check_progress` report.
pub fn progress_report(ctx: &AgentContext) -> String {
    let guard = ctx.task_registry.lock().unwrap_or_else(|e| e.into_inner());
    let Some(registry) = guard.as_ref() else {
        return "No active plan.".to_string();
    };
    let summary = registry.summary();
    let mut out = format!(
        "Plan {}: {}/{} completed, {} running, {} pending, {} failed\n",
        summary.plan_id,
        summary.completed_tasks,
        summary.total_tasks,
        summary.running_tasks,
        summary.pending_tasks,
        summary.failed_tasks,
    );
    for task in registry.tasks() {
        out.push_str(&format!(
            "- [{}] {} ({})\n",
            task.status.as_str(),
            task.name,
            task.id
        ));
    }
    out
}

/// Serializes the current tasks for the `plan_created` event payload.
pub fn tasks_payload(ctx: &AgentContext) -> Vec<serde_json::Value> {
    let guard = ctx.task_registry.lock().unwrap_or_else(|e| e.into_inner());
    guard
        .as_ref()
        .map(|registry| {
            registry
                .tasks()
                .iter()
                .map(|t| json!({"id": t.id, "name": t.name, "status": t.status.as_str()}))
                .collect()
        })
        .unwrap_or_default()
}
