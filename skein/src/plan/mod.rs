//! Plan: orchestration as a skillkit, state in the task registry.
//!
//! Plan is not a block kind. Its tools (`_plan_tasks`, `_check_progress`,
//! `_wait`, ...) manipulate the context's [`TaskRegistry`]; every piece of
//! persistent plan state lives there, so it snapshots with the context.
//! Runtime handles (spawned subtasks) live in [`PlanRuntime`], which is
//! never serialized.

mod exec;
mod skillkit;

pub use exec::schedule_eligible;
pub use skillkit::PlanSkillkit;

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use run_event::PlanSummary;

/// Task status; terminal states never revert.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Skipped
        )
    }
}

/// One plan task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub prompt: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub think: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub attempt: u32,
}

/// How eligible tasks are started.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Sequential => "sequential",
            ExecutionMode::Parallel => "parallel",
        }
    }
}

/// Ordered task store; all persistent plan state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskRegistry {
    pub plan_id: String,
    tasks: Vec<Task>,
    pub execution_mode: ExecutionMode,
    pub max_concurrency: usize,
}

impl TaskRegistry {
    pub fn new(plan_id: impl Into<String>, mode: ExecutionMode, max_concurrency: usize) -> Self {
        Self {
            plan_id: plan_id.into(),
            tasks: Vec::new(),
            execution_mode: mode,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Registers tasks; ids must be unique within the plan.
    pub fn register(&mut self, tasks: Vec<(String, String, String)>) -> Result<(), String> {
        for (id, name, prompt) in tasks {
            if self.tasks.iter().any(|t| t.id == id) {
                return Err(format!("duplicate task id '{id}'"));
            }
            self.tasks.push(Task {
                id,
                name,
                prompt,
                status: TaskStatus::Pending,
                answer: None,
                think: None,
                error: None,
                started_at: None,
                duration_ms: None,
                attempt: 0,
            });
        }
        Ok(())
    }

    pub fn get(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn is_all_done(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(|t| t.status.is_terminal())
    }

    pub fn running_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Running)
            .count()
    }

    /// The first pending task id, in registration order.
    pub fn next_pending(&self) -> Option<String> {
        self.tasks
            .iter()
            .find(|t| t.status == TaskStatus::Pending)
            .map(|t| t.id.clone())
    }

    pub fn mark_running(&mut self, task_id: &str) -> bool {
        let Some(task) = self.tasks.iter_mut().find(|t| t.id == task_id) else {
            return false;
        };
        if task.status != TaskStatus::Pending {
            return false;
        }
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        task.attempt += 1;
        true
    }

    /// Terminal transition; terminal tasks never revert (returns false).
    pub fn finish(
        &mut self,
        task_id: &str,
        status: TaskStatus,
        answer: Option<String>,
        error: Option<String>,
    ) -> bool {
        let Some(task) = self.tasks.iter_mut().find(|t| t.id == task_id) else {
            return false;
        };
        if task.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        task.duration_ms = task
            .started_at
            .map(|s| (Utc::now() - s).num_milliseconds().max(0) as u64);
        task.status = status;
        task.answer = answer;
        task.error = error;
        true
    }

    /// Resets a terminal task for retry.
    pub fn reset(&mut self, task_id: &str) -> bool {
        let Some(task) = self.tasks.iter_mut().find(|t| t.id == task_id) else {
            return false;
        };
        if !task.status.is_terminal() {
            return false;
        }
        task.status = TaskStatus::Pending;
        task.answer = None;
        task.error = None;
        task.started_at = None;
        task.duration_ms = None;
        true
    }

    pub fn summary(&self) -> PlanSummary {
        let count = |s: TaskStatus| self.tasks.iter().filter(|t| t.status == s).count();
        PlanSummary {
            plan_id: self.plan_id.clone(),
            total_tasks: self.tasks.len(),
            completed_tasks: count(TaskStatus::Completed),
            running_tasks: count(TaskStatus::Running),
            pending_tasks: count(TaskStatus::Pending),
            failed_tasks: count(TaskStatus::Failed) + count(TaskStatus::Cancelled),
        }
    }
}

/// Runtime handles of in-flight subtasks. Never serialized; a restored
/// context starts with an empty one.
#[derive(Default)]
pub struct PlanRuntime {
    handles: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl PlanRuntime {
    pub fn track(&self, task_id: &str, handle: JoinHandle<()>) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.retain(|_, h| !h.is_finished());
        handles.insert(task_id.to_string(), handle);
    }

    /// Aborts one subtask; returns whether a handle existed.
    pub fn abort(&self, task_id: &str) -> bool {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        match handles.remove(task_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        for (_, handle) in handles.drain() {
            handle.abort();
        }
    }
}
