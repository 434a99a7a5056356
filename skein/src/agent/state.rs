//! Agent state machine with a validating mediator and event listeners.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;

/// Agent lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Created,
    Initialized,
    Running,
    Paused,
    Completed,
    Terminated,
    Error,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Created => "created",
            AgentState::Initialized => "initialized",
            AgentState::Running => "running",
            AgentState::Paused => "paused",
            AgentState::Completed => "completed",
            AgentState::Terminated => "terminated",
            AgentState::Error => "error",
        }
    }
}

/// Listener event kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AgentEvent {
    Init,
    Start,
    Complete,
    Error,
    StateChanged,
}

type Listener = Box<dyn Fn(AgentState) + Send + Sync>;

/// Mediated state holder: every transition is validated, listeners fire
/// synchronously on the transition.
pub struct StateMachine {
    state: Mutex<AgentState>,
    listeners: Mutex<HashMap<AgentEvent, Vec<Listener>>>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            state: Mutex::new(AgentState::Created),
            listeners: Mutex::new(HashMap::new()),
        }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> AgentState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn on(&self, event: AgentEvent, listener: impl Fn(AgentState) + Send + Sync + 'static) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.entry(event).or_default().push(Box::new(listener));
    }

    /// Validated transition; fires `StateChanged` plus the specific event.
    pub fn transition(&self, to: AgentState) -> Result<(), RuntimeError> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if !valid_transition(*state, to) {
                return Err(RuntimeError::InvalidState(format!(
                    "cannot transition from {} to {}",
                    state.as_str(),
                    to.as_str()
                )));
            }
            *state = to;
        }
        self.fire(AgentEvent::StateChanged, to);
        match to {
            AgentState::Initialized => self.fire(AgentEvent::Init, to),
            AgentState::Running => self.fire(AgentEvent::Start, to),
            AgentState::Completed => self.fire(AgentEvent::Complete, to),
            AgentState::Error => self.fire(AgentEvent::Error, to),
            _ => {}
        }
        Ok(())
    }

    fn fire(&self, event: AgentEvent, state: AgentState) {
        let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = listeners.get(&event) {
            for listener in list {
                listener(state);
            }
        }
    }
}

fn valid_transition(from: AgentState, to: AgentState) -> bool {
    use AgentState::*;
    matches!(
        (from, to),
        (Created, Initialized)
            | (Initialized, Running)
            | (Running, Paused)
            | (Running, Completed)
            | (Running, Terminated)
            | (Running, Error)
            | (Paused, Running)
            | (Paused, Terminated)
            // A completed agent can run again (continue_chat).
            | (Completed, Running)
            | (Completed, Terminated)
    )
}
