use std::sync::Mutex;

use guardsymbi_core::types::TaskState;

use crate::graph::TaskId;

/// Lifecycle state of every task in a run.
///
/// Each transition is checked and applied under one lock, so no reader
/// ever sees a half-applied change.
pub struct StateTable {
    states: Mutex<Vec<TaskState>>,
}

impl StateTable {
    pub fn new(len: usize) -> Self {
        Self {
            states: Mutex::new(vec![TaskState::Pending; len]),
        }
    }

    pub fn get(&self, id: TaskId) -> TaskState {
        self.states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())[id]
    }

    /// Move `id` to `next`. Returns the previous state, or the current state
    /// when the transition is not allowed.
    pub fn transition(&self, id: TaskId, next: TaskState) -> Result<TaskState, TaskState> {
        let mut states = self
            .states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let current = states[id];
        if current.can_transition_to(next) {
            states[id] = next;
            Ok(current)
        } else {
            Err(current)
        }
    }

    pub fn snapshot(&self) -> Vec<TaskState> {
        self.states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
