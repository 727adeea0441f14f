//! Per-execution state machine (§4.1).
//!
//! Grounded on the teacher's `KernelError`/`AgentState` split
//! (`agent/contract/kernel.rs`): a plain enum plus a small struct enforcing
//! the legal transition table, with illegal transitions treated as a
//! fail-fast programmer error rather than routed through the normal
//! `Result` channel used for recoverable failures.

use crate::error::StateMachineError;
use serde::{Deserialize, Serialize};

/// Lifecycle states for a single [`crate::task::EventTask`] execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Idle,
    Scheduled,
    Running,
    Retrying,
    Completed,
    Failed,
    Timeout,
    Cancelled,
    DeadLetter,
}

impl TaskState {
    /// Terminal states permit no further transitions except `reset()`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed
                | TaskState::Failed
                | TaskState::Timeout
                | TaskState::Cancelled
                | TaskState::DeadLetter
        )
    }

    fn is_legal_transition(self, to: TaskState) -> bool {
        use TaskState::*;
        if self.is_terminal() {
            return false;
        }
        // Cancellation is reachable from any non-terminal state.
        if to == Cancelled {
            return true;
        }
        matches!(
            (self, to),
            (Idle, Scheduled)
                | (Scheduled, Running)
                | (Scheduled, Timeout)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Timeout)
                | (Running, Retrying)
                | (Retrying, Running)
                | (Timeout, Failed)
                | (Timeout, Retrying)
        )
    }
}

/// Enforces the transition table for one task execution, firing
/// `on_state_change` synchronously on every state entry in transition
/// order (§4.2 "Ordering").
pub struct StateMachine {
    state: TaskState,
    history: Vec<TaskState>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: TaskState::Idle,
            history: vec![TaskState::Idle],
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn history(&self) -> &[TaskState] {
        &self.history
    }

    /// Attempt a transition. Returns `Err` on an illegal transition; the
    /// caller is expected to treat this as fatal (§4.1: "Any illegal
    /// transition fails fatally").
    pub fn transition(&mut self, to: TaskState) -> Result<(), StateMachineError> {
        if !self.state.is_legal_transition(to) {
            return Err(StateMachineError {
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.history.push(to);
        Ok(())
    }

    /// The only backwards transition: returns to `Idle` unconditionally.
    pub fn reset(&mut self) {
        self.state = TaskState::Idle;
        self.history.clear();
        self.history.push(TaskState::Idle);
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
