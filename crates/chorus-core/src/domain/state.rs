//! Task state machine.

use serde::{Deserialize, Serialize};

/// Task state.
///
/// State transitions:
/// - Pending -> InProgress (claim, only through the lease coordinator)
/// - InProgress -> Done | Failed (finalize, only by the lease holder)
/// - any -> Pending (reset_to_pending, after deleting the task's results)
///
/// The integer codes are the on-disk representation and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Waiting to be claimed.
    Pending,

    /// Leased by exactly one worker.
    InProgress,

    /// Finished successfully; results are complete.
    Done,

    /// Finished with an error; results have been removed.
    Failed,
}

impl TaskState {
    pub fn code(self) -> i64 {
        match self {
            TaskState::Pending => 0,
            TaskState::InProgress => 1,
            TaskState::Done => 2,
            TaskState::Failed => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(TaskState::Pending),
            1 => Some(TaskState::InProgress),
            2 => Some(TaskState::Done),
            3 => Some(TaskState::Failed),
            _ => None,
        }
    }

    /// Is this a terminal state (no further transitions without a reset)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed)
    }

    /// States that survive `reset_queue`: active leases and completed history.
    pub fn is_kept_on_queue_reset(self) -> bool {
        matches!(self, TaskState::InProgress | TaskState::Done)
    }
}

/// The terminal outcome a lease holder reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskOutcome {
    Done,
    Failed,
}

impl From<TaskOutcome> for TaskState {
    fn from(outcome: TaskOutcome) -> Self {
        match outcome {
            TaskOutcome::Done => TaskState::Done,
            TaskOutcome::Failed => TaskState::Failed,
        }
    }
}

/// Task counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub done: usize,
    pub failed: usize,
}

impl QueueCounts {
    pub fn add(&mut self, state: TaskState) {
        match state {
            TaskState::Pending => self.pending += 1,
            TaskState::InProgress => self.in_progress += 1,
            TaskState::Done => self.done += 1,
            TaskState::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.done + self.failed
    }
}
