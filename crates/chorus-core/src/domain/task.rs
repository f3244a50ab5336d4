//! Task record: one subject processed under one config.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::config::ConfigId;
use super::ids::{SubjectId, TaskId};
use super::state::{TaskOutcome, TaskState};

/// A task row as stored in the queue.
///
/// Design:
/// - The store is the single source of truth for task state.
/// - Transitions are methods here so every store implementation stamps the
///   same timestamps the same way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub subject_id: SubjectId,
    pub config_id: ConfigId,
    pub state: TaskState,
    pub scheduled_on: DateTime<Utc>,
    pub pickup_on: Option<DateTime<Utc>>,
    pub end_on: Option<DateTime<Utc>>,

    /// Free-form group tag set by the scheduling operation (selector name).
    pub batch_tag: Option<String>,
}

impl TaskRecord {
    pub fn new(
        id: TaskId,
        subject_id: SubjectId,
        config_id: ConfigId,
        scheduled_on: DateTime<Utc>,
        batch_tag: Option<String>,
    ) -> Self {
        Self {
            id,
            subject_id,
            config_id,
            state: TaskState::Pending,
            scheduled_on,
            pickup_on: None,
            end_on: None,
            batch_tag,
        }
    }

    /// Lease the task.
    pub fn claim(&mut self, now: DateTime<Utc>) {
        self.state = TaskState::InProgress;
        self.pickup_on = Some(now);
        self.end_on = None;
    }

    pub fn finish(&mut self, outcome: TaskOutcome, now: DateTime<Utc>) {
        self.state = outcome.into();
        self.end_on = Some(now);
    }

    /// Back to the queue. Callers must delete the task's results first.
    pub fn reset(&mut self) {
        self.state = TaskState::Pending;
        self.pickup_on = None;
        self.end_on = None;
    }

    pub fn claimed(&self) -> ClaimedTask {
        ClaimedTask {
            task_id: self.id,
            subject_id: self.subject_id,
            config_id: self.config_id.clone(),
        }
    }
}

/// The identifying fields handed out by a successful claim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClaimedTask {
    pub task_id: TaskId,
    pub subject_id: SubjectId,
    pub config_id: ConfigId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ulid::Ulid;

    fn record() -> TaskRecord {
        TaskRecord::new(
            TaskId::from_ulid(Ulid::new()),
            SubjectId::from_ulid(Ulid::new()),
            ConfigId::from_hex("ab".repeat(32)).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            Some("test".to_string()),
        )
    }

    #[test]
    fn claim_finish_reset_cycle() {
        let t1 = Utc.with_ymd_and_hms(2024, 5, 1, 1, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 5, 1, 2, 0, 0).unwrap();
        let mut task = record();

        task.claim(t1);
        assert_eq!(task.state, TaskState::InProgress);
        assert_eq!(task.pickup_on, Some(t1));

        task.finish(TaskOutcome::Failed, t2);
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.end_on, Some(t2));

        task.reset();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.pickup_on, None);
        assert_eq!(task.end_on, None);
    }
}
