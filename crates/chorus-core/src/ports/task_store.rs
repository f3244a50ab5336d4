//! TaskStore port: the durable queue, config registry, subject registry and
//! result table behind one connection.
//!
//! # Design principles
//! - The store is the single source of truth; task ownership is decided here.
//! - `claim_next` is atomic and skips tasks another claimant holds.
//! - A PENDING task never has results: every path back to PENDING deletes
//!   results first, in the same transaction.

use async_trait::async_trait;

use crate::domain::{
    ClaimedTask, ConfigId, Detection, InferenceConfig, QueueCounts, StoreError, StoredConfig,
    Subject, SubjectId, SubjectSelector, TaskId, TaskOutcome, TaskRecord, TaskState,
};

/// One connection to the queue store.
///
/// Each worker and the producer hold their own; a connection that returned a
/// transient error is dropped and replaced through its [`StoreConnector`].
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Lease one PENDING task, or `None` when nothing is claimable.
    async fn claim_next(&self) -> Result<Option<ClaimedTask>, StoreError>;

    /// IN_PROGRESS -> DONE | FAILED. Any other current state means the lease
    /// is gone: [`StoreError::LeaseLost`].
    async fn finalize(&self, task_id: TaskId, outcome: TaskOutcome) -> Result<(), StoreError>;

    /// Delete the task's results, then set it PENDING and clear its lease
    /// timestamps.
    async fn reset_to_pending(&self, task_id: TaskId) -> Result<(), StoreError>;

    /// Returns the number of rows deleted.
    async fn delete_results(&self, task_id: TaskId) -> Result<u64, StoreError>;

    /// Persist a flush of detections in one transaction. Every task the
    /// detections belong to must still be IN_PROGRESS, otherwise nothing is
    /// written and the error is [`StoreError::LeaseLost`].
    async fn insert_results(&self, detections: &[Detection]) -> Result<(), StoreError>;

    async fn list_results(&self, task_id: TaskId) -> Result<Vec<Detection>, StoreError>;

    /// Insert the config, or fetch the id of identical content.
    async fn store_config(
        &self,
        config: &InferenceConfig,
        comment: Option<&str>,
    ) -> Result<ConfigId, StoreError>;

    async fn get_config(&self, id: &ConfigId) -> Result<Option<StoredConfig>, StoreError>;

    /// Insert-or-ignore by object name. Returns whether a row was inserted.
    async fn register_subject(&self, subject: &Subject) -> Result<bool, StoreError>;

    async fn get_subject(&self, id: SubjectId) -> Result<Option<Subject>, StoreError>;

    async fn get_task(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// Tasks in scheduling order, optionally only those in `state`.
    async fn list_tasks(&self, state: Option<TaskState>) -> Result<Vec<TaskRecord>, StoreError>;

    /// Create PENDING tasks for every selected subject that has no task under
    /// `config_id` yet. Returns the number of tasks created.
    async fn enqueue_batch(
        &self,
        config_id: &ConfigId,
        selector: &SubjectSelector,
        tag: Option<&str>,
    ) -> Result<u64, StoreError>;

    /// Delete every PENDING and FAILED task together with its results.
    /// Returns the number of tasks deleted.
    async fn reset_queue(&self) -> Result<u64, StoreError>;

    /// `reset_to_pending` for every FAILED task. Returns the number reset.
    async fn reset_failed(&self) -> Result<u64, StoreError>;

    async fn counts_by_state(&self) -> Result<QueueCounts, StoreError>;
}

/// Opens fresh store connections.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn TaskStore>, StoreError>;
}
