//! Lease coordinator: the only path through which task state changes.
//!
//! Wraps one store connection. Transient store errors drop the connection,
//! back off, reconnect and run the operation again from scratch; any other
//! error is returned to the caller as is.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::retry::RetryPolicy;
use crate::domain::{ClaimedTask, StoreError, TaskId, TaskOutcome, TaskState};
use crate::ports::{StoreConnector, TaskStore};

#[derive(Debug, Clone, Copy)]
enum LeaseOp {
    Claim,
    Finalize(TaskId, TaskOutcome),
    Reset(TaskId),
    Fail(TaskId),
}

enum LeaseReply {
    Claimed(Option<ClaimedTask>),
    Applied,
}

pub struct LeaseCoordinator {
    connector: Arc<dyn StoreConnector>,
    store: Box<dyn TaskStore>,
    stale: bool,
    retry: RetryPolicy,
    /// Cuts claim backoff short on shutdown. Finalize and reset ignore it.
    cancel: Option<CancellationToken>,
}

impl LeaseCoordinator {
    /// Open the first connection. Not retried: failing here is a startup
    /// failure.
    pub async fn connect(
        connector: Arc<dyn StoreConnector>,
        retry: RetryPolicy,
    ) -> Result<Self, StoreError> {
        let store = connector.connect().await?;
        Ok(Self {
            connector,
            store,
            stale: false,
            retry,
            cancel: None,
        })
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// The current connection, for non-lease calls (result flushes, config
    /// lookups).
    pub fn store(&self) -> &dyn TaskStore {
        self.store.as_ref()
    }

    /// Mark the connection broken; the next lease operation reconnects first.
    pub fn invalidate(&mut self) {
        self.stale = true;
    }

    pub async fn claim_next(&mut self) -> Result<Option<ClaimedTask>, StoreError> {
        match self.run(LeaseOp::Claim).await? {
            LeaseReply::Claimed(task) => Ok(task),
            LeaseReply::Applied => Ok(None),
        }
    }

    pub async fn finalize(&mut self, task_id: TaskId, outcome: TaskOutcome) -> Result<(), StoreError> {
        self.run(LeaseOp::Finalize(task_id, outcome)).await.map(|_| ())
    }

    pub async fn reset_to_pending(&mut self, task_id: TaskId) -> Result<(), StoreError> {
        self.run(LeaseOp::Reset(task_id)).await.map(|_| ())
    }

    /// Delete the task's partial results, then finalize it FAILED.
    pub async fn fail_task(&mut self, task_id: TaskId) -> Result<(), StoreError> {
        self.run(LeaseOp::Fail(task_id)).await.map(|_| ())
    }

    async fn run(&mut self, op: LeaseOp) -> Result<LeaseReply, StoreError> {
        let mut failures = 0;
        loop {
            let result = match self.reconnect_if_stale().await {
                Ok(()) => self.apply(op).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_transient() => {
                    self.stale = true;
                    failures += 1;
                    if !self.retry.allows(failures) {
                        warn!(?op, failures, error = %e, "giving up on store");
                        return Err(e);
                    }
                    let delay = self.retry.next_delay(failures);
                    warn!(?op, failures, ?delay, error = %e, "store unavailable, reconnecting");
                    if !self.backoff(op, delay).await {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Sleep before the next attempt. Returns false when a claim should be
    /// abandoned because shutdown started.
    async fn backoff(&self, op: LeaseOp, delay: std::time::Duration) -> bool {
        match (&self.cancel, op) {
            (Some(cancel), LeaseOp::Claim) => {
                tokio::select! {
                    _ = cancel.cancelled() => false,
                    _ = tokio::time::sleep(delay) => true,
                }
            }
            _ => {
                tokio::time::sleep(delay).await;
                true
            }
        }
    }

    async fn reconnect_if_stale(&mut self) -> Result<(), StoreError> {
        if self.stale {
            self.store = self.connector.connect().await?;
            self.stale = false;
            info!("store reconnected");
        }
        Ok(())
    }

    async fn apply(&self, op: LeaseOp) -> Result<LeaseReply, StoreError> {
        match op {
            LeaseOp::Claim => self.store.claim_next().await.map(LeaseReply::Claimed),
            LeaseOp::Finalize(task_id, outcome) => self
                .store
                .finalize(task_id, outcome)
                .await
                .map(|()| LeaseReply::Applied),
            LeaseOp::Reset(task_id) => self
                .store
                .reset_to_pending(task_id)
                .await
                .map(|()| LeaseReply::Applied),
            LeaseOp::Fail(task_id) => {
                // results of a task leased elsewhere are not ours to delete
                let leased = self
                    .store
                    .get_task(task_id)
                    .await?
                    .is_some_and(|t| t.state == TaskState::InProgress);
                if !leased {
                    return Err(StoreError::LeaseLost(task_id));
                }
                self.store.delete_results(task_id).await?;
                self.store
                    .finalize(task_id, TaskOutcome::Failed)
                    .await
                    .map(|()| LeaseReply::Applied)
            }
        }
    }
}
