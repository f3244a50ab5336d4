//! Producer: claims tasks and feeds the bounded dispatch channel.
//!
//! The channel capacity equals the pool size, so a full channel stops the
//! producer from claiming more than the pool can start.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::coordinator::LeaseCoordinator;
use crate::domain::{ClaimedTask, TaskId};

/// One message on the dispatch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Task(ClaimedTask),
    /// Poison pill: the worker that takes it forwards it once and exits.
    Stop,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerReport {
    pub dispatched: usize,
    /// Claimed but handed back to the queue because of shutdown.
    pub returned: usize,
}

pub struct Producer {
    coordinator: LeaseCoordinator,
    tx: mpsc::Sender<Dispatch>,
    idle_interval: Duration,
    exit_when_idle: bool,
    cancel: CancellationToken,
}

impl Producer {
    pub fn new(
        coordinator: LeaseCoordinator,
        tx: mpsc::Sender<Dispatch>,
        idle_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            coordinator,
            tx,
            idle_interval,
            exit_when_idle: false,
            cancel,
        }
    }

    /// Stop at the first empty claim instead of polling.
    pub fn exit_when_idle(mut self, yes: bool) -> Self {
        self.exit_when_idle = yes;
        self
    }

    /// Run until shutdown (or idle, see [`Producer::exit_when_idle`]). Hands
    /// the coordinator back for the drain.
    pub async fn run(mut self) -> (LeaseCoordinator, ProducerReport) {
        let mut report = ProducerReport::default();
        while !self.cancel.is_cancelled() {
            // a claim in flight is never cancelled; shutdown is checked after it
            match self.coordinator.claim_next().await {
                Ok(Some(task)) => {
                    if !self.push(task, &mut report).await {
                        break;
                    }
                }
                Ok(None) if self.exit_when_idle => {
                    info!("queue empty, producer exiting");
                    break;
                }
                Ok(None) => {
                    debug!(idle = ?self.idle_interval, "queue empty");
                    if !self.idle().await {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "claim failed, treating queue as empty");
                    if !self.idle().await {
                        break;
                    }
                }
            }
        }
        info!(
            dispatched = report.dispatched,
            returned = report.returned,
            "producer stopped"
        );
        (self.coordinator, report)
    }

    /// Returns false when the producer must stop.
    async fn push(&mut self, task: ClaimedTask, report: &mut ProducerReport) -> bool {
        let task_id = task.task_id;
        if self.cancel.is_cancelled() {
            self.hand_back(task_id, report).await;
            return false;
        }
        let tx = self.tx.clone();
        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            permit = tx.reserve() => permit.ok(),
        };
        match permit {
            Some(permit) => {
                permit.send(Dispatch::Task(task));
                report.dispatched += 1;
                debug!(task = %task_id, "dispatched");
                true
            }
            None => {
                self.hand_back(task_id, report).await;
                false
            }
        }
    }

    async fn hand_back(&mut self, task_id: TaskId, report: &mut ProducerReport) {
        match self.coordinator.reset_to_pending(task_id).await {
            Ok(()) => {
                report.returned += 1;
                debug!(task = %task_id, "claimed task returned to queue");
            }
            Err(e) => error!(task = %task_id, error = %e, "could not return claimed task"),
        }
    }

    /// Returns false if shutdown interrupted the sleep.
    async fn idle(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.idle_interval) => true,
        }
    }
}
