//! Worker pool.
//!
//! Each worker owns one store connection (through its own coordinator) and one
//! loaded model, and pulls from the shared dispatch channel until it takes the
//! stop pill, the channel closes, or shutdown finds the channel empty.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::coordinator::LeaseCoordinator;
use super::producer::Dispatch;
use super::retry::RetryPolicy;
use crate::domain::{
    ClaimedTask, ClassifierError, DeploymentContext, ErrorKind, StoreError, TaskError, TaskOutcome,
};
use crate::engine::{EngineReport, InferenceEngine, TaskParams, resolve_allow_list};
use crate::ports::{Classifier, MediaSource, ModelLoader, StoreConnector};

pub type SharedReceiver = Arc<Mutex<mpsc::Receiver<Dispatch>>>;

/// Failures that prevent the runtime from starting.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("store connection failed: {0}")]
    Store(#[from] StoreError),

    #[error("model load failed: {0}")]
    Model(#[from] ClassifierError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub done: usize,
    pub failed: usize,
    /// Tasks handed back to PENDING (drain or transient store failure).
    pub requeued: usize,
    /// Tasks taken out of IN_PROGRESS while this worker ran them.
    pub lost: usize,
}

impl WorkerReport {
    pub fn merge(&mut self, other: &WorkerReport) {
        self.done += other.done;
        self.failed += other.failed;
        self.requeued += other.requeued;
        self.lost += other.lost;
    }
}

/// What a worker needs besides its channel ends.
#[derive(Clone)]
pub struct WorkerDeps {
    pub connector: Arc<dyn StoreConnector>,
    pub media: Arc<dyn MediaSource>,
    pub models: Arc<dyn ModelLoader>,
    pub retry: RetryPolicy,
}

struct Worker {
    id: usize,
    coordinator: LeaseCoordinator,
    classifier: Box<dyn Classifier>,
    media: Arc<dyn MediaSource>,
    rx: SharedReceiver,
    tx: mpsc::Sender<Dispatch>,
    cancel: CancellationToken,
    report: WorkerReport,
}

/// Worker group handle.
pub struct WorkerPool {
    joins: Vec<JoinHandle<WorkerReport>>,
}

impl WorkerPool {
    /// Connect and load a model for every worker, then spawn them. Any
    /// connection or load failure aborts the start.
    pub async fn start(
        n: usize,
        deps: &WorkerDeps,
        rx: SharedReceiver,
        tx: mpsc::Sender<Dispatch>,
        cancel: CancellationToken,
    ) -> Result<Self, StartupError> {
        let mut workers = Vec::with_capacity(n);
        for id in 0..n {
            let coordinator =
                LeaseCoordinator::connect(Arc::clone(&deps.connector), deps.retry.clone()).await?;
            let classifier = deps.models.load().await?;
            workers.push(Worker {
                id,
                coordinator,
                classifier,
                media: Arc::clone(&deps.media),
                rx: Arc::clone(&rx),
                tx: tx.clone(),
                cancel: cancel.clone(),
                report: WorkerReport::default(),
            });
        }

        let joins = workers
            .into_iter()
            .map(|w| {
                let span = info_span!("worker", worker = w.id);
                tokio::spawn(w.run().instrument(span))
            })
            .collect();
        Ok(Self { joins })
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Wait for every worker to exit.
    pub async fn join(self) -> WorkerReport {
        let mut total = WorkerReport::default();
        for join in self.joins {
            match join.await {
                Ok(report) => total.merge(&report),
                Err(e) => error!(error = %e, "worker task panicked"),
            }
        }
        total
    }
}

impl Worker {
    async fn run(mut self) -> WorkerReport {
        debug!("worker started");
        while let Some(msg) = next_dispatch(&self.rx, &self.cancel).await {
            match msg {
                Dispatch::Stop => {
                    // hand the pill on; a full channel means the drain owns it
                    let _ = self.tx.try_send(Dispatch::Stop);
                    break;
                }
                Dispatch::Task(task) if self.cancel.is_cancelled() => {
                    self.requeue(&task, "shutdown").await;
                }
                Dispatch::Task(task) => {
                    let span = info_span!("task", task = %task.task_id, subject = %task.subject_id);
                    let interrupted = self.handle(task).instrument(span).await;
                    if interrupted {
                        break;
                    }
                }
            }
        }
        info!(
            done = self.report.done,
            failed = self.report.failed,
            requeued = self.report.requeued,
            lost = self.report.lost,
            "worker stopped"
        );
        self.report
    }

    /// Returns true when shutdown interrupted the task.
    async fn handle(&mut self, task: ClaimedTask) -> bool {
        let task_id = task.task_id;
        let result = self.process(&task).await;
        match result {
            Ok(report) => {
                match self.coordinator.finalize(task_id, TaskOutcome::Done).await {
                    Ok(()) => {
                        self.report.done += 1;
                        info!(
                            windows = report.windows,
                            batches = report.batches,
                            flushes = report.flushes,
                            detections = report.detections,
                            "task done"
                        );
                    }
                    Err(e) => self.finalize_failed(e, "DONE"),
                }
                false
            }
            Err(e) if e.kind() == ErrorKind::LeaseLost => {
                warn!(error = %e, "lease lost mid-task, leaving the task to its new owner");
                self.report.lost += 1;
                false
            }
            Err(e) if e.kind() == ErrorKind::Transient => {
                warn!(error = %e, "store connection lost mid-task");
                self.coordinator.invalidate();
                self.requeue(&task, "store unavailable").await;
                false
            }
            Err(e) => {
                let interrupted = e.kind() == ErrorKind::Interrupted;
                if interrupted {
                    warn!("task interrupted by shutdown");
                } else {
                    error!(error = %e, kind = ?e.kind(), "task failed");
                }
                match self.coordinator.fail_task(task_id).await {
                    Ok(()) => self.report.failed += 1,
                    Err(e) => self.finalize_failed(e, "FAILED"),
                }
                interrupted
            }
        }
    }

    fn finalize_failed(&mut self, e: StoreError, outcome: &str) {
        if let StoreError::LeaseLost(_) = e {
            warn!(outcome, "lease lost before finalize, task left to its new owner");
            self.report.lost += 1;
        } else {
            error!(error = %e, outcome, "finalize failed, task left IN_PROGRESS");
        }
    }

    async fn process(&mut self, task: &ClaimedTask) -> Result<EngineReport, TaskError> {
        let store = self.coordinator.store();
        let stored = store
            .get_config(&task.config_id)
            .await?
            .ok_or_else(|| TaskError::MissingConfig(task.config_id.to_string()))?;
        let subject = store
            .get_subject(task.subject_id)
            .await?
            .ok_or(TaskError::MissingSubject(task.subject_id))?;
        let config = &stored.config;
        config.validate()?;
        self.classifier.prepare(&config.model()?)?;

        let context = DeploymentContext::for_subject(&subject);
        let allow_list =
            resolve_allow_list(&config.species_list, &context, self.classifier.as_mut()).await?;
        let params = TaskParams::new(task, config, allow_list);

        let stream = self.media.open_stream(&subject.object_name).await?;
        debug!(object = %subject.object_name, config = stored.id.short(), "processing");
        InferenceEngine::new(store, self.classifier.as_mut(), &self.cancel)
            .run(&params, stream)
            .await
    }

    async fn requeue(&mut self, task: &ClaimedTask, reason: &str) {
        match self.coordinator.reset_to_pending(task.task_id).await {
            Ok(()) => {
                self.report.requeued += 1;
                debug!(task = %task.task_id, reason, "task returned to queue");
            }
            Err(e) => error!(task = %task.task_id, error = %e, "could not return task to queue"),
        }
    }
}

/// Next message. After shutdown only what is already queued is taken.
async fn next_dispatch(rx: &SharedReceiver, cancel: &CancellationToken) -> Option<Dispatch> {
    let mut rx = rx.lock().await;
    if cancel.is_cancelled() {
        return rx.try_recv().ok();
    }
    let received = tokio::select! {
        msg = rx.recv() => Some(msg),
        _ = cancel.cancelled() => None,
    };
    match received {
        Some(msg) => msg,
        None => rx.try_recv().ok(),
    }
}
