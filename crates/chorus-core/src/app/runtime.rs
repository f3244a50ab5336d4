//! Runtime: one producer, a fixed worker pool, and the drain that brings them
//! down without losing tasks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::coordinator::LeaseCoordinator;
use super::producer::{Dispatch, Producer, ProducerReport};
use super::retry::RetryPolicy;
use super::worker_pool::{SharedReceiver, StartupError, WorkerDeps, WorkerPool, WorkerReport};
use crate::ports::{MediaSource, ModelLoader, StoreConnector};

/// Default pause between claims while the queue is empty.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSettings {
    pub workers: usize,
    pub idle_interval: Duration,
    pub retry: RetryPolicy,
    /// Finish the queued work and stop once a claim comes back empty.
    pub exit_when_idle: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            workers: 1,
            idle_interval: DEFAULT_IDLE_INTERVAL,
            retry: RetryPolicy::default(),
            exit_when_idle: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub producer: ProducerReport,
    pub workers: WorkerReport,
    /// Tasks the drain took off the channel and handed back.
    pub drained: usize,
}

pub struct Runtime {
    settings: RuntimeSettings,
    deps: WorkerDeps,
}

impl Runtime {
    pub fn new(
        settings: RuntimeSettings,
        connector: Arc<dyn StoreConnector>,
        media: Arc<dyn MediaSource>,
        models: Arc<dyn ModelLoader>,
    ) -> Self {
        let deps = WorkerDeps {
            connector,
            media,
            models,
            retry: settings.retry.clone(),
        };
        Self { settings, deps }
    }

    /// Run until `cancel` fires (or the queue runs dry with
    /// `exit_when_idle`), then drain.
    ///
    /// Drain on shutdown:
    /// 1. the producer stops and hands back any task it could not push
    /// 2. tasks still on the channel go back to PENDING
    /// 3. the stop pill goes in, workers finish or fail their current task
    /// 4. whatever is left on the channel after the join goes back to PENDING
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunReport, StartupError> {
        let n = self.settings.workers.max(1);
        let coordinator =
            LeaseCoordinator::connect(Arc::clone(&self.deps.connector), self.settings.retry.clone())
                .await?
                .with_cancel(cancel.clone());

        let (tx, rx) = mpsc::channel(n);
        let rx: SharedReceiver = Arc::new(Mutex::new(rx));
        let pool = WorkerPool::start(n, &self.deps, Arc::clone(&rx), tx.clone(), cancel.clone()).await?;
        info!(workers = pool.len(), "runtime started");

        let producer = Producer::new(coordinator, tx.clone(), self.settings.idle_interval, cancel.clone())
            .exit_when_idle(self.settings.exit_when_idle);
        let (mut coordinator, producer_report) = match tokio::spawn(producer.run()).await {
            Ok(done) => done,
            Err(e) => {
                error!(error = %e, "producer panicked");
                cancel.cancel();
                let coordinator = LeaseCoordinator::connect(
                    Arc::clone(&self.deps.connector),
                    self.settings.retry.clone(),
                )
                .await?;
                (coordinator, ProducerReport::default())
            }
        };

        let mut drained = 0;
        if cancel.is_cancelled() {
            info!("shutdown requested, draining");
            drained += sweep(&rx, &mut coordinator, false).await;
            // workers exit on their own once the channel is empty; the pill is
            // for the ones still waiting
            let _ = tx.try_send(Dispatch::Stop);
        } else {
            // idle exit: the pill queues behind the remaining tasks
            tokio::select! {
                _ = tx.send(Dispatch::Stop) => {}
                _ = cancel.cancelled() => {
                    let _ = tx.try_send(Dispatch::Stop);
                }
            }
        }
        drop(tx);

        let workers = pool.join().await;
        drained += sweep(&rx, &mut coordinator, true).await;

        let report = RunReport {
            producer: producer_report,
            workers,
            drained,
        };
        info!(
            dispatched = report.producer.dispatched,
            done = report.workers.done,
            failed = report.workers.failed,
            requeued = report.workers.requeued + report.producer.returned + report.drained,
            lost = report.workers.lost,
            "runtime stopped"
        );
        Ok(report)
    }
}

/// Take every task off the channel and reset it to PENDING. Without `wait`
/// the sweep is skipped if a worker holds the receiver; that worker resets
/// what it takes itself.
async fn sweep(rx: &SharedReceiver, coordinator: &mut LeaseCoordinator, wait: bool) -> usize {
    let mut guard = if wait {
        rx.lock().await
    } else {
        match rx.try_lock() {
            Ok(guard) => guard,
            Err(_) => return 0,
        }
    };
    let mut reset = 0;
    while let Ok(msg) = guard.try_recv() {
        let Dispatch::Task(task) = msg else { continue };
        match coordinator.reset_to_pending(task.task_id).await {
            Ok(()) => {
                reset += 1;
                debug!(task = %task.task_id, "drained task returned to queue");
            }
            Err(e) => error!(task = %task.task_id, error = %e, "could not return drained task"),
        }
    }
    reset
}
