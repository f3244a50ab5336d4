//! In-memory store.
//!
//! All state sits behind one async mutex, so every operation is trivially
//! atomic; a claim is "skip locked" because no two claims can observe the same
//! PENDING task. Clones share state and act as separate connections.
//!
//! Faults can be injected per operation to exercise reconnect paths.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{
    ClaimedTask, ConfigId, Detection, InferenceConfig, QueueCounts, StoreError, StoredConfig,
    Subject, SubjectId, SubjectSelector, TaskId, TaskOutcome, TaskRecord, TaskState,
};
use crate::ports::{Clock, IdGenerator, StoreConnector, SystemClock, TaskStore, UlidGenerator};

/// Store operations that can be made to fail with `Unavailable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Connect,
    Claim,
    Finalize,
    Reset,
    InsertResults,
}

#[derive(Default)]
struct MemoryState {
    tasks: HashMap<TaskId, TaskRecord>,

    /// Claim order. May hold ids that are no longer PENDING; claim skips them.
    ready: VecDeque<TaskId>,

    /// Insertion order is flush order.
    results: Vec<Detection>,

    configs: HashMap<ConfigId, StoredConfig>,
    subjects: HashMap<SubjectId, Subject>,
    subject_by_object: HashMap<String, SubjectId>,

    faults: HashMap<FaultPoint, usize>,
}

impl MemoryState {
    fn trip(&mut self, point: FaultPoint) -> Result<(), StoreError> {
        match self.faults.get_mut(&point) {
            Some(n) if *n > 0 => {
                *n -= 1;
                Err(StoreError::Unavailable(format!("injected {point:?} fault")))
            }
            _ => Ok(()),
        }
    }

    fn delete_results(&mut self, task_id: TaskId) -> u64 {
        let before = self.results.len();
        self.results.retain(|d| d.task_id != task_id);
        (before - self.results.len()) as u64
    }

    fn reset_to_pending(&mut self, task_id: TaskId) -> Result<(), StoreError> {
        self.delete_results(task_id);
        let record = self
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        let was_pending = record.state == TaskState::Pending;
        record.reset();
        if !was_pending {
            self.ready.push_back(task_id);
        }
        Ok(())
    }

    fn counts_by_state(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for record in self.tasks.values() {
            counts.add(record.state);
        }
        counts
    }
}

#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    clock: Arc<dyn Clock>,
    ids: Arc<UlidGenerator<Arc<dyn Clock>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            ids: Arc::new(UlidGenerator::new(Arc::clone(&clock))),
            clock,
        }
    }

    /// A connector handing out connections to this store.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            store: self.clone(),
        }
    }

    /// Make the next `n` calls of `point` fail with `Unavailable`.
    pub async fn fail_next(&self, point: FaultPoint, n: usize) {
        self.state.lock().await.faults.insert(point, n);
    }

    /// All tasks, for inspection.
    pub async fn tasks(&self) -> Vec<TaskRecord> {
        let state = self.state.lock().await;
        let mut tasks: Vec<_> = state.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    pub async fn result_count(&self) -> usize {
        self.state.lock().await.results.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn claim_next(&self) -> Result<Option<ClaimedTask>, StoreError> {
        let mut state = self.state.lock().await;
        state.trip(FaultPoint::Claim)?;
        let now = self.clock.now();
        while let Some(task_id) = state.ready.pop_front() {
            if let Some(record) = state.tasks.get_mut(&task_id)
                && record.state == TaskState::Pending
            {
                record.claim(now);
                return Ok(Some(record.claimed()));
            }
        }
        Ok(None)
    }

    async fn finalize(&self, task_id: TaskId, outcome: TaskOutcome) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.trip(FaultPoint::Finalize)?;
        let now = self.clock.now();
        let record = state
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;
        if record.state != TaskState::InProgress {
            return Err(StoreError::LeaseLost(task_id));
        }
        record.finish(outcome, now);
        Ok(())
    }

    async fn reset_to_pending(&self, task_id: TaskId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.trip(FaultPoint::Reset)?;
        state.reset_to_pending(task_id)
    }

    async fn delete_results(&self, task_id: TaskId) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.delete_results(task_id))
    }

    async fn insert_results(&self, detections: &[Detection]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.trip(FaultPoint::InsertResults)?;
        for d in detections {
            match state.tasks.get(&d.task_id) {
                None => {
                    return Err(StoreError::Integrity(format!(
                        "result for unknown task {}",
                        d.task_id
                    )));
                }
                Some(record) if record.state != TaskState::InProgress => {
                    return Err(StoreError::LeaseLost(d.task_id));
                }
                Some(_) => {}
            }
        }
        state.results.extend_from_slice(detections);
        Ok(())
    }

    async fn list_results(&self, task_id: TaskId) -> Result<Vec<Detection>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .results
            .iter()
            .filter(|d| d.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn store_config(
        &self,
        config: &InferenceConfig,
        comment: Option<&str>,
    ) -> Result<ConfigId, StoreError> {
        let id = config
            .content_id()
            .map_err(|e| StoreError::Integrity(e.to_string()))?;
        let mut state = self.state.lock().await;
        state
            .configs
            .entry(id.clone())
            .or_insert_with(|| StoredConfig {
                id: id.clone(),
                config: config.clone(),
                comment: comment.map(str::to_string),
            });
        Ok(id)
    }

    async fn get_config(&self, id: &ConfigId) -> Result<Option<StoredConfig>, StoreError> {
        Ok(self.state.lock().await.configs.get(id).cloned())
    }

    async fn register_subject(&self, subject: &Subject) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state.subject_by_object.contains_key(&subject.object_name) {
            return Ok(false);
        }
        state
            .subject_by_object
            .insert(subject.object_name.clone(), subject.id);
        state.subjects.insert(subject.id, subject.clone());
        Ok(true)
    }

    async fn get_subject(&self, id: SubjectId) -> Result<Option<Subject>, StoreError> {
        Ok(self.state.lock().await.subjects.get(&id).cloned())
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.state.lock().await.tasks.get(&id).cloned())
    }

    async fn list_tasks(&self, state: Option<TaskState>) -> Result<Vec<TaskRecord>, StoreError> {
        let guard = self.state.lock().await;
        let mut tasks: Vec<TaskRecord> = guard
            .tasks
            .values()
            .filter(|t| state.is_none_or(|s| t.state == s))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.scheduled_on, t.id));
        Ok(tasks)
    }

    async fn enqueue_batch(
        &self,
        config_id: &ConfigId,
        selector: &SubjectSelector,
        tag: Option<&str>,
    ) -> Result<u64, StoreError> {
        let matcher = selector
            .matcher()
            .map_err(|e| StoreError::Integrity(e.to_string()))?;
        let mut state = self.state.lock().await;
        if !state.configs.contains_key(config_id) {
            return Err(StoreError::NotFound(format!("config {config_id}")));
        }

        let scheduled: HashSet<SubjectId> = state
            .tasks
            .values()
            .filter(|t| &t.config_id == config_id)
            .map(|t| t.subject_id)
            .collect();
        let with_results: HashSet<SubjectId> =
            state.results.iter().map(|d| d.subject_id).collect();

        let mut selected: Vec<&Subject> = state
            .subjects
            .values()
            .filter(|s| !scheduled.contains(&s.id))
            .filter(|s| matcher.matches(s, with_results.contains(&s.id)))
            .collect();
        selected.sort_by_key(|s| (s.recorded_at, s.id));
        let selected: Vec<SubjectId> = selected.into_iter().map(|s| s.id).collect();

        let now = self.clock.now();
        for subject_id in &selected {
            let record = TaskRecord::new(
                self.ids.generate_task_id(),
                *subject_id,
                config_id.clone(),
                now,
                tag.map(str::to_string),
            );
            state.ready.push_back(record.id);
            state.tasks.insert(record.id, record);
        }
        Ok(selected.len() as u64)
    }

    async fn reset_queue(&self) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let doomed: Vec<TaskId> = state
            .tasks
            .values()
            .filter(|t| !t.state.is_kept_on_queue_reset())
            .map(|t| t.id)
            .collect();
        for task_id in &doomed {
            state.delete_results(*task_id);
            state.tasks.remove(task_id);
        }
        Ok(doomed.len() as u64)
    }

    async fn reset_failed(&self) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let failed: Vec<TaskId> = state
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Failed)
            .map(|t| t.id)
            .collect();
        for task_id in &failed {
            state.reset_to_pending(*task_id)?;
        }
        Ok(failed.len() as u64)
    }

    async fn counts_by_state(&self) -> Result<QueueCounts, StoreError> {
        Ok(self.state.lock().await.counts_by_state())
    }
}

/// Hands out connections (clones) of one [`MemoryStore`].
#[derive(Clone)]
pub struct MemoryConnector {
    store: MemoryStore,
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn TaskStore>, StoreError> {
        self.store.state.lock().await.trip(FaultPoint::Connect)?;
        Ok(Box::new(self.store.clone()))
    }
}
