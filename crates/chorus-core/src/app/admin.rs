//! Operator commands against the queue store.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::{
    ConfigError, ConfigId, GeoPoint, InferenceConfig, QueueCounts, SelectorCatalog, StoreError,
    StoredConfig, Subject, SubjectId, TaskRecord, TaskState,
};
use crate::ports::{IdGenerator, SystemClock, TaskStore, UlidGenerator};

#[derive(Debug, Error)]
pub enum AdminError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no selector named {0:?} in the catalog")]
    UnknownSelector(String),

    #[error("config {0} is not stored")]
    UnknownConfig(ConfigId),

    #[error("{path}: {reason}")]
    Io { path: String, reason: String },

    #[error("line {line}: {reason}")]
    Import { line: usize, reason: String },
}

/// One line of a subject import file. `id` is minted when absent.
#[derive(Debug, Clone, Deserialize)]
pub struct SubjectImport {
    #[serde(default)]
    pub id: Option<SubjectId>,
    pub object_name: String,
    pub node_label: String,
    pub recorded_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub sample_rate: u32,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub location: Option<GeoPoint>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub registered: usize,
    /// Object names that were already registered.
    pub skipped: usize,
}

pub struct Admin {
    store: Box<dyn TaskStore>,
    ids: Arc<dyn IdGenerator>,
}

impl Admin {
    pub fn new(store: Box<dyn TaskStore>) -> Self {
        Self {
            store,
            ids: Arc::new(UlidGenerator::new(SystemClock)),
        }
    }

    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn store(&self) -> &dyn TaskStore {
        self.store.as_ref()
    }

    /// Queue every subject the named selector matches that has no task for
    /// this config yet.
    pub async fn enqueue_batch(
        &self,
        config_id: &ConfigId,
        catalog: &SelectorCatalog,
        selector: &str,
        tag: Option<&str>,
    ) -> Result<u64, AdminError> {
        let selector = catalog
            .get(selector)
            .ok_or_else(|| AdminError::UnknownSelector(selector.to_string()))?;
        if self.store.get_config(config_id).await?.is_none() {
            return Err(AdminError::UnknownConfig(config_id.clone()));
        }
        let inserted = self.store.enqueue_batch(config_id, selector, tag).await?;
        info!(
            config = config_id.short(),
            selector = %selector.name,
            inserted,
            "batch enqueued"
        );
        Ok(inserted)
    }

    /// Drop every task that is neither running nor done, with its results.
    pub async fn reset_queue(&self) -> Result<u64, AdminError> {
        let removed = self.store.reset_queue().await?;
        info!(removed, "queue reset");
        Ok(removed)
    }

    pub async fn reset_failed(&self) -> Result<u64, AdminError> {
        let requeued = self.store.reset_failed().await?;
        info!(requeued, "failed tasks returned to queue");
        Ok(requeued)
    }

    /// Validate and store a config. Storing the same content twice returns
    /// the same id.
    pub async fn store_config(
        &self,
        config: &InferenceConfig,
        comment: Option<&str>,
    ) -> Result<ConfigId, AdminError> {
        config.validate()?;
        let id = self.store.store_config(config, comment).await?;
        info!(config = %id, "config stored");
        Ok(id)
    }

    pub async fn store_config_file(
        &self,
        path: &Path,
        comment: Option<&str>,
    ) -> Result<ConfigId, AdminError> {
        let text = read(path).await?;
        let config: InferenceConfig =
            serde_json::from_str(&text).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.store_config(&config, comment).await
    }

    pub async fn get_config(&self, id: &ConfigId) -> Result<StoredConfig, AdminError> {
        self.store
            .get_config(id)
            .await?
            .ok_or_else(|| AdminError::UnknownConfig(id.clone()))
    }

    /// Register subjects from JSON lines. Blank lines are skipped; a bad line
    /// stops the import, lines before it stay registered.
    pub async fn import_subjects(&self, lines: &str) -> Result<ImportReport, AdminError> {
        let mut report = ImportReport::default();
        for (i, line) in lines.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let import: SubjectImport =
                serde_json::from_str(line).map_err(|e| AdminError::Import {
                    line: i + 1,
                    reason: e.to_string(),
                })?;
            let subject = self.subject_from(import);
            if self.store.register_subject(&subject).await? {
                report.registered += 1;
            } else {
                warn!(object = %subject.object_name, "subject already registered");
                report.skipped += 1;
            }
        }
        info!(
            registered = report.registered,
            skipped = report.skipped,
            "subjects imported"
        );
        Ok(report)
    }

    pub async fn import_subjects_file(&self, path: &Path) -> Result<ImportReport, AdminError> {
        let text = read(path).await?;
        self.import_subjects(&text).await
    }

    pub async fn queue_status(&self) -> Result<QueueCounts, AdminError> {
        Ok(self.store.counts_by_state().await?)
    }

    pub async fn list_tasks(&self, state: Option<TaskState>) -> Result<Vec<TaskRecord>, AdminError> {
        Ok(self.store.list_tasks(state).await?)
    }

    fn subject_from(&self, import: SubjectImport) -> Subject {
        Subject {
            id: import.id.unwrap_or_else(|| self.ids.generate_subject_id()),
            object_name: import.object_name,
            node_label: import.node_label,
            recorded_at: import.recorded_at,
            duration_secs: import.duration_secs,
            sample_rate: import.sample_rate,
            file_size: import.file_size,
            location: import.location,
        }
    }
}

async fn read(path: &Path) -> Result<String, AdminError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| AdminError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}
