//! SQLite store.
//!
//! One `SqliteStore` wraps one connection; every call runs on the blocking
//! pool. Processes and workers share the database file in WAL mode.
//!
//! SQLite has no `SKIP LOCKED`. A claim instead takes the write lock up front
//! (`BEGIN IMMEDIATE`) and moves one PENDING row to IN_PROGRESS with a single
//! `UPDATE … RETURNING`, so two claimants can never see the same row, and the
//! busy timeout bounds how long one waits for another.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, TransactionBehavior, params};
use tracing::debug;

use crate::domain::{
    ClaimedTask, ConfigId, Detection, GeoPoint, InferenceConfig, QueueCounts, StoreError,
    StoredConfig, Subject, SubjectId, SubjectSelector, TaskId, TaskOutcome, TaskRecord, TaskState,
};
use crate::ports::{Clock, IdGenerator, StoreConnector, SystemClock, TaskStore, UlidGenerator};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS configs (
    config_id   TEXT PRIMARY KEY,
    content     TEXT NOT NULL UNIQUE,
    comment     TEXT,
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS subjects (
    subject_id    TEXT PRIMARY KEY,
    object_name   TEXT NOT NULL UNIQUE,
    node_label    TEXT NOT NULL,
    recorded_at   INTEGER NOT NULL,
    duration_secs REAL NOT NULL,
    sample_rate   INTEGER NOT NULL,
    file_size     INTEGER NOT NULL,
    lat           REAL,
    lon           REAL
);

CREATE TABLE IF NOT EXISTS tasks (
    task_id      TEXT PRIMARY KEY,
    subject_id   TEXT NOT NULL REFERENCES subjects(subject_id),
    config_id    TEXT NOT NULL REFERENCES configs(config_id),
    state        INTEGER NOT NULL DEFAULT 0,
    scheduled_on INTEGER NOT NULL,
    pickup_on    INTEGER,
    end_on       INTEGER,
    batch_tag    TEXT,
    UNIQUE (subject_id, config_id)
);
CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state);

CREATE TABLE IF NOT EXISTS results (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id      TEXT NOT NULL REFERENCES tasks(task_id),
    subject_id   TEXT NOT NULL,
    start_secs   REAL NOT NULL,
    end_secs     REAL NOT NULL,
    class_label  TEXT NOT NULL,
    confidence   REAL NOT NULL,
    freq_low_hz  REAL,
    freq_high_hz REAL
);
CREATE INDEX IF NOT EXISTS idx_results_task ON results(task_id);
CREATE INDEX IF NOT EXISTS idx_results_subject ON results(subject_id);
"#;

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn map_sqlite(e: rusqlite::Error) -> StoreError {
    match e.sqlite_error_code() {
        Some(
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::CannotOpen
            | ErrorCode::SystemIoFailure,
        ) => StoreError::Unavailable(e.to_string()),
        Some(ErrorCode::ConstraintViolation) => StoreError::Integrity(e.to_string()),
        _ => StoreError::Backend(e.to_string()),
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Integrity(format!("timestamp out of range: {ms}")))
}

fn parse_id<T: std::str::FromStr>(raw: &str) -> Result<T, StoreError>
where
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e: T::Err| StoreError::Integrity(format!("bad id {raw}: {e}")))
}

fn to_i64(value: u64, what: &str) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Integrity(format!("{what} out of range: {value}")))
}

/// Open a connection and make sure the schema exists.
pub fn open_connection(path: &Path, busy_timeout: Duration) -> Result<Connection, StoreError> {
    let conn = Connection::open(path).map_err(|e| StoreError::Unavailable(e.to_string()))?;
    conn.busy_timeout(busy_timeout).map_err(map_sqlite)?;
    conn.execute_batch(SCHEMA).map_err(map_sqlite)?;
    Ok(conn)
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
    ids: Arc<UlidGenerator<Arc<dyn Clock>>>,
}

impl SqliteStore {
    pub fn new(conn: Connection, clock: Arc<dyn Clock>) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            ids: Arc::new(UlidGenerator::new(Arc::clone(&clock))),
            clock,
        }
    }

    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        SqliteConnector::new(path).open().await
    }

    /// Run `f` against the connection on the blocking pool.
    async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("connection mutex poisoned".into()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("task join error: {e}")))?
    }
}

struct TaskRow {
    task_id: String,
    subject_id: String,
    config_id: String,
    state: i64,
    scheduled_on: i64,
    pickup_on: Option<i64>,
    end_on: Option<i64>,
    batch_tag: Option<String>,
}

impl TaskRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            task_id: row.get(0)?,
            subject_id: row.get(1)?,
            config_id: row.get(2)?,
            state: row.get(3)?,
            scheduled_on: row.get(4)?,
            pickup_on: row.get(5)?,
            end_on: row.get(6)?,
            batch_tag: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<TaskRecord, StoreError> {
        Ok(TaskRecord {
            id: parse_id(&self.task_id)?,
            subject_id: parse_id(&self.subject_id)?,
            config_id: ConfigId::from_hex(self.config_id)
                .map_err(|e| StoreError::Integrity(e.to_string()))?,
            state: TaskState::from_code(self.state)
                .ok_or_else(|| StoreError::Integrity(format!("bad task state {}", self.state)))?,
            scheduled_on: from_millis(self.scheduled_on)?,
            pickup_on: self.pickup_on.map(from_millis).transpose()?,
            end_on: self.end_on.map(from_millis).transpose()?,
            batch_tag: self.batch_tag,
        })
    }
}

struct SubjectRow {
    subject_id: String,
    object_name: String,
    node_label: String,
    recorded_at: i64,
    duration_secs: f64,
    sample_rate: i64,
    file_size: i64,
    lat: Option<f64>,
    lon: Option<f64>,
}

const SUBJECT_COLUMNS: &str = "s.subject_id, s.object_name, s.node_label, s.recorded_at, \
     s.duration_secs, s.sample_rate, s.file_size, s.lat, s.lon";

impl SubjectRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            subject_id: row.get(0)?,
            object_name: row.get(1)?,
            node_label: row.get(2)?,
            recorded_at: row.get(3)?,
            duration_secs: row.get(4)?,
            sample_rate: row.get(5)?,
            file_size: row.get(6)?,
            lat: row.get(7)?,
            lon: row.get(8)?,
        })
    }

    fn into_subject(self) -> Result<Subject, StoreError> {
        Ok(Subject {
            id: parse_id(&self.subject_id)?,
            object_name: self.object_name,
            node_label: self.node_label,
            recorded_at: from_millis(self.recorded_at)?,
            duration_secs: self.duration_secs,
            sample_rate: u32::try_from(self.sample_rate)
                .map_err(|_| StoreError::Integrity(format!("bad sample rate {}", self.sample_rate)))?,
            file_size: u64::try_from(self.file_size)
                .map_err(|_| StoreError::Integrity(format!("bad file size {}", self.file_size)))?,
            location: match (self.lat, self.lon) {
                (Some(lat), Some(lon)) => Some(GeoPoint { lat, lon }),
                _ => None,
            },
        })
    }
}

fn delete_results_sync(conn: &Connection, task_id: &str) -> Result<u64, StoreError> {
    let n = conn
        .execute("DELETE FROM results WHERE task_id = ?1", params![task_id])
        .map_err(map_sqlite)?;
    Ok(n as u64)
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn claim_next(&self) -> Result<Option<ClaimedTask>, StoreError> {
        let now = millis(self.clock.now());
        let claimed = self
            .call(move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(map_sqlite)?;
                let row = tx
                    .query_row(
                        "UPDATE tasks SET state = 1, pickup_on = ?1, end_on = NULL
                         WHERE task_id = (SELECT task_id FROM tasks WHERE state = 0 LIMIT 1)
                         RETURNING task_id, subject_id, config_id",
                        params![now],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, String>(2)?,
                            ))
                        },
                    )
                    .optional()
                    .map_err(map_sqlite)?;
                tx.commit().map_err(map_sqlite)?;
                Ok(row)
            })
            .await?;

        claimed
            .map(|(task_id, subject_id, config_id)| {
                Ok(ClaimedTask {
                    task_id: parse_id(&task_id)?,
                    subject_id: parse_id(&subject_id)?,
                    config_id: ConfigId::from_hex(config_id)
                        .map_err(|e| StoreError::Integrity(e.to_string()))?,
                })
            })
            .transpose()
    }

    async fn finalize(&self, task_id: TaskId, outcome: TaskOutcome) -> Result<(), StoreError> {
        let now = millis(self.clock.now());
        let state = TaskState::from(outcome).code();
        let id = task_id.to_storage();
        self.call(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_sqlite)?;
            let changed = tx
                .execute(
                    "UPDATE tasks SET state = ?2, end_on = ?3 WHERE task_id = ?1 AND state = 1",
                    params![id, state, now],
                )
                .map_err(map_sqlite)?;
            if changed == 0 {
                let current: Option<i64> = tx
                    .query_row(
                        "SELECT state FROM tasks WHERE task_id = ?1",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(map_sqlite)?;
                return Err(match current {
                    None => StoreError::NotFound(format!("task {id}")),
                    Some(_) => StoreError::LeaseLost(task_id),
                });
            }
            tx.commit().map_err(map_sqlite)
        })
        .await
    }

    async fn reset_to_pending(&self, task_id: TaskId) -> Result<(), StoreError> {
        let id = task_id.to_storage();
        self.call(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_sqlite)?;
            delete_results_sync(&tx, &id)?;
            let changed = tx
                .execute(
                    "UPDATE tasks SET state = 0, pickup_on = NULL, end_on = NULL
                     WHERE task_id = ?1",
                    params![id],
                )
                .map_err(map_sqlite)?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("task {id}")));
            }
            tx.commit().map_err(map_sqlite)
        })
        .await
    }

    async fn delete_results(&self, task_id: TaskId) -> Result<u64, StoreError> {
        let id = task_id.to_storage();
        self.call(move |conn| delete_results_sync(conn, &id)).await
    }

    async fn insert_results(&self, detections: &[Detection]) -> Result<(), StoreError> {
        if detections.is_empty() {
            return Ok(());
        }
        let detections = detections.to_vec();
        self.call(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_sqlite)?;
            let mut leased = HashSet::new();
            for d in &detections {
                if leased.contains(&d.task_id) {
                    continue;
                }
                let code: Option<i64> = tx
                    .query_row(
                        "SELECT state FROM tasks WHERE task_id = ?1",
                        params![d.task_id.to_storage()],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(map_sqlite)?;
                match code {
                    None => {
                        return Err(StoreError::Integrity(format!(
                            "result for unknown task {}",
                            d.task_id
                        )));
                    }
                    Some(code) if code != TaskState::InProgress.code() => {
                        return Err(StoreError::LeaseLost(d.task_id));
                    }
                    Some(_) => {
                        leased.insert(d.task_id);
                    }
                }
            }
            {
                let mut stmt = tx
                    .prepare_cached(
                        "INSERT INTO results (task_id, subject_id, start_secs, end_secs,
                             class_label, confidence, freq_low_hz, freq_high_hz)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    )
                    .map_err(map_sqlite)?;
                for d in &detections {
                    stmt.execute(params![
                        d.task_id.to_storage(),
                        d.subject_id.to_storage(),
                        d.start_secs,
                        d.end_secs,
                        d.class_label,
                        f64::from(d.confidence),
                        d.freq_low_hz.map(f64::from),
                        d.freq_high_hz.map(f64::from),
                    ])
                    .map_err(map_sqlite)?;
                }
            }
            tx.commit().map_err(map_sqlite)
        })
        .await
    }

    async fn list_results(&self, task_id: TaskId) -> Result<Vec<Detection>, StoreError> {
        let id = task_id.to_storage();
        self.call(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT subject_id, start_secs, end_secs, class_label, confidence,
                            freq_low_hz, freq_high_hz
                     FROM results WHERE task_id = ?1 ORDER BY id",
                )
                .map_err(map_sqlite)?;
            let rows = stmt
                .query_map(params![id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, Option<f64>>(5)?,
                        row.get::<_, Option<f64>>(6)?,
                    ))
                })
                .map_err(map_sqlite)?;

            let mut out = Vec::new();
            for row in rows {
                let (subject_id, start_secs, end_secs, class_label, confidence, low, high) =
                    row.map_err(map_sqlite)?;
                out.push(Detection {
                    task_id,
                    subject_id: parse_id(&subject_id)?,
                    start_secs,
                    end_secs,
                    class_label,
                    confidence: confidence as f32,
                    freq_low_hz: low.map(|v| v as f32),
                    freq_high_hz: high.map(|v| v as f32),
                });
            }
            Ok(out)
        })
        .await
    }

    async fn store_config(
        &self,
        config: &InferenceConfig,
        comment: Option<&str>,
    ) -> Result<ConfigId, StoreError> {
        let content = config
            .canonical_json()
            .map_err(|e| StoreError::Integrity(e.to_string()))?;
        let id = ConfigId::for_content(content.as_bytes());
        let comment = comment.map(str::to_string);
        let now = millis(self.clock.now());
        let key = id.to_string();
        self.call(move |conn| {
            let inserted = conn
                .execute(
                    "INSERT INTO configs (config_id, content, comment, created_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT DO NOTHING",
                    params![key, content, comment, now],
                )
                .map_err(map_sqlite)?;
            debug!(config_id = %key, inserted = inserted == 1, "stored config");
            Ok(())
        })
        .await?;
        Ok(id)
    }

    async fn get_config(&self, id: &ConfigId) -> Result<Option<StoredConfig>, StoreError> {
        let key = id.to_string();
        let row = self
            .call(move |conn| {
                conn.query_row(
                    "SELECT content, comment FROM configs WHERE config_id = ?1",
                    params![key],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
                )
                .optional()
                .map_err(map_sqlite)
            })
            .await?;

        row.map(|(content, comment)| {
            let config: InferenceConfig = serde_json::from_str(&content)
                .map_err(|e| StoreError::Integrity(format!("config {id}: {e}")))?;
            Ok(StoredConfig {
                id: id.clone(),
                config,
                comment,
            })
        })
        .transpose()
    }

    async fn register_subject(&self, subject: &Subject) -> Result<bool, StoreError> {
        let s = subject.clone();
        let file_size = to_i64(s.file_size, "file size")?;
        self.call(move |conn| {
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO subjects (subject_id, object_name, node_label,
                         recorded_at, duration_secs, sample_rate, file_size, lat, lon)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        s.id.to_storage(),
                        s.object_name,
                        s.node_label,
                        millis(s.recorded_at),
                        s.duration_secs,
                        i64::from(s.sample_rate),
                        file_size,
                        s.location.map(|p| p.lat),
                        s.location.map(|p| p.lon),
                    ],
                )
                .map_err(map_sqlite)?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn get_subject(&self, id: SubjectId) -> Result<Option<Subject>, StoreError> {
        let key = id.to_storage();
        let row = self
            .call(move |conn| {
                conn.query_row(
                    &format!("SELECT {SUBJECT_COLUMNS} FROM subjects s WHERE s.subject_id = ?1"),
                    params![key],
                    SubjectRow::from_row,
                )
                .optional()
                .map_err(map_sqlite)
            })
            .await?;
        row.map(SubjectRow::into_subject).transpose()
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let key = id.to_storage();
        let row = self
            .call(move |conn| {
                conn.query_row(
                    "SELECT task_id, subject_id, config_id, state, scheduled_on, pickup_on,
                            end_on, batch_tag
                     FROM tasks WHERE task_id = ?1",
                    params![key],
                    TaskRow::from_row,
                )
                .optional()
                .map_err(map_sqlite)
            })
            .await?;
        row.map(TaskRow::into_record).transpose()
    }

    async fn list_tasks(&self, state: Option<TaskState>) -> Result<Vec<TaskRecord>, StoreError> {
        let code = state.map(TaskState::code);
        let rows = self
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT task_id, subject_id, config_id, state, scheduled_on, pickup_on,
                                end_on, batch_tag
                         FROM tasks WHERE ?1 IS NULL OR state = ?1
                         ORDER BY scheduled_on, task_id",
                    )
                    .map_err(map_sqlite)?;
                let rows = stmt
                    .query_map(params![code], TaskRow::from_row)
                    .map_err(map_sqlite)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(map_sqlite)?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(TaskRow::into_record).collect()
    }

    async fn enqueue_batch(
        &self,
        config_id: &ConfigId,
        selector: &SubjectSelector,
        tag: Option<&str>,
    ) -> Result<u64, StoreError> {
        // the regex is checked before touching the database
        selector
            .matcher()
            .map_err(|e| StoreError::Integrity(e.to_string()))?;
        let selector = selector.clone();
        let config_key = config_id.to_string();
        let tag = tag.map(str::to_string);
        let now = millis(self.clock.now());
        let ids = Arc::clone(&self.ids);

        self.call(move |conn| {
            let matcher = selector
                .matcher()
                .map_err(|e| StoreError::Integrity(e.to_string()))?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_sqlite)?;

            let known: bool = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM configs WHERE config_id = ?1)",
                    params![config_key],
                    |row| row.get(0),
                )
                .map_err(map_sqlite)?;
            if !known {
                return Err(StoreError::NotFound(format!("config {config_key}")));
            }

            let candidates = {
                let mut stmt = tx
                    .prepare(&format!(
                        "SELECT {SUBJECT_COLUMNS},
                                EXISTS(SELECT 1 FROM results r WHERE r.subject_id = s.subject_id)
                         FROM subjects s
                         WHERE NOT EXISTS (
                             SELECT 1 FROM tasks t
                             WHERE t.subject_id = s.subject_id AND t.config_id = ?1)
                         ORDER BY s.recorded_at, s.subject_id"
                    ))
                    .map_err(map_sqlite)?;
                let rows = stmt
                    .query_map(params![config_key], |row| {
                        Ok((SubjectRow::from_row(row)?, row.get::<_, bool>(9)?))
                    })
                    .map_err(map_sqlite)?;
                let mut out = Vec::new();
                for row in rows {
                    let (subject, has_results) = row.map_err(map_sqlite)?;
                    out.push((subject.into_subject()?, has_results));
                }
                out
            };

            let mut inserted = 0_u64;
            {
                let mut stmt = tx
                    .prepare_cached(
                        "INSERT OR IGNORE INTO tasks
                             (task_id, subject_id, config_id, state, scheduled_on, batch_tag)
                         VALUES (?1, ?2, ?3, 0, ?4, ?5)",
                    )
                    .map_err(map_sqlite)?;
                for (subject, has_results) in &candidates {
                    if !matcher.matches(subject, *has_results) {
                        continue;
                    }
                    inserted += stmt
                        .execute(params![
                            ids.generate_task_id().to_storage(),
                            subject.id.to_storage(),
                            config_key,
                            now,
                            tag,
                        ])
                        .map_err(map_sqlite)? as u64;
                }
            }
            tx.commit().map_err(map_sqlite)?;
            Ok(inserted)
        })
        .await
    }

    async fn reset_queue(&self) -> Result<u64, StoreError> {
        self.call(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_sqlite)?;
            tx.execute(
                "DELETE FROM results WHERE task_id IN
                     (SELECT task_id FROM tasks WHERE state IN (0, 3))",
                [],
            )
            .map_err(map_sqlite)?;
            let deleted = tx
                .execute("DELETE FROM tasks WHERE state IN (0, 3)", [])
                .map_err(map_sqlite)?;
            tx.commit().map_err(map_sqlite)?;
            Ok(deleted as u64)
        })
        .await
    }

    async fn reset_failed(&self) -> Result<u64, StoreError> {
        self.call(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_sqlite)?;
            tx.execute(
                "DELETE FROM results WHERE task_id IN
                     (SELECT task_id FROM tasks WHERE state = 3)",
                [],
            )
            .map_err(map_sqlite)?;
            let reset = tx
                .execute(
                    "UPDATE tasks SET state = 0, pickup_on = NULL, end_on = NULL WHERE state = 3",
                    [],
                )
                .map_err(map_sqlite)?;
            tx.commit().map_err(map_sqlite)?;
            Ok(reset as u64)
        })
        .await
    }

    async fn counts_by_state(&self) -> Result<QueueCounts, StoreError> {
        self.call(|conn| {
            let mut stmt = conn
                .prepare("SELECT state, COUNT(*) FROM tasks GROUP BY state")
                .map_err(map_sqlite)?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))
                .map_err(map_sqlite)?;
            let mut counts = QueueCounts::default();
            for row in rows {
                let (code, n) = row.map_err(map_sqlite)?;
                let n = n as usize;
                match TaskState::from_code(code) {
                    Some(TaskState::Pending) => counts.pending = n,
                    Some(TaskState::InProgress) => counts.in_progress = n,
                    Some(TaskState::Done) => counts.done = n,
                    Some(TaskState::Failed) => counts.failed = n,
                    None => return Err(StoreError::Integrity(format!("bad task state {code}"))),
                }
            }
            Ok(counts)
        })
        .await
    }
}

/// Opens connections to one database file.
#[derive(Clone)]
pub struct SqliteConnector {
    path: PathBuf,
    busy_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl SqliteConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn open(&self) -> Result<SqliteStore, StoreError> {
        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;
        let conn = tokio::task::spawn_blocking(move || open_connection(&path, busy_timeout))
            .await
            .map_err(|e| StoreError::Backend(format!("task join error: {e}")))??;
        Ok(SqliteStore::new(conn, Arc::clone(&self.clock)))
    }
}

#[async_trait]
impl StoreConnector for SqliteConnector {
    async fn connect(&self) -> Result<Box<dyn TaskStore>, StoreError> {
        Ok(Box::new(self.open().await?))
    }
}
