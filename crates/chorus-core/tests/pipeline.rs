//! End-to-end runs over the in-memory and SQLite stores.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rstest::rstest;
use tokio_util::sync::CancellationToken;

use chorus_core::app::{Admin, Runtime, RuntimeSettings};
use chorus_core::domain::{
    ConfigId, Detection, FlushParams, InferenceConfig, MediaError, SelectorCatalog,
    SpeciesListSource, TaskOutcome, TaskState,
};
use chorus_core::impls::{BandEnergyLoader, MemoryMediaSource, MemoryStore, SqliteConnector};
use chorus_core::ports::{AudioStream, MediaSource, StoreConnector, TaskStore};

const RATE: u32 = 8000;

const MANIFEST: &str = r#"
    [model]
    version = "BandEnergy_V1_Goertzel"
    sample_rate = 8000

    [[band]]
    label = "Low tone_Low"
    low_hz = 400
    high_hz = 600

    [[band]]
    label = "High tone_High"
    low_hz = 1800
    high_hz = 2200
"#;

const CATALOG: &str = r#"
    [[selector]]
    name = "all"
"#;

/// Alternating 3 s tones: low, high, low, ...
fn alternating(windows: usize) -> Vec<f32> {
    let per = 3 * RATE as usize;
    (0..windows * per)
        .map(|i| {
            let freq = if (i / per) % 2 == 0 { 500.0 } else { 2000.0 };
            0.5 * (std::f32::consts::TAU * freq * i as f32 / RATE as f32).sin()
        })
        .collect()
}

fn config() -> InferenceConfig {
    InferenceConfig {
        model_version: "BandEnergy_V1_Goertzel".into(),
        species_list: SpeciesListSource::Static(vec![]),
        flush: FlushParams { every_windows: 2 },
        ..InferenceConfig::default()
    }
}

fn subjects(names: &[&str]) -> String {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let at = Utc.with_ymd_and_hms(2023, 5, 1, 4, i as u32, 0).unwrap();
            format!(
                r#"{{"object_name": "{name}", "node_label": "node", "recorded_at": "{}", "duration_secs": 30.0, "sample_rate": {RATE}}}"#,
                at.to_rfc3339()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Registers `n` recordings, stores `config` and queues everything.
async fn seed(
    connector: &dyn StoreConnector,
    media: &MemoryMediaSource,
    n: usize,
    windows: usize,
    config: &InferenceConfig,
) -> ConfigId {
    let names: Vec<String> = (0..n).map(|i| format!("rec-{i}.wav")).collect();
    for name in &names {
        media.insert(name.as_str(), RATE, alternating(windows));
    }
    let admin = Admin::new(connector.connect().await.unwrap());
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    admin.import_subjects(&subjects(&refs)).await.unwrap();
    let id = admin.store_config(config, None).await.unwrap();
    let catalog = SelectorCatalog::parse(CATALOG).unwrap();
    admin.enqueue_batch(&id, &catalog, "all", None).await.unwrap();
    id
}

fn sqlite(dir: &tempfile::TempDir) -> SqliteConnector {
    SqliteConnector::new(dir.path().join("queue.db"))
}

fn settings(workers: usize, once: bool) -> RuntimeSettings {
    RuntimeSettings {
        workers,
        idle_interval: Duration::from_millis(10),
        exit_when_idle: once,
        ..RuntimeSettings::default()
    }
}

async fn run_once(connector: Arc<dyn StoreConnector>, media: Arc<dyn MediaSource>, workers: usize) {
    Runtime::new(
        settings(workers, true),
        connector,
        media,
        Arc::new(BandEnergyLoader::inline(MANIFEST)),
    )
    .run(CancellationToken::new())
    .await
    .unwrap();
}

fn sorted(mut results: Vec<Detection>) -> Vec<(u64, String)> {
    results.sort_by(|a, b| a.start_secs.total_cmp(&b.start_secs));
    results
        .into_iter()
        .map(|d| ((d.start_secs * 1000.0) as u64, d.class_label))
        .collect()
}

enum Backend {
    Memory,
    Sqlite,
}

fn connector(backend: Backend, dir: &tempfile::TempDir) -> Arc<dyn StoreConnector> {
    match backend {
        Backend::Memory => Arc::new(MemoryStore::new().connector()),
        Backend::Sqlite => Arc::new(sqlite(dir)),
    }
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claimants_never_share_a_task(#[case] backend: Backend) {
    let dir = tempfile::tempdir().unwrap();
    let connector = connector(backend, &dir);
    let media = MemoryMediaSource::new();
    seed(connector.as_ref(), &media, 40, 1, &config()).await;

    let mut claimers = Vec::new();
    for _ in 0..4 {
        let store = connector.connect().await.unwrap();
        claimers.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            while let Some(task) = store.claim_next().await.unwrap() {
                mine.push(task.task_id);
            }
            mine
        }));
    }
    let mut seen = HashSet::new();
    let mut total = 0;
    for claimer in claimers {
        for id in claimer.await.unwrap() {
            total += 1;
            assert!(seen.insert(id), "task {id} claimed twice");
        }
    }

    assert_eq!(total, 40);
    let counts = connector.connect().await.unwrap().counts_by_state().await.unwrap();
    assert_eq!(counts.in_progress, 40);
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn drain_leaves_no_task_in_progress(#[case] backend: Backend) {
    let dir = tempfile::tempdir().unwrap();
    let connector = connector(backend, &dir);
    let media = MemoryMediaSource::new();
    seed(connector.as_ref(), &media, 12, 20, &config()).await;

    let cancel = CancellationToken::new();
    let runtime = Runtime::new(
        settings(3, false),
        Arc::clone(&connector),
        Arc::new(media),
        Arc::new(BandEnergyLoader::inline(MANIFEST)),
    );
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        stopper.cancel();
    });
    runtime.run(cancel).await.unwrap();

    let store = connector.connect().await.unwrap();
    let tasks = store.list_tasks(None).await.unwrap();
    assert_eq!(tasks.len(), 12);
    for task in tasks {
        let results = store.list_results(task.id).await.unwrap();
        match task.state {
            TaskState::Done => assert_eq!(results.len(), 20),
            TaskState::Pending | TaskState::Failed => {
                assert!(results.is_empty(), "{:?} task kept results", task.state);
            }
            TaskState::InProgress => panic!("task {} left IN_PROGRESS", task.id),
        }
        if task.state == TaskState::Pending {
            assert!(task.pickup_on.is_none());
        }
    }
}

/// Fails every read past `fail_after` frames while `broken` is set.
#[derive(Clone)]
struct FlakySource {
    inner: MemoryMediaSource,
    broken: Arc<AtomicBool>,
    fail_after: u64,
}

struct FlakyStream {
    inner: Box<dyn AudioStream>,
    broken: bool,
    fail_after: u64,
    pos: u64,
}

#[async_trait]
impl MediaSource for FlakySource {
    async fn open_stream(&self, object_name: &str) -> Result<Box<dyn AudioStream>, MediaError> {
        Ok(Box::new(FlakyStream {
            inner: self.inner.open_stream(object_name).await?,
            broken: self.broken.load(Ordering::SeqCst),
            fail_after: self.fail_after,
            pos: 0,
        }))
    }
}

impl AudioStream for FlakyStream {
    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    fn total_frames(&self) -> u64 {
        self.inner.total_frames()
    }

    fn seek(&mut self, frame: u64) -> Result<(), MediaError> {
        self.pos = frame;
        self.inner.seek(frame)
    }

    fn read(&mut self, buf: &mut [f32]) -> Result<usize, MediaError> {
        if self.broken && self.pos >= self.fail_after {
            return Err(MediaError::Decode("truncated file".into()));
        }
        let n = self.inner.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rerun_after_failure_matches_a_clean_run() {
    let dir = tempfile::tempdir().unwrap();
    let connector: Arc<dyn StoreConnector> = Arc::new(sqlite(&dir));
    let media = MemoryMediaSource::new();
    seed(connector.as_ref(), &media, 1, 6, &config()).await;
    let flaky = FlakySource {
        inner: media.clone(),
        broken: Arc::new(AtomicBool::new(true)),
        // two flushes of two windows land before the failure
        fail_after: 4 * 3 * u64::from(RATE),
    };

    run_once(Arc::clone(&connector), Arc::new(flaky.clone()), 1).await;
    let store = connector.connect().await.unwrap();
    let failed = store.list_tasks(Some(TaskState::Failed)).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert!(store.list_results(failed[0].id).await.unwrap().is_empty());

    flaky.broken.store(false, Ordering::SeqCst);
    let admin = Admin::new(connector.connect().await.unwrap());
    assert_eq!(admin.reset_failed().await.unwrap(), 1);
    run_once(Arc::clone(&connector), Arc::new(flaky), 1).await;
    let rerun = sorted(store.list_results(failed[0].id).await.unwrap());

    let clean_store = MemoryStore::new();
    let clean_media = MemoryMediaSource::new();
    seed(&clean_store.connector(), &clean_media, 1, 6, &config()).await;
    run_once(Arc::new(clean_store.connector()), Arc::new(clean_media), 1).await;
    let done = clean_store.list_tasks(Some(TaskState::Done)).await.unwrap();
    let clean = sorted(clean_store.list_results(done[0].id).await.unwrap());

    assert_eq!(rerun.len(), 6);
    assert_eq!(rerun, clean);
}

#[tokio::test]
async fn only_allowed_confident_classes_persist() {
    let store = MemoryStore::new();
    let media = MemoryMediaSource::new();
    let config = InferenceConfig {
        min_confidence: 0.5,
        species_list: SpeciesListSource::Static(vec!["Low tone_Low".into()]),
        ..config()
    };
    seed(&store.connector(), &media, 2, 4, &config).await;

    run_once(Arc::new(store.connector()), Arc::new(media), 2).await;

    let mut results = Vec::new();
    for task in store.list_tasks(Some(TaskState::Done)).await.unwrap() {
        results.extend(store.list_results(task.id).await.unwrap());
    }
    // windows 0 and 2 of each recording carry the low tone
    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|d| d.class_label == "Low tone"));
    assert!(results.iter().all(|d| d.confidence >= 0.5));
    assert!(results.iter().all(|d| d.start_secs == 0.0 || d.start_secs == 6.0));
    assert!(results.iter().all(|d| d.freq_low_hz == Some(400.0)));
}

#[tokio::test]
async fn identical_configs_are_stored_once() {
    let dir = tempfile::tempdir().unwrap();
    let connector = sqlite(&dir);
    let admin = Admin::new(connector.connect().await.unwrap());

    let a = admin.store_config(&config(), Some("first")).await.unwrap();
    let b = admin.store_config(&config(), Some("second")).await.unwrap();
    let c = admin
        .store_config(&InferenceConfig { batch_size: 4, ..config() }, None)
        .await
        .unwrap();

    assert_eq!(a, b);
    assert_ne!(a, c);
    let conn = rusqlite::Connection::open(connector.path()).unwrap();
    let rows: i64 = conn
        .query_row("SELECT COUNT(*) FROM configs", [], |row| row.get(0))
        .unwrap();
    assert_eq!(rows, 2);
}

#[tokio::test]
async fn reset_queue_keeps_running_and_finished_work() {
    let dir = tempfile::tempdir().unwrap();
    let connector = sqlite(&dir);
    let media = MemoryMediaSource::new();
    seed(&connector, &media, 4, 1, &config()).await;
    let store = connector.connect().await.unwrap();
    let done = store.claim_next().await.unwrap().unwrap();
    store
        .insert_results(&[Detection {
            task_id: done.task_id,
            subject_id: done.subject_id,
            start_secs: 0.0,
            end_secs: 3.0,
            class_label: "Low tone".into(),
            confidence: 0.9,
            freq_low_hz: None,
            freq_high_hz: None,
        }])
        .await
        .unwrap();
    store
        .finalize(done.task_id, TaskOutcome::Done)
        .await
        .unwrap();
    let failed = store.claim_next().await.unwrap().unwrap();
    store
        .finalize(failed.task_id, TaskOutcome::Failed)
        .await
        .unwrap();
    let running = store.claim_next().await.unwrap().unwrap();

    let admin = Admin::new(connector.connect().await.unwrap());
    assert_eq!(admin.reset_queue().await.unwrap(), 2);

    let left: Vec<_> = store
        .list_tasks(None)
        .await
        .unwrap()
        .into_iter()
        .map(|t| (t.id, t.state))
        .collect();
    assert_eq!(left.len(), 2);
    assert!(left.contains(&(done.task_id, TaskState::Done)));
    assert!(left.contains(&(running.task_id, TaskState::InProgress)));
    assert_eq!(store.list_results(done.task_id).await.unwrap().len(), 1);

    // the removed subjects can be queued again
    let catalog = SelectorCatalog::parse(CATALOG).unwrap();
    let id = admin.store_config(&config(), None).await.unwrap();
    assert_eq!(admin.enqueue_batch(&id, &catalog, "all", None).await.unwrap(), 2);
}
