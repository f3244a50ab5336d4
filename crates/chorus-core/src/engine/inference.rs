//! The streaming engine: windows -> batches -> scores -> filtered detections
//! -> periodic flushes.
//!
//! Memory stays bounded by one batch of windows plus the detections of at
//! most `flush_every_windows` windows, whatever the recording length.

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::params::TaskParams;
use super::window::{Window, WindowReader};
use crate::domain::{scientific_name, ClassifierError, Detection, MediaError, TaskError};
use crate::ports::{AudioStream, Classifier, TaskStore};

/// What one engine run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineReport {
    pub windows: usize,
    pub batches: usize,
    pub flushes: usize,
    pub detections: usize,
    /// Largest number of windows whose detections sat unflushed at once.
    pub peak_unflushed_windows: usize,
}

pub struct InferenceEngine<'a> {
    store: &'a dyn TaskStore,
    classifier: &'a mut dyn Classifier,
    cancel: &'a CancellationToken,
}

impl<'a> InferenceEngine<'a> {
    pub fn new(
        store: &'a dyn TaskStore,
        classifier: &'a mut dyn Classifier,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            store,
            classifier,
            cancel,
        }
    }

    /// Run one task over an opened stream. The stream is dropped on every
    /// exit path; partial results already flushed stay for the caller to
    /// clean up.
    pub async fn run(
        &mut self,
        params: &TaskParams,
        stream: Box<dyn AudioStream>,
    ) -> Result<EngineReport, TaskError> {
        let model_rate = self.classifier.sample_rate();
        if stream.sample_rate() != model_rate {
            return Err(MediaError::SampleRate {
                stream: stream.sample_rate(),
                model: model_rate,
            }
            .into());
        }

        let mut reader = WindowReader::new(stream, &params.window, &params.padding);
        debug!(
            windows = reader.plan().count,
            window_frames = reader.plan().length_frames,
            "stream opened"
        );

        let mut report = EngineReport::default();
        let mut pending: Vec<Detection> = Vec::new();
        let mut unflushed_windows = 0;

        while !reader.is_done() {
            if self.cancel.is_cancelled() {
                return Err(TaskError::Interrupted(params.task_id));
            }

            // a batch never crosses a flush boundary
            let n = params
                .batch_size
                .min(params.flush_every_windows - unflushed_windows);
            let (back, windows) = read_batch(reader, n).await?;
            reader = back;
            let windows = windows?;

            self.score(params, &windows, &mut pending).await?;

            report.windows += windows.len();
            report.batches += 1;
            unflushed_windows += windows.len();
            report.peak_unflushed_windows = report.peak_unflushed_windows.max(unflushed_windows);

            if unflushed_windows >= params.flush_every_windows {
                self.flush(&mut pending, &mut report).await?;
                unflushed_windows = 0;
            }
        }

        if !pending.is_empty() {
            self.flush(&mut pending, &mut report).await?;
        }
        Ok(report)
    }

    async fn score(
        &mut self,
        params: &TaskParams,
        windows: &[Window],
        out: &mut Vec<Detection>,
    ) -> Result<(), TaskError> {
        let batch: Vec<Vec<f32>> = windows.iter().map(|w| w.samples.clone()).collect();
        let scores = self.classifier.infer(&batch).await?;
        if scores.len() != windows.len() {
            return Err(ClassifierError::Inference(format!(
                "expected {} score rows, got {}",
                windows.len(),
                scores.len()
            ))
            .into());
        }

        let labels = self.classifier.labels();
        for (window, row) in windows.iter().zip(&scores) {
            if row.len() != labels.len() {
                return Err(ClassifierError::Inference(format!(
                    "expected {} class scores, got {}",
                    labels.len(),
                    row.len()
                ))
                .into());
            }
            for (label, &raw) in labels.iter().zip(row) {
                let confidence = params.confidence(raw);
                if !params.keeps(label, confidence) {
                    continue;
                }
                let bounds = self.classifier.frequency_bounds(label);
                out.push(Detection {
                    task_id: params.task_id,
                    subject_id: params.subject_id,
                    start_secs: window.start_secs,
                    end_secs: window.end_secs,
                    class_label: scientific_name(label).to_string(),
                    confidence,
                    freq_low_hz: bounds.map(|b| b.0),
                    freq_high_hz: bounds.map(|b| b.1),
                });
            }
        }
        Ok(())
    }

    async fn flush(
        &mut self,
        pending: &mut Vec<Detection>,
        report: &mut EngineReport,
    ) -> Result<(), TaskError> {
        self.store.insert_results(pending).await?;
        report.flushes += 1;
        report.detections += pending.len();
        debug!(detections = pending.len(), "flushed");
        pending.clear();
        Ok(())
    }
}

/// Stream reads block, so the reader travels to the blocking pool and back.
async fn read_batch(
    mut reader: WindowReader,
    n: usize,
) -> Result<(WindowReader, Result<Vec<Window>, MediaError>), TaskError> {
    tokio::task::spawn_blocking(move || {
        let windows = reader.read_windows(n);
        (reader, windows)
    })
    .await
    .map_err(|e| TaskError::from(MediaError::Decode(format!("window reader task failed: {e}"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{InferenceConfig, ModelVersion, Subject, SubjectId, SubjectSelector};
    use crate::engine::params::AllowList;
    use crate::impls::media::MemoryStream;
    use crate::impls::memory_store::MemoryStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use ulid::Ulid;

    const RATE: u32 = 100;

    /// Same raw scores for every window; counts calls.
    struct ConstClassifier {
        labels: Vec<String>,
        scores: Vec<f32>,
        calls: usize,
    }

    impl ConstClassifier {
        fn new(scores: &[(&str, f32)]) -> Self {
            Self {
                labels: scores.iter().map(|(l, _)| l.to_string()).collect(),
                scores: scores.iter().map(|(_, s)| *s).collect(),
                calls: 0,
            }
        }
    }

    #[async_trait]
    impl Classifier for ConstClassifier {
        fn labels(&self) -> &[String] {
            &self.labels
        }

        fn sample_rate(&self) -> u32 {
            RATE
        }

        fn prepare(&mut self, _model: &ModelVersion) -> Result<(), ClassifierError> {
            Ok(())
        }

        async fn infer(&mut self, batch: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, ClassifierError> {
            self.calls += 1;
            Ok(batch.iter().map(|_| self.scores.clone()).collect())
        }

        async fn species_occurrence(
            &mut self,
            _lat: f64,
            _lon: f64,
            _week: Option<u32>,
        ) -> Result<Vec<(String, f32)>, ClassifierError> {
            Ok(self.labels.iter().map(|l| (l.clone(), 1.0)).collect())
        }
    }

    /// Queue and lease one task in `store`, then build its parameters.
    async fn leased(
        store: &MemoryStore,
        batch_size: usize,
        flush_every: usize,
        allow: AllowList,
    ) -> TaskParams {
        let mut config = InferenceConfig::default();
        config.batch_size = batch_size;
        config.flush.every_windows = flush_every;
        config.sigmoid = None;
        store
            .register_subject(&Subject {
                id: SubjectId::from_ulid(Ulid::new()),
                object_name: "engine.wav".into(),
                node_label: "node".into(),
                recorded_at: Utc::now(),
                duration_secs: 100.0,
                sample_rate: RATE,
                file_size: 1,
                location: None,
            })
            .await
            .unwrap();
        let config_id = store.store_config(&config, None).await.unwrap();
        store
            .enqueue_batch(&config_id, &SubjectSelector::all("all"), None)
            .await
            .unwrap();
        let task = store.claim_next().await.unwrap().unwrap();
        TaskParams::new(&task, &config, allow)
    }

    fn stream(secs: u64) -> Box<dyn AudioStream> {
        Box::new(MemoryStream::new(RATE, vec![0.1; (secs * u64::from(RATE)) as usize]))
    }

    #[tokio::test]
    async fn filters_by_confidence_and_allow_list() {
        let store = MemoryStore::new();
        let mut classifier = ConstClassifier::new(&[
            ("Turdus merula_Eurasian Blackbird", 0.9),
            ("Erithacus rubecula_European Robin", 0.8),
            ("Parus major_Great Tit", 0.05),
        ]);
        let allow: AllowList = ["Turdus merula_Eurasian Blackbird", "Parus major_Great Tit"]
            .into_iter()
            .collect();
        let params = leased(&store, 2, 1200, allow).await;
        let cancel = CancellationToken::new();

        let report = InferenceEngine::new(&store, &mut classifier, &cancel)
            .run(&params, stream(7))
            .await
            .unwrap();

        assert_eq!(report.windows, 3);
        assert_eq!(report.batches, 2);
        assert_eq!(report.flushes, 1);
        assert_eq!(report.detections, 3);

        let results = store.list_results(params.task_id).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|d| d.class_label == "Turdus merula"));
        let starts: Vec<f64> = results.iter().map(|d| d.start_secs).collect();
        assert_eq!(starts, vec![0.0, 3.0, 6.0]);
        assert_eq!(results[2].end_secs, 9.0);
    }

    #[tokio::test]
    async fn unflushed_windows_never_exceed_flush_interval() {
        let store = MemoryStore::new();
        let mut classifier = ConstClassifier::new(&[("A_a", 0.9)]);
        // 100 s at 3 s windows = 34 windows, batches of 8, flush every 5
        let params = leased(&store, 8, 5, AllowList::unrestricted()).await;
        let cancel = CancellationToken::new();

        let report = InferenceEngine::new(&store, &mut classifier, &cancel)
            .run(&params, stream(100))
            .await
            .unwrap();

        assert_eq!(report.windows, 34);
        assert_eq!(report.peak_unflushed_windows, 5);
        assert_eq!(report.flushes, 7);
        assert_eq!(report.detections, 34);
        assert_eq!(classifier.calls, report.batches);
    }

    #[tokio::test]
    async fn sample_rate_mismatch_is_a_stream_error() {
        let store = MemoryStore::new();
        let mut classifier = ConstClassifier::new(&[("A_a", 0.9)]);
        let params = leased(&store, 1, 1200, AllowList::unrestricted()).await;
        let cancel = CancellationToken::new();

        let err = InferenceEngine::new(&store, &mut classifier, &cancel)
            .run(&params, Box::new(MemoryStream::new(48_000, vec![0.0; 10])))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::domain::ErrorKind::Stream);
        assert_eq!(classifier.calls, 0);
    }

    #[tokio::test]
    async fn cancelled_token_interrupts_before_next_batch() {
        let store = MemoryStore::new();
        let mut classifier = ConstClassifier::new(&[("A_a", 0.9)]);
        let params = leased(&store, 1, 1200, AllowList::unrestricted()).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = InferenceEngine::new(&store, &mut classifier, &cancel)
            .run(&params, stream(7))
            .await
            .unwrap_err();

        assert!(matches!(err, TaskError::Interrupted(id) if id == params.task_id));
        assert!(store.list_results(params.task_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sigmoid_is_applied_before_the_threshold() {
        let store = MemoryStore::new();
        // sigmoid(-5) ~ 0.0067: dropped; sigmoid(0) = 0.5: kept
        let mut classifier = ConstClassifier::new(&[("Low_l", -5.0), ("Mid_m", 0.0)]);
        let mut params = leased(&store, 4, 1200, AllowList::unrestricted()).await;
        params.sigmoid = Some(crate::domain::SigmoidParams { sensitivity: 1.0 });
        let cancel = CancellationToken::new();

        InferenceEngine::new(&store, &mut classifier, &cancel)
            .run(&params, stream(3))
            .await
            .unwrap();

        let results = store.list_results(params.task_id).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].class_label, "Mid");
        assert!((results[0].confidence - 0.5).abs() < 1e-6);
    }
}
