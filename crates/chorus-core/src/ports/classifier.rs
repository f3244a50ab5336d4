//! Classifier port: the model a worker loads once and reuses for every task.

use async_trait::async_trait;

use crate::domain::{ClassifierError, ModelVersion};

#[async_trait]
pub trait Classifier: Send {
    /// Class labels, in score order.
    fn labels(&self) -> &[String];

    /// Sample rate the model expects its windows in.
    fn sample_rate(&self) -> u32;

    /// Frequency band of a class, when the model knows it.
    fn frequency_bounds(&self, _label: &str) -> Option<(f32, f32)> {
        None
    }

    /// Configure the loaded model for a task's model version. Fails when the
    /// loaded model cannot serve that version.
    fn prepare(&mut self, model: &ModelVersion) -> Result<(), ClassifierError>;

    /// Raw scores, one row per window, one column per label.
    async fn infer(&mut self, batch: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, ClassifierError>;

    /// Occurrence probability per label at a location; `week` None means
    /// year-round.
    async fn species_occurrence(
        &mut self,
        lat: f64,
        lon: f64,
        week: Option<u32>,
    ) -> Result<Vec<(String, f32)>, ClassifierError>;
}

#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self) -> Result<Box<dyn Classifier>, ClassifierError>;
}
