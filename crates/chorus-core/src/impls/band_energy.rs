//! Reference classifier: per-label frequency bands scored by Goertzel energy.
//!
//! The manifest is TOML:
//!
//! ```toml
//! [model]
//! version = "BandEnergy_V1_Goertzel"
//! sample_rate = 48000
//!
//! [[band]]
//! label = "Strix aluco_Tawny Owl"
//! low_hz = 700
//! high_hz = 1200
//! occurrence = 0.4        # optional, default 1.0
//! weeks = [1, 20]         # optional season, inclusive
//! ```
//!
//! The raw score of a band is `20 * r - 10`, where `r` in `[0, 1]` is the
//! share of the window's energy at the band's strongest probe frequency. A
//! pure tone inside the band scores about 10, silence about -10.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;

use crate::domain::{ClassifierError, ModelVersion};
use crate::ports::{Classifier, ModelLoader};

const PROBES_PER_BAND: usize = 5;

#[derive(Debug, Clone, Deserialize)]
struct Manifest {
    model: ModelSection,
    #[serde(default, rename = "band")]
    bands: Vec<Band>,
}

#[derive(Debug, Clone, Deserialize)]
struct ModelSection {
    version: String,
    sample_rate: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct Band {
    label: String,
    low_hz: f32,
    high_hz: f32,
    #[serde(default = "default_occurrence")]
    occurrence: f32,
    #[serde(default)]
    weeks: Option<(u32, u32)>,
}

fn default_occurrence() -> f32 {
    1.0
}

#[derive(Debug, Clone)]
pub struct BandEnergyClassifier {
    model: ModelVersion,
    sample_rate: u32,
    labels: Vec<String>,
    bands: Vec<Band>,
    /// Goertzel coefficients, `PROBES_PER_BAND` per band.
    coeffs: Vec<[f32; PROBES_PER_BAND]>,
}

impl BandEnergyClassifier {
    pub fn from_manifest_str(text: &str) -> Result<Self, ClassifierError> {
        let manifest: Manifest =
            toml::from_str(text).map_err(|e| ClassifierError::Load(e.to_string()))?;
        let model = ModelVersion::parse(&manifest.model.version)
            .map_err(|e| ClassifierError::Load(e.to_string()))?;
        let rate = manifest.model.sample_rate;
        if rate == 0 {
            return Err(ClassifierError::Load("sample_rate must be positive".into()));
        }
        let nyquist = rate as f32 / 2.0;
        let mut coeffs = Vec::with_capacity(manifest.bands.len());
        for band in &manifest.bands {
            if !(0.0 < band.low_hz && band.low_hz <= band.high_hz && band.high_hz < nyquist) {
                return Err(ClassifierError::Load(format!(
                    "band {} must satisfy 0 < low <= high < {nyquist}",
                    band.label
                )));
            }
            let mut c = [0.0; PROBES_PER_BAND];
            for (i, slot) in c.iter_mut().enumerate() {
                let t = i as f32 / (PROBES_PER_BAND - 1) as f32;
                let freq = band.low_hz + t * (band.high_hz - band.low_hz);
                *slot = 2.0 * (std::f32::consts::TAU * freq / rate as f32).cos();
            }
            coeffs.push(c);
        }
        Ok(Self {
            model,
            sample_rate: rate,
            labels: manifest.bands.iter().map(|b| b.label.clone()).collect(),
            bands: manifest.bands,
            coeffs,
        })
    }

    pub fn model(&self) -> &ModelVersion {
        &self.model
    }

    fn score_window(&self, samples: &[f32]) -> Vec<f32> {
        let energy: f32 = samples.iter().map(|s| s * s).sum();
        let norm = energy * samples.len() as f32 / 2.0;
        self.coeffs
            .iter()
            .map(|probes| {
                let share = if norm > f32::EPSILON {
                    probes
                        .iter()
                        .map(|&c| goertzel_power(samples, c) / norm)
                        .fold(0.0_f32, f32::max)
                        .min(1.0)
                } else {
                    0.0
                };
                20.0 * share - 10.0
            })
            .collect()
    }
}

fn goertzel_power(samples: &[f32], coeff: f32) -> f32 {
    let (mut s1, mut s2) = (0.0_f32, 0.0_f32);
    for &x in samples {
        let s0 = x + coeff * s1 - s2;
        s2 = s1;
        s1 = s0;
    }
    s1 * s1 + s2 * s2 - coeff * s1 * s2
}

#[async_trait]
impl Classifier for BandEnergyClassifier {
    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn frequency_bounds(&self, label: &str) -> Option<(f32, f32)> {
        self.bands
            .iter()
            .find(|b| b.label == label)
            .map(|b| (b.low_hz, b.high_hz))
    }

    fn prepare(&mut self, model: &ModelVersion) -> Result<(), ClassifierError> {
        if model.family != self.model.family {
            return Err(ClassifierError::UnsupportedModel {
                requested: model.tag(),
                loaded: self.model.tag(),
            });
        }
        Ok(())
    }

    async fn infer(&mut self, batch: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, ClassifierError> {
        Ok(batch.iter().map(|w| self.score_window(w)).collect())
    }

    async fn species_occurrence(
        &mut self,
        _lat: f64,
        _lon: f64,
        week: Option<u32>,
    ) -> Result<Vec<(String, f32)>, ClassifierError> {
        Ok(self
            .bands
            .iter()
            .map(|b| {
                let in_season = match (week, b.weeks) {
                    (Some(w), Some((from, to))) if from <= to => (from..=to).contains(&w),
                    (Some(w), Some((from, to))) => w >= from || w <= to,
                    _ => true,
                };
                (b.label.clone(), if in_season { b.occurrence } else { 0.0 })
            })
            .collect())
    }
}

#[derive(Debug, Clone)]
enum ManifestSource {
    Path(PathBuf),
    Inline(String),
}

/// Loads the manifest once per worker.
#[derive(Debug, Clone)]
pub struct BandEnergyLoader {
    source: ManifestSource,
}

impl BandEnergyLoader {
    pub fn new(manifest: impl Into<PathBuf>) -> Self {
        Self {
            source: ManifestSource::Path(manifest.into()),
        }
    }

    /// Loader over manifest text already in memory.
    pub fn inline(text: impl Into<String>) -> Self {
        Self {
            source: ManifestSource::Inline(text.into()),
        }
    }
}

#[async_trait]
impl ModelLoader for BandEnergyLoader {
    async fn load(&self) -> Result<Box<dyn Classifier>, ClassifierError> {
        let classifier = match &self.source {
            ManifestSource::Path(path) => {
                let text = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| ClassifierError::Load(format!("{}: {e}", path.display())))?;
                BandEnergyClassifier::from_manifest_str(&text)?
            }
            ManifestSource::Inline(text) => BandEnergyClassifier::from_manifest_str(text)?,
        };
        Ok(Box::new(classifier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
        occurrence = 0.2
        weeks = [40, 8]
    "#;

    fn tone(freq: f32, secs: f32) -> Vec<f32> {
        let n = (8000.0 * secs) as usize;
        (0..n)
            .map(|i| 0.5 * (std::f32::consts::TAU * freq * i as f32 / 8000.0).sin())
            .collect()
    }

    #[tokio::test]
    async fn tone_scores_high_only_in_its_band() {
        let mut c = BandEnergyClassifier::from_manifest_str(MANIFEST).unwrap();
        let scores = c.infer(&[tone(500.0, 1.0), vec![0.0; 8000]]).await.unwrap();

        assert!(scores[0][0] > 8.0, "in-band score {}", scores[0][0]);
        assert!(scores[0][1] < -8.0, "out-of-band score {}", scores[0][1]);
        assert_eq!(scores[1], vec![-10.0, -10.0]);
    }

    #[test]
    fn prepare_rejects_other_model_families() {
        let mut c = BandEnergyClassifier::from_manifest_str(MANIFEST).unwrap();
        c.prepare(&ModelVersion::parse("BandEnergy_V2_Goertzel").unwrap())
            .unwrap();
        let err = c
            .prepare(&ModelVersion::parse("BirdNET_GLOBAL_2K_V2.1_Model_FP32").unwrap())
            .unwrap_err();
        assert!(matches!(err, ClassifierError::UnsupportedModel { .. }));
    }

    #[tokio::test]
    async fn occurrence_follows_wrapping_season() {
        let mut c = BandEnergyClassifier::from_manifest_str(MANIFEST).unwrap();

        let summer = c.species_occurrence(0.0, 0.0, Some(25)).await.unwrap();
        assert_eq!(summer[1].1, 0.0);
        let winter = c.species_occurrence(0.0, 0.0, Some(2)).await.unwrap();
        assert_eq!(winter[1].1, 0.2);
        let year = c.species_occurrence(0.0, 0.0, None).await.unwrap();
        assert_eq!(year[0].1, 1.0);
        assert_eq!(year[1].1, 0.2);
    }

    #[test]
    fn bands_above_nyquist_are_rejected() {
        let err = BandEnergyClassifier::from_manifest_str(
            "[model]\nversion = \"BandEnergy_V1_G\"\nsample_rate = 8000\n\n[[band]]\nlabel = \"x\"\nlow_hz = 100\nhigh_hz = 5000\n",
        )
        .unwrap_err();
        assert!(matches!(err, ClassifierError::Load(_)));
    }
}
