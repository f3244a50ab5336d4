//! Inference configuration: the immutable, content-addressed parameter blob
//! every task references.
//!
//! # Content addressing
//! A config's id is the SHA-256 of its canonical JSON encoding. Storing the
//! same content twice therefore yields the same id, and the stores only need a
//! uniqueness constraint on the content to stay duplicate free.

use std::fmt;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::errors::ConfigError;

/// Content-derived config identifier (lowercase hex SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigId(String);

impl ConfigId {
    pub fn for_content(canonical: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(canonical)))
    }

    pub fn from_hex(value: impl Into<String>) -> Result<Self, ConfigError> {
        let value = value.into().to_ascii_lowercase();
        if value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(Self(value))
        } else {
            Err(ConfigError::InvalidId(value))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex digits, enough to tell configs apart in logs.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for ConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for ConfigId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowParams {
    pub length_secs: f64,
    pub overlap_secs: f64,
}

impl WindowParams {
    /// Distance between two successive window starts.
    pub fn hop_secs(&self) -> f64 {
        self.length_secs - self.overlap_secs
    }
}

/// Noise used to pad the final, short window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaddingParams {
    pub seed: u64,
    pub gain: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigmoidParams {
    pub sensitivity: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlushParams {
    /// Flush accumulated detections after this many windows.
    pub every_windows: usize,
}

/// Location + season species prediction.
///
/// `lat`/`lon` override the subject's deployment location when set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoSpeciesList {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    /// Use the recording's week of year; otherwise a year-round list.
    pub auto_season: bool,
    pub loc_filter_thresh: f32,
}

/// Where the class allow-list comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeciesListSource {
    /// One label per line.
    File(PathBuf),
    Static(Vec<String>),
    Auto(AutoSpeciesList),
}

/// The config blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceConfig {
    pub model_version: String,
    pub window: WindowParams,
    pub batch_size: usize,
    pub min_confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sigmoid: Option<SigmoidParams>,
    pub species_list: SpeciesListSource,
    pub padding: PaddingParams,
    pub flush: FlushParams,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            model_version: "BirdNET_GLOBAL_2K_V2.1_Model_FP32".to_string(),
            window: WindowParams {
                length_secs: 3.0,
                overlap_secs: 0.0,
            },
            batch_size: 1,
            min_confidence: 0.1,
            sigmoid: Some(SigmoidParams { sensitivity: 1.0 }),
            species_list: SpeciesListSource::Auto(AutoSpeciesList {
                lat: Some(47.53774126535403),
                lon: Some(7.613764385606163),
                auto_season: false,
                loc_filter_thresh: 0.03,
            }),
            padding: PaddingParams {
                seed: 42,
                gain: 0.23,
            },
            flush: FlushParams {
                every_windows: 1200,
            },
        }
    }
}

impl InferenceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.window;
        if !(w.length_secs.is_finite() && w.length_secs > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "window length must be positive, got {}",
                w.length_secs
            )));
        }
        if !(w.overlap_secs >= 0.0 && w.overlap_secs < w.length_secs) {
            return Err(ConfigError::Invalid(format!(
                "overlap must be in [0, {}), got {}",
                w.length_secs, w.overlap_secs
            )));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(ConfigError::Invalid(format!(
                "min_confidence must be in [0, 1], got {}",
                self.min_confidence
            )));
        }
        if let Some(sigmoid) = &self.sigmoid
            && !(sigmoid.sensitivity.is_finite() && sigmoid.sensitivity > 0.0)
        {
            return Err(ConfigError::Invalid(format!(
                "sigmoid sensitivity must be positive, got {}",
                sigmoid.sensitivity
            )));
        }
        if !(self.padding.gain.is_finite() && self.padding.gain >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "padding gain must be non-negative, got {}",
                self.padding.gain
            )));
        }
        if self.flush.every_windows == 0 {
            return Err(ConfigError::Invalid(
                "flush.every_windows must be at least 1".into(),
            ));
        }
        ModelVersion::parse(&self.model_version)?;
        Ok(())
    }

    /// Canonical encoding used for content addressing and storage.
    pub fn canonical_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn content_id(&self) -> Result<ConfigId, ConfigError> {
        Ok(ConfigId::for_content(self.canonical_json()?.as_bytes()))
    }

    pub fn model(&self) -> Result<ModelVersion, ConfigError> {
        ModelVersion::parse(&self.model_version)
    }
}

/// A config as stored: id, content and the operator's comment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredConfig {
    pub id: ConfigId,
    pub config: InferenceConfig,
    pub comment: Option<String>,
}

static MODEL_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+)_(V[0-9]+(?:\.[0-9]+)*)_(.+)$").expect("model version pattern is valid")
});

/// Parsed model version tag, e.g. `BirdNET_GLOBAL_2K_V2.1_Model_FP32`:
/// family `BirdNET_GLOBAL_2K`, version `V2.1`, variant `Model_FP32`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelVersion {
    pub family: String,
    pub version: String,
    pub variant: String,
}

impl ModelVersion {
    pub fn parse(tag: &str) -> Result<Self, ConfigError> {
        let caps = MODEL_VERSION
            .captures(tag)
            .ok_or_else(|| ConfigError::ModelVersion(tag.to_string()))?;
        Ok(Self {
            family: caps[1].to_string(),
            version: caps[2].to_string(),
            variant: caps[3].to_string(),
        })
    }

    /// Numeric part of the version (`V2.1` -> 2.1).
    pub fn number(&self) -> Option<f64> {
        self.version[1..].parse().ok()
    }

    pub fn tag(&self) -> String {
        format!("{}_{}_{}", self.family, self.version, self.variant)
    }
}

impl fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}
