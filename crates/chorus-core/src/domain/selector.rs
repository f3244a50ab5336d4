//! Named subject selectors for scheduling.
//!
//! A selector is a declarative filter over the subject registry. All set
//! fields must match; unset fields match everything. Selectors live in a TOML
//! catalog:
//!
//! ```toml
//! [[selector]]
//! name = "long-48k"
//! comment = "full-length 48 kHz recordings"
//! min_duration_secs = 3000
//! sample_rate = 48000
//! skip_with_results = true
//! ```

use std::path::Path;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::errors::ConfigError;
use super::subject::Subject;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubjectSelector {
    pub name: String,
    #[serde(default)]
    pub comment: Option<String>,
    /// Regex matched against the subject's node label.
    #[serde(default)]
    pub node_label: Option<String>,
    #[serde(default)]
    pub min_duration_secs: Option<f64>,
    #[serde(default)]
    pub sample_rate: Option<u32>,
    #[serde(default)]
    pub recorded_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_file_size: Option<u64>,
    /// Only subjects that have no results under any config.
    #[serde(default)]
    pub skip_with_results: bool,
}

impl SubjectSelector {
    /// Selects every subject.
    pub fn all(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn matcher(&self) -> Result<SubjectMatcher<'_>, ConfigError> {
        let node_label = self
            .node_label
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| ConfigError::Selector {
                name: self.name.clone(),
                reason: e.to_string(),
            })?;
        Ok(SubjectMatcher {
            selector: self,
            node_label,
        })
    }
}

/// A selector with its regex compiled.
#[derive(Debug)]
pub struct SubjectMatcher<'a> {
    selector: &'a SubjectSelector,
    node_label: Option<Regex>,
}

impl SubjectMatcher<'_> {
    pub fn matches(&self, subject: &Subject, has_results: bool) -> bool {
        let s = self.selector;
        if s.skip_with_results && has_results {
            return false;
        }
        if let Some(re) = &self.node_label
            && !re.is_match(&subject.node_label)
        {
            return false;
        }
        if s.min_duration_secs.is_some_and(|min| subject.duration_secs < min) {
            return false;
        }
        if s.sample_rate.is_some_and(|rate| subject.sample_rate != rate) {
            return false;
        }
        if s.recorded_after.is_some_and(|after| subject.recorded_at <= after) {
            return false;
        }
        if s.max_file_size.is_some_and(|max| subject.file_size > max) {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectorCatalog {
    #[serde(default, rename = "selector")]
    pub selectors: Vec<SubjectSelector>,
}

impl SelectorCatalog {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let catalog: Self = toml::from_str(text).map_err(|e| ConfigError::Selector {
            name: "<catalog>".into(),
            reason: e.to_string(),
        })?;
        for selector in &catalog.selectors {
            selector.matcher()?;
        }
        Ok(catalog)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Selector {
            name: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::parse(&text)
    }

    pub fn get(&self, name: &str) -> Option<&SubjectSelector> {
        self.selectors.iter().find(|s| s.name == name)
    }
}
