use serde::{Deserialize, Serialize};

use super::ids::{SubjectId, TaskId};

/// One persisted detection. Owned by exactly one task; never updated, only
/// bulk-deleted when the task is reset or fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub task_id: TaskId,
    pub subject_id: SubjectId,
    /// Offset of the window start from the beginning of the recording.
    pub start_secs: f64,
    pub end_secs: f64,
    pub class_label: String,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freq_low_hz: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freq_high_hz: Option<f32>,
}

/// Persisted class label: the scientific name before the first `_`
/// (`Turdus merula_Eurasian Blackbird` -> `Turdus merula`).
pub fn scientific_name(label: &str) -> &str {
    label.split('_').next().unwrap_or(label)
}
