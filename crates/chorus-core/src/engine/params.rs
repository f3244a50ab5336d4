//! Per-task parameters and score post-processing.

use std::collections::HashSet;

use crate::domain::{
    ClaimedTask, InferenceConfig, PaddingParams, SigmoidParams, SubjectId, TaskId, WindowParams,
};

/// Class allow-list. Empty means no restriction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllowList(HashSet<String>);

impl AllowList {
    pub fn unrestricted() -> Self {
        Self::default()
    }

    pub fn is_unrestricted(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Matched against the full model label.
    pub fn allows(&self, label: &str) -> bool {
        self.0.is_empty() || self.0.contains(label)
    }
}

impl<S: Into<String>> FromIterator<S> for AllowList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// `1 / (1 + exp(-sensitivity * clamp(x, -15, 15)))`
pub fn flat_sigmoid(x: f32, sensitivity: f32) -> f32 {
    1.0 / (1.0 + (-sensitivity * x.clamp(-15.0, 15.0)).exp())
}

/// Everything the engine needs to run one task. Built fresh per task; the
/// loaded model itself carries no task state.
#[derive(Debug, Clone)]
pub struct TaskParams {
    pub task_id: TaskId,
    pub subject_id: SubjectId,
    pub window: WindowParams,
    pub batch_size: usize,
    pub min_confidence: f32,
    pub sigmoid: Option<SigmoidParams>,
    pub allow_list: AllowList,
    pub padding: PaddingParams,
    pub flush_every_windows: usize,
}

impl TaskParams {
    pub fn new(task: &ClaimedTask, config: &InferenceConfig, allow_list: AllowList) -> Self {
        Self {
            task_id: task.task_id,
            subject_id: task.subject_id,
            window: config.window.clone(),
            batch_size: config.batch_size.max(1),
            min_confidence: config.min_confidence,
            sigmoid: config.sigmoid.clone(),
            allow_list,
            padding: config.padding.clone(),
            flush_every_windows: config.flush.every_windows.max(1),
        }
    }

    pub fn confidence(&self, raw: f32) -> f32 {
        match &self.sigmoid {
            Some(s) => flat_sigmoid(raw, s.sensitivity),
            None => raw,
        }
    }

    /// Keep a class score only if it clears the threshold and the allow-list.
    pub fn keeps(&self, label: &str, confidence: f32) -> bool {
        confidence >= self.min_confidence && self.allow_list.allows(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0.0, 1.0, 0.5)]
    #[case(100.0, 1.0, 1.0 / (1.0 + (-15.0_f32).exp()))]
    #[case(-100.0, 1.0, 1.0 / (1.0 + 15.0_f32.exp()))]
    #[case(2.0, 0.5, 1.0 / (1.0 + (-1.0_f32).exp()))]
    fn sigmoid_clamps_and_scales(#[case] x: f32, #[case] s: f32, #[case] expected: f32) {
        assert!((flat_sigmoid(x, s) - expected).abs() < 1e-6);
    }

    #[test]
    fn empty_allow_list_allows_everything() {
        let list = AllowList::unrestricted();
        assert!(list.allows("Turdus merula_Eurasian Blackbird"));

        let list: AllowList = ["Turdus merula_Eurasian Blackbird"].into_iter().collect();
        assert!(list.allows("Turdus merula_Eurasian Blackbird"));
        assert!(!list.allows("Turdus merula"));
        assert!(!list.allows("Erithacus rubecula_European Robin"));
    }

    #[test]
    fn threshold_is_inclusive() {
        let task = ClaimedTask {
            task_id: TaskId::from_ulid(ulid::Ulid::new()),
            subject_id: SubjectId::from_ulid(ulid::Ulid::new()),
            config_id: crate::domain::ConfigId::for_content(b"x"),
        };
        let params = TaskParams::new(&task, &InferenceConfig::default(), AllowList::unrestricted());

        assert!(params.keeps("a", 0.1));
        assert!(!params.keeps("a", 0.099));
    }
}
