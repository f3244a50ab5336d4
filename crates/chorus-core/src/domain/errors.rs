//! Errors and their operational classification.
//!
//! Every error that can end a task maps to an [`ErrorKind`]; the worker routes
//! on the kind, never on the concrete variant.

use thiserror::Error;

use super::ids::{SubjectId, TaskId};

/// How the worker reacts to a failed task.
///
/// - Transient: store connectivity. Reconnect, give the task back to the queue.
/// - Stream / Inference / Configuration: fatal to the task. Delete partial
///   results, finalize FAILED, never retried automatically.
/// - Interrupted: shutdown reached the engine mid-task.
/// - LeaseLost: the task was taken out of IN_PROGRESS under the worker. Its
///   state and results now belong to someone else; leave both alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Stream,
    Inference,
    Configuration,
    Interrupted,
    LeaseLost,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection-level failure: retried with reconnect.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Constraint or state violation: fatal to the operation.
    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The task is no longer IN_PROGRESS; the caller's lease is gone.
    #[error("task {0} is no longer leased")]
    LeaseLost(TaskId),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("stream open failed for {object}: {reason}")]
    Open { object: String, reason: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("sample rate mismatch: stream {stream} Hz, model {model} Hz")]
    SampleRate { stream: u32, model: u32 },
}

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("model load failed: {0}")]
    Load(String),

    #[error("model {requested} not supported by loaded model {loaded}")]
    UnsupportedModel { requested: String, loaded: String },

    #[error("inference failed: {0}")]
    Inference(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("invalid config id: {0}")]
    InvalidId(String),

    #[error("unparsable model version: {0}")]
    ModelVersion(String),

    #[error("species list unavailable: {0}")]
    SpeciesList(String),

    #[error("invalid selector {name}: {reason}")]
    Selector { name: String, reason: String },
}

/// Everything that can end a single task.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Classifier(#[from] ClassifierError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("config {0} not found")]
    MissingConfig(String),

    #[error("subject {0} not found")]
    MissingSubject(SubjectId),

    #[error("task {0} interrupted by shutdown")]
    Interrupted(TaskId),
}

impl TaskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::Store(e) if e.is_transient() => ErrorKind::Transient,
            TaskError::Store(StoreError::LeaseLost(_)) => ErrorKind::LeaseLost,
            // a broken store row is as fatal to the task as a broken stream
            TaskError::Store(_) => ErrorKind::Stream,
            TaskError::Media(_) => ErrorKind::Stream,
            TaskError::Classifier(_) => ErrorKind::Inference,
            TaskError::Config(_) | TaskError::MissingConfig(_) | TaskError::MissingSubject(_) => {
                ErrorKind::Configuration
            }
            TaskError::Interrupted(_) => ErrorKind::Interrupted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use ulid::Ulid;

    #[rstest]
    #[case(TaskError::Store(StoreError::Unavailable("reset by peer".into())), ErrorKind::Transient)]
    #[case(TaskError::Store(StoreError::Integrity("dup".into())), ErrorKind::Stream)]
    #[case(TaskError::Store(StoreError::LeaseLost(TaskId::from_ulid(Ulid::nil()))), ErrorKind::LeaseLost)]
    #[case(TaskError::Media(MediaError::Decode("eof".into())), ErrorKind::Stream)]
    #[case(TaskError::Classifier(ClassifierError::Inference("nan".into())), ErrorKind::Inference)]
    #[case(TaskError::Config(ConfigError::ModelVersion("x".into())), ErrorKind::Configuration)]
    #[case(TaskError::MissingConfig("ab".into()), ErrorKind::Configuration)]
    #[case(TaskError::Interrupted(TaskId::from_ulid(Ulid::nil())), ErrorKind::Interrupted)]
    fn task_errors_map_to_kinds(#[case] err: TaskError, #[case] kind: ErrorKind) {
        assert_eq!(err.kind(), kind);
    }

    #[test]
    fn only_unavailable_is_transient() {
        assert!(StoreError::Unavailable("x".into()).is_transient());
        assert!(!StoreError::Integrity("x".into()).is_transient());
        assert!(!StoreError::NotFound("x".into()).is_transient());
        assert!(!StoreError::Backend("x".into()).is_transient());
        assert!(!StoreError::LeaseLost(TaskId::from_ulid(Ulid::nil())).is_transient());
    }
}
