//! Domain model: ids, task lifecycle, configs, subjects, detections, errors.

pub mod config;
pub mod detection;
pub mod errors;
pub mod ids;
pub mod selector;
pub mod state;
pub mod subject;
pub mod task;

pub use config::{
    AutoSpeciesList, ConfigId, FlushParams, InferenceConfig, ModelVersion, PaddingParams,
    SigmoidParams, SpeciesListSource, StoredConfig, WindowParams,
};
pub use detection::{Detection, scientific_name};
pub use errors::{ClassifierError, ConfigError, ErrorKind, MediaError, StoreError, TaskError};
pub use ids::{SubjectId, TaskId};
pub use selector::{SelectorCatalog, SubjectMatcher, SubjectSelector};
pub use state::{QueueCounts, TaskOutcome, TaskState};
pub use subject::{DeploymentContext, GeoPoint, Subject, season_week};
pub use task::{ClaimedTask, TaskRecord};
