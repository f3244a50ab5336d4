//! Ports: the seams between the queue runtime and the outside world.
//!
//! - `TaskStore` / `StoreConnector`: durable queue, configs, subjects, results
//! - `MediaSource` / `AudioStream`: recordings
//! - `Classifier` / `ModelLoader`: the model
//! - `Clock` / `IdGenerator`: time and ids

pub mod classifier;
pub mod clock;
pub mod id_generator;
pub mod media_source;
pub mod task_store;

pub use self::classifier::{Classifier, ModelLoader};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::media_source::{AudioStream, MediaSource};
pub use self::task_store::{StoreConnector, TaskStore};
