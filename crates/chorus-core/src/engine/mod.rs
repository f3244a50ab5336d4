//! Streaming windowed inference.

pub mod inference;
pub mod params;
pub mod species;
pub mod window;

pub use inference::{EngineReport, InferenceEngine};
pub use params::{AllowList, TaskParams, flat_sigmoid};
pub use species::resolve_allow_list;
pub use window::{Window, WindowPlan, WindowReader, pad_with_noise};
