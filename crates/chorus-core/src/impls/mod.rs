//! Port implementations.
//!
//! - **MemoryStore**: single-process store for tests and dry runs
//! - **SqliteStore**: durable store shared by processes through one file
//! - **WavDirectorySource** / **MemoryMediaSource**: recordings
//! - **BandEnergyClassifier**: bundled reference model

pub mod band_energy;
pub mod media;
pub mod memory_store;
pub mod sqlite_store;
pub mod wav_source;

pub use self::band_energy::{BandEnergyClassifier, BandEnergyLoader};
pub use self::media::{MemoryMediaSource, MemoryStream};
pub use self::memory_store::{FaultPoint, MemoryConnector, MemoryStore};
pub use self::sqlite_store::{SqliteConnector, SqliteStore};
pub use self::wav_source::{WavDirectorySource, WavStream};
