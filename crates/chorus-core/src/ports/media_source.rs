//! Media source port: object name -> seekable sample stream.

use async_trait::async_trait;

use crate::domain::MediaError;

#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Fails with [`MediaError::Open`] when the object cannot be opened.
    async fn open_stream(&self, object_name: &str) -> Result<Box<dyn AudioStream>, MediaError>;
}

/// Mono f32 samples in `[-1, 1]`, addressed by frame.
///
/// Reads are blocking; the engine drives them from `spawn_blocking`.
pub trait AudioStream: Send {
    fn sample_rate(&self) -> u32;

    fn total_frames(&self) -> u64;

    fn duration_secs(&self) -> f64 {
        if self.sample_rate() == 0 {
            return 0.0;
        }
        self.total_frames() as f64 / f64::from(self.sample_rate())
    }

    fn seek(&mut self, frame: u64) -> Result<(), MediaError>;

    /// Fill `buf` from the current position. Returns the number of samples
    /// read; fewer than `buf.len()` only at end of stream.
    fn read(&mut self, buf: &mut [f32]) -> Result<usize, MediaError>;
}
