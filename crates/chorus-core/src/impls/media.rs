//! In-memory media for tests and demos.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::domain::MediaError;
use crate::ports::{AudioStream, MediaSource};

/// A mono stream over an owned sample buffer.
#[derive(Debug, Clone)]
pub struct MemoryStream {
    sample_rate: u32,
    samples: Arc<[f32]>,
    pos: usize,
}

impl MemoryStream {
    pub fn new(sample_rate: u32, samples: Vec<f32>) -> Self {
        Self {
            sample_rate,
            samples: samples.into(),
            pos: 0,
        }
    }
}

impl AudioStream for MemoryStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_frames(&self) -> u64 {
        self.samples.len() as u64
    }

    fn seek(&mut self, frame: u64) -> Result<(), MediaError> {
        self.pos = (frame as usize).min(self.samples.len());
        Ok(())
    }

    fn read(&mut self, buf: &mut [f32]) -> Result<usize, MediaError> {
        let n = buf.len().min(self.samples.len() - self.pos);
        buf[..n].copy_from_slice(&self.samples[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Object name -> stream map. Unknown names fail to open.
#[derive(Debug, Clone, Default)]
pub struct MemoryMediaSource {
    objects: Arc<Mutex<HashMap<String, MemoryStream>>>,
}

impl MemoryMediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, object_name: impl Into<String>, sample_rate: u32, samples: Vec<f32>) {
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects.insert(object_name.into(), MemoryStream::new(sample_rate, samples));
    }
}

#[async_trait]
impl MediaSource for MemoryMediaSource {
    async fn open_stream(&self, object_name: &str) -> Result<Box<dyn AudioStream>, MediaError> {
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects
            .get(object_name)
            .cloned()
            .map(|s| Box::new(s) as Box<dyn AudioStream>)
            .ok_or_else(|| MediaError::Open {
                object: object_name.to_string(),
                reason: "no such object".into(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_stops_at_end_of_stream() {
        let mut s = MemoryStream::new(10, vec![1.0, 2.0, 3.0]);
        let mut buf = [0.0; 2];
        assert_eq!(s.read(&mut buf).unwrap(), 2);
        assert_eq!(s.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], 3.0);
        assert_eq!(s.read(&mut buf).unwrap(), 0);

        s.seek(1).unwrap();
        assert_eq!(s.read(&mut buf).unwrap(), 2);
        assert_eq!(buf, [2.0, 3.0]);
    }

    #[tokio::test]
    async fn unknown_object_fails_to_open() {
        let source = MemoryMediaSource::new();
        source.insert("a.wav", 10, vec![0.0; 10]);

        assert!(source.open_stream("a.wav").await.is_ok());
        assert!(matches!(
            source.open_stream("b.wav").await,
            Err(MediaError::Open { .. })
        ));
    }
}
