//! WAV files below a root directory, decoded with `hound`.

use std::fs::File;
use std::io::BufReader;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use hound::{SampleFormat, WavReader};

use crate::domain::MediaError;
use crate::ports::{AudioStream, MediaSource};

/// Resolves object names relative to `root`. Names that would escape the
/// root are rejected.
#[derive(Debug, Clone)]
pub struct WavDirectorySource {
    root: PathBuf,
}

impl WavDirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, object_name: &str) -> Result<PathBuf, MediaError> {
        let rel = Path::new(object_name);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(MediaError::Open {
                object: object_name.to_string(),
                reason: "object name escapes the media root".into(),
            });
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl MediaSource for WavDirectorySource {
    async fn open_stream(&self, object_name: &str) -> Result<Box<dyn AudioStream>, MediaError> {
        let path = self.resolve(object_name)?;
        let object = object_name.to_string();
        tokio::task::spawn_blocking(move || WavStream::open(&path))
            .await
            .map_err(|e| MediaError::Open {
                object: object.clone(),
                reason: e.to_string(),
            })?
            .map(|s| Box::new(s) as Box<dyn AudioStream>)
            .map_err(|e| MediaError::Open {
                object,
                reason: e.to_string(),
            })
    }
}

/// Mono downmix of a WAV file, as f32 in `[-1, 1]`.
pub struct WavStream {
    reader: WavReader<BufReader<File>>,
    channels: usize,
    sample_rate: u32,
    frames: u64,
    format: SampleFormat,
    scale: f32,
}

impl WavStream {
    pub fn open(path: &Path) -> Result<Self, hound::Error> {
        let reader = WavReader::open(path)?;
        let spec = reader.spec();
        let scale = match spec.sample_format {
            SampleFormat::Float => 1.0,
            SampleFormat::Int => 1.0 / (1_i64 << (spec.bits_per_sample.max(1) - 1)) as f32,
        };
        Ok(Self {
            frames: u64::from(reader.duration()),
            channels: usize::from(spec.channels.max(1)),
            sample_rate: spec.sample_rate,
            format: spec.sample_format,
            scale,
            reader,
        })
    }

    fn next_sample(&mut self) -> Option<Result<f32, hound::Error>> {
        match self.format {
            SampleFormat::Float => self.reader.samples::<f32>().next(),
            SampleFormat::Int => {
                let scale = self.scale;
                self.reader
                    .samples::<i32>()
                    .next()
                    .map(|s| s.map(|v| v as f32 * scale))
            }
        }
    }
}

impl AudioStream for WavStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_frames(&self) -> u64 {
        self.frames
    }

    fn seek(&mut self, frame: u64) -> Result<(), MediaError> {
        let frame = u32::try_from(frame.min(self.frames))
            .map_err(|_| MediaError::Decode(format!("seek target {frame} out of range")))?;
        self.reader
            .seek(frame)
            .map_err(|e| MediaError::Decode(e.to_string()))
    }

    fn read(&mut self, buf: &mut [f32]) -> Result<usize, MediaError> {
        let mut n = 0;
        'frames: for slot in buf.iter_mut() {
            let mut sum = 0.0;
            for ch in 0..self.channels {
                match self.next_sample() {
                    Some(Ok(v)) => sum += v,
                    Some(Err(e)) => return Err(MediaError::Decode(e.to_string())),
                    None if ch == 0 => break 'frames,
                    None => return Err(MediaError::Decode("truncated frame".into())),
                }
            }
            *slot = sum / self.channels as f32;
            n += 1;
        }
        Ok(n)
    }
}
