//! Window planning and reading.
//!
//! Window `k` starts at `k * (L - O)` seconds and is reported as
//! `[start, start + L)`. Every start before the end of the stream yields a
//! window; the last one is usually short and is padded with noise.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::domain::{MediaError, PaddingParams, WindowParams};
use crate::ports::AudioStream;

/// One window of samples, always exactly `length_frames` long.
#[derive(Debug, Clone)]
pub struct Window {
    pub index: usize,
    pub start_secs: f64,
    pub end_secs: f64,
    pub samples: Vec<f32>,
    /// Number of samples that came from the stream; the rest is padding.
    pub true_len: usize,
}

impl Window {
    pub fn is_padded(&self) -> bool {
        self.true_len < self.samples.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowPlan {
    pub length_secs: f64,
    pub hop_secs: f64,
    pub length_frames: usize,
    pub hop_frames: u64,
    pub count: usize,
}

impl WindowPlan {
    pub fn new(params: &WindowParams, sample_rate: u32, total_frames: u64) -> Self {
        let rate = f64::from(sample_rate);
        let length_frames = (params.length_secs * rate).round().max(1.0) as usize;
        let hop_frames = (params.hop_secs() * rate).round().max(1.0) as u64;
        let count = total_frames.div_ceil(hop_frames) as usize;
        Self {
            length_secs: params.length_secs,
            hop_secs: params.hop_secs(),
            length_frames,
            hop_frames,
            count,
        }
    }

    pub fn start_frame(&self, index: usize) -> u64 {
        index as u64 * self.hop_frames
    }

    pub fn start_secs(&self, index: usize) -> f64 {
        index as f64 * self.hop_secs
    }
}

/// Fill `samples[true_len..]` with uniform noise in
/// `[min * gain, max * gain]` of the true part. An empty true part pads with
/// silence.
pub fn pad_with_noise(samples: &mut [f32], true_len: usize, gain: f32, rng: &mut StdRng) {
    if true_len >= samples.len() {
        return;
    }
    let (head, tail) = samples.split_at_mut(true_len);
    if head.is_empty() {
        tail.fill(0.0);
        return;
    }
    let (min, max) = head
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &s| {
            (lo.min(s), hi.max(s))
        });
    let (lo, hi) = (min * gain, max * gain);
    if !(lo.is_finite() && hi.is_finite()) || lo >= hi {
        tail.fill(if lo.is_finite() { lo } else { 0.0 });
        return;
    }
    for s in tail {
        *s = rng.gen_range(lo..=hi);
    }
}

/// Sequential reader over a planned stream. Owns the stream and the padding
/// RNG so it can be moved into a blocking task and back.
pub struct WindowReader {
    stream: Box<dyn AudioStream>,
    plan: WindowPlan,
    rng: StdRng,
    gain: f32,
    next: usize,
}

impl WindowReader {
    pub fn new(stream: Box<dyn AudioStream>, window: &WindowParams, padding: &PaddingParams) -> Self {
        let plan = WindowPlan::new(window, stream.sample_rate(), stream.total_frames());
        Self {
            stream,
            plan,
            rng: StdRng::seed_from_u64(padding.seed),
            gain: padding.gain,
            next: 0,
        }
    }

    pub fn plan(&self) -> &WindowPlan {
        &self.plan
    }

    pub fn remaining(&self) -> usize {
        self.plan.count - self.next
    }

    pub fn is_done(&self) -> bool {
        self.remaining() == 0
    }

    /// Read up to `n` windows. Blocking.
    pub fn read_windows(&mut self, n: usize) -> Result<Vec<Window>, MediaError> {
        let n = n.min(self.remaining());
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.read_one()?);
        }
        Ok(out)
    }

    fn read_one(&mut self) -> Result<Window, MediaError> {
        let index = self.next;
        self.stream.seek(self.plan.start_frame(index))?;

        let mut samples = vec![0.0_f32; self.plan.length_frames];
        let mut filled = 0;
        while filled < samples.len() {
            let n = self.stream.read(&mut samples[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        pad_with_noise(&mut samples, filled, self.gain, &mut self.rng);

        self.next += 1;
        let start_secs = self.plan.start_secs(index);
        Ok(Window {
            index,
            start_secs,
            end_secs: start_secs + self.plan.length_secs,
            samples,
            true_len: filled,
        })
    }
}
