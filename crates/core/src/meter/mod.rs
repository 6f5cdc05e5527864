//! Output level metering.
//!
//! The output wrapper feeds every consumed frame into a [`MeterTap`], which
//! may run at a different cadence than the scheduler tick. The accumulator is
//! therefore mutex-protected; the scheduler side periodically calls
//! [`LevelMeter::publish`] to turn it into a [`MeterReading`] for the
//! lighting layer.

use std::{
    f32::consts::PI,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};

use crate::{DomeError, Result};

/// Latest published level of the audio output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MeterReading {
    /// RMS of the left channel in raw 16-bit units.
    pub level_raw: u16,
    /// `level_raw` normalised to [0, 1].
    pub level: f32,
    /// Normalised [0, 1] spectral centroid where 1.0 corresponds to the
    /// Nyquist frequency of the metered stream.
    pub spectral_centroid: f32,
}

#[derive(Debug)]
struct Accumulator {
    sum_squares: u64,
    count: u32,
    window: Vec<f32>,
    write: usize,
    filled: bool,
    reading: MeterReading,
}

impl Accumulator {
    fn new(window: usize) -> Self {
        Self {
            sum_squares: 0,
            count: 0,
            window: vec![0.0; window.max(2)],
            write: 0,
            filled: false,
            reading: MeterReading::default(),
        }
    }

    fn clear(&mut self) {
        self.sum_squares = 0;
        self.count = 0;
        self.write = 0;
        self.filled = false;
        self.window.iter_mut().for_each(|s| *s = 0.0);
    }

    fn recent_samples(&self) -> Vec<f32> {
        if self.filled {
            let (head, tail) = self.window.split_at(self.write);
            tail.iter().chain(head.iter()).copied().collect()
        } else {
            self.window[..self.write].to_vec()
        }
    }
}

/// Sample-side handle of the meter.
#[derive(Clone)]
pub struct MeterTap {
    shared: Arc<Mutex<Accumulator>>,
}

impl MeterTap {
    /// Accounts one output sample. A poisoned accumulator drops the sample.
    pub fn record(&self, sample: i16) {
        let Ok(mut acc) = self.shared.lock() else {
            return;
        };
        let value = i64::from(sample);
        acc.sum_squares = acc.sum_squares.saturating_add((value * value) as u64);
        acc.count = acc.count.saturating_add(1);
        let write = acc.write;
        acc.window[write] = f32::from(sample) / 32768.0;
        acc.write = (write + 1) % acc.window.len();
        if acc.write == 0 {
            acc.filled = true;
        }
    }
}

impl fmt::Debug for MeterTap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeterTap").finish()
    }
}

/// Scheduler-side half of the meter, including the FFT used for the
/// spectral centroid.
pub struct LevelMeter {
    shared: Arc<Mutex<Accumulator>>,
    sample_rate: u32,
    planner: RealFftPlanner<f32>,
    fft: Option<FftResources>,
}

impl LevelMeter {
    pub fn new(window: usize) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Accumulator::new(window))),
            sample_rate: 44_100,
            planner: RealFftPlanner::new(),
            fft: None,
        }
    }

    pub fn tap(&self) -> MeterTap {
        MeterTap {
            shared: self.shared.clone(),
        }
    }

    /// Records the sample rate of the stream currently being metered.
    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate.max(1);
    }

    /// Converts the accumulated samples into a new reading and clears the
    /// accumulator. Returns `None` when nothing was played since the last
    /// publication.
    pub fn publish(&mut self) -> Result<Option<MeterReading>> {
        let (mean, samples) = {
            let mut acc = self.lock()?;
            if acc.count == 0 {
                return Ok(None);
            }
            let mean = acc.sum_squares as f64 / f64::from(acc.count);
            let samples = acc.recent_samples();
            acc.clear();
            (mean, samples)
        };

        let level_raw = mean.sqrt().min(f64::from(i16::MAX)) as u16;
        let centroid_hz = self.spectral_centroid(&samples);
        let nyquist = self.sample_rate as f32 * 0.5;
        let reading = MeterReading {
            level_raw,
            level: f32::from(level_raw) / f32::from(i16::MAX as u16),
            spectral_centroid: (centroid_hz / nyquist).clamp(0.0, 1.0),
        };

        self.lock()?.reading = reading;
        Ok(Some(reading))
    }

    /// Last published reading.
    pub fn reading(&self) -> MeterReading {
        self.shared
            .lock()
            .map(|acc| acc.reading)
            .unwrap_or_default()
    }

    /// Drops pending samples and publishes silence.
    pub fn reset(&mut self) {
        if let Ok(mut acc) = self.shared.lock() {
            acc.clear();
            acc.reading = MeterReading::default();
        }
    }

    fn spectral_centroid(&mut self, samples: &[f32]) -> f32 {
        let len = samples.len();
        if len < 2 {
            return 0.0;
        }
        let sample_rate = self.sample_rate as f32;
        let fft = self.prepare_fft(len);

        for (index, value) in samples.iter().enumerate() {
            fft.input[index] = *value * hann_value(index, len);
        }

        if let Err(err) =
            fft.plan
                .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)
        {
            tracing::debug!(%err, "meter fft failed");
            return 0.0;
        }

        let bin_hz = sample_rate / len as f32;
        let mut magnitude_sum = 0.0;
        let mut weighted_sum = 0.0;
        for (i, bin) in fft.spectrum.iter().enumerate() {
            let magnitude = bin.norm();
            magnitude_sum += magnitude;
            weighted_sum += magnitude * (i as f32 * bin_hz);
        }

        if magnitude_sum <= f32::EPSILON {
            0.0
        } else {
            weighted_sum / magnitude_sum
        }
    }

    fn prepare_fft(&mut self, size: usize) -> &mut FftResources {
        let resources = match self.fft.take() {
            Some(fft) if fft.size == size => fft,
            _ => {
                let plan = self.planner.plan_fft_forward(size);
                FftResources {
                    size,
                    scratch: plan.make_scratch_vec(),
                    spectrum: plan.make_output_vec(),
                    input: plan.make_input_vec(),
                    plan,
                }
            }
        };

        self.fft.insert(resources)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Accumulator>> {
        self.shared
            .lock()
            .map_err(|_| DomeError::msg("level meter accumulator has been poisoned"))
    }
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl fmt::Debug for LevelMeter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LevelMeter")
            .field("sample_rate", &self.sample_rate)
            .field("reading", &self.reading())
            .finish()
    }
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}
