//! Drives the core against an in-memory device on a virtual clock.
//!
//! Time advances by exactly the audio the device accepted in each iteration,
//! so fades and timers line up with the rendered output as they would on
//! real hardware.

use std::path::Path;

use dome_core::{
    audio::{Frame, MemoryDevice},
    AudioArbiter, DomeError, EngineConfig, ManualClock, Result, Runtime, TimerKey,
};
use rubato::{FastFixedIn, PolynomialDegree, Resampler as _};

pub const OUTPUT_RATE: u32 = 44_100;

/// A run of frames recorded at one device rate.
#[derive(Debug)]
struct Segment {
    rate: u32,
    frames: Vec<Frame>,
}

/// Everything the listener heard, kept at the rates the device ran at and
/// resampled to [`OUTPUT_RATE`] on [`render`](Capture::render).
#[derive(Debug, Default)]
pub struct Capture {
    segments: Vec<Segment>,
}

impl Capture {
    /// Appends `frames` recorded at `rate`.
    pub fn extend(&mut self, frames: &[Frame], rate: u32) {
        if frames.is_empty() || rate == 0 {
            return;
        }
        match self.segments.last_mut() {
            Some(segment) if segment.rate == rate => segment.frames.extend_from_slice(frames),
            _ => self.segments.push(Segment {
                rate,
                frames: frames.to_vec(),
            }),
        }
    }

    pub fn duration_ms(&self) -> u64 {
        self.segments
            .iter()
            .map(|segment| segment.frames.len() as u64 * 1000 / u64::from(segment.rate))
            .sum()
    }

    /// The whole capture at [`OUTPUT_RATE`].
    pub fn render(&self) -> Result<Vec<Frame>> {
        let mut out = Vec::new();
        for segment in &self.segments {
            if segment.rate == OUTPUT_RATE {
                out.extend_from_slice(&segment.frames);
            } else {
                out.extend(resample(&segment.frames, segment.rate)?);
            }
        }
        Ok(out)
    }

    pub fn write_wav(&self, path: &Path) -> Result<()> {
        let frames = self.render()?;
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: OUTPUT_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let failed = |err: hound::Error| DomeError::msg(format!("writing {}: {err}", path.display()));
        let mut writer = hound::WavWriter::create(path, spec).map_err(failed)?;
        for [left, right] in &frames {
            writer.write_sample(*left).map_err(failed)?;
            writer.write_sample(*right).map_err(failed)?;
        }
        writer.finalize().map_err(failed)
    }
}

/// Converts one segment to [`OUTPUT_RATE`] in a single rubato pass.
fn resample(frames: &[Frame], rate: u32) -> Result<Vec<Frame>> {
    let planar: Vec<Vec<f32>> = (0..2)
        .map(|channel| {
            frames
                .iter()
                .map(|frame| f32::from(frame[channel]) / 32_768.0)
                .collect()
        })
        .collect();

    let mut resampler = FastFixedIn::<f32>::new(
        f64::from(OUTPUT_RATE) / f64::from(rate),
        1.0,
        PolynomialDegree::Septic,
        frames.len(),
        2,
    )
    .map_err(|err| DomeError::msg(format!("resampler for {rate} Hz: {err}")))?;
    let planar = resampler
        .process(&planar, None)
        .map_err(|err| DomeError::msg(format!("resampling {rate} Hz: {err}")))?;

    let to_i16 = |sample: f32| (sample * 32_768.0).round().clamp(-32_768.0, 32_767.0) as i16;
    tracing::debug!(rate, input = frames.len(), output = planar[0].len(), "segment resampled");
    Ok(planar[0]
        .iter()
        .zip(&planar[1])
        .map(|(&left, &right)| [to_i16(left), to_i16(right)])
        .collect())
}

pub struct Simulation {
    clock: ManualClock,
    runtime: Runtime<MemoryDevice>,
    capture: Capture,
    carry_us: u64,
    limit_ms: u32,
}

impl Simulation {
    pub fn new(arbiter: AudioArbiter<MemoryDevice>, config: &EngineConfig, limit_ms: u32) -> Self {
        let clock = ManualClock::new();
        let runtime = Runtime::new(arbiter, config, clock.clone());
        let mut sim = Self {
            clock,
            runtime,
            capture: Capture::default(),
            carry_us: 0,
            limit_ms,
        };
        // Brings the device up.
        sim.step();
        sim
    }

    pub fn runtime(&mut self) -> &mut Runtime<MemoryDevice> {
        &mut self.runtime
    }

    pub fn capture(&self) -> &Capture {
        &self.capture
    }

    pub fn now_ms(&self) -> u32 {
        self.runtime.now_ms()
    }

    fn out_of_time(&self) -> bool {
        self.now_ms() >= self.limit_ms
    }

    /// Runs for `ms` of virtual time.
    pub fn run_for(&mut self, ms: u32) {
        let until = self.now_ms().saturating_add(ms);
        while self.now_ms() < until && !self.out_of_time() {
            self.step();
        }
    }

    /// Runs until nothing plays and no ping is pending.
    pub fn run_until_idle(&mut self) {
        while !self.out_of_time() {
            let busy = self.runtime.arbiter().is_busy()
                || self.runtime.timers().is_active(TimerKey::Ping);
            if !busy {
                return;
            }
            self.step();
        }
        tracing::warn!(limit_ms = self.limit_ms, "simulation time limit reached");
    }

    fn step(&mut self) {
        self.runtime.run_once();

        let device = self.runtime.arbiter_mut().device_mut();
        let produced = device.rendered().len() as u64;
        let rate = device.sample_rate.max(1);
        self.capture.extend(device.rendered(), rate);
        device.clear_capture();

        if produced == 0 {
            self.carry_us = 0;
            self.clock.advance(1);
            return;
        }
        let elapsed_us = produced * 1_000_000 / u64::from(rate) + self.carry_us;
        self.carry_us = elapsed_us % 1000;
        self.clock.advance((elapsed_us / 1000) as u32);
    }
}
