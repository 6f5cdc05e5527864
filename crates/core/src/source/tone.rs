use std::f32::consts::TAU;

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{configure_device, push_frame, SourceKind, SourcePlayer, StallLog};
use crate::{audio::OutputDevice, config::AudioConfig, Result};

const ATTACK_MS: f32 = 35.0;
const DECAY_MS: f32 = 260.0;
const HARMONIC_GAIN: f32 = 0.18;

/// Parameters of a swept proximity ping.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToneProfile {
    pub start_hz: f32,
    pub end_hz: f32,
    pub duration_ms: f32,
    pub amplitude: f32,
    pub noise: f32,
}

impl Default for ToneProfile {
    fn default() -> Self {
        Self {
            start_hz: 800.0,
            end_hz: 1100.0,
            duration_ms: 320.0,
            amplitude: 0.4,
            noise: 0.0,
        }
    }
}

impl ToneProfile {
    /// Duration at least 10 ms, amplitude in [0.01, 1], noise in [0, 1].
    pub fn sanitized(self) -> Self {
        Self {
            duration_ms: self.duration_ms.max(10.0),
            amplitude: self.amplitude.clamp(0.01, 1.0),
            noise: self.noise.clamp(0.0, 1.0),
            ..self
        }
    }
}

/// Procedural tone: a linear frequency sweep with a second harmonic, shaped
/// by an attack/decay envelope, plus optional white noise.
pub struct ToneSynth {
    profile: ToneProfile,
    sample_rate: u32,
    total: u32,
    index: u32,
    phase: f32,
    /// Rendered sample the device refused last time.
    pending: Option<i16>,
    rng: StdRng,
    batch: usize,
    retries: u8,
    stalls: StallLog,
    running: bool,
}

impl std::fmt::Debug for ToneSynth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToneSynth")
            .field("profile", &self.profile)
            .field("index", &self.index)
            .field("total", &self.total)
            .field("running", &self.running)
            .finish()
    }
}

impl ToneSynth {
    pub fn new(config: &AudioConfig) -> Self {
        Self::with_rng(config, StdRng::from_os_rng())
    }

    /// Reproducible noise, for tests and offline rendering.
    pub fn with_seed(config: &AudioConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &AudioConfig, rng: StdRng) -> Self {
        Self {
            profile: ToneProfile::default(),
            sample_rate: config.tone_sample_rate.max(1),
            total: 0,
            index: 0,
            phase: 0.0,
            pending: None,
            rng,
            batch: config.tone_batch_frames.max(1),
            retries: config.stall_retries,
            stalls: StallLog::default(),
            running: false,
        }
    }

    pub fn profile(&self) -> &ToneProfile {
        &self.profile
    }

    pub fn total_samples(&self) -> u32 {
        self.total
    }

    pub fn remaining_ms(&self) -> u32 {
        if !self.running || self.index >= self.total {
            return 0;
        }
        let left = (self.total - self.index) as f32;
        (left / self.sample_rate as f32 * 1000.0).round() as u32
    }

    fn render_sample(&mut self) -> i16 {
        let rate = self.sample_rate as f32;
        let t = self.index as f32 / rate;
        let duration = self.profile.duration_ms / 1000.0;
        let progress = if duration > 0.0 { t / duration } else { 1.0 };
        let sweep = self.profile.start_hz + (self.profile.end_hz - self.profile.start_hz) * progress;
        let freq = if sweep > 0.0 { sweep } else { self.profile.start_hz };

        self.phase += TAU * freq / rate;
        if self.phase > TAU {
            self.phase %= TAU;
        }

        let attack = 1.0 - (-t / (ATTACK_MS / 1000.0)).exp();
        let decay = (-t / (DECAY_MS / 1000.0)).exp();
        let envelope = (attack * decay).clamp(0.0, 1.0);

        let mut signal = self.phase.sin() + HARMONIC_GAIN * (self.phase * 2.0).sin();
        if self.profile.noise > 0.0 {
            signal += self.profile.noise * self.rng.random_range(-1.0f32..1.0);
        }

        let sample = (self.profile.amplitude * envelope * signal).clamp(-1.0, 1.0);
        (sample * f32::from(i16::MAX)) as i16
    }
}

impl SourcePlayer for ToneSynth {
    type Input = ToneProfile;

    fn begin<D: OutputDevice>(&mut self, profile: ToneProfile, device: &mut D) -> Result<()> {
        self.profile = profile.sanitized();
        configure_device(device, self.sample_rate)?;

        let samples = self.profile.duration_ms * self.sample_rate as f32 / 1000.0;
        self.total = if samples > 1.0 { samples as u32 } else { 1 };
        self.index = 0;
        self.phase = 0.0;
        self.pending = None;
        self.running = true;
        tracing::debug!(
            duration_ms = self.profile.duration_ms,
            samples = self.total,
            start_hz = self.profile.start_hz,
            end_hz = self.profile.end_hz,
            amplitude = self.profile.amplitude,
            noise = self.profile.noise,
            "tone started"
        );
        Ok(())
    }

    fn pump<D: OutputDevice>(&mut self, device: &mut D) -> bool {
        if !self.running {
            return false;
        }

        let mut produced = 0;
        while produced < self.batch && self.index < self.total {
            let value = match self.pending.take() {
                Some(value) => value,
                None => self.render_sample(),
            };
            if let Err(err) = push_frame(device, [value, value], self.retries) {
                self.pending = Some(value);
                self.stalls.stalled(SourceKind::Tone, u64::from(self.index), &err);
                break;
            }
            self.stalls.cleared();
            self.index += 1;
            produced += 1;
        }

        device.pump();
        if self.index >= self.total {
            self.running = false;
            return false;
        }
        true
    }

    fn stop<D: OutputDevice>(&mut self, device: &mut D) {
        if !self.running {
            return;
        }
        self.running = false;
        self.pending = None;
        tracing::debug!(index = self.index, total = self.total, "tone stopped");
        device.flush();
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::MemoryDevice;

    #[test]
    fn profile_is_sanitized() {
        let profile = ToneProfile {
            duration_ms: 2.0,
            amplitude: 3.0,
            noise: -1.0,
            ..ToneProfile::default()
        }
        .sanitized();
        assert_eq!(profile.duration_ms, 10.0);
        assert_eq!(profile.amplitude, 1.0);
        assert_eq!(profile.noise, 0.0);
        assert_eq!(
            ToneProfile { amplitude: 0.0, ..ToneProfile::default() }.sanitized().amplitude,
            0.01
        );
    }

    #[test]
    fn renders_the_configured_length() {
        let config = AudioConfig::default();
        let mut synth = ToneSynth::with_seed(&config, 7);
        let mut device = MemoryDevice::new();

        synth.begin(ToneProfile::default(), &mut device).unwrap();
        assert_eq!(device.sample_rate, 44_100);
        assert_eq!(synth.total_samples(), 14_112);
        assert_eq!(synth.remaining_ms(), 320);

        let mut pumps = 0;
        while synth.pump(&mut device) {
            pumps += 1;
        }
        assert_eq!(device.frames().len(), 14_112);
        assert_eq!(pumps + 1, 14_112 / config.tone_batch_frames);
        assert_eq!(synth.remaining_ms(), 0);
        assert!(device.frames().iter().all(|f| f[0] == f[1]));
        // Starts from silence under the attack envelope.
        assert_eq!(device.frames()[0], [0, 0]);
        assert!(device.frames().iter().any(|f| f[0].abs() > 1_000));
    }

    #[test]
    fn seeded_noise_is_reproducible() {
        let config = AudioConfig::default();
        let profile = ToneProfile { noise: 0.5, ..ToneProfile::default() };
        let render = |seed| {
            let mut synth = ToneSynth::with_seed(&config, seed);
            let mut device = MemoryDevice::new();
            synth.begin(profile, &mut device).unwrap();
            while synth.pump(&mut device) {}
            device.frames().to_vec()
        };
        assert_eq!(render(3), render(3));
        assert_ne!(render(3), render(4));
    }

    #[test]
    fn stall_does_not_skip_samples() {
        let config = AudioConfig::default();
        let profile = ToneProfile { duration_ms: 10.0, ..ToneProfile::default() };

        let mut reference = ToneSynth::with_seed(&config, 1);
        let mut clean = MemoryDevice::new();
        reference.begin(profile, &mut clean).unwrap();
        while reference.pump(&mut clean) {}

        let mut synth = ToneSynth::with_seed(&config, 1);
        let mut device = MemoryDevice::new().with_capacity(10);
        synth.begin(profile, &mut device).unwrap();
        device.set_accepting(false);
        assert!(synth.pump(&mut device));
        device.set_accepting(true);
        while synth.pump(&mut device) {}

        assert_eq!(device.frames(), clean.frames());
    }
}
