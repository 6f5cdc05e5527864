use std::{fs::File, io::BufReader, io::Read, path::Path, sync::Arc};

use hound::{SampleFormat, WavReader};

use super::{configure_device, push_frame, SourceKind, SourcePlayer, StallLog};
use crate::{audio::OutputDevice, config::AudioConfig, DomeError, Result};

/// Pre-loaded mono 16-bit sample buffer. Cloning shares the samples.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmClip {
    samples: Arc<[i16]>,
    sample_rate: u32,
    duration_ms: u32,
}

impl PcmClip {
    pub fn from_samples(samples: Vec<i16>, sample_rate: u32) -> Result<Self> {
        if samples.is_empty() {
            return Err(DomeError::InvalidInput("pcm clip has no samples"));
        }
        if sample_rate == 0 {
            return Err(DomeError::InvalidInput("pcm clip sample rate is zero"));
        }
        let rate = u64::from(sample_rate);
        let duration_ms = (samples.len() as u64 * 1000 + rate / 2) / rate;
        Ok(Self {
            samples: samples.into(),
            sample_rate,
            duration_ms: u32::try_from(duration_ms).unwrap_or(u32::MAX),
        })
    }

    /// Loads a clip, enforcing the fixed clip format: integer PCM, mono,
    /// 16 bits, `expected_rate` Hz.
    pub fn from_wav_reader<R: Read>(reader: R, expected_rate: u32) -> Result<Self> {
        let mut reader = WavReader::new(reader)?;
        let spec = reader.spec();
        if spec.sample_format != SampleFormat::Int {
            return Err(DomeError::msg("pcm clip must be integer PCM"));
        }
        if spec.channels != 1 {
            return Err(DomeError::msg(format!(
                "pcm clip must be mono, got {} channels",
                spec.channels
            )));
        }
        if spec.bits_per_sample != 16 {
            return Err(DomeError::msg(format!(
                "pcm clip must be 16-bit, got {} bits",
                spec.bits_per_sample
            )));
        }
        if spec.sample_rate != expected_rate {
            return Err(DomeError::msg(format!(
                "pcm clip must be {expected_rate} Hz, got {}",
                spec.sample_rate
            )));
        }

        let samples = reader
            .samples::<i16>()
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Self::from_samples(samples, spec.sample_rate)
    }

    pub fn from_wav_path(path: impl AsRef<Path>, expected_rate: u32) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let clip = Self::from_wav_reader(BufReader::new(file), expected_rate)?;
        tracing::info!(
            path = %path.display(),
            samples = clip.len(),
            duration_ms = clip.duration_ms,
            "pcm clip loaded"
        );
        Ok(clip)
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn duration_ms(&self) -> u32 {
        self.duration_ms
    }
}

/// Input for [`PcmClipPlayer::begin`].
#[derive(Debug, Clone)]
pub struct PcmPlayback {
    pub clip: PcmClip,
    /// Requested amplitude; clamped to [0, 1].
    pub amplitude: f32,
}

#[derive(Debug)]
pub struct PcmClipPlayer {
    clip: Option<PcmClip>,
    index: usize,
    amplitude: f32,
    batch: usize,
    retries: u8,
    stalls: StallLog,
}

fn sanitize_amplitude(amplitude: f32) -> f32 {
    if amplitude.is_finite() {
        amplitude.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Scales one sample, saturating at the 16-bit range.
fn scale(sample: i16, amplitude: f32) -> i16 {
    (f32::from(sample) * amplitude)
        .round()
        .clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
}

impl PcmClipPlayer {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            clip: None,
            index: 0,
            amplitude: 0.0,
            batch: config.pcm_batch_frames.max(1),
            retries: config.stall_retries,
            stalls: StallLog::default(),
        }
    }

    pub fn amplitude(&self) -> f32 {
        self.amplitude
    }

    /// Adjusts the amplitude of the running clip.
    pub fn set_amplitude(&mut self, amplitude: f32) {
        self.amplitude = sanitize_amplitude(amplitude);
    }

    pub fn remaining_ms(&self) -> u32 {
        match &self.clip {
            Some(clip) => {
                let left = clip.len().saturating_sub(self.index) as u64;
                (left * 1000 / u64::from(clip.sample_rate())) as u32
            }
            None => 0,
        }
    }
}

impl SourcePlayer for PcmClipPlayer {
    type Input = PcmPlayback;

    fn begin<D: OutputDevice>(&mut self, input: PcmPlayback, device: &mut D) -> Result<()> {
        configure_device(device, input.clip.sample_rate())?;
        self.amplitude = sanitize_amplitude(input.amplitude);
        self.index = 0;
        tracing::debug!(
            samples = input.clip.len(),
            duration_ms = input.clip.duration_ms(),
            amplitude = self.amplitude,
            "pcm clip started"
        );
        self.clip = Some(input.clip);
        Ok(())
    }

    fn pump<D: OutputDevice>(&mut self, device: &mut D) -> bool {
        let Some(clip) = self.clip.as_ref() else {
            return false;
        };
        let samples = clip.samples();

        let end = (self.index + self.batch).min(samples.len());
        while self.index < end {
            let value = scale(samples[self.index], self.amplitude);
            if let Err(err) = push_frame(device, [value, value], self.retries) {
                self.stalls.stalled(SourceKind::PcmClip, self.index as u64, &err);
                break;
            }
            self.stalls.cleared();
            self.index += 1;
        }
        device.pump();

        if self.index >= samples.len() {
            self.clip = None;
            return false;
        }
        true
    }

    fn stop<D: OutputDevice>(&mut self, device: &mut D) {
        if self.clip.take().is_some() {
            device.flush();
        }
        self.index = 0;
    }

    fn is_running(&self) -> bool {
        self.clip.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{audio::MemoryDevice, source::decode::tests::wav_bytes};
    use proptest::prelude::*;
    use std::io::Cursor;

    #[test]
    fn duration_is_rounded_to_the_nearest_millisecond() {
        let clip = PcmClip::from_samples(vec![0; 22_061], 22_050).unwrap();
        assert_eq!(clip.duration_ms(), 1_000);
        let clip = PcmClip::from_samples(vec![0; 22_062], 22_050).unwrap();
        assert_eq!(clip.duration_ms(), 1_001);
    }

    #[test]
    fn wav_loader_enforces_the_clip_format() {
        let good = wav_bytes(1, 22_050, &[1, 2, 3]);
        let clip = PcmClip::from_wav_reader(Cursor::new(good), 22_050).unwrap();
        assert_eq!(clip.samples(), &[1, 2, 3]);

        let stereo = wav_bytes(2, 22_050, &[1, 2]);
        assert!(PcmClip::from_wav_reader(Cursor::new(stereo), 22_050).is_err());

        let wrong_rate = wav_bytes(1, 44_100, &[1]);
        assert!(PcmClip::from_wav_reader(Cursor::new(wrong_rate), 22_050).is_err());

        let empty = wav_bytes(1, 22_050, &[]);
        assert!(matches!(
            PcmClip::from_wav_reader(Cursor::new(empty), 22_050),
            Err(DomeError::InvalidInput(_))
        ));
    }

    #[test]
    fn pumps_in_bounded_batches_at_the_clip_rate() {
        let config = AudioConfig::default();
        let clip = PcmClip::from_samples(vec![1000; 200], 22_050).unwrap();
        let mut player = PcmClipPlayer::new(&config);
        let mut device = MemoryDevice::new();

        player
            .begin(PcmPlayback { clip, amplitude: 0.5 }, &mut device)
            .unwrap();
        assert_eq!(device.sample_rate, 22_050);
        assert_eq!((device.channels, device.bits_per_sample), (2, 16));

        assert!(player.pump(&mut device));
        assert_eq!(device.frames().len(), config.pcm_batch_frames);
        assert!(player.pump(&mut device));
        assert!(!player.pump(&mut device));
        assert_eq!(device.frames().len(), 200);
        assert!(device.frames().iter().all(|f| *f == [500, 500]));
        assert!(!player.is_running());
    }

    #[test]
    fn stall_keeps_position() {
        let clip = PcmClip::from_samples(vec![1, 2, 3], 22_050).unwrap();
        let mut player = PcmClipPlayer::new(&AudioConfig::default());
        let mut device = MemoryDevice::new().with_capacity(2);

        player
            .begin(PcmPlayback { clip, amplitude: 1.0 }, &mut device)
            .unwrap();
        device.set_accepting(false);
        assert!(player.pump(&mut device));
        device.set_accepting(true);
        assert!(!player.pump(&mut device));
        assert_eq!(device.frames(), &[[1, 1], [2, 2], [3, 3]]);
    }

    proptest! {
        #[test]
        fn output_never_exceeds_input_magnitude(
            samples in proptest::collection::vec(any::<i16>(), 1..64),
            amplitude in -4.0f32..4.0,
        ) {
            let clip = PcmClip::from_samples(samples.clone(), 22_050).unwrap();
            let mut player = PcmClipPlayer::new(&AudioConfig::default());
            let mut device = MemoryDevice::new();
            player.begin(PcmPlayback { clip, amplitude }, &mut device).unwrap();
            while player.pump(&mut device) {}

            prop_assert_eq!(device.frames().len(), samples.len());
            for (frame, input) in device.frames().iter().zip(&samples) {
                prop_assert!(i32::from(frame[0]).abs() <= i32::from(*input).abs());
                prop_assert_eq!(frame[0], frame[1]);
            }
        }
    }
}
