use std::{fmt, io::Read};

use hound::{SampleFormat, WavReader};

use super::{push_frame, SourceKind, StallLog};
use crate::{
    audio::{Frame, OutputDevice},
    config::AudioConfig,
    DomeError, Result,
};

/// Anything a decoder can pull bytes from: a stored file or a remote stream.
pub type ByteSource = Box<dyn Read>;

/// Streaming decoder producing interleaved stereo frames.
pub trait Decoder {
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> u16;
    /// Next frame, `None` at end of stream.
    fn next_frame(&mut self) -> Option<Result<Frame>>;

    /// Discards up to `frames` frames and returns how many were skipped.
    fn skip_frames(&mut self, frames: u64) -> Result<u64> {
        let mut skipped = 0;
        while skipped < frames {
            match self.next_frame() {
                Some(Ok(_)) => skipped += 1,
                Some(Err(err)) => return Err(err),
                None => break,
            }
        }
        Ok(skipped)
    }
}

/// Builds decoders over byte sources.
pub trait DecoderFactory {
    fn create(&self, source: ByteSource) -> Result<Box<dyn Decoder>>;
}

/// RIFF/WAVE decoder for integer or float PCM of any channel count.
///
/// Mono streams are duplicated onto both channels; channels past the second
/// are dropped.
pub struct WavDecoder<R: Read> {
    reader: WavReader<R>,
    channels: u16,
    sample_rate: u32,
    format: SampleFormat,
    bits: u16,
}

impl<R: Read> WavDecoder<R> {
    pub fn new(source: R) -> Result<Self> {
        let reader = WavReader::new(source)?;
        let spec = reader.spec();
        if spec.channels == 0 {
            return Err(DomeError::AllocationFailure("wav stream declares zero channels".into()));
        }
        if spec.sample_format == SampleFormat::Int && !(8..=32).contains(&spec.bits_per_sample) {
            return Err(DomeError::AllocationFailure(format!(
                "unsupported sample width {} bits",
                spec.bits_per_sample
            )));
        }
        Ok(Self {
            channels: spec.channels,
            sample_rate: spec.sample_rate,
            format: spec.sample_format,
            bits: spec.bits_per_sample,
            reader,
        })
    }

    fn next_sample(&mut self) -> Option<Result<i16>> {
        match self.format {
            SampleFormat::Int => {
                let bits = self.bits;
                let sample = self.reader.samples::<i32>().next()?;
                Some(sample.map_err(DomeError::from).map(|value| {
                    let widened = if bits > 16 {
                        value >> (bits - 16)
                    } else {
                        value << (16 - bits)
                    };
                    widened.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
                }))
            }
            SampleFormat::Float => {
                let sample = self.reader.samples::<f32>().next()?;
                Some(
                    sample
                        .map_err(DomeError::from)
                        .map(|value| (value.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16),
                )
            }
        }
    }
}

impl<R: Read> Decoder for WavDecoder<R> {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn next_frame(&mut self) -> Option<Result<Frame>> {
        let left = match self.next_sample()? {
            Ok(sample) => sample,
            Err(err) => return Some(Err(err)),
        };
        if self.channels == 1 {
            return Some(Ok([left, left]));
        }

        let right = match self.next_sample() {
            Some(Ok(sample)) => sample,
            Some(Err(err)) => return Some(Err(err)),
            None => return None,
        };
        for _ in 2..self.channels {
            match self.next_sample() {
                Some(Ok(_)) => {}
                Some(Err(err)) => return Some(Err(err)),
                None => break,
            }
        }
        Some(Ok([left, right]))
    }
}

impl<R: Read> fmt::Debug for WavDecoder<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WavDecoder")
            .field("channels", &self.channels)
            .field("sample_rate", &self.sample_rate)
            .field("format", &self.format)
            .finish()
    }
}

/// Default factory: every byte source is treated as a WAV stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct WavDecoderFactory;

impl DecoderFactory for WavDecoderFactory {
    fn create(&self, source: ByteSource) -> Result<Box<dyn Decoder>> {
        let decoder = WavDecoder::new(source)?;
        tracing::debug!(
            channels = decoder.channels(),
            sample_rate = decoder.sample_rate(),
            "wav decoder ready"
        );
        Ok(Box::new(decoder))
    }
}

/// Decoder-driven frame pump shared by the fragment and sentence players.
///
/// A frame the device refused is kept and offered first on the next pump,
/// so a stall never drops audio.
pub(crate) struct DecodePump {
    kind: SourceKind,
    decoder: Option<Box<dyn Decoder>>,
    pending: Option<Frame>,
    /// Frames still allowed, `None` for the whole stream.
    remaining: Option<u64>,
    position: u64,
    batch: usize,
    retries: u8,
    stalls: StallLog,
}

impl DecodePump {
    pub(crate) fn new(kind: SourceKind, config: &AudioConfig) -> Self {
        Self {
            kind,
            decoder: None,
            pending: None,
            remaining: None,
            position: 0,
            batch: config.decode_batch_frames.max(1),
            retries: config.stall_retries,
            stalls: StallLog::default(),
        }
    }

    pub(crate) fn start(&mut self, decoder: Box<dyn Decoder>, limit: Option<u64>) {
        self.decoder = Some(decoder);
        self.pending = None;
        self.remaining = limit;
        self.position = 0;
    }

    pub(crate) fn is_open(&self) -> bool {
        self.decoder.is_some()
    }

    pub(crate) fn position(&self) -> u64 {
        self.position
    }

    pub(crate) fn stall_count(&self) -> u64 {
        self.stalls.total()
    }

    pub(crate) fn close(&mut self) {
        self.decoder = None;
        self.pending = None;
        self.remaining = None;
    }

    pub(crate) fn pump<D: OutputDevice>(&mut self, device: &mut D) -> bool {
        let Some(decoder) = self.decoder.as_mut() else {
            return false;
        };

        let mut finished = false;
        for _ in 0..self.batch {
            if self.remaining == Some(0) {
                finished = true;
                break;
            }
            let frame = match self.pending.take() {
                Some(frame) => frame,
                None => match decoder.next_frame() {
                    Some(Ok(frame)) => frame,
                    Some(Err(err)) => {
                        tracing::error!(source = ?self.kind, position = self.position, %err, "decode failed");
                        finished = true;
                        break;
                    }
                    None => {
                        finished = true;
                        break;
                    }
                },
            };

            if let Err(err) = push_frame(device, frame, self.retries) {
                self.pending = Some(frame);
                self.stalls.stalled(self.kind, self.position, &err);
                break;
            }
            self.stalls.cleared();
            self.position += 1;
            if let Some(remaining) = self.remaining.as_mut() {
                *remaining -= 1;
            }
        }

        device.pump();
        if finished {
            tracing::debug!(source = ?self.kind, frames = self.position, "stream finished");
            self.close();
        }
        !finished
    }
}

impl fmt::Debug for DecodePump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodePump")
            .field("kind", &self.kind)
            .field("open", &self.decoder.is_some())
            .field("pending", &self.pending)
            .field("remaining", &self.remaining)
            .field("position", &self.position)
            .finish()
    }
}
