//! The four mutually exclusive sound sources.
//!
//! Each player implements the same capability set ([`SourcePlayer`]); the
//! arbiter holds at most one of them at a time inside [`ActiveSource`].

mod decode;
mod fragment;
mod pcm;
mod sentence;
mod tone;

use serde::{Deserialize, Serialize};

pub use decode::{ByteSource, Decoder, DecoderFactory, WavDecoder, WavDecoderFactory};
pub use fragment::{
    ContentStore, DirectoryStore, FragmentDescriptor, FragmentPlayer, FragmentSource, ItemId,
    MemoryStore,
};
pub use pcm::{PcmClip, PcmClipPlayer, PcmPlayback};
pub use sentence::{
    preflight, voice_rss_url, ProbeResponse, SentenceSource, SentenceStreamer, SpeechService,
};
pub use tone::{ToneProfile, ToneSynth};

#[cfg(test)]
pub(crate) use decode::tests::wav_bytes;
#[cfg(test)]
pub(crate) use sentence::tests::CannedSpeech;

use crate::{
    audio::{Frame, OutputDevice},
    Result,
};

/// Which source currently owns the output device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    None,
    Fragment,
    Sentence,
    PcmClip,
    Tone,
}

/// Capability set shared by every player.
pub trait SourcePlayer {
    type Input;

    /// Configures the device for this source and starts producing.
    fn begin<D: OutputDevice>(&mut self, input: Self::Input, device: &mut D) -> Result<()>;
    /// Feeds one bounded batch of frames. `false` signals natural completion
    /// or failure.
    fn pump<D: OutputDevice>(&mut self, device: &mut D) -> bool;
    fn stop<D: OutputDevice>(&mut self, device: &mut D);
    fn is_running(&self) -> bool;
}

/// The player owning the device.
#[derive(Debug)]
pub enum ActiveSource {
    Fragment(FragmentPlayer),
    Sentence(SentenceStreamer),
    PcmClip(PcmClipPlayer),
    Tone(ToneSynth),
}

impl ActiveSource {
    pub fn kind(&self) -> SourceKind {
        match self {
            ActiveSource::Fragment(_) => SourceKind::Fragment,
            ActiveSource::Sentence(_) => SourceKind::Sentence,
            ActiveSource::PcmClip(_) => SourceKind::PcmClip,
            ActiveSource::Tone(_) => SourceKind::Tone,
        }
    }

    pub fn pump<D: OutputDevice>(&mut self, device: &mut D) -> bool {
        match self {
            ActiveSource::Fragment(player) => player.pump(device),
            ActiveSource::Sentence(player) => player.pump(device),
            ActiveSource::PcmClip(player) => player.pump(device),
            ActiveSource::Tone(player) => player.pump(device),
        }
    }

    pub fn stop<D: OutputDevice>(&mut self, device: &mut D) {
        match self {
            ActiveSource::Fragment(player) => player.stop(device),
            ActiveSource::Sentence(player) => player.stop(device),
            ActiveSource::PcmClip(player) => player.stop(device),
            ActiveSource::Tone(player) => player.stop(device),
        }
    }

    pub fn is_running(&self) -> bool {
        match self {
            ActiveSource::Fragment(player) => player.is_running(),
            ActiveSource::Sentence(player) => player.is_running(),
            ActiveSource::PcmClip(player) => player.is_running(),
            ActiveSource::Tone(player) => player.is_running(),
        }
    }
}

/// Pushes one frame, retrying up to `retries` times and letting the device
/// drain between attempts.
pub(crate) fn push_frame<D: OutputDevice>(device: &mut D, frame: Frame, retries: u8) -> Result<()> {
    if device.consume_sample(frame) {
        return Ok(());
    }
    for _ in 0..retries {
        device.pump();
        if device.consume_sample(frame) {
            return Ok(());
        }
    }
    Err(crate::DomeError::BufferStall {
        attempts: retries.saturating_add(1),
    })
}

/// Rate-limited logging of output stalls.
#[derive(Debug, Default, Clone)]
pub(crate) struct StallLog {
    consecutive: u32,
    total: u64,
}

impl StallLog {
    pub(crate) fn stalled(&mut self, source: SourceKind, position: u64, err: &crate::DomeError) {
        self.consecutive += 1;
        self.total += 1;
        if self.consecutive == 1 || self.consecutive % 16 == 0 {
            tracing::debug!(
                ?source,
                position,
                %err,
                consecutive = self.consecutive,
                "output buffer stalled, deferring to next tick"
            );
        }
    }

    pub(crate) fn cleared(&mut self) {
        self.consecutive = 0;
    }

    pub(crate) fn total(&self) -> u64 {
        self.total
    }
}

/// Configures the device for interleaved 16-bit stereo at `sample_rate`.
pub(crate) fn configure_device<D: OutputDevice>(device: &mut D, sample_rate: u32) -> Result<()> {
    device.set_sample_rate(sample_rate);
    device.set_bits_per_sample(16);
    device.set_channels(2);
    if device.begin() {
        Ok(())
    } else {
        Err(crate::DomeError::DeviceNotReady)
    }
}
