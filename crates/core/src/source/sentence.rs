//! Remote text-to-speech playback.
//!
//! A sentence is probed before anything is allocated: the arbiter calls
//! [`preflight`] first and only opens the stream and builds a decoder once the
//! remote side has answered with audio.

use serde::{Deserialize, Serialize};
use url::Url;

use super::{
    configure_device,
    decode::{DecodePump, Decoder},
    ByteSource, SourceKind, SourcePlayer,
};
use crate::{audio::OutputDevice, config::AudioConfig, DomeError, Result};

const VOICE_RSS_ENDPOINT: &str = "https://api.voicerss.org/";
const ERROR_MARKER: &[u8] = b"ERROR";

/// First look at a remote response: status, content type and the first
/// bytes of the body.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProbeResponse {
    pub status: u16,
    pub content_type: String,
    pub head: Vec<u8>,
}

impl ProbeResponse {
    pub fn is_audio(&self) -> bool {
        matches!(self.status, 200 | 206) && self.content_type.starts_with("audio/")
    }

    /// The body carries an explicit error marker instead of audio.
    pub fn error_text(&self) -> Option<String> {
        self.head
            .starts_with(ERROR_MARKER)
            .then(|| String::from_utf8_lossy(&self.head).trim().to_string())
    }

    pub fn check(&self) -> Result<()> {
        if let Some(text) = self.error_text() {
            return Err(DomeError::Remote(text));
        }
        if self.is_audio() {
            return Ok(());
        }
        Err(DomeError::Remote(format!(
            "HTTP {} CT:{}",
            self.status, self.content_type
        )))
    }
}

/// A remote text-to-speech endpoint.
pub trait SpeechService {
    /// Issues a lightweight request and returns the response head.
    fn probe(&mut self, text: &str) -> Result<ProbeResponse>;
    /// Opens the audio stream for `text`.
    fn open(&mut self, text: &str) -> Result<ByteSource>;
}

/// Probes `text` and accepts it only when the service answers with audio.
pub fn preflight(service: &mut dyn SpeechService, text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(DomeError::InvalidInput("sentence text is empty"));
    }
    let response = service.probe(text)?;
    response.check().map_err(|err| {
        tracing::warn!(status = response.status, content_type = %response.content_type, %err, "sentence pre-flight failed");
        err
    })
}

/// Request URL for the VoiceRSS API, asking for 16-bit mono WAV.
pub fn voice_rss_url(api_key: &str, language: &str, voice: &str, text: &str) -> Result<Url> {
    Ok(Url::parse_with_params(
        VOICE_RSS_ENDPOINT,
        &[
            ("key", api_key),
            ("hl", language),
            ("v", voice),
            ("c", "WAV"),
            ("f", "44khz_16bit_mono"),
            ("src", text),
        ],
    )?)
}

/// Streams a decoded sentence until the remote stream ends.
#[derive(Debug)]
pub struct SentenceStreamer {
    stream: DecodePump,
    text: Option<String>,
}

/// Input for [`SentenceStreamer::begin`].
pub struct SentenceSource {
    pub text: String,
    pub decoder: Box<dyn Decoder>,
}

impl SentenceStreamer {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            stream: DecodePump::new(SourceKind::Sentence, config),
            text: None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }
}

impl SourcePlayer for SentenceStreamer {
    type Input = SentenceSource;

    fn begin<D: OutputDevice>(&mut self, input: SentenceSource, device: &mut D) -> Result<()> {
        configure_device(device, input.decoder.sample_rate())?;
        self.stream.start(input.decoder, None);
        tracing::info!(text = %input.text, "sentence started");
        self.text = Some(input.text);
        Ok(())
    }

    fn pump<D: OutputDevice>(&mut self, device: &mut D) -> bool {
        self.stream.pump(device)
    }

    fn stop<D: OutputDevice>(&mut self, device: &mut D) {
        if self.stream.is_open() {
            device.flush();
        }
        self.stream.close();
        self.text = None;
    }

    fn is_running(&self) -> bool {
        self.stream.is_open()
    }
}
