use std::{io::Read, time::Duration};

use dome_core::{
    source::{voice_rss_url, ByteSource, ProbeResponse, SpeechService},
    DomeError, Result,
};
use reqwest::{
    blocking::Client,
    header::{CONTENT_TYPE, RANGE},
    Url,
};

pub const API_KEY_VAR: &str = "VOICERSS_API_KEY";
const PROBE_BYTES: u64 = 64;

/// VoiceRSS text-to-speech over blocking HTTP.
pub struct VoiceRssService {
    client: Client,
    api_key: String,
    language: String,
    voice: String,
}

impl VoiceRssService {
    /// Reads the API key from the environment.
    pub fn from_env(language: &str, voice: &str) -> Result<Self> {
        let api_key = std::env::var(API_KEY_VAR)
            .map_err(|_| DomeError::msg(format!("{API_KEY_VAR} is not set")))?;
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(remote)?;
        Ok(Self {
            client,
            api_key,
            language: language.to_string(),
            voice: voice.to_string(),
        })
    }

    fn url(&self, text: &str) -> Result<Url> {
        voice_rss_url(&self.api_key, &self.language, &self.voice, text)
    }
}

impl SpeechService for VoiceRssService {
    fn probe(&mut self, text: &str) -> Result<ProbeResponse> {
        let response = self
            .client
            .get(self.url(text)?)
            .header(RANGE, format!("bytes=0-{}", PROBE_BYTES - 1))
            .send()
            .map_err(remote)?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let mut head = Vec::with_capacity(PROBE_BYTES as usize);
        response.take(PROBE_BYTES).read_to_end(&mut head)?;
        tracing::debug!(status, content_type = %content_type, bytes = head.len(), "speech probe answered");

        Ok(ProbeResponse {
            status,
            content_type,
            head,
        })
    }

    fn open(&mut self, text: &str) -> Result<ByteSource> {
        let response = self
            .client
            .get(self.url(text)?)
            .send()
            .and_then(|response| response.error_for_status())
            .map_err(remote)?;
        Ok(Box::new(response))
    }
}

fn remote(err: reqwest::Error) -> DomeError {
    DomeError::Remote(err.to_string())
}
