use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Top-level configuration structure for the core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub fade: FadeConfig,
    pub audio: AudioConfig,
    pub proximity: ProximityConfig,
}

impl EngineConfig {
    /// Parses a (possibly partial) JSON document; missing fields keep their
    /// defaults.
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

/// Timer pool sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub capacity: usize,
    pub min_duration_ms: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            capacity: 60,
            min_duration_ms: 1,
        }
    }
}

/// Crossfade engine tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FadeConfig {
    /// Number of curve coefficients, and therefore timer firings, per fade.
    pub steps: usize,
    /// Exponent applied to the quarter-sine easing; values below 1 are raised
    /// to 1.
    pub shape_exponent: f32,
    /// Stop requests at or below this fade length silence immediately.
    pub hard_stop_threshold_ms: u32,
    /// Fade used when a sentence preempts a fragment.
    pub preempt_fade_ms: u32,
}

impl Default for FadeConfig {
    fn default() -> Self {
        Self {
            steps: 15,
            shape_exponent: 2.0,
            hard_stop_threshold_ms: 40,
            preempt_fade_ms: 300,
        }
    }
}

/// Configuration specific to the audio output path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Device base level, the first factor of the gain product.
    pub base_level: f32,
    pub pcm_batch_frames: usize,
    pub decode_batch_frames: usize,
    pub tone_batch_frames: usize,
    /// Extra `consume_sample` attempts per pump before deferring to the next
    /// tick.
    pub stall_retries: u8,
    pub meter_interval_ms: u32,
    pub meter_window: usize,
    pub tone_sample_rate: u32,
    pub clip_sample_rate: u32,
    /// Initialisation attempts tolerated silently before each retry is logged.
    pub device_init_attempts: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            base_level: 0.8,
            pcm_batch_frames: 96,
            decode_batch_frames: 256,
            tone_batch_frames: 32,
            stall_retries: 6,
            meter_interval_ms: 50,
            meter_window: 512,
            tone_sample_rate: 44_100,
            clip_sample_rate: 22_050,
            device_init_attempts: 3,
        }
    }
}

/// Distance-to-feedback mapping used by the ping responder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProximityConfig {
    pub min_distance_mm: f32,
    pub max_distance_mm: f32,
    pub min_interval_ms: u32,
    pub max_interval_ms: u32,
    pub volume_near: f32,
    pub volume_far: f32,
    pub busy_retry_ms: u32,
    pub ping_amplitude: f32,
    /// A jump at least this large pings almost immediately.
    pub trigger_delta_mm: f32,
    pub trigger_delay_ms: u32,
    /// Interval changes smaller than this keep the running schedule.
    pub interval_epsilon_ms: u32,
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self {
            min_distance_mm: 40.0,
            max_distance_mm: 1000.0,
            min_interval_ms: 160,
            max_interval_ms: 2400,
            volume_near: 1.0,
            volume_far: 0.35,
            busy_retry_ms: 120,
            ping_amplitude: 0.6,
            trigger_delta_mm: 90.0,
            trigger_delay_ms: 35,
            interval_epsilon_ms: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(r#"{ "fade": { "steps": 20 } }"#).unwrap();

        assert_eq!(config.fade.steps, 20);
        assert_eq!(config.fade.hard_stop_threshold_ms, 40);
        assert_eq!(config.scheduler, SchedulerConfig::default());
    }

    #[test]
    fn rejects_malformed_json() {
        let err = EngineConfig::from_json_str("{ fade: ").unwrap_err();
        assert!(format!("{err}").contains("invalid configuration"));
    }
}
