//! Audio core for the sensor-reactive dome installation.
//!
//! Everything runs cooperatively from a single main loop: a software timer
//! pool ([`timeline`]) drives fades, metering and proximity pings, and an
//! [`audio::AudioArbiter`] decides which of the four source kinds owns the
//! one output device. [`runtime::Runtime`] bundles both for embedders.

pub mod audio;
pub mod config;
pub mod error;
pub mod fade;
pub mod meter;
pub mod proximity;
pub mod runtime;
pub mod source;
pub mod timeline;

pub use audio::{AudioArbiter, DeviceState, GainStage, MemoryDevice, OutputDevice, SourceRequest};
pub use config::EngineConfig;
pub use error::{DomeError, Result, TimerError};
pub use fade::{CrossfadeEngine, FadeCurve};
pub use meter::{LevelMeter, MeterReading};
pub use proximity::{PingResponder, ProximityPolicy};
pub use runtime::Runtime;
pub use source::{FragmentDescriptor, ItemId, PcmClip, SourceKind, ToneProfile};
pub use timeline::{Clock, ManualClock, MonotonicClock, Scheduler, TimerKey};
