//! Distance-driven acoustic feedback.
//!
//! [`ProximityPolicy`] turns a distance reading into a ping interval, a
//! playback volume and a tone. [`PingResponder`] keeps the `Ping` timer in
//! step with the latest reading and plays the ping through the arbiter.

use serde::{Deserialize, Serialize};

use crate::{
    audio::{AudioArbiter, OutputDevice},
    config::ProximityConfig,
    source::{PcmClip, ToneProfile},
    timeline::{Scheduler, TimerKey},
};

const PING_DURATION_MS: f32 = 340.0;
const NOISE_NEAR: f32 = 0.24;
const NOISE_FAR: f32 = 0.08;

/// Pure mapping from distance to feedback parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ProximityPolicy {
    config: ProximityConfig,
}

impl ProximityPolicy {
    pub fn new(config: ProximityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProximityConfig {
        &self.config
    }

    /// 0.0 at the near end of the range, 1.0 at the far end. Readings that
    /// are non-positive or beyond the range yield `None`.
    pub fn normalized(&self, distance_mm: f32) -> Option<f32> {
        let ProximityConfig {
            min_distance_mm: near,
            max_distance_mm: far,
            ..
        } = self.config;
        if !distance_mm.is_finite() || distance_mm <= 0.0 || distance_mm > far {
            return None;
        }
        let span = far - near;
        if span <= 0.0 {
            return Some(0.0);
        }
        Some((distance_mm.clamp(near, far) - near) / span)
    }

    pub fn interval_ms(&self, distance_mm: f32) -> Option<u32> {
        let t = self.normalized(distance_mm)?;
        let min = self.config.min_interval_ms as f32;
        let max = self.config.max_interval_ms as f32;
        let interval = (min + t * (max - min)).round() as u32;
        Some(interval.clamp(
            self.config.min_interval_ms,
            self.config.max_interval_ms.max(self.config.min_interval_ms),
        ))
    }

    pub fn volume(&self, distance_mm: f32) -> Option<f32> {
        let t = self.normalized(distance_mm)?;
        let volume = self.config.volume_near + t * (self.config.volume_far - self.config.volume_near);
        Some(volume.clamp(0.0, 1.0))
    }

    /// Closer readings ping higher, louder and noisier.
    pub fn tone_profile(&self, distance_mm: f32) -> Option<ToneProfile> {
        let t = self.normalized(distance_mm)?;
        let closeness = 1.0 - t;
        Some(ToneProfile {
            start_hz: 480.0 - t * 80.0,
            end_hz: 980.0 + closeness * 380.0,
            duration_ms: PING_DURATION_MS,
            amplitude: 0.18 + closeness * 0.62,
            noise: NOISE_FAR + closeness * (NOISE_NEAR - NOISE_FAR),
        })
    }

    /// Fade used to clear a fragment out of the way of the ping cadence.
    pub fn fade_for_interval(interval_ms: u32) -> u32 {
        interval_ms.clamp(100, 5_000)
    }
}

/// Current ping schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PingSchedule {
    pub distance_mm: f32,
    pub interval_ms: u32,
    pub volume: f32,
    pub profile: ToneProfile,
}

/// Keeps pinging at the cadence of the latest distance reading.
#[derive(Debug)]
pub struct PingResponder {
    policy: ProximityPolicy,
    clip: Option<PcmClip>,
    schedule: Option<PingSchedule>,
    pings: u32,
}

impl PingResponder {
    pub fn new(config: ProximityConfig) -> Self {
        Self {
            policy: ProximityPolicy::new(config),
            clip: None,
            schedule: None,
            pings: 0,
        }
    }

    pub fn policy(&self) -> &ProximityPolicy {
        &self.policy
    }

    /// Plays `clip` instead of a synthesized tone.
    pub fn set_clip(&mut self, clip: Option<PcmClip>) {
        if let Some(clip) = &clip {
            tracing::info!(duration_ms = clip.duration_ms(), "ping clip registered");
        }
        self.clip = clip;
    }

    pub fn schedule(&self) -> Option<&PingSchedule> {
        self.schedule.as_ref()
    }

    pub fn pings(&self) -> u32 {
        self.pings
    }

    /// Feeds a new reading. Out-of-range readings silence the responder.
    pub fn notify_distance<D: OutputDevice>(
        &mut self,
        distance_mm: f32,
        timers: &mut Scheduler<TimerKey>,
        arbiter: &mut AudioArbiter<D>,
    ) {
        let (Some(interval_ms), Some(volume), Some(profile)) = (
            self.policy.interval_ms(distance_mm),
            self.policy.volume(distance_mm),
            self.policy.tone_profile(distance_mm),
        ) else {
            if self.schedule.is_some() {
                tracing::debug!(distance_mm, "distance out of range, ping silenced");
            }
            self.silence(timers, arbiter);
            return;
        };

        let config = self.policy.config();
        let previous = self.schedule;
        let reschedule = previous.map_or(true, |prev| {
            prev.interval_ms.abs_diff(interval_ms) >= config.interval_epsilon_ms
        });
        let immediate = previous.is_some_and(|prev| {
            (distance_mm - prev.distance_mm).abs() >= config.trigger_delta_mm
        });
        let delay_ms = if immediate {
            config.trigger_delay_ms
        } else {
            interval_ms
        };

        // Small drifts keep the armed cadence until they add up to epsilon.
        let interval_ms = match previous {
            Some(prev) if !reschedule => prev.interval_ms,
            _ => interval_ms,
        };
        self.schedule = Some(PingSchedule {
            distance_mm,
            interval_ms,
            volume,
            profile,
        });
        if !(reschedule || immediate) {
            return;
        }

        if arbiter.is_fragment_playing() {
            arbiter.stop(timers, Some(ProximityPolicy::fade_for_interval(interval_ms)));
        }
        match timers.restart(delay_ms, 1, TimerKey::Ping) {
            Ok(()) => tracing::debug!(distance_mm, interval_ms, delay_ms, "ping scheduled"),
            Err(err) => tracing::warn!(%err, "ping timer unavailable"),
        }
    }

    /// Handles the `Ping` timer.
    pub fn on_timer<D: OutputDevice>(
        &mut self,
        timers: &mut Scheduler<TimerKey>,
        arbiter: &mut AudioArbiter<D>,
    ) {
        let Some(schedule) = self.schedule else {
            return;
        };
        let config = self.policy.config();

        let next_ms = if arbiter.is_fragment_playing() || arbiter.is_sentence_playing() {
            tracing::debug!("audio busy, ping postponed");
            config.busy_retry_ms
        } else {
            arbiter.cap_volume(schedule.volume);
            let started = match &self.clip {
                Some(clip) => arbiter.play_pcm_clip(timers, clip.clone(), config.ping_amplitude),
                None => arbiter.play_tone(timers, schedule.profile),
            };
            if started {
                self.pings += 1;
            }
            schedule.interval_ms
        };

        if let Err(err) = timers.restart(next_ms, 1, TimerKey::Ping) {
            tracing::warn!(%err, "ping timer unavailable");
        }
    }

    /// Stops pinging and lifts the volume cap.
    pub fn silence<D: OutputDevice>(
        &mut self,
        timers: &mut Scheduler<TimerKey>,
        arbiter: &mut AudioArbiter<D>,
    ) {
        timers.cancel(TimerKey::Ping);
        if self.schedule.take().is_some() {
            arbiter.cap_volume(1.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::MemoryDevice,
        config::{EngineConfig, SchedulerConfig},
        source::{wav_bytes, CannedSpeech, FragmentDescriptor, ItemId, MemoryStore},
        timeline::ManualClock,
    };

    fn policy() -> ProximityPolicy {
        ProximityPolicy::new(ProximityConfig::default())
    }

    #[test]
    fn interval_spans_the_configured_range() {
        let policy = policy();
        assert_eq!(policy.interval_ms(40.0), Some(160));
        assert_eq!(policy.interval_ms(520.0), Some(1_280));
        assert_eq!(policy.interval_ms(1_000.0), Some(2_400));
        assert_eq!(policy.interval_ms(10.0), Some(160));
        assert_eq!(policy.interval_ms(0.0), None);
        assert_eq!(policy.interval_ms(1_000.5), None);
        assert_eq!(policy.interval_ms(f32::NAN), None);
    }

    #[test]
    fn closer_is_louder_and_higher() {
        let policy = policy();
        assert_eq!(policy.volume(40.0), Some(1.0));
        assert!((policy.volume(1_000.0).unwrap() - 0.35).abs() < 1e-6);

        let near = policy.tone_profile(40.0).unwrap();
        let far = policy.tone_profile(1_000.0).unwrap();
        assert!(near.end_hz > far.end_hz);
        assert!(near.start_hz > far.start_hz);
        assert!(near.amplitude > far.amplitude);
        assert!((near.amplitude - 0.8).abs() < 1e-6);
        assert!((far.end_hz - 980.0).abs() < 1e-3);
    }

    #[test]
    fn preemption_fade_is_bounded() {
        assert_eq!(ProximityPolicy::fade_for_interval(20), 100);
        assert_eq!(ProximityPolicy::fade_for_interval(1_280), 1_280);
        assert_eq!(ProximityPolicy::fade_for_interval(9_000), 5_000);
    }

    struct Rig {
        clock: ManualClock,
        timers: Scheduler<TimerKey>,
        arbiter: AudioArbiter<MemoryDevice>,
        responder: PingResponder,
    }

    impl Rig {
        fn new() -> Self {
            let config = EngineConfig::default();
            let mut store = MemoryStore::new();
            store.insert(ItemId::new(1, 1), wav_bytes(1, 1_000, &vec![100; 20_000]));
            let clock = ManualClock::new();
            let mut rig = Self {
                timers: Scheduler::new(&SchedulerConfig::default(), clock.clone()),
                clock,
                arbiter: AudioArbiter::new(MemoryDevice::new(), &config)
                    .with_store(store)
                    .with_speech(CannedSpeech::audio(&vec![100; 5_000])),
                responder: PingResponder::new(config.proximity),
            };
            rig.arbiter.begin();
            rig.arbiter.update(&mut rig.timers);
            rig
        }

        fn notify(&mut self, distance_mm: f32) {
            self.responder
                .notify_distance(distance_mm, &mut self.timers, &mut self.arbiter);
        }

        /// Ticks timers only; sources are not pumped, so they stay active.
        fn tick_for(&mut self, ms: u32) {
            for _ in 0..ms {
                self.clock.advance(1);
                let Self {
                    timers,
                    arbiter,
                    responder,
                    ..
                } = self;
                timers.tick(|timers, key| match key {
                    TimerKey::Ping => responder.on_timer(timers, arbiter),
                    TimerKey::Audio(timer) => arbiter.on_timer(timers, timer),
                    _ => {}
                });
            }
        }
    }

    #[test]
    fn pings_at_the_distance_interval() {
        let mut rig = Rig::new();
        rig.notify(520.0);
        assert_eq!(rig.timers.remaining_ms(TimerKey::Ping), Some(1_280));

        rig.tick_for(1_279);
        assert!(!rig.arbiter.is_tone_active());
        rig.tick_for(1);
        assert!(rig.arbiter.is_tone_active());
        assert_eq!(rig.responder.pings(), 1);
        assert_eq!(rig.timers.remaining_ms(TimerKey::Ping), Some(1_280));
        let cap = rig.arbiter.gain().ceiling();
        assert!((cap - rig.responder.policy().volume(520.0).unwrap()).abs() < 1e-6);
    }

    #[test]
    fn small_changes_keep_the_schedule_and_jumps_ping_soon() {
        let mut rig = Rig::new();
        rig.notify(520.0);
        rig.tick_for(500);
        rig.notify(525.0);
        assert_eq!(rig.timers.remaining_ms(TimerKey::Ping), Some(780));

        rig.notify(200.0);
        assert_eq!(rig.timers.remaining_ms(TimerKey::Ping), Some(35));
    }

    #[test]
    fn busy_audio_postpones_the_ping() {
        let mut rig = Rig::new();
        assert!(rig.arbiter.start_sentence(&mut rig.timers, "hallo"));
        rig.notify(40.0);
        rig.tick_for(160);
        assert!(rig.arbiter.is_sentence_playing());
        assert_eq!(rig.responder.pings(), 0);
        assert_eq!(rig.timers.remaining_ms(TimerKey::Ping), Some(120));
    }

    #[test]
    fn arming_fades_out_a_fragment() {
        let mut rig = Rig::new();
        let descriptor = FragmentDescriptor {
            item: ItemId::new(1, 1),
            start_offset_ms: 0,
            duration_ms: 10_000,
            fade_ms: 100,
        };
        assert!(rig.arbiter.start_fragment(&mut rig.timers, descriptor));
        rig.tick_for(1_000);

        rig.notify(40.0);
        assert!(rig.timers.is_active(crate::timeline::AudioTimer::FadeOut.into()));
        rig.tick_for(160);
        assert!(!rig.arbiter.is_fragment_playing());
        assert_eq!(rig.responder.pings(), 1);
    }

    #[test]
    fn out_of_range_silences_and_lifts_the_cap() {
        let mut rig = Rig::new();
        rig.notify(1_000.0);
        rig.tick_for(2_400);
        assert!(rig.arbiter.gain().ceiling() < 0.5);

        rig.notify(1_500.0);
        assert!(!rig.timers.is_active(TimerKey::Ping));
        assert_eq!(rig.arbiter.gain().ceiling(), 1.0);
        assert!(rig.responder.schedule().is_none());
    }
}
