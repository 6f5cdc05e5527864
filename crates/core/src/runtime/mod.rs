//! Explicitly owned context tying the core together.
//!
//! [`Runtime`] owns the timer pool, the audio arbiter and the ping responder.
//! The embedding main loop calls [`Runtime::run_once`] as often as it can;
//! everything else happens inside that call.

use std::collections::VecDeque;

use crate::{
    audio::{AudioArbiter, OutputDevice, SourceRequest},
    config::EngineConfig,
    meter::MeterReading,
    proximity::PingResponder,
    source::PcmClip,
    timeline::{Clock, Scheduler, TimerKey},
    TimerError,
};

/// Unclaimed application timer firings kept before the oldest is dropped.
pub const APP_EVENT_CAPACITY: usize = 64;
const USAGE_REPORT_ITERATIONS: u64 = 10_000;

pub struct Runtime<D: OutputDevice> {
    timers: Scheduler<TimerKey>,
    arbiter: AudioArbiter<D>,
    pings: PingResponder,
    app_events: VecDeque<u16>,
    iterations: u64,
}

impl<D: OutputDevice> Runtime<D> {
    /// Builds the context around a ready-made arbiter and starts device
    /// bring-up and level metering.
    pub fn new(arbiter: AudioArbiter<D>, config: &EngineConfig, clock: impl Clock + 'static) -> Self {
        let mut runtime = Self {
            timers: Scheduler::new(&config.scheduler, clock),
            arbiter,
            pings: PingResponder::new(config.proximity.clone()),
            app_events: VecDeque::with_capacity(APP_EVENT_CAPACITY),
            iterations: 0,
        };
        runtime.arbiter.begin();

        let interval = config.audio.meter_interval_ms;
        if let Err(err) = runtime.timers.create(interval, 0, TimerKey::Meter) {
            tracing::warn!(%err, interval, "level meter timer unavailable");
        }
        runtime
    }

    /// One main-loop iteration: fire due timers, then pump the active
    /// source. Returns the number of timers fired.
    pub fn run_once(&mut self) -> usize {
        let Self {
            timers,
            arbiter,
            pings,
            app_events,
            iterations,
        } = self;

        let fired = timers.tick(|timers, key| match key {
            TimerKey::Audio(timer) => arbiter.on_timer(timers, timer),
            TimerKey::Meter => {
                if let Some(reading) = arbiter.publish_level() {
                    tracing::trace!(
                        level = reading.level,
                        centroid = reading.spectral_centroid,
                        "level published"
                    );
                }
            }
            TimerKey::Ping => pings.on_timer(timers, arbiter),
            TimerKey::App(id) => queue_app_event(app_events, id),
        });
        arbiter.update(timers);

        *iterations += 1;
        if *iterations % USAGE_REPORT_ITERATIONS == 0 && timers.report_usage(false) {
            timers.dump();
        }
        fired
    }

    pub fn request(&mut self, request: SourceRequest) -> bool {
        self.arbiter.request(&mut self.timers, request)
    }

    pub fn stop(&mut self, fade_ms: Option<u32>) {
        self.arbiter.stop(&mut self.timers, fade_ms);
    }

    /// Feeds a distance reading to the ping responder.
    pub fn notify_distance(&mut self, distance_mm: f32) {
        self.pings
            .notify_distance(distance_mm, &mut self.timers, &mut self.arbiter);
    }

    pub fn set_ping_clip(&mut self, clip: Option<PcmClip>) {
        self.pings.set_clip(clip);
    }

    /// Rescales a playing PCM clip. Returns false when no clip is active.
    pub fn set_clip_amplitude(&mut self, amplitude: f32) -> bool {
        self.arbiter.set_clip_amplitude(amplitude)
    }

    pub fn silence_pings(&mut self) {
        self.pings.silence(&mut self.timers, &mut self.arbiter);
    }

    /// Arms an application timer; its firings are queued for
    /// [`take_app_event`](Self::take_app_event). At most
    /// [`APP_EVENT_CAPACITY`] firings are held; older ones are dropped.
    pub fn schedule_app(&mut self, id: u16, duration_ms: u32, repeat: u32) -> Result<(), TimerError> {
        self.timers.restart(duration_ms, repeat, TimerKey::App(id))
    }

    pub fn cancel_app(&mut self, id: u16) {
        self.timers.cancel(TimerKey::App(id));
    }

    pub fn take_app_event(&mut self) -> Option<u16> {
        self.app_events.pop_front()
    }

    /// Last published output level, for the lighting layer.
    pub fn level(&self) -> MeterReading {
        self.arbiter.level()
    }

    pub fn now_ms(&self) -> u32 {
        self.timers.now_ms()
    }

    pub fn timers(&self) -> &Scheduler<TimerKey> {
        &self.timers
    }

    pub fn arbiter(&self) -> &AudioArbiter<D> {
        &self.arbiter
    }

    pub fn arbiter_mut(&mut self) -> &mut AudioArbiter<D> {
        &mut self.arbiter
    }

    pub fn pings(&self) -> &PingResponder {
        &self.pings
    }
}

fn queue_app_event(queue: &mut VecDeque<u16>, id: u16) {
    if queue.len() >= APP_EVENT_CAPACITY {
        if let Some(dropped) = queue.pop_front() {
            tracing::warn!(dropped, id, "application event queue full; dropping oldest");
        }
    }
    queue.push_back(id);
}

impl<D: OutputDevice> std::fmt::Debug for Runtime<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("now_ms", &self.timers.now_ms())
            .field("active_timers", &self.timers.active_count())
            .field("arbiter", &self.arbiter)
            .field("pings", &self.pings.pings())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::MemoryDevice,
        source::{wav_bytes, FragmentDescriptor, ItemId, MemoryStore, SourceKind, ToneProfile},
        timeline::ManualClock,
    };

    fn runtime(clock: &ManualClock) -> Runtime<MemoryDevice> {
        let mut config = EngineConfig::default();
        config.audio.base_level = 1.0;
        config.audio.stall_retries = 0;

        let mut store = MemoryStore::new();
        store.insert(ItemId::new(2, 7), wav_bytes(1, 1_000, &vec![4_000; 5_000]));
        let arbiter = AudioArbiter::new(MemoryDevice::new().with_capacity(1), &config).with_store(store);
        Runtime::new(arbiter, &config, clock.clone())
    }

    fn run_for(runtime: &mut Runtime<MemoryDevice>, clock: &ManualClock, ms: u32) {
        for _ in 0..ms {
            clock.advance(1);
            runtime.run_once();
        }
    }

    #[test]
    fn device_comes_up_on_the_first_iteration() {
        let clock = ManualClock::new();
        let mut runtime = runtime(&clock);
        assert!(!runtime.request(SourceRequest::Tone(ToneProfile::default())));

        runtime.run_once();
        assert!(runtime.request(SourceRequest::Tone(ToneProfile::default())));
        assert!(runtime.arbiter().is_tone_active());
    }

    #[test]
    fn fragment_plays_through_and_meters() {
        let clock = ManualClock::new();
        let mut runtime = runtime(&clock);
        runtime.run_once();

        let descriptor = FragmentDescriptor {
            item: ItemId::new(2, 7),
            start_offset_ms: 0,
            duration_ms: 1_000,
            fade_ms: 100,
        };
        assert!(runtime.request(SourceRequest::Fragment(descriptor)));

        run_for(&mut runtime, &clock, 500);
        assert!(runtime.arbiter().is_fragment_playing());
        let level = runtime.level();
        assert!(level.level_raw > 3_000, "{level:?}");

        run_for(&mut runtime, &clock, 600);
        assert_eq!(runtime.arbiter().active_kind(), SourceKind::None);
        assert_eq!(runtime.level(), MeterReading::default());
        // Only the meter is left running.
        assert_eq!(runtime.timers().active_count(), 1);
    }

    #[test]
    fn distance_drives_pings() {
        let clock = ManualClock::new();
        let mut runtime = runtime(&clock);
        runtime.run_once();

        runtime.notify_distance(40.0);
        run_for(&mut runtime, &clock, 160);
        assert_eq!(runtime.pings().pings(), 1);
        assert!(runtime.arbiter().is_tone_active());

        runtime.notify_distance(5_000.0);
        assert!(!runtime.timers().is_active(TimerKey::Ping));
    }

    #[test]
    fn app_timers_are_queued_in_order() {
        let clock = ManualClock::new();
        let mut runtime = runtime(&clock);
        runtime.schedule_app(3, 20, 1).unwrap();
        runtime.schedule_app(1, 10, 2).unwrap();

        run_for(&mut runtime, &clock, 20);
        let events: Vec<_> = std::iter::from_fn(|| runtime.take_app_event()).collect();
        assert_eq!(events, vec![1, 3, 1]);

        runtime.schedule_app(5, 10, 0).unwrap();
        runtime.cancel_app(5);
        run_for(&mut runtime, &clock, 20);
        assert_eq!(runtime.take_app_event(), None);
    }

    #[test]
    fn unclaimed_app_events_keep_only_the_newest() {
        let clock = ManualClock::new();
        let mut runtime = runtime(&clock);
        runtime.schedule_app(9, 1, 0).unwrap();

        let firings = APP_EVENT_CAPACITY as u32 + 36;
        run_for(&mut runtime, &clock, firings);
        runtime.cancel_app(9);

        let events: Vec<_> = std::iter::from_fn(|| runtime.take_app_event()).collect();
        assert_eq!(events.len(), APP_EVENT_CAPACITY);
        assert!(events.iter().all(|&id| id == 9));
    }

    #[test]
    fn app_event_queue_drops_the_oldest_first() {
        let mut queue = VecDeque::new();
        for id in 0..APP_EVENT_CAPACITY as u16 + 2 {
            queue_app_event(&mut queue, id);
        }
        assert_eq!(queue.len(), APP_EVENT_CAPACITY);
        assert_eq!(queue.front(), Some(&2));
        assert_eq!(queue.back(), Some(&(APP_EVENT_CAPACITY as u16 + 1)));
    }

    #[test]
    fn playing_clip_can_be_rescaled() {
        let clock = ManualClock::new();
        let mut runtime = runtime(&clock);
        runtime.run_once();
        assert!(!runtime.set_clip_amplitude(0.5));

        let clip = crate::source::PcmClip::from_samples(vec![1_000; 4_000], 8_000).unwrap();
        let request = SourceRequest::PcmClip {
            clip,
            amplitude: 1.0,
            max_ms: None,
        };
        assert!(runtime.request(request));
        assert!(runtime.set_clip_amplitude(0.5));
    }
}
