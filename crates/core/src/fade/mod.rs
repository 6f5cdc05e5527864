//! Crossfade engine.
//!
//! A fade is a sequence of scheduler firings, each of which looks up the next
//! curve coefficient and pushes it through the gain stage as the fade factor.
//! For a play duration `D` and requested fade `F`:
//!
//! ```text
//!   0 ──fade-in (ef)──▶ ef ──sustain (D−2ef)──▶ D−ef ──fade-out (ef)──▶ D
//! ```
//!
//! with `ef = min(F, D/2)`. A stop request fades out from the mirror of the
//! last applied coefficient, so the level never jumps.

mod curve;

use std::cell::OnceCell;

pub use curve::FadeCurve;

use crate::{
    audio::{GainStage, OutputDevice},
    config::FadeConfig,
    timeline::{AudioTimer, Scheduler, TimerKey},
};

/// Timing derived from a play duration and a requested fade length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FadePlan {
    pub duration_ms: u32,
    pub effective_ms: u32,
    pub step_ms: u32,
    /// Full-level time between the end of fade-in and the start of fade-out.
    pub sustain_ms: u32,
}

impl FadePlan {
    pub fn new(duration_ms: u32, requested_fade_ms: u32, steps: usize) -> Self {
        let effective_ms = requested_fade_ms.min(duration_ms / 2);
        Self {
            duration_ms,
            effective_ms,
            step_ms: step_interval(effective_ms, steps),
            sustain_ms: duration_ms.saturating_sub(effective_ms.saturating_mul(2)),
        }
    }
}

fn step_interval(fade_ms: u32, steps: usize) -> u32 {
    (fade_ms / steps.max(1) as u32).max(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadePhase {
    FadingIn,
    Sustaining,
    FadingOut,
}

/// Transient state of the fade applied to the active source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FadeSession {
    pub effective_ms: u32,
    pub step_ms: u32,
    pub sustain_ms: u32,
    pub in_index: usize,
    pub out_step: usize,
    /// Curve index most recently pushed to the gain stage.
    pub last_index: usize,
    pub phase: FadePhase,
}

/// Outcome of a fade timer firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeEvent {
    Continue,
    /// Fade-out reached silence; the arbiter must finalize playback.
    Finished,
}

/// What a stop request turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Fading,
    /// The caller must silence and finalize immediately.
    HardStop,
}

#[derive(Debug)]
pub struct CrossfadeEngine {
    config: FadeConfig,
    curve: OnceCell<FadeCurve>,
    session: Option<FadeSession>,
}

impl CrossfadeEngine {
    pub fn new(config: FadeConfig) -> Self {
        Self {
            config,
            curve: OnceCell::new(),
            session: None,
        }
    }

    /// The shared easing table, built on first use.
    pub fn curve(&self) -> &FadeCurve {
        self.curve
            .get_or_init(|| FadeCurve::build(self.config.steps, self.config.shape_exponent))
    }

    pub fn steps(&self) -> usize {
        self.curve().len()
    }

    pub fn plan(&self, duration_ms: u32, requested_fade_ms: u32) -> FadePlan {
        FadePlan::new(duration_ms, requested_fade_ms, self.steps())
    }

    pub fn session(&self) -> Option<&FadeSession> {
        self.session.as_ref()
    }

    pub fn phase(&self) -> Option<FadePhase> {
        self.session.as_ref().map(|s| s.phase)
    }

    /// Opens a session that fades in from silence according to `plan`.
    ///
    /// Timer shortages degrade the fade rather than the playback: without a
    /// fade-in timer the source plays at full level, without a sustain timer
    /// it plays until its own end.
    pub fn start_session<D: OutputDevice>(
        &mut self,
        plan: FadePlan,
        timers: &mut Scheduler<TimerKey>,
        gain: &mut GainStage,
        device: &mut D,
    ) {
        self.cancel_timers(timers);
        let steps = self.steps();
        let top = steps - 1;

        if plan.effective_ms == 0 {
            gain.set_fade_factor(1.0, device);
            self.session = Some(FadeSession {
                effective_ms: 0,
                step_ms: plan.step_ms,
                sustain_ms: plan.sustain_ms,
                in_index: steps,
                out_step: 0,
                last_index: top,
                phase: FadePhase::Sustaining,
            });
            tracing::debug!(duration_ms = plan.duration_ms, "fade disabled for this session");
            return;
        }

        gain.set_fade_factor(0.0, device);
        self.session = Some(FadeSession {
            effective_ms: plan.effective_ms,
            step_ms: plan.step_ms,
            sustain_ms: plan.sustain_ms,
            in_index: 0,
            out_step: 0,
            last_index: 0,
            phase: FadePhase::FadingIn,
        });

        if let Err(err) = timers.create(plan.step_ms, steps as u32, AudioTimer::FadeIn.into()) {
            tracing::warn!(%err, "fade-in timer unavailable, playing at full level");
            gain.set_fade_factor(1.0, device);
            if let Some(session) = self.session.as_mut() {
                session.in_index = steps;
                session.last_index = top;
                session.phase = FadePhase::Sustaining;
            }
            let until_fade_out = plan.duration_ms.saturating_sub(plan.effective_ms);
            self.arm_sustain(until_fade_out, timers);
        }

        tracing::debug!(
            duration_ms = plan.duration_ms,
            fade_ms = plan.effective_ms,
            step_ms = plan.step_ms,
            sustain_ms = plan.sustain_ms,
            "fade session started"
        );
    }

    /// Opens a session already at full level, so a later stop can still fade.
    pub fn start_full_level<D: OutputDevice>(
        &mut self,
        fade_out_ms: u32,
        timers: &mut Scheduler<TimerKey>,
        gain: &mut GainStage,
        device: &mut D,
    ) {
        self.cancel_timers(timers);
        let steps = self.steps();
        gain.set_fade_factor(1.0, device);
        self.session = Some(FadeSession {
            effective_ms: fade_out_ms,
            step_ms: step_interval(fade_out_ms, steps),
            sustain_ms: 0,
            in_index: steps,
            out_step: 0,
            last_index: steps - 1,
            phase: FadePhase::Sustaining,
        });
    }

    /// Handles one of the engine's own timers.
    pub fn on_timer<D: OutputDevice>(
        &mut self,
        timer: AudioTimer,
        timers: &mut Scheduler<TimerKey>,
        gain: &mut GainStage,
        device: &mut D,
    ) -> FadeEvent {
        match timer {
            AudioTimer::FadeIn => self.fade_in_step(timers, gain, device),
            AudioTimer::Sustain => {
                let step_ms = self.session.as_ref().map(|s| s.step_ms).unwrap_or(1);
                self.begin_fade_out(step_ms, timers)
            }
            AudioTimer::FadeOut => self.fade_out_step(timers, gain, device),
            AudioTimer::PcmStop => FadeEvent::Continue,
        }
    }

    /// Turns an explicit stop into a fade-out (or a hard stop).
    ///
    /// `fade_ms` of `None` reuses the session's fade length. Lengths at or
    /// below the hard-stop threshold skip the curve entirely. A fade-out that
    /// is already running keeps its position and is only re-timed.
    pub fn stop(&mut self, fade_ms: Option<u32>, timers: &mut Scheduler<TimerKey>) -> StopOutcome {
        let Some(session) = self.session.as_mut() else {
            return StopOutcome::HardStop;
        };

        let effective = fade_ms.unwrap_or(session.effective_ms);
        if effective <= self.config.hard_stop_threshold_ms {
            tracing::debug!(fade_ms = effective, "stop below fade threshold, silencing");
            return StopOutcome::HardStop;
        }

        let steps = self.curve.get().map(FadeCurve::len).unwrap_or(self.config.steps.max(1));
        let step_ms = step_interval(effective, steps);
        session.effective_ms = effective;
        session.sustain_ms = 0;

        if session.phase == FadePhase::FadingOut {
            if step_ms == session.step_ms {
                return StopOutcome::Fading;
            }
            session.step_ms = step_ms;
            let remaining = steps.saturating_sub(session.out_step).max(1) as u32;
            return match timers.restart(step_ms, remaining, AudioTimer::FadeOut.into()) {
                Ok(()) => StopOutcome::Fading,
                Err(err) => {
                    tracing::warn!(%err, "could not re-time running fade-out");
                    StopOutcome::HardStop
                }
            };
        }

        session.step_ms = step_ms;
        match self.begin_fade_out(step_ms, timers) {
            FadeEvent::Continue => StopOutcome::Fading,
            FadeEvent::Finished => StopOutcome::HardStop,
        }
    }

    /// Cancels every fade timer and forgets the session.
    pub fn reset(&mut self, timers: &mut Scheduler<TimerKey>) {
        self.cancel_timers(timers);
        self.session = None;
    }

    fn fade_in_step<D: OutputDevice>(
        &mut self,
        timers: &mut Scheduler<TimerKey>,
        gain: &mut GainStage,
        device: &mut D,
    ) -> FadeEvent {
        let curve = self
            .curve
            .get_or_init(|| FadeCurve::build(self.config.steps, self.config.shape_exponent));
        let steps = curve.len();
        let Some(session) = self.session.as_mut() else {
            timers.cancel(AudioTimer::FadeIn.into());
            return FadeEvent::Continue;
        };
        if session.phase != FadePhase::FadingIn {
            timers.cancel(AudioTimer::FadeIn.into());
            return FadeEvent::Continue;
        }

        let index = session.in_index.min(steps - 1);
        let factor = curve.fade_in(index);
        gain.set_fade_factor(factor, device);
        session.last_index = index;
        session.in_index += 1;
        tracing::trace!(index, factor, gain = gain.current_gain(), "fade-in step");

        if session.in_index < steps {
            return FadeEvent::Continue;
        }

        timers.cancel(AudioTimer::FadeIn.into());
        session.phase = FadePhase::Sustaining;
        let sustain_ms = session.sustain_ms;
        let step_ms = session.step_ms;
        tracing::debug!(sustain_ms, "fade-in complete");

        if sustain_ms > 0 {
            self.arm_sustain(sustain_ms, timers);
            FadeEvent::Continue
        } else {
            self.begin_fade_out(step_ms, timers)
        }
    }

    fn fade_out_step<D: OutputDevice>(
        &mut self,
        timers: &mut Scheduler<TimerKey>,
        gain: &mut GainStage,
        device: &mut D,
    ) -> FadeEvent {
        let curve = self
            .curve
            .get_or_init(|| FadeCurve::build(self.config.steps, self.config.shape_exponent));
        let steps = curve.len();
        let Some(session) = self.session.as_mut() else {
            timers.cancel(AudioTimer::FadeOut.into());
            return FadeEvent::Continue;
        };

        let index = curve.mirror(session.out_step);
        let factor = curve.fade_out(session.out_step);
        gain.set_fade_factor(factor, device);
        session.last_index = index;
        session.out_step += 1;
        tracing::trace!(index, factor, gain = gain.current_gain(), "fade-out step");

        if session.out_step < steps {
            return FadeEvent::Continue;
        }

        timers.cancel(AudioTimer::FadeOut.into());
        tracing::debug!("fade-out complete");
        FadeEvent::Finished
    }

    /// Arms the fade-out from the mirror of the last applied index.
    ///
    /// The session's phase is the single owner of the fade-out: once it is
    /// `FadingOut`, further attempts (a late sustain timer, a repeated stop)
    /// leave the running sequence alone.
    fn begin_fade_out(&mut self, step_ms: u32, timers: &mut Scheduler<TimerKey>) -> FadeEvent {
        let steps = self.steps();
        let Some(session) = self.session.as_mut() else {
            return FadeEvent::Finished;
        };
        if session.phase == FadePhase::FadingOut {
            tracing::debug!("fade-out already armed");
            return FadeEvent::Continue;
        }

        timers.cancel(AudioTimer::FadeIn.into());
        timers.cancel(AudioTimer::Sustain.into());

        session.out_step = (steps - 1).saturating_sub(session.last_index);
        session.phase = FadePhase::FadingOut;
        let remaining = (steps - session.out_step) as u32;

        match timers.restart(step_ms, remaining, AudioTimer::FadeOut.into()) {
            Ok(()) => {
                tracing::debug!(step_ms, from_index = session.last_index, "fade-out started");
                FadeEvent::Continue
            }
            Err(err) => {
                tracing::warn!(%err, "fade-out timer unavailable, stopping immediately");
                FadeEvent::Finished
            }
        }
    }

    fn arm_sustain(&mut self, delay_ms: u32, timers: &mut Scheduler<TimerKey>) {
        if let Err(err) = timers.restart(delay_ms, 1, AudioTimer::Sustain.into()) {
            tracing::warn!(%err, delay_ms, "sustain timer unavailable, playing to the end");
        }
    }

    fn cancel_timers(&self, timers: &mut Scheduler<TimerKey>) {
        timers.cancel(AudioTimer::FadeIn.into());
        timers.cancel(AudioTimer::Sustain.into());
        timers.cancel(AudioTimer::FadeOut.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{audio::MemoryDevice, config::SchedulerConfig, timeline::{Clock, ManualClock}};
    use proptest::prelude::*;

    struct Rig {
        clock: ManualClock,
        timers: Scheduler<TimerKey>,
        engine: CrossfadeEngine,
        gain: GainStage,
        device: MemoryDevice,
        finished_at: Option<u32>,
    }

    impl Rig {
        fn new(capacity: usize) -> Self {
            let clock = ManualClock::new();
            let config = SchedulerConfig {
                capacity,
                min_duration_ms: 1,
            };
            Self {
                timers: Scheduler::new(&config, clock.clone()),
                clock,
                engine: CrossfadeEngine::new(FadeConfig::default()),
                gain: GainStage::new(1.0),
                device: MemoryDevice::new(),
                finished_at: None,
            }
        }

        fn start(&mut self, duration_ms: u32, fade_ms: u32) -> FadePlan {
            let plan = self.engine.plan(duration_ms, fade_ms);
            self.engine
                .start_session(plan, &mut self.timers, &mut self.gain, &mut self.device);
            plan
        }

        fn run_for(&mut self, ms: u32) {
            for _ in 0..ms {
                self.clock.advance(1);
                let Self {
                    timers,
                    engine,
                    gain,
                    device,
                    finished_at,
                    clock,
                } = self;
                timers.tick(|timers, key| {
                    if let TimerKey::Audio(timer) = key {
                        if engine.on_timer(timer, timers, gain, device) == FadeEvent::Finished {
                            finished_at.get_or_insert(clock.now_ms());
                            engine.reset(timers);
                        }
                    }
                });
            }
        }
    }

    #[test]
    fn long_fade_is_clamped_to_half_the_duration() {
        let plan = FadePlan::new(10_000, 6_000, 15);
        assert_eq!(plan.effective_ms, 5_000);
        assert_eq!(plan.step_ms, 333);
        assert_eq!(plan.sustain_ms, 0);
    }

    #[test]
    fn full_session_fades_in_sustains_and_fades_out() {
        let mut rig = Rig::new(8);
        let plan = rig.start(3_000, 150);
        assert_eq!(plan.step_ms, 10);

        rig.run_for(150);
        assert_eq!(rig.engine.phase(), Some(FadePhase::Sustaining));
        assert!((rig.gain.fade_factor() - 1.0).abs() < 1e-6);

        rig.run_for(2_700);
        assert_eq!(rig.engine.phase(), Some(FadePhase::FadingOut));
        rig.run_for(200);

        assert_eq!(rig.finished_at, Some(3_000));
        assert_eq!(rig.gain.fade_factor(), 0.0);
        assert!(!rig.timers.is_active(AudioTimer::FadeOut.into()));
    }

    #[test]
    fn back_to_back_fade_when_no_sustain_remains() {
        let mut rig = Rig::new(8);
        rig.start(300, 1_000);

        rig.run_for(150);
        assert_eq!(rig.engine.phase(), Some(FadePhase::FadingOut));
        assert!(!rig.timers.is_active(AudioTimer::Sustain.into()));
        rig.run_for(200);
        assert!(rig.finished_at.is_some());
    }

    #[test]
    fn stop_mid_fade_in_resumes_from_mirrored_index() {
        let mut rig = Rig::new(8);
        rig.start(10_000, 1_500);
        rig.run_for(500);

        let before = rig.gain.fade_factor();
        let last = rig.engine.session().unwrap().last_index;
        assert_eq!(last, 4);

        assert_eq!(
            rig.engine.stop(Some(1_500), &mut rig.timers),
            StopOutcome::Fading
        );
        rig.run_for(100);

        let history = rig.device.gain_history();
        let first_out = history[history.len() - 1];
        assert_eq!(first_out, before);
        assert!(!rig.timers.is_active(AudioTimer::FadeIn.into()));
    }

    #[test]
    fn short_stop_is_a_hard_stop() {
        let mut rig = Rig::new(8);
        rig.start(10_000, 1_500);
        assert_eq!(rig.engine.stop(Some(40), &mut rig.timers), StopOutcome::HardStop);
    }

    #[test]
    fn sustain_timer_and_stop_arm_fade_out_once() {
        let mut rig = Rig::new(8);
        rig.start(1_000, 150);
        rig.run_for(150);

        assert_eq!(rig.engine.stop(None, &mut rig.timers), StopOutcome::Fading);
        let armed = rig.timers.remaining_ms(AudioTimer::FadeOut.into());
        // The sustain timer is gone, and a second stop keeps the running fade.
        assert!(!rig.timers.is_active(AudioTimer::Sustain.into()));
        assert_eq!(rig.engine.stop(None, &mut rig.timers), StopOutcome::Fading);
        assert_eq!(rig.timers.remaining_ms(AudioTimer::FadeOut.into()), armed);

        rig.run_for(150);
        assert_eq!(rig.finished_at, Some(300));
    }

    #[test]
    fn missing_fade_in_timer_plays_at_full_level() {
        let mut rig = Rig::new(1);
        rig.timers.create(1_000_000, 0, TimerKey::App(1)).unwrap();

        rig.start(10_000, 1_500);
        assert_eq!(rig.gain.fade_factor(), 1.0);
        assert_eq!(rig.engine.phase(), Some(FadePhase::Sustaining));
    }

    #[test]
    fn zero_fade_plays_at_full_level_without_timers() {
        let mut rig = Rig::new(4);
        rig.start(10_000, 0);
        assert_eq!(rig.gain.fade_factor(), 1.0);
        assert_eq!(rig.timers.active_count(), 0);
    }

    proptest! {
        #[test]
        fn effective_fade_never_exceeds_half_duration(duration in 0u32..1_000_000, fade in 0u32..1_000_000) {
            let plan = FadePlan::new(duration, fade, 15);
            prop_assert!(plan.effective_ms <= duration / 2);
            prop_assert!(plan.effective_ms <= fade);
            prop_assert!(plan.step_ms >= 1);
        }

        #[test]
        fn stop_during_fade_in_never_jumps(stop_after in 1u32..300) {
            let mut rig = Rig::new(8);
            rig.start(10_000, 300);
            rig.run_for(stop_after);
            let level = rig.gain.fade_factor();
            let steps = rig.engine.steps();

            rig.engine.stop(Some(300), &mut rig.timers);
            rig.run_for(25);

            let curve = rig.engine.curve();
            let max_step = (1..steps)
                .map(|i| curve.fade_in(i) - curve.fade_in(i - 1))
                .fold(0.0f32, f32::max);
            prop_assert!((rig.gain.fade_factor() - level).abs() <= max_step + 1e-6);
        }
    }
}
