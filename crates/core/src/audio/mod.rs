//! Audio arbitration: one shared output device, at most one active source.
//!
//! The [`AudioArbiter`] is the only owner of the device, the gain stage, the
//! crossfade engine and the playback state. Orchestration code talks to it
//! through `start_*`/`play_*`, `stop` and the status queries, and drives it
//! from the main loop with [`AudioArbiter::on_timer`] and
//! [`AudioArbiter::update`].

mod device;
mod gain;
mod state;

use std::fmt;

pub use device::{Frame, MemoryDevice, MeteredOutput, OutputDevice};
pub use gain::GainStage;
pub use state::{DeviceState, PlaybackState};

use crate::{
    config::{AudioConfig, EngineConfig, FadeConfig},
    fade::{CrossfadeEngine, FadeEvent, StopOutcome},
    meter::{LevelMeter, MeterReading},
    source::{
        preflight, ActiveSource, ContentStore, DecoderFactory, FragmentDescriptor, FragmentPlayer,
        FragmentSource, MemoryStore, PcmClip, PcmClipPlayer, PcmPlayback, SentenceSource,
        SentenceStreamer, SourceKind, SourcePlayer, SpeechService, ToneProfile, ToneSynth,
        WavDecoderFactory,
    },
    timeline::{AudioTimer, Scheduler, TimerKey},
    DomeError, Result,
};

/// A playback request, routed through the exclusivity policy.
#[derive(Debug, Clone)]
pub enum SourceRequest {
    Fragment(FragmentDescriptor),
    Sentence(String),
    PcmClip {
        clip: PcmClip,
        amplitude: f32,
        /// Optional cut-off before the clip's natural end.
        max_ms: Option<u32>,
    },
    Tone(ToneProfile),
}

impl SourceRequest {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceRequest::Fragment(_) => SourceKind::Fragment,
            SourceRequest::Sentence(_) => SourceKind::Sentence,
            SourceRequest::PcmClip { .. } => SourceKind::PcmClip,
            SourceRequest::Tone(_) => SourceKind::Tone,
        }
    }
}

/// How an admitted request takes over the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Free,
    FadeOutCurrent,
    HardStopCurrent,
}

/// Past the configured attempt budget, a still-failing device is reported on
/// the first excess attempt and then once every this many attempts.
const INIT_WARN_EVERY: u32 = 64;

fn init_warning_due(attempts: u32, budget: u32) -> bool {
    match attempts.checked_sub(budget) {
        Some(0) | None => false,
        Some(excess) => excess == 1 || excess % INIT_WARN_EVERY == 0,
    }
}

fn unit(value: f32) -> f32 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

pub struct AudioArbiter<D: OutputDevice> {
    config: AudioConfig,
    fade_config: FadeConfig,
    device: MeteredOutput<D>,
    device_state: DeviceState,
    init_attempts: u32,
    gain: GainStage,
    fades: CrossfadeEngine,
    state: PlaybackState,
    source: Option<ActiveSource>,
    meter: LevelMeter,
    decoders: Box<dyn DecoderFactory>,
    store: Box<dyn ContentStore>,
    speech: Option<Box<dyn SpeechService>>,
}

impl<D: OutputDevice> AudioArbiter<D> {
    /// Wraps `device`. Stored items come from an empty in-memory store and
    /// are decoded as WAV until [`with_store`](Self::with_store) and
    /// [`with_decoders`](Self::with_decoders) say otherwise.
    pub fn new(device: D, config: &EngineConfig) -> Self {
        let meter = LevelMeter::new(config.audio.meter_window);
        let device = MeteredOutput::new(device, meter.tap());
        Self {
            config: config.audio.clone(),
            fade_config: config.fade.clone(),
            device,
            device_state: DeviceState::Idle,
            init_attempts: 0,
            gain: GainStage::new(unit(config.audio.base_level)),
            fades: CrossfadeEngine::new(config.fade.clone()),
            state: PlaybackState::default(),
            source: None,
            meter,
            decoders: Box::new(WavDecoderFactory),
            store: Box::new(MemoryStore::new()),
            speech: None,
        }
    }

    pub fn with_store(mut self, store: impl ContentStore + 'static) -> Self {
        self.store = Box::new(store);
        self
    }

    pub fn with_decoders(mut self, decoders: impl DecoderFactory + 'static) -> Self {
        self.decoders = Box::new(decoders);
        self
    }

    pub fn with_speech(mut self, speech: impl SpeechService + 'static) -> Self {
        self.speech = Some(Box::new(speech));
        self
    }

    /// Starts device bring-up; [`update`](Self::update) completes it.
    pub fn begin(&mut self) {
        if self.device_state == DeviceState::Idle {
            self.device_state = DeviceState::Initializing;
            self.init_attempts = 0;
            tracing::debug!("output device initialising");
        }
    }

    /// Once per main-loop iteration: advance device bring-up, then pump the
    /// active source and finalize it when it reports completion.
    pub fn update(&mut self, timers: &mut Scheduler<TimerKey>) {
        self.poll_device();
        let Some(source) = self.source.as_mut() else {
            return;
        };
        if !source.pump(&mut self.device) {
            self.finalize(timers);
        }
    }

    /// Dispatches one of the audio timers.
    pub fn on_timer(&mut self, timers: &mut Scheduler<TimerKey>, timer: AudioTimer) {
        match timer {
            AudioTimer::PcmStop => {
                if self.state.active() == SourceKind::PcmClip {
                    tracing::debug!("pcm clip reached its time limit");
                    self.finalize(timers);
                }
            }
            fade_timer => {
                let event = self
                    .fades
                    .on_timer(fade_timer, timers, &mut self.gain, &mut self.device);
                if event == FadeEvent::Finished {
                    self.finalize(timers);
                }
            }
        }
    }

    pub fn request(&mut self, timers: &mut Scheduler<TimerKey>, request: SourceRequest) -> bool {
        match request {
            SourceRequest::Fragment(descriptor) => self.start_fragment(timers, descriptor),
            SourceRequest::Sentence(text) => self.start_sentence(timers, text),
            SourceRequest::PcmClip {
                clip,
                amplitude,
                max_ms,
            } => self.start_pcm(timers, clip, amplitude, max_ms),
            SourceRequest::Tone(profile) => self.play_tone(timers, profile),
        }
    }

    /// Plays a stored fragment with fade-in, sustain and fade-out. Rejected
    /// while any other source is active.
    pub fn start_fragment(
        &mut self,
        timers: &mut Scheduler<TimerKey>,
        descriptor: FragmentDescriptor,
    ) -> bool {
        if let Err(err) = self.admit(SourceKind::Fragment) {
            return self.reject(SourceKind::Fragment, err);
        }
        match self.open_fragment(timers, descriptor) {
            Ok(()) => true,
            Err(err) => self.abort(timers, SourceKind::Fragment, err),
        }
    }

    /// Speaks `text`. The remote response is checked before anything else
    /// happens; an active fragment is then faded out and the sentence starts
    /// when it has gone silent.
    pub fn start_sentence(&mut self, timers: &mut Scheduler<TimerKey>, text: impl Into<String>) -> bool {
        let text = text.into();
        let admission = match self.admit(SourceKind::Sentence) {
            Ok(admission) => admission,
            Err(err) => return self.reject(SourceKind::Sentence, err),
        };
        let Some(service) = self.speech.as_deref_mut() else {
            return self.reject(
                SourceKind::Sentence,
                DomeError::msg("no speech service configured"),
            );
        };
        if let Err(err) = preflight(service, &text) {
            tracing::error!(%err, text = %text, "sentence aborted before playback");
            return false;
        }

        match admission {
            Admission::Free => self.begin_sentence(timers, text),
            Admission::HardStopCurrent => {
                self.preempt(timers);
                self.begin_sentence(timers, text)
            }
            Admission::FadeOutCurrent => {
                self.state.queue_sentence(text);
                match self.fades.stop(Some(self.fade_config.preempt_fade_ms), timers) {
                    StopOutcome::Fading => {
                        tracing::info!(
                            fade_ms = self.fade_config.preempt_fade_ms,
                            "fading out fragment for sentence"
                        );
                        true
                    }
                    StopOutcome::HardStop => {
                        self.finalize(timers);
                        self.state.active() == SourceKind::Sentence
                    }
                }
            }
        }
    }

    /// Plays `clip` at `amplitude` (clamped to [0, 1]), cutting off whatever
    /// else is playing.
    pub fn play_pcm_clip(
        &mut self,
        timers: &mut Scheduler<TimerKey>,
        clip: PcmClip,
        amplitude: f32,
    ) -> bool {
        self.start_pcm(timers, clip, amplitude, None)
    }

    /// Like [`play_pcm_clip`](Self::play_pcm_clip), stopping after `max_ms`.
    pub fn play_pcm_clip_for(
        &mut self,
        timers: &mut Scheduler<TimerKey>,
        clip: PcmClip,
        amplitude: f32,
        max_ms: u32,
    ) -> bool {
        self.start_pcm(timers, clip, amplitude, Some(max_ms))
    }

    /// Synthesizes a ping, cutting off whatever else is playing.
    pub fn play_tone(&mut self, timers: &mut Scheduler<TimerKey>, profile: ToneProfile) -> bool {
        let admission = match self.admit(SourceKind::Tone) {
            Ok(admission) => admission,
            Err(err) => return self.reject(SourceKind::Tone, err),
        };
        if admission != Admission::Free {
            self.preempt(timers);
        }

        let mut synth = ToneSynth::new(&self.config);
        if let Err(err) = synth.begin(profile, &mut self.device) {
            return self.abort(timers, SourceKind::Tone, err);
        }
        self.install(ActiveSource::Tone(synth), self.config.tone_sample_rate);
        self.play_unfaded(timers);
        true
    }

    /// Stops the active source. Fragments and sentences fade out over
    /// `fade_ms` (or their session's fade length); short fades, clips and
    /// tones stop immediately. A queued sentence is dropped.
    pub fn stop(&mut self, timers: &mut Scheduler<TimerKey>, fade_ms: Option<u32>) {
        match self.state.active() {
            SourceKind::None => tracing::debug!("stop requested with nothing playing"),
            SourceKind::PcmClip | SourceKind::Tone => self.preempt(timers),
            SourceKind::Fragment | SourceKind::Sentence => {
                if self.state.take_pending_sentence().is_some() {
                    tracing::info!("queued sentence dropped by stop");
                }
                if self.fades.stop(fade_ms, timers) == StopOutcome::HardStop {
                    self.finalize(timers);
                }
            }
        }
    }

    /// Sets the user level factor, clamped to [0, 1].
    pub fn set_user_level(&mut self, value: f32) -> f32 {
        self.gain.set_user_level(unit(value), &mut self.device)
    }

    /// Caps the applied gain at `max` (clamped to [0, 1]).
    pub fn cap_volume(&mut self, max: f32) -> f32 {
        self.gain.set_ceiling(unit(max), &mut self.device)
    }

    /// Rescales the playing PCM clip. Returns false when no clip is active.
    pub fn set_clip_amplitude(&mut self, amplitude: f32) -> bool {
        match &mut self.source {
            Some(ActiveSource::PcmClip(player)) => {
                player.set_amplitude(amplitude);
                tracing::debug!(amplitude = player.amplitude(), "clip amplitude changed");
                true
            }
            _ => false,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.state.is_busy()
    }

    pub fn is_fragment_playing(&self) -> bool {
        self.state.logical() == SourceKind::Fragment
    }

    pub fn is_sentence_playing(&self) -> bool {
        self.state.logical() == SourceKind::Sentence
    }

    pub fn is_pcm_clip_active(&self) -> bool {
        self.state.active() == SourceKind::PcmClip
    }

    pub fn is_tone_active(&self) -> bool {
        self.state.active() == SourceKind::Tone
    }

    /// The source currently feeding the device.
    pub fn active_kind(&self) -> SourceKind {
        self.state.active()
    }

    pub fn playback_state(&self) -> &PlaybackState {
        &self.state
    }

    pub fn device_state(&self) -> DeviceState {
        self.device_state
    }

    pub fn gain(&self) -> &GainStage {
        &self.gain
    }

    pub fn fades(&self) -> &CrossfadeEngine {
        &self.fades
    }

    pub fn device(&self) -> &D {
        self.device.inner()
    }

    pub fn device_mut(&mut self) -> &mut D {
        self.device.inner_mut()
    }

    /// Turns the samples metered since the last call into a reading.
    pub fn publish_level(&mut self) -> Option<MeterReading> {
        match self.meter.publish() {
            Ok(reading) => reading,
            Err(err) => {
                tracing::warn!(%err, "level meter unavailable");
                None
            }
        }
    }

    /// Last published level reading.
    pub fn level(&self) -> MeterReading {
        self.meter.reading()
    }

    fn poll_device(&mut self) {
        if self.device_state != DeviceState::Initializing {
            return;
        }
        self.init_attempts += 1;
        if self.device.begin() {
            self.device_state = DeviceState::Ready;
            let gain = self.gain.apply(&mut self.device);
            tracing::info!(attempts = self.init_attempts, gain, "output device ready");
        } else if init_warning_due(self.init_attempts, self.config.device_init_attempts) {
            tracing::warn!(attempts = self.init_attempts, "output device still not ready");
        } else {
            tracing::debug!(attempts = self.init_attempts, "output device not ready yet");
        }
    }

    fn admit(&self, kind: SourceKind) -> Result<Admission> {
        if self.device_state != DeviceState::Ready {
            return Err(DomeError::DeviceNotReady);
        }
        let current = self.state.logical();
        match (kind, current) {
            (SourceKind::None, _) => Err(DomeError::InvalidInput("nothing to play")),
            (_, SourceKind::None) => Ok(Admission::Free),
            (SourceKind::Fragment, _) => Err(DomeError::PolicyRejected("another source is active")),
            (SourceKind::Sentence, SourceKind::Sentence) => {
                Err(DomeError::PolicyRejected("a sentence is already playing"))
            }
            (SourceKind::Sentence, SourceKind::Fragment) => Ok(Admission::FadeOutCurrent),
            (SourceKind::Sentence | SourceKind::PcmClip | SourceKind::Tone, _) => {
                Ok(Admission::HardStopCurrent)
            }
        }
    }

    fn reject(&self, kind: SourceKind, err: DomeError) -> bool {
        tracing::info!(request = ?kind, active = ?self.state.logical(), %err, "request rejected");
        false
    }

    /// Reports a request that failed after admission and releases whatever
    /// it had acquired.
    fn abort(&mut self, timers: &mut Scheduler<TimerKey>, kind: SourceKind, err: DomeError) -> bool {
        tracing::error!(request = ?kind, %err, "playback request aborted");
        self.release(timers);
        false
    }

    fn open_fragment(
        &mut self,
        timers: &mut Scheduler<TimerKey>,
        descriptor: FragmentDescriptor,
    ) -> Result<()> {
        let bytes = self.store.open(descriptor.item)?;
        let decoder = self.decoders.create(bytes)?;
        let rate = decoder.sample_rate();

        let mut player = FragmentPlayer::new(&self.config);
        player.begin(FragmentSource { descriptor, decoder }, &mut self.device)?;
        self.install(ActiveSource::Fragment(player), rate);

        let plan = self.fades.plan(descriptor.duration_ms, descriptor.fade_ms);
        self.fades
            .start_session(plan, timers, &mut self.gain, &mut self.device);
        Ok(())
    }

    fn begin_sentence(&mut self, timers: &mut Scheduler<TimerKey>, text: String) -> bool {
        match self.open_sentence(timers, text) {
            Ok(()) => true,
            Err(err) => self.abort(timers, SourceKind::Sentence, err),
        }
    }

    fn open_sentence(&mut self, timers: &mut Scheduler<TimerKey>, text: String) -> Result<()> {
        let service = self
            .speech
            .as_deref_mut()
            .ok_or_else(|| DomeError::msg("no speech service configured"))?;
        let bytes = service.open(&text)?;
        let decoder = self.decoders.create(bytes)?;
        let rate = decoder.sample_rate();

        let mut streamer = SentenceStreamer::new(&self.config);
        streamer.begin(SentenceSource { text, decoder }, &mut self.device)?;
        self.install(ActiveSource::Sentence(streamer), rate);
        self.fades.start_full_level(
            self.fade_config.preempt_fade_ms,
            timers,
            &mut self.gain,
            &mut self.device,
        );
        Ok(())
    }

    fn start_pcm(
        &mut self,
        timers: &mut Scheduler<TimerKey>,
        clip: PcmClip,
        amplitude: f32,
        max_ms: Option<u32>,
    ) -> bool {
        let admission = match self.admit(SourceKind::PcmClip) {
            Ok(admission) => admission,
            Err(err) => return self.reject(SourceKind::PcmClip, err),
        };
        if admission != Admission::Free {
            self.preempt(timers);
        }

        let rate = clip.sample_rate();
        let mut player = PcmClipPlayer::new(&self.config);
        if let Err(err) = player.begin(PcmPlayback { clip, amplitude }, &mut self.device) {
            return self.abort(timers, SourceKind::PcmClip, err);
        }
        self.install(ActiveSource::PcmClip(player), rate);
        self.play_unfaded(timers);

        if let Some(max_ms) = max_ms.filter(|ms| *ms > 0) {
            if let Err(err) = timers.restart(max_ms, 1, AudioTimer::PcmStop.into()) {
                tracing::warn!(%err, max_ms, "pcm stop timer unavailable, playing whole clip");
            }
        }
        true
    }

    fn install(&mut self, source: ActiveSource, sample_rate: u32) {
        self.state.activate(source.kind());
        self.meter.set_sample_rate(sample_rate);
        self.source = Some(source);
    }

    /// Clips and tones run at full level with no fade session.
    fn play_unfaded(&mut self, timers: &mut Scheduler<TimerKey>) {
        self.fades.reset(timers);
        self.gain.set_fade_factor(1.0, &mut self.device);
    }

    /// Hard-stops the current source for a time-critical request.
    fn preempt(&mut self, timers: &mut Scheduler<TimerKey>) {
        if self.state.take_pending_sentence().is_some() {
            tracing::info!("queued sentence dropped by preemption");
        }
        let stopped = self.release(timers);
        if stopped != SourceKind::None {
            tracing::info!(source = ?stopped, "source preempted");
        }
    }

    /// Tears down the active source and shared state, leaving the device
    /// stopped at base level times user level. The next source restarts it.
    fn release(&mut self, timers: &mut Scheduler<TimerKey>) -> SourceKind {
        if let Some(mut source) = self.source.take() {
            source.stop(&mut self.device);
            self.device.stop();
        }
        self.fades.reset(timers);
        timers.cancel(AudioTimer::PcmStop.into());
        self.gain.set_fade_factor(1.0, &mut self.device);
        self.meter.reset();
        self.state.clear()
    }

    /// Natural or forced end of playback. Starts a sentence that was waiting
    /// for the device.
    fn finalize(&mut self, timers: &mut Scheduler<TimerKey>) {
        let pending = self.state.take_pending_sentence();
        let finished = self.release(timers);
        tracing::info!(source = ?finished, "playback finished");

        if let Some(text) = pending {
            self.begin_sentence(timers, text);
        }
    }
}

impl<D: OutputDevice> fmt::Debug for AudioArbiter<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioArbiter")
            .field("device_state", &self.device_state)
            .field("state", &self.state)
            .field("gain", &self.gain)
            .field("fade_phase", &self.fades.phase())
            .field("source", &self.source)
            .finish()
    }
}
