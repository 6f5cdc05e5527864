use serde::{Deserialize, Serialize};

use crate::source::SourceKind;

/// Output device bring-up, polled once per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    #[default]
    Idle,
    Initializing,
    Ready,
}

/// Which source owns the device, plus a sentence waiting for a fading
/// fragment to finish.
///
/// Only the arbiter mutates this; everything else sees `&PlaybackState`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackState {
    active: SourceKind,
    pending_sentence: Option<String>,
}

impl PlaybackState {
    /// The source currently feeding the device.
    pub fn active(&self) -> SourceKind {
        self.active
    }

    pub fn is_busy(&self) -> bool {
        self.active != SourceKind::None || self.pending_sentence.is_some()
    }

    pub fn pending_sentence(&self) -> Option<&str> {
        self.pending_sentence.as_deref()
    }

    /// The logical source: a fragment fading out on behalf of a queued
    /// sentence already counts as the sentence.
    pub fn logical(&self) -> SourceKind {
        if self.pending_sentence.is_some() {
            SourceKind::Sentence
        } else {
            self.active
        }
    }

    pub(super) fn activate(&mut self, kind: SourceKind) {
        self.active = kind;
    }

    pub(super) fn queue_sentence(&mut self, text: String) {
        self.pending_sentence = Some(text);
    }

    pub(super) fn take_pending_sentence(&mut self) -> Option<String> {
        self.pending_sentence.take()
    }

    /// Returns to "none" and reports what was active.
    pub(super) fn clear(&mut self) -> SourceKind {
        std::mem::take(&mut self.active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queued_sentence_takes_over_the_logical_state() {
        let mut state = PlaybackState::default();
        assert!(!state.is_busy());

        state.activate(SourceKind::Fragment);
        assert_eq!(state.logical(), SourceKind::Fragment);

        state.queue_sentence("hallo".into());
        assert_eq!(state.active(), SourceKind::Fragment);
        assert_eq!(state.logical(), SourceKind::Sentence);

        assert_eq!(state.clear(), SourceKind::Fragment);
        assert!(state.is_busy());
        assert_eq!(state.take_pending_sentence().as_deref(), Some("hallo"));
        assert!(!state.is_busy());
    }
}
