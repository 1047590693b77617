//! Cross-utterance carry. Everything a conversation accumulates lives
//! in one value owned by the caller; nothing is global.

use crate::decoder::DecoderState;
use crate::lm::LmState;

/// State carried between utterances of one recognition session.
#[derive(Default)]
pub struct SessionContext {
    speaker: Option<String>,
    /// Final decoder state of the best hypothesis.
    pub decoder_state: Option<DecoderState>,
    /// Final first-pass (or fusion) LM state.
    pub lm_state: Option<LmState>,
    /// Long-range LM memory for models that support it.
    pub lm_memory: Option<LmState>,
    /// Token carry for cached-state LMs re-encoded at utterance start.
    pub lm_tokens: Option<Vec<u32>>,
    /// Per-item final decoder states from the last discourse-aware batch.
    pub batch_states: Vec<Option<DecoderState>>,
    /// Marks the next utterance as the start of a new conversation.
    pub new_session: bool,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new conversation; carried state is dropped and the next
    /// discourse-aware batch starts fresh.
    pub fn start_new_session(&mut self) {
        self.reset_states();
        self.batch_states.clear();
        self.new_session = true;
    }

    /// Registers the utterance's speaker. Carried state survives only
    /// when the speaker matches the previous utterance; the return
    /// value says whether it did.
    pub fn enter_utterance(&mut self, speaker: Option<&str>) -> bool {
        let Some(speaker) = speaker else {
            // Without speaker tracking, nothing vouches for the carry.
            return false;
        };
        let same = self.speaker.as_deref() == Some(speaker);
        if !same {
            log::debug!("speaker changed to {speaker}, dropping carried state");
            self.reset_states();
        }
        self.speaker = Some(speaker.to_string());
        same
    }

    pub fn speaker(&self) -> Option<&str> {
        self.speaker.as_deref()
    }

    fn reset_states(&mut self) {
        self.decoder_state = None;
        self.lm_state = None;
        self.lm_memory = None;
        self.lm_tokens = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn speaker_change_drops_carried_state() {
        let mut session = SessionContext::new();
        session.enter_utterance(Some("spk-a"));
        session.decoder_state = Some(DecoderState::Gru {
            h: Array3::zeros((1, 1, 4)),
        });
        assert!(session.enter_utterance(Some("spk-a")));
        assert!(session.decoder_state.is_some());

        assert!(!session.enter_utterance(Some("spk-b")));
        assert!(session.decoder_state.is_none());
    }

    #[test]
    fn missing_speaker_never_vouches_for_carry() {
        let mut session = SessionContext::new();
        session.enter_utterance(Some("spk-a"));
        assert!(!session.enter_utterance(None));
    }
}
