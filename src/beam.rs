//! Hypothesis bookkeeping shared by the batch and streaming beam search.

use ndarray::Array2;
use serde::Serialize;

use crate::attention::AttentionState;
use crate::ctc::{CtcPrefixScorer, CtcPrefixState};
use crate::decoder::DecoderState;
use crate::error::DecodeError;
use crate::lm::LmState;

/// Raw cumulative score per source, before interpolation weights are
/// folded into the total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub att: f32,
    pub ctc: f32,
    pub lm: f32,
    pub cp: f32,
    pub lm_second: f32,
    pub lm_second_bwd: f32,
}

/// Per-ensemble-member carried state.
#[derive(Clone)]
pub(crate) struct MemberState {
    pub dstate: DecoderState,
    pub att: AttentionState,
}

#[derive(Clone)]
pub(crate) struct Hypothesis {
    /// Token ids including the leading start symbol.
    pub tokens: Vec<u32>,
    pub score: f32,
    pub breakdown: ScoreBreakdown,
    pub dstate: DecoderState,
    pub att: AttentionState,
    /// Attention weights per generated step, `[H, T]` each; kept whole
    /// for coverage recomputation.
    pub aws: Vec<Array2<f32>>,
    pub lm_state: Option<LmState>,
    pub ctc_state: Option<CtcPrefixState>,
    pub ensemble: Vec<MemberState>,
    /// Streaming only: no attention boundary found in the current chunk.
    pub no_boundary: bool,
}

impl Hypothesis {
    pub fn seed(
        start: u32,
        dstate: DecoderState,
        att: AttentionState,
        lm_state: Option<LmState>,
        ctc_state: Option<CtcPrefixState>,
        ensemble: Vec<MemberState>,
    ) -> Self {
        Self {
            tokens: vec![start],
            score: 0.0,
            breakdown: ScoreBreakdown::default(),
            dstate,
            att,
            aws: Vec::new(),
            lm_state,
            ctc_state,
            ensemble,
            no_boundary: false,
        }
    }

    /// Generated length, excluding the start symbol.
    pub fn gen_len(&self) -> usize {
        self.tokens.len().saturating_sub(1)
    }
}

/// One proposed continuation of a hypothesis, carrying the cumulative
/// per-source scores so later re-ranking cannot mispair them.
pub(crate) struct Candidate {
    pub id: u32,
    pub total: f32,
    pub att: f32,
    pub lm: f32,
    pub ctc: f32,
    pub ctc_state: Option<CtcPrefixState>,
}

pub(crate) struct BeamSearch {
    beam_width: usize,
    eos: u32,
    ctc_weight: f32,
}

impl BeamSearch {
    pub fn new(beam_width: usize, eos: u32, ctc_weight: f32) -> Self {
        Self {
            beam_width,
            eos,
            ctc_weight,
        }
    }

    /// Sorts the beam best-first and splits off everything beyond the
    /// width. The overflow comes back so callers can salvage from it.
    pub fn prune(&self, hyps: &mut Vec<Hypothesis>) -> Vec<Hypothesis> {
        hyps.sort_by(|a, b| b.score.total_cmp(&a.score));
        if hyps.len() > self.beam_width {
            hyps.split_off(self.beam_width)
        } else {
            Vec::new()
        }
    }

    /// Folds weighted CTC prefix scores into the candidates and re-ranks
    /// them jointly. Without a scorer the candidates are only sorted.
    pub fn add_ctc_score(
        &self,
        prefix: &[u32],
        candidates: &mut [Candidate],
        ctc_state: Option<&CtcPrefixState>,
        scorer: Option<&mut dyn CtcPrefixScorer>,
    ) -> Result<(), DecodeError> {
        if let (Some(state), Some(scorer)) = (ctc_state, scorer) {
            let ids: Vec<u32> = candidates.iter().map(|c| c.id).collect();
            let (states, scores) = scorer.extend(prefix, &ids, state)?;
            if states.len() != candidates.len() || scores.len() != candidates.len() {
                return Err(DecodeError::Scorer(format!(
                    "prefix scorer returned {} scores for {} candidates",
                    scores.len(),
                    candidates.len()
                )));
            }
            for ((cand, st), sc) in candidates.iter_mut().zip(states).zip(scores) {
                cand.ctc = sc;
                cand.total += self.ctc_weight * sc;
                cand.ctc_state = Some(st);
            }
        }
        candidates.sort_by(|a, b| b.total.total_cmp(&a.total));
        Ok(())
    }

    /// Moves finished hypotheses into `completed` and reports whether the
    /// whole beam has finished.
    pub fn remove_complete_hyp(
        &self,
        hyps_sorted: Vec<Hypothesis>,
        completed: &mut Vec<Hypothesis>,
    ) -> (Vec<Hypothesis>, bool) {
        let mut active = Vec::with_capacity(hyps_sorted.len());
        for hyp in hyps_sorted {
            if hyp.tokens.len() > 1 && hyp.tokens.last() == Some(&self.eos) {
                completed.push(hyp);
            } else {
                active.push(hyp);
            }
        }
        let done = active.is_empty();
        (active, done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn make_hyp(tokens: &[u32]) -> Hypothesis {
        Hypothesis {
            tokens: tokens.to_vec(),
            score: 0.0,
            breakdown: ScoreBreakdown::default(),
            dstate: DecoderState::Gru {
                h: Array3::zeros((1, 1, 4)),
            },
            att: AttentionState::fresh(1, 8),
            aws: Vec::new(),
            lm_state: None,
            ctc_state: None,
            ensemble: Vec::new(),
            no_boundary: false,
        }
    }

    struct FixedPrefixScorer;

    impl CtcPrefixScorer for FixedPrefixScorer {
        fn initial_state(&self) -> CtcPrefixState {
            CtcPrefixState::new(1)
        }

        fn extend(
            &mut self,
            _prefix: &[u32],
            candidates: &[u32],
            _state: &CtcPrefixState,
        ) -> Result<(Vec<CtcPrefixState>, Vec<f32>), DecodeError> {
            let states = candidates.iter().map(|_| CtcPrefixState::new(1)).collect();
            let scores = candidates.iter().map(|&c| -(c as f32)).collect();
            Ok((states, scores))
        }

        fn register_new_chunk(&mut self, _frame_log_probs: Array2<f32>) -> Result<(), DecodeError> {
            Ok(())
        }
    }

    #[test]
    fn prune_returns_the_overflow_best_first() {
        let helper = BeamSearch::new(2, 2, 0.0);
        let mut hyps = Vec::new();
        for (tokens, score) in [(&[2u32, 4][..], -3.0f32), (&[2, 5], -1.0), (&[2, 6], -2.0)] {
            let mut hyp = make_hyp(tokens);
            hyp.score = score;
            hyps.push(hyp);
        }
        let overflow = helper.prune(&mut hyps);
        assert_eq!(hyps.len(), 2);
        assert!((hyps[0].score - (-1.0)).abs() < 1e-6);
        assert!((hyps[1].score - (-2.0)).abs() < 1e-6);
        assert_eq!(overflow.len(), 1);
        assert!((overflow[0].score - (-3.0)).abs() < 1e-6);
    }

    #[test]
    fn complete_hyps_need_a_generated_eos() {
        let helper = BeamSearch::new(2, 2, 0.0);
        let mut completed = Vec::new();
        let hyps = vec![make_hyp(&[2]), make_hyp(&[2, 5, 2]), make_hyp(&[2, 7])];
        let (active, done) = helper.remove_complete_hyp(hyps, &mut completed);
        // A bare start symbol does not count as finished.
        assert_eq!(active.len(), 2);
        assert_eq!(completed.len(), 1);
        assert!(!done);

        let (active, done) = helper.remove_complete_hyp(vec![make_hyp(&[2, 9, 2])], &mut completed);
        assert!(active.is_empty());
        assert_eq!(completed.len(), 2);
        assert!(done);
    }

    #[test]
    fn ctc_fusion_rescores_and_reranks() {
        let helper = BeamSearch::new(2, 2, 0.5);
        let mut cands = vec![
            Candidate {
                id: 4,
                total: -1.0,
                att: -1.0,
                lm: 0.0,
                ctc: 0.0,
                ctc_state: None,
            },
            Candidate {
                id: 1,
                total: -1.2,
                att: -1.2,
                lm: 0.0,
                ctc: 0.0,
                ctc_state: None,
            },
        ];
        let state = CtcPrefixState::new(3);
        let mut scorer = FixedPrefixScorer;
        helper
            .add_ctc_score(&[2], &mut cands, Some(&state), Some(&mut scorer))
            .unwrap();
        // id 4 gets -4 from the prefix scorer, id 1 gets -1; the cheap
        // id wins after fusion.
        assert_eq!(cands[0].id, 1);
        assert!((cands[0].total - (-1.2 - 0.5)).abs() < 1e-6);
        assert!(cands[0].ctc_state.is_some());
    }

    #[test]
    fn without_ctc_candidates_are_only_sorted() {
        let helper = BeamSearch::new(2, 2, 0.5);
        let mut cands = vec![
            Candidate {
                id: 7,
                total: -2.0,
                att: -2.0,
                lm: 0.0,
                ctc: 0.0,
                ctc_state: None,
            },
            Candidate {
                id: 3,
                total: -0.5,
                att: -0.5,
                lm: 0.0,
                ctc: 0.0,
                ctc_state: None,
            },
        ];
        helper.add_ctc_score(&[2], &mut cands, None, None).unwrap();
        assert_eq!(cands[0].id, 3);
        assert!((cands[0].total - (-0.5)).abs() < 1e-6);
    }
}
