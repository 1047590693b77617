//! Chunk-synchronous beam search over an incrementally encoded stream.

use ndarray::{Array2, ArrayView3, Axis};

use crate::attention::{AttentionMode, AttentionState};
use crate::beam::{BeamSearch, Hypothesis, ScoreBreakdown};
use crate::config::RecogConfig;
use crate::ctc::CtcPrefixScorer;
use crate::error::DecodeError;
use crate::layers::log_softmax_rows;
use crate::lm::{LanguageModel, LmState};
use crate::session::SessionContext;

use super::beam_search::select_candidates;
use super::{DecoderState, RnnDecoder};

/// One hypothesis of a streaming result. Attention histories span
/// chunks of different widths, so no stacked weight tensor is exposed.
#[derive(Debug, Clone)]
pub struct StreamHypothesis {
    /// Token ids without the start symbol.
    pub tokens: Vec<u32>,
    pub score: f32,
    pub breakdown: ScoreBreakdown,
}

/// Outcome of one processed chunk.
#[derive(Debug)]
pub struct ChunkResult {
    /// Hypotheses that reached the end symbol inside this chunk, best
    /// first.
    pub completed: Vec<StreamHypothesis>,
    /// Active beam carried into the next chunk, best first.
    pub active: Vec<StreamHypothesis>,
}

/// Cross-chunk decoding session. Owns the carried beam, the chunk-fed
/// CTC prefix scorer and the frame cursor; the decoder itself is lent
/// per call.
pub struct ChunkSyncDecoder {
    recog: RecogConfig,
    /// Park hypotheses on end-of-sequence instead of finishing, for
    /// encoders whose final frames are still provisional.
    ignore_eos: bool,
    ctc_scorer: Option<Box<dyn CtcPrefixScorer>>,
    hyps: Vec<Hypothesis>,
    started: bool,
    n_frames: usize,
    carry_dstate: Option<DecoderState>,
    carry_lm: Option<LmState>,
    best_dstate: Option<DecoderState>,
    best_lm: Option<LmState>,
}

impl ChunkSyncDecoder {
    pub fn new(
        recog: RecogConfig,
        ctc_scorer: Option<Box<dyn CtcPrefixScorer>>,
        ignore_eos: bool,
        carry: Option<&SessionContext>,
    ) -> Result<Self, DecodeError> {
        recog.validate()?;
        if ctc_scorer.is_some() && recog.ctc_weight <= 0.0 {
            return Err(DecodeError::config("a CTC prefix scorer needs ctc_weight > 0"));
        }
        let carry_dstate = match carry {
            Some(sess) if recog.asr_state_carry_over => sess.decoder_state.clone(),
            _ => None,
        };
        let carry_lm = match carry {
            Some(sess) if recog.lm_state_carry_over => sess.lm_state.clone(),
            _ => None,
        };
        Ok(Self {
            recog,
            ignore_eos,
            ctc_scorer,
            hyps: Vec::new(),
            started: false,
            n_frames: 0,
            carry_dstate,
            carry_lm,
            best_dstate: None,
            best_lm: None,
        })
    }

    /// Encoder frames consumed so far.
    pub fn n_frames(&self) -> usize {
        self.n_frames
    }

    /// Writes the best completed hypothesis' states back for the next
    /// utterance of the same speaker.
    pub fn store_carry(&self, session: &mut SessionContext) {
        if let Some(dstate) = &self.best_dstate {
            session.decoder_state = Some(dstate.clone());
        }
        if let Some(lm_state) = &self.best_lm {
            session.lm_state = Some(lm_state.clone());
        }
    }

    /// Runs the synchronous beam over one encoder chunk, `[1, T_c, enc]`.
    /// `ctc_chunk_log_probs` extends the prefix scorer by the chunk's
    /// frame posteriors before any scoring.
    pub fn process_chunk(
        &mut self,
        decoder: &mut RnnDecoder,
        eouts_chunk: &ArrayView3<f32>,
        lm: Option<&dyn LanguageModel>,
        ctc_chunk_log_probs: Option<Array2<f32>>,
    ) -> Result<ChunkResult, DecodeError> {
        let (bs, chunk, enc) = eouts_chunk.dim();
        if bs != 1 {
            return Err(DecodeError::input("streaming decodes one utterance at a time"));
        }
        if chunk == 0 {
            return Err(DecodeError::input("empty encoder chunk"));
        }
        if enc != decoder.config.enc_n_units {
            return Err(DecodeError::Input(format!(
                "encoder width {enc} differs from configured {}",
                decoder.config.enc_n_units
            )));
        }
        if !decoder.supports_streaming() {
            return Err(DecodeError::config(
                "chunk-synchronous decoding needs a monotonic attention scorer",
            ));
        }
        if let Some(lm) = lm {
            if self.recog.lm_weight <= 0.0 {
                return Err(DecodeError::config("a first-pass LM needs lm_weight > 0"));
            }
            if decoder.has_fusion_lm() {
                return Err(DecodeError::config(
                    "fusion and shallow first-pass LM cannot be combined",
                ));
            }
            if lm.vocab() != decoder.config.vocab {
                return Err(DecodeError::LanguageModel(format!(
                    "LM vocabulary {} differs from decoder vocabulary {}",
                    lm.vocab(),
                    decoder.config.vocab
                )));
            }
        }

        decoder.reset_attention_cache();
        match (self.ctc_scorer.as_mut(), ctc_chunk_log_probs) {
            (Some(scorer), Some(probs)) => scorer.register_new_chunk(probs)?,
            (None, Some(_)) => {
                return Err(DecodeError::config(
                    "chunk posteriors need a CTC prefix scorer",
                ));
            }
            _ => {}
        }

        let eos = decoder.config.special.eos;
        let helper = BeamSearch::new(self.recog.beam_width, eos, self.recog.ctc_weight);

        if !self.started {
            self.started = true;
            self.n_frames = 0;
            let dstate = match self.carry_dstate.take() {
                Some(carried) if carried.batch() == 1 => carried,
                _ => decoder.zero_state(1),
            };
            let lm_state = match (lm, decoder.has_fusion_lm()) {
                (Some(lm), _) => Some(self.carry_lm.take().unwrap_or_else(|| lm.initial_state(1))),
                (None, true) => self.carry_lm.take(),
                (None, false) => None,
            };
            let ctc_state = self.ctc_scorer.as_ref().map(|s| s.initial_state());
            self.hyps = vec![Hypothesis::seed(
                eos,
                dstate,
                decoder.fresh_attention(1),
                lm_state,
                ctc_state,
                Vec::new(),
            )];
        } else {
            for hyp in &mut self.hyps {
                hyp.no_boundary = false;
            }
        }

        let mut completed: Vec<Hypothesis> = Vec::new();
        let mut parked_overflow: Vec<Hypothesis> = Vec::new();
        let elens_c = [chunk];
        let ymax = (chunk as f32 * self.recog.max_len_ratio).floor() as usize + 1;

        for t in 0..ymax {
            if self.hyps.is_empty() || self.hyps.iter().all(|h| h.no_boundary) {
                break;
            }

            // Hypotheses already out of boundaries sit this step out.
            let mut new_hyps: Vec<Hypothesis> = Vec::new();
            let mut active: Vec<Hypothesis> = Vec::new();
            for hyp in self.hyps.drain(..) {
                if hyp.no_boundary {
                    new_hyps.push(hyp);
                } else {
                    active.push(hyp);
                }
            }
            let n = active.len();
            let last_tokens: Vec<u32> = active
                .iter()
                .map(|h| h.tokens.last().copied().unwrap_or(eos))
                .collect();

            let mut lm_rows: Option<Vec<ndarray::Array1<f32>>> = None;
            let mut lm_states_new: Option<Vec<LmState>> = None;
            let mut fusion_feats: Option<Array2<f32>> = None;
            if decoder.has_fusion_lm() {
                let states: Option<Vec<&LmState>> =
                    active.iter().map(|h| h.lm_state.as_ref()).collect();
                let state = match states {
                    Some(parts) => Some(LmState::concat(&parts)?),
                    None => None,
                };
                let out = decoder
                    .fusion_lm_step(&last_tokens, state.as_ref())?
                    .ok_or_else(|| DecodeError::input("fusion LM unavailable"))?;
                fusion_feats = decoder.fusion_features(&out);
                lm_states_new = Some((0..n).map(|j| out.state.select(j)).collect());
            } else if let Some(lm) = lm {
                let states: Vec<&LmState> = active
                    .iter()
                    .map(|h| h.lm_state.as_ref())
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| DecodeError::input("LM state missing from a hypothesis"))?;
                let state = LmState::concat(&states)?;
                let out = lm.predict(&last_tokens, &state, None)?;
                lm_rows = Some(
                    (0..n)
                        .map(|j| out.log_probs.index_axis(Axis(0), j).to_owned())
                        .collect(),
                );
                lm_states_new = Some((0..n).map(|j| out.state.select(j)).collect());
            }

            let dparts: Vec<&DecoderState> = active.iter().map(|h| &h.dstate).collect();
            let dstate = DecoderState::concat(&dparts)?;
            // The first step of every chunk restarts the monotonic scan
            // over the chunk's frames; contexts carry, weights do not.
            let att = if t == 0 {
                let contexts: Vec<_> = active.iter().map(|h| h.att.context.view()).collect();
                AttentionState {
                    context: ndarray::concatenate(Axis(0), &contexts)?,
                    weights: None,
                    gmm_means: None,
                    stop_probs: None,
                }
            } else {
                let aparts: Vec<&AttentionState> = active.iter().map(|h| &h.att).collect();
                AttentionState::concat(&aparts)?
            };
            let fview = fusion_feats.as_ref().map(|f| f.view());
            let out = decoder.decode_step(
                eouts_chunk,
                &elens_c,
                &dstate,
                &att,
                &last_tokens,
                fview.as_ref(),
                AttentionMode::Hard,
                None,
            )?;
            let logits = decoder.output_logits(&out.attn_v.view());
            let scores_att = log_softmax_rows(&logits.view());
            let step_weights = out
                .att
                .weights
                .as_ref()
                .ok_or_else(|| DecodeError::input("attention produced no weights"))?;

            for (j, hyp) in active.iter().enumerate() {
                let row = scores_att.index_axis(Axis(0), j);
                let cur_aw = step_weights.index_axis(Axis(0), j).to_owned();
                let heads = cur_aw.dim().0;
                let no_boundary = cur_aw.sum() == 0.0;
                let mut parked_already = false;
                if no_boundary {
                    new_hyps.push(park(hyp, heads, chunk));
                    parked_already = true;
                }

                let gen_len = hyp.gen_len();
                let mut cands = select_candidates(
                    &row,
                    hyp.breakdown.att,
                    self.recog.ctc_weight,
                    self.recog.beam_width,
                );
                if let Some(rows) = &lm_rows {
                    for cand in &mut cands {
                        cand.lm = hyp.breakdown.lm + rows[j][cand.id as usize];
                        cand.total += cand.lm * self.recog.lm_weight;
                    }
                } else {
                    for cand in &mut cands {
                        cand.lm = hyp.breakdown.lm;
                    }
                }
                if self.recog.length_penalty > 0.0 {
                    for cand in &mut cands {
                        cand.total += (gen_len + 1) as f32 * self.recog.length_penalty;
                    }
                }
                let scorer = self
                    .ctc_scorer
                    .as_mut()
                    .map(|s| s.as_mut() as &mut dyn CtcPrefixScorer);
                helper.add_ctc_score(&hyp.tokens, &mut cands, hyp.ctc_state.as_ref(), scorer)?;

                for cand in cands {
                    if cand.id == eos && self.ignore_eos {
                        if !parked_already {
                            new_hyps.push(park(hyp, heads, chunk));
                            parked_already = true;
                        }
                        continue;
                    }
                    if no_boundary && cand.id != eos {
                        continue;
                    }
                    if cand.id == eos {
                        let mut best_no_eos = f32::NEG_INFINITY;
                        for (id, &v) in row.iter().enumerate() {
                            if id != eos as usize && v > best_no_eos {
                                best_no_eos = v;
                            }
                        }
                        if row[eos as usize] <= self.recog.eos_threshold * best_no_eos {
                            continue;
                        }
                    }
                    let norm = if self.recog.length_norm {
                        (gen_len + 1) as f32
                    } else {
                        1.0
                    };
                    let mut tokens = hyp.tokens.clone();
                    tokens.push(cand.id);
                    let mut aws = hyp.aws.clone();
                    aws.push(cur_aw.clone());
                    let lm_state = match &lm_states_new {
                        Some(v) => Some(v[j].clone()),
                        None => hyp.lm_state.clone(),
                    };
                    new_hyps.push(Hypothesis {
                        tokens,
                        score: cand.total / norm,
                        breakdown: ScoreBreakdown {
                            att: cand.att,
                            ctc: cand.ctc,
                            lm: cand.lm,
                            cp: 0.0,
                            lm_second: 0.0,
                            lm_second_bwd: 0.0,
                        },
                        dstate: out.state.select(j),
                        att: out.att.select(j),
                        aws,
                        lm_state,
                        ctc_state: cand.ctc_state,
                        ensemble: Vec::new(),
                        no_boundary,
                    });
                }
            }

            let overflow = helper.prune(&mut new_hyps);
            parked_overflow.extend(overflow.into_iter().filter(|h| h.no_boundary));
            let (active_next, done) = helper.remove_complete_hyp(new_hyps, &mut completed);
            self.hyps = active_next;
            if done {
                break;
            }
        }

        // Fold the set-aside boundary-less hypotheses back into the beam.
        self.hyps.extend(parked_overflow);
        helper.prune(&mut self.hyps);

        completed.sort_by(|a, b| b.score.total_cmp(&a.score));
        if let Some(best) = completed.first() {
            self.best_dstate = Some(best.dstate.clone());
            self.best_lm = best.lm_state.clone();
        }
        self.n_frames += chunk;

        let mut summary: Vec<&Hypothesis> = completed.iter().chain(self.hyps.iter()).collect();
        summary.sort_by(|a, b| b.score.total_cmp(&a.score));
        for (k, hyp) in summary.iter().take(self.recog.beam_width).enumerate() {
            log::debug!(
                "chunk@{} hyp {k}: tokens={:?} score={:.4} att={:.4} ctc={:.4} lm={:.4}",
                self.n_frames,
                &hyp.tokens[1..],
                hyp.score,
                hyp.breakdown.att * (1.0 - self.recog.ctc_weight),
                hyp.breakdown.ctc * self.recog.ctc_weight,
                hyp.breakdown.lm * self.recog.lm_weight,
            );
        }

        Ok(ChunkResult {
            completed: completed.iter().map(stream_hypothesis).collect(),
            active: self.hyps.iter().map(stream_hypothesis).collect(),
        })
    }
}

/// A copy set aside until the next chunk: the stale weight entry is
/// blanked to the current chunk's width and the flag raised.
fn park(hyp: &Hypothesis, heads: usize, chunk: usize) -> Hypothesis {
    let mut parked = hyp.clone();
    let zeros = Array2::zeros((heads, chunk));
    match parked.aws.last_mut() {
        Some(last) => *last = zeros,
        None => parked.aws.push(zeros),
    }
    parked.no_boundary = true;
    parked
}

fn stream_hypothesis(hyp: &Hypothesis) -> StreamHypothesis {
    StreamHypothesis {
        tokens: hyp.tokens[1..].to_vec(),
        score: hyp.score,
        breakdown: hyp.breakdown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AttentionKind, DecoderConfig};
    use ndarray::Array3;

    fn make_plain_config() -> DecoderConfig {
        DecoderConfig {
            enc_n_units: 8,
            n_units: 12,
            n_layers: 1,
            bottleneck_dim: 10,
            emb_dim: 6,
            vocab: 11,
            seed: 7,
            ..Default::default()
        }
    }

    fn make_config() -> DecoderConfig {
        let mut config = make_plain_config();
        config.attention.kind = AttentionKind::Mocha;
        config
    }

    fn make_eouts(t: usize) -> Array3<f32> {
        Array3::from_shape_fn((1, t, 8), |(_, i, d)| ((i * 8 + d) as f32 * 0.017).cos())
    }

    #[test]
    fn non_monotonic_scorer_is_rejected() {
        let mut dec = RnnDecoder::new(make_plain_config(), None, None).unwrap();
        let mut stream = ChunkSyncDecoder::new(RecogConfig::default(), None, false, None).unwrap();
        let eouts = make_eouts(4);
        let err = stream
            .process_chunk(&mut dec, &eouts.view(), None, None)
            .unwrap_err();
        assert!(matches!(err, DecodeError::Config(_)));
    }

    #[test]
    fn chunk_posteriors_without_a_scorer_are_rejected() {
        let mut dec = RnnDecoder::new(make_config(), None, None).unwrap();
        let mut stream = ChunkSyncDecoder::new(RecogConfig::default(), None, false, None).unwrap();
        let chunk = make_eouts(4);
        let probs = Array2::from_elem((4, 11), -(11.0f32).ln());
        let err = stream
            .process_chunk(&mut dec, &chunk.view(), None, Some(probs))
            .unwrap_err();
        assert!(matches!(err, DecodeError::Config(_)));
    }

    #[test]
    fn chunks_advance_the_frame_cursor() {
        let mut dec = RnnDecoder::new(make_config(), None, None).unwrap();
        let mut stream = ChunkSyncDecoder::new(RecogConfig::default(), None, false, None).unwrap();
        let chunk = make_eouts(4);
        stream
            .process_chunk(&mut dec, &chunk.view(), None, None)
            .unwrap();
        assert_eq!(stream.n_frames(), 4);
        stream
            .process_chunk(&mut dec, &chunk.view(), None, None)
            .unwrap();
        assert_eq!(stream.n_frames(), 8);
    }

    #[test]
    fn beam_never_exceeds_its_width() {
        let mut dec = RnnDecoder::new(make_config(), None, None).unwrap();
        let recog = RecogConfig {
            beam_width: 2,
            ..Default::default()
        };
        let mut stream = ChunkSyncDecoder::new(recog, None, false, None).unwrap();
        let chunk = make_eouts(6);
        let result = stream
            .process_chunk(&mut dec, &chunk.view(), None, None)
            .unwrap();
        assert!(result.active.len() <= 2);
    }

    #[test]
    fn parked_copy_blanks_the_last_weights() {
        let hyp = Hypothesis {
            tokens: vec![2, 4],
            score: -1.0,
            breakdown: ScoreBreakdown::default(),
            dstate: DecoderState::Gru {
                h: Array3::zeros((1, 1, 4)),
            },
            att: AttentionState::fresh(1, 8),
            aws: vec![Array2::from_elem((1, 4), 0.25)],
            lm_state: None,
            ctc_state: None,
            ensemble: Vec::new(),
            no_boundary: false,
        };
        let parked = park(&hyp, 1, 6);
        assert!(parked.no_boundary);
        assert_eq!(parked.aws.len(), 1);
        assert_eq!(parked.aws[0].dim(), (1, 6));
        assert_eq!(parked.aws[0].sum(), 0.0);
        assert_eq!(parked.tokens, hyp.tokens);
    }
}
