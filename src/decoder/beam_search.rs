//! Batch beam search with joint CTC, LM and ensemble scoring.

use ndarray::{s, Array2, Array3, ArrayView1, Axis};

use crate::attention::{AttentionMode, AttentionState};
use crate::beam::{BeamSearch, Candidate, Hypothesis, MemberState, ScoreBreakdown};
use crate::config::RecogConfig;
use crate::ctc::CtcPrefixScorer;
use crate::error::DecodeError;
use crate::layers::softmax_rows;
use crate::lm::{LanguageModel, LmOutput, LmState};
use crate::session::SessionContext;

use super::{DecoderState, RnnDecoder};

/// One ranked hypothesis of the N-best list.
#[derive(Debug, Clone)]
pub struct DecodedHypothesis {
    /// Token ids without the start symbol.
    pub tokens: Vec<u32>,
    pub score: f32,
    pub breakdown: ScoreBreakdown,
    /// Attention weights over the generated steps, `[H, L, T]`.
    pub aws: Array3<f32>,
}

/// Another decoder joining the probability-space ensemble. Its encoder
/// output may differ in width and length from the main model's.
pub struct EnsembleMember<'a> {
    pub decoder: &'a mut RnnDecoder,
    pub eouts: ndarray::ArrayView3<'a, f32>,
    pub elens: &'a [usize],
}

/// Optional collaborators of one `beam_search` call.
///
/// CTC prefix scorers are per utterance; for a backward decoder they
/// must be built over time-reversed frame posteriors.
#[derive(Default)]
pub struct RecogResources<'a> {
    pub lm: Option<&'a dyn LanguageModel>,
    pub lm_second: Option<&'a dyn LanguageModel>,
    pub lm_second_bwd: Option<&'a dyn LanguageModel>,
    pub ctc_scorers: Option<Vec<Box<dyn CtcPrefixScorer>>>,
    pub ensemble: Vec<EnsembleMember<'a>>,
    pub refs: Option<&'a [Vec<u32>]>,
    pub speakers: Option<&'a [String]>,
    pub session: Option<&'a mut SessionContext>,
    pub exclude_eos: bool,
}

impl RnnDecoder {
    /// Decodes each utterance with beam search and returns its N-best
    /// list. The beam is re-batched every step so the whole beam costs
    /// one decode step per model.
    pub fn beam_search(
        &mut self,
        eouts: &ndarray::ArrayView3<f32>,
        elens: &[usize],
        recog: &RecogConfig,
        resources: RecogResources<'_>,
    ) -> Result<Vec<Vec<DecodedHypothesis>>, DecodeError> {
        let RecogResources {
            lm,
            lm_second,
            lm_second_bwd,
            mut ctc_scorers,
            mut ensemble,
            refs,
            speakers,
            mut session,
            exclude_eos,
        } = resources;

        let (bs, xmax, enc) = eouts.dim();
        if bs == 0 {
            return Ok(Vec::new());
        }
        recog.validate()?;
        if elens.len() != bs {
            return Err(DecodeError::input("elens must cover the batch"));
        }
        if enc != self.config.enc_n_units {
            return Err(DecodeError::Input(format!(
                "encoder width {enc} differs from configured {}",
                self.config.enc_n_units
            )));
        }
        if elens.iter().any(|&l| l == 0 || l > xmax) {
            return Err(DecodeError::input("encoder length out of range"));
        }
        if lm.is_some() && recog.lm_weight <= 0.0 {
            return Err(DecodeError::config("a first-pass LM needs lm_weight > 0"));
        }
        if lm_second.is_some() && recog.lm_second_weight <= 0.0 {
            return Err(DecodeError::config("a second-pass LM needs lm_second_weight > 0"));
        }
        if lm_second_bwd.is_some() && recog.lm_bwd_weight <= 0.0 {
            return Err(DecodeError::config("a backward second-pass LM needs lm_bwd_weight > 0"));
        }
        if self.has_fusion_lm() && lm.is_some() {
            return Err(DecodeError::config(
                "fusion and shallow first-pass LM cannot be combined",
            ));
        }
        for scoring_lm in [lm, lm_second, lm_second_bwd].into_iter().flatten() {
            if scoring_lm.vocab() != self.config.vocab {
                return Err(DecodeError::LanguageModel(format!(
                    "LM vocabulary {} differs from decoder vocabulary {}",
                    scoring_lm.vocab(),
                    self.config.vocab
                )));
            }
        }
        if let Some(scorers) = &ctc_scorers {
            if recog.ctc_weight <= 0.0 {
                return Err(DecodeError::config("CTC prefix scorers need ctc_weight > 0"));
            }
            if scorers.len() != bs {
                return Err(DecodeError::input("one CTC prefix scorer per utterance"));
            }
        }
        for member in &ensemble {
            if member.decoder.vocab() != self.config.vocab {
                return Err(DecodeError::Ensemble(format!(
                    "member vocabulary {} differs from the main model's {}",
                    member.decoder.vocab(),
                    self.config.vocab
                )));
            }
            if member.decoder.has_fusion_lm() {
                return Err(DecodeError::Ensemble(
                    "ensemble members cannot use LM fusion".into(),
                ));
            }
            if member.eouts.dim().0 != bs || member.elens.len() != bs {
                return Err(DecodeError::Ensemble(
                    "member encoder outputs must cover the batch".into(),
                ));
            }
        }
        if self.config.replace_sos
            && refs.map_or(true, |r| r.len() != bs || r.iter().any(Vec::is_empty))
        {
            return Err(DecodeError::input(
                "start-symbol replacement needs a leading reference token per item",
            ));
        }

        let eos = self.config.special.eos;
        let helper = BeamSearch::new(recog.beam_width, eos, recog.ctc_weight);
        let mut results = Vec::with_capacity(bs);

        for b in 0..bs {
            self.reset_attention_cache();
            for member in &mut ensemble {
                member.decoder.reset_attention_cache();
            }
            let eouts_b = eouts.slice(s![b..b + 1, ..elens[b], ..]);
            let elens_b = [elens[b]];

            // Cross-utterance carry, keyed by speaker.
            let mut carry_dstate: Option<DecoderState> = None;
            let mut carry_lm: Option<LmState> = None;
            let mut carry_tokens: Option<Vec<u32>> = None;
            if let Some(sess) = session.as_mut() {
                let speaker = speakers.and_then(|s| s.get(b)).map(String::as_str);
                if sess.enter_utterance(speaker) {
                    if recog.asr_state_carry_over {
                        carry_dstate = sess.decoder_state.clone();
                    }
                    if recog.lm_state_carry_over {
                        carry_lm = sess.lm_state.clone();
                        carry_tokens = sess.lm_tokens.clone();
                    }
                }
            }
            let lm_memory: Option<LmState> =
                session.as_ref().and_then(|s| s.lm_memory.clone());

            let dstate = match carry_dstate {
                Some(carried) if carried.batch() == 1 => carried,
                _ => self.zero_state(1),
            };
            let lm_initial: Option<LmState> = match (lm, self.has_fusion_lm()) {
                (Some(lm), _) => Some(match (&carry_tokens, lm.supports_cached_state()) {
                    (Some(tokens), true) => score_prefix(lm, tokens, lm_memory.as_ref())?.state,
                    _ => carry_lm.unwrap_or_else(|| lm.initial_state(1)),
                }),
                (None, true) => carry_lm,
                (None, false) => None,
            };
            let ctc_initial = ctc_scorers.as_ref().map(|v| v[b].initial_state());
            let member_states: Vec<MemberState> = ensemble
                .iter()
                .map(|m| MemberState {
                    dstate: m.decoder.zero_state(1),
                    att: m.decoder.fresh_attention(1),
                })
                .collect();
            let start = match (self.config.replace_sos, refs) {
                (true, Some(refs)) => refs[b][0],
                _ => eos,
            };

            let mut hyps = vec![Hypothesis::seed(
                start,
                dstate,
                self.fresh_attention(1),
                lm_initial,
                ctc_initial,
                member_states,
            )];
            let mut completed: Vec<Hypothesis> = Vec::new();
            let ymax = (elens[b] as f32 * recog.max_len_ratio).floor() as usize + 1;

            for _t in 0..ymax {
                if hyps.is_empty() {
                    break;
                }
                let n = hyps.len();
                let last_tokens: Vec<u32> = hyps
                    .iter()
                    .map(|h| h.tokens.last().copied().unwrap_or(eos))
                    .collect();

                // First-pass LM step: fusion features or shallow scores.
                let mut lm_rows: Option<Vec<ndarray::Array1<f32>>> = None;
                let mut lm_states_new: Option<Vec<LmState>> = None;
                let mut fusion_feats: Option<Array2<f32>> = None;
                if self.has_fusion_lm() {
                    let states: Option<Vec<&LmState>> =
                        hyps.iter().map(|h| h.lm_state.as_ref()).collect();
                    let state = match states {
                        Some(parts) => Some(LmState::concat(&parts)?),
                        None => None,
                    };
                    let out = self
                        .fusion_lm_step(&last_tokens, state.as_ref())?
                        .ok_or_else(|| DecodeError::input("fusion LM unavailable"))?;
                    fusion_feats = self.fusion_features(&out);
                    lm_states_new = Some((0..n).map(|j| out.state.select(j)).collect());
                } else if let Some(lm) = lm {
                    if lm.supports_cached_state() && !recog.cache_states {
                        // Re-encode each prefix from scratch instead of
                        // trusting cached per-layer states.
                        let mut rows = Vec::with_capacity(n);
                        let mut states = Vec::with_capacity(n);
                        for hyp in &hyps {
                            let mut seq = carry_tokens.clone().unwrap_or_default();
                            seq.extend_from_slice(&hyp.tokens);
                            let out = score_prefix(lm, &seq, lm_memory.as_ref())?;
                            rows.push(out.log_probs.index_axis(Axis(0), 0).to_owned());
                            states.push(out.state);
                        }
                        lm_rows = Some(rows);
                        lm_states_new = Some(states);
                    } else {
                        let states: Vec<&LmState> = hyps
                            .iter()
                            .map(|h| h.lm_state.as_ref())
                            .collect::<Option<Vec<_>>>()
                            .ok_or_else(|| {
                                DecodeError::input("LM state missing from a hypothesis")
                            })?;
                        let state = LmState::concat(&states)?;
                        let out = lm.predict(&last_tokens, &state, lm_memory.as_ref())?;
                        lm_rows =
                            Some((0..n).map(|j| out.log_probs.slice(s![j, ..]).to_owned()).collect());
                        lm_states_new = Some((0..n).map(|j| out.state.select(j)).collect());
                    }
                }

                // One decode step for the whole beam.
                let dparts: Vec<&DecoderState> = hyps.iter().map(|h| &h.dstate).collect();
                let dstate = DecoderState::concat(&dparts)?;
                let aparts: Vec<&AttentionState> = hyps.iter().map(|h| &h.att).collect();
                let att = AttentionState::concat(&aparts)?;
                let fview = fusion_feats.as_ref().map(|f| f.view());
                let out = self.decode_step(
                    &eouts_b,
                    &elens_b,
                    &dstate,
                    &att,
                    &last_tokens,
                    fview.as_ref(),
                    AttentionMode::Hard,
                    None,
                )?;

                let logits = self.output_logits(&out.attn_v.view());
                let mut probs = logits.mapv(|v| v * recog.softmax_smoothing);
                softmax_rows(&mut probs);

                let mut member_outs = Vec::with_capacity(ensemble.len());
                for (i, member) in ensemble.iter_mut().enumerate() {
                    let m_eouts = member.eouts.slice(s![b..b + 1, ..member.elens[b], ..]);
                    let m_elens = [member.elens[b]];
                    let dparts: Vec<&DecoderState> =
                        hyps.iter().map(|h| &h.ensemble[i].dstate).collect();
                    let m_dstate = DecoderState::concat(&dparts)?;
                    let aparts: Vec<&AttentionState> =
                        hyps.iter().map(|h| &h.ensemble[i].att).collect();
                    let m_att = AttentionState::concat(&aparts)?;
                    let m_out = member.decoder.decode_step(
                        &m_eouts,
                        &m_elens,
                        &m_dstate,
                        &m_att,
                        &last_tokens,
                        None,
                        AttentionMode::Hard,
                        None,
                    )?;
                    let m_logits = member.decoder.output_logits(&m_out.attn_v.view());
                    let mut m_probs = m_logits;
                    softmax_rows(&mut m_probs);
                    probs += &m_probs;
                    member_outs.push(m_out);
                }
                let n_models = 1 + ensemble.len();
                let scores_att = probs.mapv(|p| (p / n_models as f32).ln());
                let step_weights = out
                    .att
                    .weights
                    .as_ref()
                    .ok_or_else(|| DecodeError::input("attention produced no weights"))?;

                let mut new_hyps: Vec<Hypothesis> = Vec::new();
                for (j, hyp) in hyps.iter().enumerate() {
                    let row = scores_att.index_axis(Axis(0), j);
                    let cur_aw = step_weights.index_axis(Axis(0), j).to_owned();
                    let gen_len = hyp.gen_len();

                    let mut cands = select_candidates(
                        &row,
                        hyp.breakdown.att,
                        recog.ctc_weight,
                        recog.beam_width,
                    );

                    if let Some(rows) = &lm_rows {
                        for cand in &mut cands {
                            cand.lm = hyp.breakdown.lm + rows[j][cand.id as usize];
                            cand.total += cand.lm * recog.lm_weight;
                        }
                    } else {
                        for cand in &mut cands {
                            cand.lm = hyp.breakdown.lm;
                        }
                    }

                    if recog.length_penalty > 0.0 {
                        if recog.gnmt_decoding {
                            let lp = ((6 + gen_len) as f32).powf(recog.length_penalty)
                                / 6f32.powf(recog.length_penalty);
                            for cand in &mut cands {
                                cand.total /= lp;
                            }
                        } else {
                            for cand in &mut cands {
                                cand.total += (gen_len + 1) as f32 * recog.length_penalty;
                            }
                        }
                    }

                    // Coverage is recomputed from the whole history so
                    // pruning never sees a stale value.
                    let mut cp = 0.0;
                    if recog.coverage_penalty > 0.0 {
                        cp = coverage_penalty(
                            &hyp.aws,
                            &cur_aw,
                            recog.coverage_threshold,
                            recog.gnmt_decoding,
                        );
                        for cand in &mut cands {
                            cand.total += cp * recog.coverage_penalty;
                        }
                    }

                    let scorer = ctc_scorers
                        .as_mut()
                        .map(|v| v[b].as_mut() as &mut dyn CtcPrefixScorer);
                    helper.add_ctc_score(&hyp.tokens, &mut cands, hyp.ctc_state.as_ref(), scorer)?;

                    for cand in cands {
                        if cand.id == eos {
                            if (gen_len as f32) < elens[b] as f32 * recog.min_len_ratio {
                                continue;
                            }
                            let mut best_no_eos = f32::NEG_INFINITY;
                            for (id, &v) in row.iter().enumerate() {
                                if id != eos as usize && v > best_no_eos {
                                    best_no_eos = v;
                                }
                            }
                            if row[eos as usize] <= recog.eos_threshold * best_no_eos {
                                continue;
                            }
                        }
                        let norm = if recog.length_norm {
                            (gen_len + 1) as f32
                        } else {
                            1.0
                        };
                        let mut tokens = hyp.tokens.clone();
                        tokens.push(cand.id);
                        let mut aws = hyp.aws.clone();
                        aws.push(cur_aw.clone());
                        let ens: Vec<MemberState> = member_outs
                            .iter()
                            .map(|m| MemberState {
                                dstate: m.state.select(j),
                                att: m.att.select(j),
                            })
                            .collect();
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
                                cp,
                                lm_second: 0.0,
                                lm_second_bwd: 0.0,
                            },
                            dstate: out.state.select(j),
                            att: out.att.select(j),
                            aws,
                            lm_state,
                            ctc_state: cand.ctc_state,
                            ensemble: ens,
                            no_boundary: false,
                        });
                    }
                }

                helper.prune(&mut new_hyps);
                let (active, done) = helper.remove_complete_hyp(new_hyps, &mut completed);
                hyps = active;
                if done {
                    break;
                }
            }

            // Backfill when fewer hypotheses completed than requested.
            if completed.is_empty() {
                completed = hyps;
            } else if completed.len() < recog.nbest && recog.nbest > 1 {
                let need = recog.nbest - completed.len();
                completed.extend(hyps.into_iter().take(need));
            }

            if let Some(lm2) = lm_second {
                lm_rescoring(&mut completed, lm2, recog.lm_second_weight, false)?;
            }
            if let Some(lm2b) = lm_second_bwd {
                lm_rescoring(&mut completed, lm2b, recog.lm_bwd_weight, true)?;
            }
            completed.sort_by(|a, b| b.score.total_cmp(&a.score));

            for (k, hyp) in completed.iter().take(recog.nbest).enumerate() {
                log::debug!(
                    "utt {b} hyp {k}: tokens={:?} score={:.4} att={:.4} cp={:.4} ctc={:.4} lm={:.4} lm2={:.4} lm2_bwd={:.4}",
                    &hyp.tokens[1..],
                    hyp.score,
                    hyp.breakdown.att * (1.0 - recog.ctc_weight),
                    hyp.breakdown.cp * recog.coverage_penalty,
                    hyp.breakdown.ctc * recog.ctc_weight,
                    hyp.breakdown.lm * recog.lm_weight,
                    hyp.breakdown.lm_second * recog.lm_second_weight,
                    hyp.breakdown.lm_second_bwd * recog.lm_bwd_weight,
                );
            }

            if let Some(sess) = session.as_mut() {
                if let Some(best) = completed.first() {
                    sess.decoder_state = Some(best.dstate.clone());
                    if let Some(lm) = lm {
                        if let Some(best_lm) = &best.lm_state {
                            if lm.supports_memory() {
                                sess.lm_memory =
                                    lm.update_memory(sess.lm_memory.take(), best_lm)?;
                            } else if lm.supports_cached_state() {
                                let mut carry = best.tokens.clone();
                                if carry.len() > 1 && carry.last() == Some(&eos) {
                                    carry.pop();
                                }
                                sess.lm_tokens = Some(carry);
                            }
                            sess.lm_state = Some(best_lm.clone());
                        }
                    } else if self.has_fusion_lm() {
                        sess.lm_state = best.lm_state.clone();
                    }
                }
            }

            let mut utt_results = Vec::new();
            for hyp in completed.iter().take(recog.nbest) {
                let mut tokens: Vec<u32> = hyp.tokens[1..].to_vec();
                let len = tokens.len();
                let heads = hyp.aws.first().map(|a| a.dim().0).unwrap_or(1);
                let mut aws = Array3::zeros((heads, len, elens[b]));
                for (l, aw) in hyp.aws.iter().enumerate() {
                    aws.slice_mut(s![.., l, ..]).assign(aw);
                }
                if self.config.backward {
                    tokens.reverse();
                    aws.invert_axis(Axis(1));
                }
                let ended = hyp.tokens.len() > 1 && hyp.tokens.last() == Some(&eos);
                if exclude_eos && ended {
                    if self.config.backward {
                        tokens.remove(0);
                    } else {
                        tokens.pop();
                    }
                }
                utt_results.push(DecodedHypothesis {
                    tokens,
                    score: hyp.score,
                    breakdown: hyp.breakdown,
                    aws,
                });
            }
            results.push(utt_results);
        }

        Ok(results)
    }
}

/// Top-`beam_width` continuations of one hypothesis, strictly by the
/// attention score so cheaper sources bound the expensive ones.
pub(crate) fn select_candidates(
    step_scores: &ArrayView1<f32>,
    base_att: f32,
    ctc_weight: f32,
    beam_width: usize,
) -> Vec<Candidate> {
    let mut all: Vec<Candidate> = step_scores
        .iter()
        .enumerate()
        .map(|(id, &v)| {
            let att = base_att + v;
            Candidate {
                id: id as u32,
                total: att * (1.0 - ctc_weight),
                att,
                lm: 0.0,
                ctc: 0.0,
                ctc_state: None,
            }
        })
        .collect();
    all.sort_by(|a, b| b.total.total_cmp(&a.total));
    all.truncate(beam_width);
    all
}

/// Coverage over the whole attention history including the current
/// step. Per-weight threshold clipping, averaged over heads; the GNMT
/// variant rewards only under-attended source positions.
fn coverage_penalty(
    history: &[Array2<f32>],
    current: &Array2<f32>,
    threshold: f32,
    gnmt: bool,
) -> f32 {
    let heads = current.dim().0.max(1);
    if gnmt {
        let tmax = current.dim().1;
        let mut cp = 0.0f32;
        for t in 0..tmax {
            let mut mass = 0.0f32;
            for aw in history.iter().chain(std::iter::once(current)) {
                for h in 0..aw.dim().0 {
                    mass += aw[[h, t]];
                }
            }
            mass /= heads as f32;
            let v = mass.max(1e-10).ln();
            if v < 0.0 {
                cp += v;
            }
        }
        cp
    } else {
        let mut total = 0.0f32;
        for aw in history.iter().chain(std::iter::once(current)) {
            for &v in aw.iter() {
                if threshold == 0.0 || v > threshold {
                    total += v;
                }
            }
        }
        total / heads as f32
    }
}

/// Folds a prefix through the LM one token at a time and returns the
/// prediction after its last token.
fn score_prefix(
    lm: &dyn LanguageModel,
    tokens: &[u32],
    memory: Option<&LmState>,
) -> Result<LmOutput, DecodeError> {
    let (last, prefix) = tokens
        .split_last()
        .ok_or_else(|| DecodeError::input("cannot score an empty prefix"))?;
    let mut state = lm.initial_state(1);
    for &tok in prefix {
        state = lm.predict(&[tok], &state, memory)?.state;
    }
    lm.predict(&[*last], &state, memory)
}

/// Second-pass rescoring: the whole sequence is re-scored by `lm` and
/// the weighted total is added to the hypothesis score. A backward LM
/// sees the sequence reversed.
fn lm_rescoring(
    hyps: &mut [Hypothesis],
    lm: &dyn LanguageModel,
    weight: f32,
    backward: bool,
) -> Result<(), DecodeError> {
    for hyp in hyps.iter_mut() {
        let seq: Vec<u32> = if backward {
            hyp.tokens.iter().rev().copied().collect()
        } else {
            hyp.tokens.clone()
        };
        let mut state = lm.initial_state(1);
        let mut total = 0.0f32;
        for w in seq.windows(2) {
            let out = lm.predict(&[w[0]], &state, None)?;
            total += out.log_probs[[0, w[1] as usize]];
            state = out.state;
        }
        hyp.score += total * weight;
        if backward {
            hyp.breakdown.lm_second_bwd = total;
        } else {
            hyp.breakdown.lm_second = total;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array3 as A3};

    struct UniformLm {
        vocab: usize,
    }

    impl LanguageModel for UniformLm {
        fn vocab(&self) -> usize {
            self.vocab
        }

        fn dim(&self) -> usize {
            2
        }

        fn initial_state(&self, batch: usize) -> LmState {
            LmState::Recurrent {
                h: A3::zeros((1, batch, 2)),
                c: A3::zeros((1, batch, 2)),
            }
        }

        fn predict(
            &self,
            tokens: &[u32],
            state: &LmState,
            _memory: Option<&LmState>,
        ) -> Result<LmOutput, DecodeError> {
            let lp = -(self.vocab as f32).ln();
            Ok(LmOutput {
                features: Array2::zeros((tokens.len(), 2)),
                state: state.clone(),
                log_probs: Array2::from_elem((tokens.len(), self.vocab), lp),
            })
        }
    }

    fn make_hyp(tokens: &[u32]) -> Hypothesis {
        Hypothesis {
            tokens: tokens.to_vec(),
            score: 0.0,
            breakdown: ScoreBreakdown::default(),
            dstate: DecoderState::Gru {
                h: A3::zeros((1, 1, 4)),
            },
            att: AttentionState::fresh(1, 8),
            aws: Vec::new(),
            lm_state: None,
            ctc_state: None,
            ensemble: Vec::new(),
            no_boundary: false,
        }
    }

    #[test]
    fn candidates_are_selected_by_attention_score() {
        let row = Array1::from(vec![-2.0f32, -0.5, -1.0, -3.0]);
        let cands = select_candidates(&row.view(), -1.0, 0.5, 2);
        assert_eq!(cands.len(), 2);
        assert_eq!(cands[0].id, 1);
        assert_eq!(cands[1].id, 2);
        assert!((cands[0].att - (-1.5)).abs() < 1e-6);
        assert!((cands[0].total - (-0.75)).abs() < 1e-6);
    }

    #[test]
    fn coverage_threshold_clips_small_weights() {
        let mut step0 = Array2::zeros((1, 4));
        step0[[0, 0]] = 0.6;
        step0[[0, 1]] = 0.4;
        let mut step1 = Array2::zeros((1, 4));
        step1[[0, 1]] = 0.05;
        step1[[0, 2]] = 0.95;
        let history = vec![step0];
        let all = coverage_penalty(&history, &step1, 0.0, false);
        assert!((all - 2.0).abs() < 1e-5);
        let clipped = coverage_penalty(&history, &step1, 0.5, false);
        assert!((clipped - (0.6 + 0.95)).abs() < 1e-5);
    }

    #[test]
    fn gnmt_coverage_only_penalizes_uncovered_positions() {
        let mut step0 = Array2::zeros((1, 3));
        step0[[0, 0]] = 1.0;
        let mut step1 = Array2::zeros((1, 3));
        step1[[0, 1]] = 0.5;
        let cp = coverage_penalty(&[step0], &step1, 0.0, true);
        // Position 0 is fully covered, position 1 at half mass and
        // position 2 untouched; only the short positions count.
        assert!(cp < 0.0);
        assert!(cp < (0.5f32).ln());
    }

    #[test]
    fn rescoring_adds_weighted_sequence_score() {
        let lm = UniformLm { vocab: 4 };
        let mut hyps = vec![make_hyp(&[2, 1, 2])];
        lm_rescoring(&mut hyps, &lm, 0.5, false).unwrap();
        let expected = 2.0 * -(4.0f32).ln();
        assert!((hyps[0].breakdown.lm_second - expected).abs() < 1e-5);
        assert!((hyps[0].score - expected * 0.5).abs() < 1e-5);

        lm_rescoring(&mut hyps, &lm, 0.25, true).unwrap();
        assert!((hyps[0].breakdown.lm_second_bwd - expected).abs() < 1e-5);
    }
}
