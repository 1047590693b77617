//! Batch greedy decoding.

use ndarray::{s, Array3, ArrayView3, Axis};

use crate::attention::AttentionMode;
use crate::config::RecogConfig;
use crate::error::DecodeError;
use crate::lm::LmState;
use crate::session::SessionContext;

use super::loss::argmax_rows;
use super::{DecoderState, RnnDecoder};

/// One utterance's greedy result.
#[derive(Debug, Clone)]
pub struct GreedyHypothesis {
    pub tokens: Vec<u32>,
    /// Attention weights over the kept steps, `[H, L, T]`.
    pub aws: Array3<f32>,
}

impl RnnDecoder {
    /// Decodes every utterance of the batch by stepwise argmax. Hard
    /// attention mode, so a monotonic scorer commits to boundaries.
    /// `refs` supplies the first token per item when start-symbol
    /// replacement is configured; `trigger_points` constrain a monotonic
    /// scorer to precomputed boundaries.
    pub fn greedy(
        &mut self,
        eouts: &ArrayView3<f32>,
        elens: &[usize],
        recog: &RecogConfig,
        exclude_eos: bool,
        refs: Option<&[Vec<u32>]>,
        trigger_points: Option<&[Vec<usize>]>,
        session: Option<&mut SessionContext>,
    ) -> Result<Vec<GreedyHypothesis>, DecodeError> {
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
        if self.config.replace_sos
            && refs.map_or(true, |r| r.len() != bs || r.iter().any(Vec::is_empty))
        {
            return Err(DecodeError::input(
                "start-symbol replacement needs a leading reference token per item",
            ));
        }
        if let Some(tp) = trigger_points {
            if tp.len() != bs {
                return Err(DecodeError::input("trigger points must cover the batch"));
            }
        }

        let mut dstate = self.zero_state(bs);
        if self.config.discourse_aware {
            if let Some(sess) = &session {
                if !sess.new_session
                    && sess.batch_states.len() == bs
                    && sess.batch_states.iter().all(Option::is_some)
                {
                    let parts: Vec<&DecoderState> = sess.batch_states.iter().flatten().collect();
                    dstate = DecoderState::concat(&parts)?;
                }
            }
        }
        let mut snaps: Vec<Option<DecoderState>> = vec![None; bs];

        self.reset_attention_cache();
        let mut att = self.fresh_attention(bs);
        let mut lm_state: Option<LmState> = None;
        let eos = self.config.special.eos;
        let mut tokens: Vec<u32> = match (self.config.replace_sos, refs) {
            (true, Some(refs)) => refs.iter().map(|y| y[0]).collect(),
            _ => vec![eos; bs],
        };

        let ymax = (xmax as f32 * recog.max_len_ratio).floor() as usize + 1;
        let mut ylens = vec![0usize; bs];
        let mut eos_flags = vec![false; bs];
        let mut steps_tokens: Vec<Vec<u32>> = Vec::with_capacity(ymax);
        let mut steps_aws: Vec<Array3<f32>> = Vec::with_capacity(ymax);

        for t in 0..ymax {
            let lmout = self.fusion_lm_step(&tokens, lm_state.as_ref())?;
            let feats = lmout.as_ref().and_then(|o| self.fusion_features(o));
            let fview = feats.as_ref().map(|f| f.view());
            let trig = match trigger_points {
                Some(tp) => {
                    let mut step = Vec::with_capacity(bs);
                    for points in tp {
                        let point = points.get(t).copied().ok_or_else(|| {
                            DecodeError::Input(format!("trigger points exhausted at step {t}"))
                        })?;
                        step.push(point);
                    }
                    Some(step)
                }
                None => None,
            };

            let out = self.decode_step(
                eouts,
                elens,
                &dstate,
                &att,
                &tokens,
                fview.as_ref(),
                AttentionMode::Hard,
                trig.as_deref(),
            )?;
            if let Some(o) = lmout {
                lm_state = Some(o.state);
            }

            let aw = out
                .att
                .weights
                .clone()
                .ok_or_else(|| DecodeError::input("attention produced no weights"))?;
            steps_aws.push(aw);
            let logits = self.output_logits(&out.attn_v.view());
            let next = argmax_rows(&logits.view());
            dstate = out.state;
            att = out.att;

            for b in 0..bs {
                if !eos_flags[b] {
                    if next[b] == eos {
                        eos_flags[b] = true;
                        if self.config.discourse_aware {
                            snaps[b] = Some(dstate.select(b));
                        }
                    }
                    ylens[b] += 1;
                }
            }
            steps_tokens.push(next.clone());
            tokens = next;

            if eos_flags.iter().all(|&f| f) {
                break;
            }
        }

        if self.config.discourse_aware {
            for (b, snap) in snaps.iter_mut().enumerate() {
                if snap.is_none() {
                    // Items that never finished carry their final state.
                    *snap = Some(dstate.select(b));
                }
            }
        }
        if let Some(sess) = session {
            if self.config.discourse_aware {
                sess.batch_states = snaps;
                sess.new_session = false;
            }
            // Only a fusion pass owns the carried LM state; without one
            // the slot keeps whatever an earlier pass stored.
            if self.has_fusion_lm() {
                sess.lm_state = lm_state;
            }
        }

        let heads = steps_aws.first().map(|a| a.dim().1).unwrap_or(1);
        let mut results = Vec::with_capacity(bs);
        for b in 0..bs {
            let len = ylens[b];
            let mut toks: Vec<u32> = (0..len).map(|t| steps_tokens[t][b]).collect();
            let mut aws = Array3::zeros((heads, len, xmax));
            for l in 0..len {
                aws.slice_mut(s![.., l, ..])
                    .assign(&steps_aws[l].slice(s![b, .., ..]));
            }
            if self.config.backward {
                toks.reverse();
                aws.invert_axis(Axis(1));
            }
            if exclude_eos && eos_flags[b] {
                if self.config.backward {
                    toks.remove(0);
                } else {
                    toks.pop();
                }
            }
            if let Some(refs) = refs {
                log::debug!("ref ({b}): {:?}", refs[b]);
            }
            log::debug!("greedy hyp ({b}): {:?}", toks);
            results.push(GreedyHypothesis { tokens: toks, aws });
        }
        Ok(results)
    }
}
