//! Recurrent attention decoder and its decoding front-ends.
//!
//! `RnnDecoder` owns the parameters and the attention scorer; one call
//! to [`RnnDecoder::decode_step`] advances every batch row by a single
//! output position. The training loss, greedy, beam-search, streaming
//! and MBR front-ends live in the submodules and drive that step.

pub mod beam_search;
pub mod greedy;
pub mod loss;
pub mod mbr;
pub mod streaming;

use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::attention::{build_attention, AttentionMode, AttentionScorer, AttentionState};
use crate::config::{CellKind, DecoderConfig, LmFusionKind, ScheduledSamplingKind};
use crate::ctc::CtcScorer;
use crate::error::DecodeError;
use crate::layers::{sigmoid, Embedding, GruCell, Linear, LstmCell, RnnCell};
use crate::lm::{LanguageModel, LmOutput};

/// Typed recurrent state, `[n_layers, B, n_units]` per tensor.
#[derive(Debug, Clone)]
pub enum DecoderState {
    Lstm { h: Array3<f32>, c: Array3<f32> },
    Gru { h: Array3<f32> },
}

impl DecoderState {
    pub fn batch(&self) -> usize {
        match self {
            DecoderState::Lstm { h, .. } | DecoderState::Gru { h } => h.dim().1,
        }
    }

    /// Extracts one batch column as a standalone state.
    pub fn select(&self, index: usize) -> Self {
        match self {
            DecoderState::Lstm { h, c } => DecoderState::Lstm {
                h: h.slice(s![.., index..index + 1, ..]).to_owned(),
                c: c.slice(s![.., index..index + 1, ..]).to_owned(),
            },
            DecoderState::Gru { h } => DecoderState::Gru {
                h: h.slice(s![.., index..index + 1, ..]).to_owned(),
            },
        }
    }

    /// Stacks per-hypothesis states back into a batch.
    pub fn concat(states: &[&DecoderState]) -> Result<Self, DecodeError> {
        let first = states
            .first()
            .ok_or_else(|| DecodeError::input("cannot concat an empty state list"))?;
        match first {
            DecoderState::Lstm { .. } => {
                let mut hs = Vec::with_capacity(states.len());
                let mut cs = Vec::with_capacity(states.len());
                for state in states {
                    match state {
                        DecoderState::Lstm { h, c } => {
                            hs.push(h.view());
                            cs.push(c.view());
                        }
                        DecoderState::Gru { .. } => {
                            return Err(DecodeError::input(
                                "mixed decoder state kinds in one beam",
                            ));
                        }
                    }
                }
                Ok(DecoderState::Lstm {
                    h: ndarray::concatenate(Axis(1), &hs)?,
                    c: ndarray::concatenate(Axis(1), &cs)?,
                })
            }
            DecoderState::Gru { .. } => {
                let mut hs = Vec::with_capacity(states.len());
                for state in states {
                    match state {
                        DecoderState::Gru { h } => hs.push(h.view()),
                        DecoderState::Lstm { .. } => {
                            return Err(DecodeError::input(
                                "mixed decoder state kinds in one beam",
                            ));
                        }
                    }
                }
                Ok(DecoderState::Gru {
                    h: ndarray::concatenate(Axis(1), &hs)?,
                })
            }
        }
    }
}

/// One decode step over a batch.
#[derive(Debug, Clone)]
pub struct DecodeOutput {
    pub state: DecoderState,
    pub att: AttentionState,
    /// Generation vector before the output projection, `[B, bottleneck_dim]`.
    pub attn_v: Array2<f32>,
}

struct LmFusion {
    kind: LmFusionKind,
    dec_feat: Linear,
    lm_feat: Linear,
    lm_gate: Linear,
}

pub struct RnnDecoder {
    config: DecoderConfig,
    embed: Embedding,
    cells: Vec<RnnCell>,
    projs: Vec<Linear>,
    score: Box<dyn AttentionScorer>,
    fusion: Option<LmFusion>,
    fusion_lm: Option<Box<dyn LanguageModel>>,
    output_bn: Linear,
    output: Linear,
    ctc: Option<Box<dyn CtcScorer>>,
    rng: StdRng,
    /// Scheduled-sampling rate in effect; raised by
    /// [`RnnDecoder::start_scheduled_sampling`].
    active_ss_prob: f32,
}

impl RnnDecoder {
    pub fn new(
        config: DecoderConfig,
        fusion_lm: Option<Box<dyn LanguageModel>>,
        ctc: Option<Box<dyn CtcScorer>>,
    ) -> Result<Self, DecodeError> {
        config.validate()?;
        if config.ctc_weight > 0.0 && ctc.is_none() {
            return Err(DecodeError::config("ctc_weight > 0 requires a CTC scorer"));
        }
        if config.lm_fusion.is_some() && fusion_lm.is_none() {
            return Err(DecodeError::config("LM fusion requires an external LM"));
        }
        if let (Some(LmFusionKind::ColdProb), Some(lm)) = (&config.lm_fusion, &fusion_lm) {
            if lm.vocab() != config.vocab {
                return Err(DecodeError::config(
                    "cold_prob fusion requires matching vocabularies",
                ));
            }
        }

        let scale = config.param_init;
        let mut rng = StdRng::seed_from_u64(config.seed);

        let embed = Embedding::new(config.vocab, config.emb_dim, config.special.pad, &mut rng, scale);

        let mut cells = Vec::with_capacity(config.n_layers);
        let mut projs = Vec::new();
        let mut in_dim = config.emb_dim + config.enc_n_units;
        for _ in 0..config.n_layers {
            cells.push(match config.rnn_type {
                CellKind::Lstm => {
                    RnnCell::Lstm(LstmCell::new(in_dim, config.n_units, &mut rng, scale))
                }
                CellKind::Gru => RnnCell::Gru(GruCell::new(in_dim, config.n_units, &mut rng, scale)),
            });
            in_dim = if config.n_projs > 0 {
                projs.push(Linear::new(config.n_units, config.n_projs, true, &mut rng, scale));
                config.n_projs
            } else {
                config.n_units
            };
        }

        let score = build_attention(
            &config.attention,
            config.enc_n_units,
            config.qdim(),
            &mut rng,
            scale,
        );

        let dec_odim = config.qdim();
        let bn_in = if config.lm_fusion.is_some() {
            2 * config.n_units
        } else {
            dec_odim + config.enc_n_units
        };
        let output_bn = Linear::new(bn_in, config.bottleneck_dim, true, &mut rng, scale);
        let mut output = Linear::new(config.bottleneck_dim, config.vocab, true, &mut rng, scale);
        if config.tie_embedding {
            output.weight = embed.weight.clone();
        }

        let fusion = match (&config.lm_fusion, &fusion_lm) {
            (Some(kind), Some(lm)) => {
                let feat_in = match kind {
                    LmFusionKind::ColdProb => lm.vocab(),
                    LmFusionKind::Cold | LmFusionKind::Deep => lm.dim(),
                };
                let dec_feat =
                    Linear::new(dec_odim + config.enc_n_units, config.n_units, true, &mut rng, scale);
                let lm_feat = Linear::new(feat_in, config.n_units, true, &mut rng, scale);
                let mut lm_gate = Linear::new(2 * config.n_units, config.n_units, true, &mut rng, scale);
                if let Some(bias) = &mut lm_gate.bias {
                    // Gates open slowly; the LM contributes little at first.
                    bias.fill(-1.0);
                }
                Some(LmFusion {
                    kind: *kind,
                    dec_feat,
                    lm_feat,
                    lm_gate,
                })
            }
            _ => None,
        };

        log::info!(
            "decoder ready: vocab={}, {} x {:?}({}), attention={:?}, ctc_weight={}, fusion={:?}",
            config.vocab,
            config.n_layers,
            config.rnn_type,
            config.n_units,
            config.attention.kind,
            config.ctc_weight,
            config.lm_fusion,
        );

        Ok(Self {
            config,
            embed,
            cells,
            projs,
            score,
            fusion,
            fusion_lm,
            output_bn,
            output,
            ctc,
            rng,
            active_ss_prob: 0.0,
        })
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn vocab(&self) -> usize {
        self.config.vocab
    }

    pub fn n_heads(&self) -> usize {
        self.score.n_heads()
    }

    /// Whether hard-mode decoding can stream chunk by chunk.
    pub fn supports_streaming(&self) -> bool {
        self.score.supports_streaming()
    }

    pub fn zero_state(&self, batch: usize) -> DecoderState {
        let dim = (self.config.n_layers, batch, self.config.n_units);
        match self.config.rnn_type {
            CellKind::Lstm => DecoderState::Lstm {
                h: Array3::zeros(dim),
                c: Array3::zeros(dim),
            },
            CellKind::Gru => DecoderState::Gru {
                h: Array3::zeros(dim),
            },
        }
    }

    pub fn fresh_attention(&self, batch: usize) -> AttentionState {
        AttentionState::fresh(batch, self.config.enc_n_units)
    }

    /// Clears cached attention key projections; call at utterance (and
    /// streaming-chunk) boundaries.
    pub fn reset_attention_cache(&mut self) {
        self.score.reset();
    }

    /// Re-derives the runtime randomness (scheduled sampling draws,
    /// monotonic-energy noise) from a fresh seed. Parameters stay.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
        let noise_seed = self.rng.gen::<u64>();
        self.score.reseed(noise_seed);
    }

    /// Activates scheduled sampling; constant rate jumps to the
    /// configured probability, ramped rate approaches it over calls.
    pub fn start_scheduled_sampling(&mut self) {
        self.active_ss_prob = match self.config.ss_type {
            ScheduledSamplingKind::Constant => self.config.ss_prob,
            ScheduledSamplingKind::Ramp => {
                (self.active_ss_prob + self.config.ss_prob / 10.0).min(self.config.ss_prob)
            }
        };
        log::debug!("scheduled sampling rate now {}", self.active_ss_prob);
    }

    /// One decode step. `memory` is `[B_mem, T, enc]` with `B_mem` of 1
    /// (shared across the batch, as in beam search) or the full batch;
    /// `elens` has one entry per memory row.
    #[allow(clippy::too_many_arguments)]
    pub fn decode_step(
        &mut self,
        memory: &ArrayView3<f32>,
        elens: &[usize],
        state: &DecoderState,
        att: &AttentionState,
        tokens: &[u32],
        lm_features: Option<&ArrayView2<f32>>,
        mode: AttentionMode,
        trigger_points: Option<&[usize]>,
    ) -> Result<DecodeOutput, DecodeError> {
        let batch = tokens.len();
        let (b_mem, _, enc) = memory.dim();
        if b_mem != 1 && b_mem != batch {
            return Err(DecodeError::Input(format!(
                "memory batch {b_mem} cannot serve a query batch of {batch}"
            )));
        }
        if elens.len() != b_mem {
            return Err(DecodeError::input("elens must match the memory batch"));
        }
        if enc != self.config.enc_n_units {
            return Err(DecodeError::Input(format!(
                "memory width {enc} differs from configured {}",
                self.config.enc_n_units
            )));
        }
        if state.batch() != batch || att.batch() != batch {
            return Err(DecodeError::input("carried state does not match the batch"));
        }

        let y_emb = self.embed.lookup(tokens)?;
        let inputs = ndarray::concatenate(Axis(1), &[y_emb.view(), att.context.view()])?;
        let (new_state, query, dout_gen) = self.recurrency(&inputs, state)?;
        let att_new = self
            .score
            .forward(memory, elens, &query.view(), att, mode, trigger_points)?;
        let attn_v = self.generate(&att_new.context, &dout_gen, lm_features)?;
        Ok(DecodeOutput {
            state: new_state,
            att: att_new,
            attn_v,
        })
    }

    /// Advances the layer stack; returns the new state, the first-layer
    /// output (attention query) and the last-layer output (generation).
    fn recurrency(
        &self,
        inputs: &Array2<f32>,
        state: &DecoderState,
    ) -> Result<(DecoderState, Array2<f32>, Array2<f32>), DecodeError> {
        let (h_prev, c_prev) = match state {
            DecoderState::Lstm { h, c } => (h, Some(c)),
            DecoderState::Gru { h } => (h, None),
        };
        if h_prev.dim().0 != self.cells.len() {
            return Err(DecodeError::input("state layer count differs from the stack"));
        }

        let mut h_new = Array3::zeros(h_prev.raw_dim());
        let mut c_new = c_prev.map(|c| Array3::zeros(c.raw_dim()));
        let mut x = inputs.clone();
        let mut query = None;
        for (l, cell) in self.cells.iter().enumerate() {
            let h_l = h_prev.index_axis(Axis(0), l);
            let c_l = c_prev.map(|c| c.index_axis(Axis(0), l));
            let (h_out, c_out) = cell.forward(&x.view(), &h_l, c_l.as_ref())?;
            h_new.index_axis_mut(Axis(0), l).assign(&h_out);
            match (&mut c_new, c_out) {
                (Some(cn), Some(co)) => cn.index_axis_mut(Axis(0), l).assign(&co),
                (None, None) => {}
                _ => {
                    return Err(DecodeError::input(
                        "cell state kind does not match the layer stack",
                    ));
                }
            }
            let dout = match self.projs.get(l) {
                Some(proj) => proj.forward(&h_out.view()).mapv(f32::tanh),
                None => h_out,
            };
            if l == 0 {
                query = Some(dout.clone());
            }
            x = dout;
        }
        let query = query.ok_or_else(|| DecodeError::input("decoder has no layers"))?;
        let new_state = match c_new {
            Some(c) => DecoderState::Lstm { h: h_new, c },
            None => DecoderState::Gru { h: h_new },
        };
        Ok((new_state, query, x))
    }

    /// Combines context, generation output and optionally gated LM
    /// features into the tanh bottleneck.
    fn generate(
        &self,
        context: &Array2<f32>,
        dout: &Array2<f32>,
        lm_features: Option<&ArrayView2<f32>>,
    ) -> Result<Array2<f32>, DecodeError> {
        let out = match (&self.fusion, lm_features) {
            (Some(fusion), Some(lmout)) => {
                let merged = ndarray::concatenate(Axis(1), &[dout.view(), context.view()])?;
                let dec_feat = fusion.dec_feat.forward(&merged.view());
                let lm_feat = fusion.lm_feat.forward(lmout);
                let gate_in = ndarray::concatenate(Axis(1), &[dec_feat.view(), lm_feat.view()])?;
                let gate = fusion.lm_gate.forward(&gate_in.view()).mapv(sigmoid);
                let gated = gate * &lm_feat;
                let bn_in = ndarray::concatenate(Axis(1), &[dec_feat.view(), gated.view()])?;
                self.output_bn.forward(&bn_in.view())
            }
            (Some(_), None) => {
                return Err(DecodeError::input(
                    "LM fusion is configured but no LM features were given",
                ));
            }
            (None, _) => {
                let bn_in = ndarray::concatenate(Axis(1), &[dout.view(), context.view()])?;
                self.output_bn.forward(&bn_in.view())
            }
        };
        Ok(out.mapv(f32::tanh))
    }

    /// Logits over the vocabulary for a batch of generation vectors.
    pub fn output_logits(&self, attn_v: &ArrayView2<f32>) -> Array2<f32> {
        self.output.forward(attn_v)
    }

    /// Feature vectors the fusion layers consume for a given LM step.
    pub(crate) fn fusion_features(&self, out: &LmOutput) -> Option<Array2<f32>> {
        self.fusion.as_ref().map(|fusion| match fusion.kind {
            LmFusionKind::ColdProb => out.log_probs.mapv(f32::exp),
            LmFusionKind::Cold | LmFusionKind::Deep => out.features.clone(),
        })
    }

    /// Advances the internal fusion LM by one token per batch row.
    pub(crate) fn fusion_lm_step(
        &self,
        tokens: &[u32],
        state: Option<&crate::lm::LmState>,
    ) -> Result<Option<LmOutput>, DecodeError> {
        match &self.fusion_lm {
            Some(lm) => {
                let owned;
                let state = match state {
                    Some(s) => s,
                    None => {
                        owned = lm.initial_state(tokens.len());
                        &owned
                    }
                };
                Ok(Some(lm.predict(tokens, state, None)?))
            }
            None => Ok(None),
        }
    }

    pub(crate) fn has_fusion_lm(&self) -> bool {
        self.fusion_lm.is_some()
    }

    pub(crate) fn sample_step(&mut self) -> bool {
        self.active_ss_prob > 0.0 && self.rng.gen::<f32>() < self.active_ss_prob
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AttentionKind;
    use ndarray::Array3;

    fn make_config() -> DecoderConfig {
        DecoderConfig {
            enc_n_units: 8,
            n_units: 12,
            n_layers: 2,
            bottleneck_dim: 10,
            emb_dim: 6,
            vocab: 11,
            seed: 42,
            ..Default::default()
        }
    }

    fn make_memory(t: usize) -> Array3<f32> {
        Array3::from_shape_fn((1, t, 8), |(_, i, d)| ((i * 8 + d) as f32 * 0.01).sin())
    }

    #[test]
    fn same_seed_same_step_output() {
        let mut a = RnnDecoder::new(make_config(), None, None).unwrap();
        let mut b = RnnDecoder::new(make_config(), None, None).unwrap();
        let memory = make_memory(5);
        let state = a.zero_state(2);
        let att = a.fresh_attention(2);
        let out_a = a
            .decode_step(
                &memory.view(),
                &[5],
                &state,
                &att,
                &[2, 4],
                None,
                AttentionMode::Parallel,
                None,
            )
            .unwrap();
        let out_b = b
            .decode_step(
                &memory.view(),
                &[5],
                &state,
                &att,
                &[2, 4],
                None,
                AttentionMode::Parallel,
                None,
            )
            .unwrap();
        assert_eq!(out_a.attn_v, out_b.attn_v);
        assert_eq!(out_a.att.context, out_b.att.context);
    }

    #[test]
    fn state_kind_mismatch_is_rejected() {
        let mut dec = RnnDecoder::new(make_config(), None, None).unwrap();
        let memory = make_memory(4);
        let wrong = DecoderState::Gru {
            h: Array3::zeros((2, 1, 12)),
        };
        let att = dec.fresh_attention(1);
        let err = dec.decode_step(
            &memory.view(),
            &[4],
            &wrong,
            &att,
            &[2],
            None,
            AttentionMode::Parallel,
            None,
        );
        assert!(err.is_err());
    }

    #[test]
    fn ctc_weight_without_scorer_is_rejected() {
        let config = DecoderConfig {
            ctc_weight: 0.3,
            ..make_config()
        };
        assert!(RnnDecoder::new(config, None, None).is_err());
    }

    #[test]
    fn mocha_decoder_reports_streaming_support() {
        let mut config = make_config();
        config.attention.kind = AttentionKind::Mocha;
        let dec = RnnDecoder::new(config, None, None).unwrap();
        assert!(dec.supports_streaming());

        let plain = RnnDecoder::new(make_config(), None, None).unwrap();
        assert!(!plain.supports_streaming());
    }

    #[test]
    fn select_concat_round_trip_preserves_state() {
        let dec = RnnDecoder::new(make_config(), None, None).unwrap();
        let state = match dec.zero_state(3) {
            DecoderState::Lstm { mut h, c } => {
                h[[0, 1, 3]] = 0.7;
                DecoderState::Lstm { h, c }
            }
            other => other,
        };
        let parts: Vec<DecoderState> = (0..3).map(|b| state.select(b)).collect();
        let refs: Vec<&DecoderState> = parts.iter().collect();
        let merged = DecoderState::concat(&refs).unwrap();
        match (&state, &merged) {
            (DecoderState::Lstm { h: a, .. }, DecoderState::Lstm { h: b, .. }) => {
                assert_eq!(a, b);
            }
            _ => panic!("state kind changed"),
        }
    }
}
