use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Special token indices shared by the decoder and its collaborators.
/// `eos` doubles as the start symbol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SpecialSymbols {
    pub eos: u32,
    pub unk: u32,
    pub pad: u32,
    pub blank: u32,
}

impl Default for SpecialSymbols {
    fn default() -> Self {
        Self {
            eos: 2,
            unk: 1,
            pad: 3,
            blank: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellKind {
    Lstm,
    Gru,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionKind {
    /// Bahdanau-style additive attention, single head.
    Additive,
    /// Independent additive heads over projected slices.
    MultiheadAdditive,
    /// Monotonic chunkwise attention; the only streaming-capable kind.
    Mocha,
    /// Mixture-of-Gaussians positioning with monotonic means.
    Gmm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledSamplingKind {
    Constant,
    Ramp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LmFusionKind {
    Cold,
    Deep,
    ColdProb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyMetric {
    /// Quadratic penalty on the delay matrix between consecutive
    /// attention distributions.
    Interval,
    /// Deviation between expected attention positions and CTC
    /// forced-alignment trigger points.
    CtcSync,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MochaConfig {
    /// Chunkwise attention window; 1 disables the chunk distribution.
    pub chunk_size: usize,
    /// Initial bias of the monotonic energy.
    pub init_r: f32,
    /// Denominator clamp for the expected-alignment recurrence.
    pub eps: f32,
    /// Std of the pre-sigmoid noise applied in parallel mode.
    pub noise_std: f32,
    /// Drop the denominator from the recurrence.
    pub no_denominator: bool,
}

impl Default for MochaConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1,
            init_r: -4.0,
            eps: 1e-6,
            noise_std: 1.0,
            no_denominator: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttentionConfig {
    pub kind: AttentionKind,
    pub dim: usize,
    pub n_heads: usize,
    pub sharpening_factor: f32,
    /// Replace the softmax with a normalized sigmoid (additive only).
    pub sigmoid_smoothing: bool,
    pub mocha: MochaConfig,
    pub gmm_n_mixtures: usize,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            kind: AttentionKind::Additive,
            dim: 128,
            n_heads: 1,
            sharpening_factor: 1.0,
            sigmoid_smoothing: false,
            mocha: MochaConfig::default(),
            gmm_n_mixtures: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MbrConfig {
    /// Hypotheses sampled from beam search per utterance; at least 2.
    pub nbest: usize,
    /// Weight of the ground-truth cross-entropy regularizer.
    pub ce_weight: f32,
    /// Sharpening applied before the softmax over hypothesis scores.
    pub softmax_smoothing: f32,
}

impl Default for MbrConfig {
    fn default() -> Self {
        Self {
            nbest: 4,
            ce_weight: 0.01,
            softmax_smoothing: 0.8,
        }
    }
}

/// Construction surface of [`crate::decoder::RnnDecoder`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderConfig {
    pub special: SpecialSymbols,
    /// Dimensionality of the encoder memory vectors.
    pub enc_n_units: usize,
    pub attention: AttentionConfig,
    pub rnn_type: CellKind,
    /// Units per recurrent layer.
    pub n_units: usize,
    /// Units of the optional post-layer projection; 0 disables it.
    pub n_projs: usize,
    pub n_layers: usize,
    /// Bottleneck before the output softmax.
    pub bottleneck_dim: usize,
    pub emb_dim: usize,
    pub vocab: usize,
    /// Share the embedding and output weights.
    pub tie_embedding: bool,
    /// Label smoothing probability for the attention cross-entropy.
    pub lsm_prob: f32,
    /// Scheduled sampling probability.
    pub ss_prob: f32,
    pub ss_type: ScheduledSamplingKind,
    pub ctc_weight: f32,
    /// Total task weight; the attention share is `global_weight - ctc_weight`.
    pub global_weight: f32,
    /// Alternate whole batches between tasks instead of mixing weights.
    pub mtl_per_batch: bool,
    pub lm_fusion: Option<LmFusionKind>,
    /// Decode right-to-left; outputs are reversed on the way out.
    pub backward: bool,
    pub quantity_loss_weight: f32,
    pub latency_metric: Option<LatencyMetric>,
    pub latency_loss_weight: f32,
    pub mbr: Option<MbrConfig>,
    /// Replace the start symbol with the leading reference token.
    pub replace_sos: bool,
    /// Soft-label weight for knowledge distillation.
    pub distillation_weight: f32,
    /// Carry final decoder states across utterances of a session.
    pub discourse_aware: bool,
    /// Half-width of the uniform parameter init.
    pub param_init: f32,
    pub seed: u64,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            special: SpecialSymbols::default(),
            enc_n_units: 512,
            attention: AttentionConfig::default(),
            rnn_type: CellKind::Lstm,
            n_units: 512,
            n_projs: 0,
            n_layers: 1,
            bottleneck_dim: 1024,
            emb_dim: 512,
            vocab: 100,
            tie_embedding: false,
            lsm_prob: 0.0,
            ss_prob: 0.0,
            ss_type: ScheduledSamplingKind::Constant,
            ctc_weight: 0.0,
            global_weight: 1.0,
            mtl_per_batch: false,
            lm_fusion: None,
            backward: false,
            quantity_loss_weight: 0.0,
            latency_metric: None,
            latency_loss_weight: 0.0,
            mbr: None,
            replace_sos: false,
            distillation_weight: 0.0,
            discourse_aware: false,
            param_init: 0.1,
            seed: 1,
        }
    }
}

impl DecoderConfig {
    /// Attention-side task weight.
    pub fn att_weight(&self) -> f32 {
        self.global_weight - self.ctc_weight
    }

    /// Query dimension seen by the attention scorer.
    pub fn qdim(&self) -> usize {
        if self.n_projs > 0 {
            self.n_projs
        } else {
            self.n_units
        }
    }

    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.vocab == 0 {
            return Err(DecodeError::config("vocab must be non-zero"));
        }
        for (name, idx) in [
            ("eos", self.special.eos),
            ("unk", self.special.unk),
            ("pad", self.special.pad),
            ("blank", self.special.blank),
        ] {
            if idx as usize >= self.vocab {
                return Err(DecodeError::Config(format!(
                    "special symbol {name}={idx} outside vocab of {}",
                    self.vocab
                )));
            }
        }
        if self.n_layers == 0 || self.n_units == 0 {
            return Err(DecodeError::config("decoder needs at least one RNN layer"));
        }
        if self.bottleneck_dim == 0 {
            return Err(DecodeError::config("bottleneck_dim must be larger than zero"));
        }
        if self.tie_embedding && self.emb_dim != self.bottleneck_dim {
            return Err(DecodeError::config(
                "tied embeddings require emb_dim == bottleneck_dim",
            ));
        }
        if !(0.0..=1.0).contains(&self.ctc_weight) {
            return Err(DecodeError::config("ctc_weight must lie in [0, 1]"));
        }
        if self.ctc_weight > self.global_weight {
            return Err(DecodeError::config("ctc_weight exceeds global_weight"));
        }
        if self.att_weight() <= 0.0 && self.ctc_weight <= 0.0 {
            return Err(DecodeError::config(
                "both CTC and attention weights are zero",
            ));
        }
        if !(0.0..1.0).contains(&self.lsm_prob) {
            return Err(DecodeError::config("lsm_prob must lie in [0, 1)"));
        }
        if !(0.0..=1.0).contains(&self.ss_prob) {
            return Err(DecodeError::config("ss_prob must lie in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.distillation_weight) {
            return Err(DecodeError::config("distillation_weight must lie in [0, 1]"));
        }
        match self.attention.kind {
            AttentionKind::Additive | AttentionKind::Gmm => {
                if self.attention.n_heads != 1 {
                    return Err(DecodeError::config(
                        "single-head attention kinds require n_heads == 1",
                    ));
                }
            }
            AttentionKind::MultiheadAdditive => {
                if self.attention.n_heads < 2 {
                    return Err(DecodeError::config(
                        "multihead attention requires n_heads > 1",
                    ));
                }
                if self.attention.dim % self.attention.n_heads != 0 {
                    return Err(DecodeError::config(
                        "attention dim must divide evenly over heads",
                    ));
                }
            }
            AttentionKind::Mocha => {
                if self.attention.n_heads != 1 {
                    return Err(DecodeError::config("MoChA requires a single attention head"));
                }
                if self.attention.mocha.chunk_size == 0 {
                    return Err(DecodeError::config("MoChA chunk size must be at least 1"));
                }
            }
        }
        if self.attention.kind == AttentionKind::Gmm && self.attention.gmm_n_mixtures == 0 {
            return Err(DecodeError::config("GMM attention needs at least one mixture"));
        }
        if matches!(self.latency_metric, Some(LatencyMetric::CtcSync))
            && !(self.ctc_weight > 0.0 && self.ctc_weight < 1.0)
        {
            return Err(DecodeError::config(
                "ctc_sync latency loss requires 0 < ctc_weight < 1",
            ));
        }
        if matches!(self.latency_metric, Some(LatencyMetric::Interval))
            && self.attention.n_heads != 1
        {
            return Err(DecodeError::config(
                "interval latency loss supports a single attention head only",
            ));
        }
        if let Some(mbr) = &self.mbr {
            if mbr.nbest < 2 {
                return Err(DecodeError::config("MBR training requires nbest >= 2"));
            }
            if mbr.softmax_smoothing <= 0.0 {
                return Err(DecodeError::config("MBR softmax smoothing must be positive"));
            }
        }
        Ok(())
    }
}

/// Recognized decoding options, mirrored by `RECOG_*` environment overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecogConfig {
    pub beam_width: usize,
    pub nbest: usize,
    /// Joint scoring weight of the CTC prefix score.
    pub ctc_weight: f32,
    pub max_len_ratio: f32,
    pub min_len_ratio: f32,
    pub length_penalty: f32,
    /// GNMT-style score normalization instead of the additive penalty.
    pub gnmt_decoding: bool,
    pub coverage_penalty: f32,
    pub coverage_threshold: f32,
    pub length_norm: bool,
    /// First-pass (shallow fusion) LM weight.
    pub lm_weight: f32,
    pub lm_second_weight: f32,
    pub lm_bwd_weight: f32,
    /// Admit end-of-sequence only when its log-probability exceeds this
    /// fraction of the best non-eos log-probability.
    pub eos_threshold: f32,
    pub softmax_smoothing: f32,
    pub asr_state_carry_over: bool,
    pub lm_state_carry_over: bool,
    /// Cache transformer LM state across steps instead of re-encoding.
    pub cache_states: bool,
}

impl Default for RecogConfig {
    fn default() -> Self {
        Self {
            beam_width: 4,
            nbest: 1,
            ctc_weight: 0.0,
            max_len_ratio: 1.0,
            min_len_ratio: 0.0,
            length_penalty: 0.0,
            gnmt_decoding: false,
            coverage_penalty: 0.0,
            coverage_threshold: 0.0,
            length_norm: false,
            lm_weight: 0.0,
            lm_second_weight: 0.0,
            lm_bwd_weight: 0.0,
            eos_threshold: 1.5,
            softmax_smoothing: 1.0,
            asr_state_carry_over: false,
            lm_state_carry_over: false,
            cache_states: true,
        }
    }
}

impl RecogConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides("RECOG_");
        config
    }

    fn apply_env_overrides(&mut self, prefix: &str) {
        let parse_env = |suffix: &str| std::env::var(format!("{prefix}{suffix}")).ok();
        let apply = |suffix: &str, target: &mut f32| {
            if let Some(v) = parse_env(suffix).and_then(|s| s.parse().ok()) {
                *target = v;
            }
        };
        let apply_bool = |suffix: &str, target: &mut bool| {
            if let Some(v) = parse_env(suffix) {
                *target = matches!(v.as_str(), "1" | "true" | "yes");
            }
        };

        apply("CTC_WEIGHT", &mut self.ctc_weight);
        apply("MAX_LEN_RATIO", &mut self.max_len_ratio);
        apply("MIN_LEN_RATIO", &mut self.min_len_ratio);
        apply("LENGTH_PENALTY", &mut self.length_penalty);
        apply("COVERAGE_PENALTY", &mut self.coverage_penalty);
        apply("COVERAGE_THRESHOLD", &mut self.coverage_threshold);
        apply("LM_WEIGHT", &mut self.lm_weight);
        apply("LM_SECOND_WEIGHT", &mut self.lm_second_weight);
        apply("LM_BWD_WEIGHT", &mut self.lm_bwd_weight);
        apply("EOS_THRESHOLD", &mut self.eos_threshold);
        apply("SOFTMAX_SMOOTHING", &mut self.softmax_smoothing);
        apply_bool("GNMT_DECODING", &mut self.gnmt_decoding);
        apply_bool("LENGTH_NORM", &mut self.length_norm);
        apply_bool("ASR_STATE_CARRY_OVER", &mut self.asr_state_carry_over);
        apply_bool("LM_STATE_CARRY_OVER", &mut self.lm_state_carry_over);
        apply_bool("CACHE_STATES", &mut self.cache_states);

        if let Some(v) = parse_env("BEAM_WIDTH").and_then(|s| s.parse::<usize>().ok()) {
            self.beam_width = v.max(1);
        }
        if let Some(v) = parse_env("NBEST").and_then(|s| s.parse::<usize>().ok()) {
            self.nbest = v.max(1);
        }
    }

    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.beam_width == 0 {
            return Err(DecodeError::config("beam width must be at least 1"));
        }
        if self.nbest == 0 || self.nbest > self.beam_width {
            return Err(DecodeError::Config(format!(
                "nbest of {} must lie in [1, beam_width={}]",
                self.nbest, self.beam_width
            )));
        }
        if !(0.0..=1.0).contains(&self.ctc_weight) {
            return Err(DecodeError::config("recog ctc_weight must lie in [0, 1]"));
        }
        if self.max_len_ratio <= 0.0 {
            return Err(DecodeError::config("max_len_ratio must be positive"));
        }
        if self.min_len_ratio < 0.0 || self.min_len_ratio > self.max_len_ratio {
            return Err(DecodeError::config(
                "min_len_ratio must lie in [0, max_len_ratio]",
            ));
        }
        if self.softmax_smoothing <= 0.0 {
            return Err(DecodeError::config("softmax_smoothing must be positive"));
        }
        if self.eos_threshold < 0.0 {
            return Err(DecodeError::config("eos_threshold must be non-negative"));
        }
        Ok(())
    }
}
