//! Attention scorers over encoder memory.
//!
//! All scorers share one contract: given the memory, a batch of queries
//! and the previous per-item attention state, produce the next state
//! (context vector, weights and any scorer-specific carry such as GMM
//! means). The memory batch may be 1 while the query batch is larger;
//! scorers broadcast in that case, which is how beam search shares one
//! utterance across many hypotheses.

pub(crate) mod additive;
pub(crate) mod gmm;
pub(crate) mod mocha;
pub(crate) mod multihead;

use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};
use rand::rngs::StdRng;

use crate::config::{AttentionConfig, AttentionKind};
use crate::error::DecodeError;

/// How attention weights are produced at a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionMode {
    /// Differentiable expected alignment; used during training.
    Parallel,
    /// Discrete boundary selection; used during inference.
    Hard,
}

/// Per-item attention carry between decode steps.
///
/// `weights` is `None` before the first step of an utterance (and at the
/// start of every streaming chunk). An all-zero weight row in hard mode
/// means no monotonic boundary fired.
#[derive(Debug, Clone)]
pub struct AttentionState {
    /// Context vectors, `[B, enc_n_units]`.
    pub context: Array2<f32>,
    /// Last attention weights, `[B, n_heads, T]`.
    pub weights: Option<Array3<f32>>,
    /// Monotonic mixture means, `[B, n_mixtures]`; GMM attention only.
    pub gmm_means: Option<Array2<f32>>,
    /// Chunkwise distribution of the last step, `[B, T]`; monotonic
    /// scorers only. Step output, not carried input.
    pub stop_probs: Option<Array2<f32>>,
}

impl AttentionState {
    pub fn fresh(batch: usize, enc_n_units: usize) -> Self {
        Self {
            context: Array2::zeros((batch, enc_n_units)),
            weights: None,
            gmm_means: None,
            stop_probs: None,
        }
    }

    pub fn batch(&self) -> usize {
        self.context.nrows()
    }

    /// Extracts one batch row as a standalone state.
    pub fn select(&self, index: usize) -> Self {
        Self {
            context: self
                .context
                .index_axis(Axis(0), index)
                .to_owned()
                .insert_axis(Axis(0)),
            weights: self
                .weights
                .as_ref()
                .map(|w| w.index_axis(Axis(0), index).to_owned().insert_axis(Axis(0))),
            gmm_means: self
                .gmm_means
                .as_ref()
                .map(|m| m.index_axis(Axis(0), index).to_owned().insert_axis(Axis(0))),
            stop_probs: self
                .stop_probs
                .as_ref()
                .map(|p| p.index_axis(Axis(0), index).to_owned().insert_axis(Axis(0))),
        }
    }

    /// Stacks per-hypothesis states back into a batch. Weights must be
    /// uniformly present or uniformly absent across the inputs.
    pub fn concat(states: &[&AttentionState]) -> Result<Self, DecodeError> {
        if states.is_empty() {
            return Err(DecodeError::input("cannot concat an empty state list"));
        }
        let contexts: Vec<ArrayView2<f32>> = states.iter().map(|s| s.context.view()).collect();
        let context = ndarray::concatenate(Axis(0), &contexts)?;

        let n_some = states.iter().filter(|s| s.weights.is_some()).count();
        let weights = if n_some == 0 {
            None
        } else if n_some == states.len() {
            let views: Vec<ArrayView3<f32>> = states
                .iter()
                .filter_map(|s| s.weights.as_ref().map(|w| w.view()))
                .collect();
            Some(ndarray::concatenate(Axis(0), &views)?)
        } else {
            return Err(DecodeError::input(
                "attention weights present on only part of the beam",
            ));
        };

        let n_means = states.iter().filter(|s| s.gmm_means.is_some()).count();
        let gmm_means = if n_means == 0 {
            None
        } else if n_means == states.len() {
            let views: Vec<ArrayView2<f32>> = states
                .iter()
                .filter_map(|s| s.gmm_means.as_ref().map(|m| m.view()))
                .collect();
            Some(ndarray::concatenate(Axis(0), &views)?)
        } else {
            return Err(DecodeError::input(
                "GMM means present on only part of the beam",
            ));
        };

        Ok(Self {
            context,
            weights,
            gmm_means,
            stop_probs: None,
        })
    }
}

/// Scoring interface shared by every attention variant.
pub(crate) trait AttentionScorer: Send {
    /// Clears cached key projections; call at utterance (or chunk) start.
    fn reset(&mut self);

    fn n_heads(&self) -> usize {
        1
    }

    /// Whether hard-mode decoding can stream chunk-by-chunk.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Re-derives any internal randomness from `seed`; a no-op for
    /// deterministic scorers.
    fn reseed(&mut self, seed: u64) {
        let _ = seed;
    }

    /// One attention step. `memory` is `[B_mem, T, enc]` with `B_mem` of 1
    /// or the query batch; `elens` has `B_mem` entries.
    fn forward(
        &mut self,
        memory: &ArrayView3<f32>,
        elens: &[usize],
        query: &ArrayView2<f32>,
        prev: &AttentionState,
        mode: AttentionMode,
        trigger_points: Option<&[usize]>,
    ) -> Result<AttentionState, DecodeError>;
}

pub(crate) fn build_attention(
    config: &AttentionConfig,
    enc_n_units: usize,
    qdim: usize,
    rng: &mut StdRng,
    scale: f32,
) -> Box<dyn AttentionScorer> {
    match config.kind {
        AttentionKind::Additive => Box::new(additive::AddAttention::new(
            enc_n_units,
            qdim,
            config.dim,
            config.sharpening_factor,
            config.sigmoid_smoothing,
            rng,
            scale,
        )),
        AttentionKind::MultiheadAdditive => Box::new(multihead::MultiheadAttention::new(
            enc_n_units,
            qdim,
            config.dim,
            config.n_heads,
            rng,
            scale,
        )),
        AttentionKind::Mocha => Box::new(mocha::MochaAttention::new(
            enc_n_units,
            qdim,
            config.dim,
            config.mocha,
            rng,
            scale,
        )),
        AttentionKind::Gmm => Box::new(gmm::GmmAttention::new(
            qdim,
            config.dim,
            config.gmm_n_mixtures,
            rng,
            scale,
        )),
    }
}

/// Maps a query row to its memory row under batch broadcasting.
pub(crate) fn memory_row(b: usize, b_mem: usize) -> usize {
    if b_mem == 1 {
        0
    } else {
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn select_then_concat_restores_batch() {
        let state = AttentionState {
            context: array![[1.0, 2.0], [3.0, 4.0]],
            weights: Some(
                Array3::from_shape_vec((2, 1, 3), vec![0.1, 0.2, 0.7, 0.3, 0.3, 0.4]).unwrap(),
            ),
            gmm_means: None,
            stop_probs: None,
        };
        let a = state.select(0);
        let b = state.select(1);
        let merged = AttentionState::concat(&[&a, &b]).unwrap();
        assert_eq!(merged.context, state.context);
        assert_eq!(merged.weights.unwrap(), state.weights.unwrap());
    }

    #[test]
    fn concat_rejects_partial_weights() {
        let with = AttentionState {
            context: array![[0.0]],
            weights: Some(Array3::zeros((1, 1, 2))),
            gmm_means: None,
            stop_probs: None,
        };
        let without = AttentionState::fresh(1, 1);
        assert!(AttentionState::concat(&[&with, &without]).is_err());
    }
}
