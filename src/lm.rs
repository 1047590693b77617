//! External language-model interface.
//!
//! The decoder never inspects the concrete model type; capability
//! probes cover the differences that matter to decoding (cached
//! self-attention state, long-range memory).

use ndarray::{s, Array2, Array3, ArrayView3, Axis};

use crate::error::DecodeError;

/// Carried language-model state.
#[derive(Debug, Clone)]
pub enum LmState {
    /// Stacked recurrent state, each `[n_layers, B, n_units]`.
    Recurrent { h: Array3<f32>, c: Array3<f32> },
    /// Per-layer activation cache of a self-attentive model, each
    /// `[B, len, dim]`.
    Cached(Vec<Array3<f32>>),
}

impl LmState {
    pub fn batch(&self) -> usize {
        match self {
            LmState::Recurrent { h, .. } => h.dim().1,
            LmState::Cached(layers) => layers.first().map_or(0, |l| l.dim().0),
        }
    }

    /// Extracts one batch row as a standalone state.
    pub fn select(&self, index: usize) -> Self {
        match self {
            LmState::Recurrent { h, c } => LmState::Recurrent {
                h: h.slice(s![.., index..index + 1, ..]).to_owned(),
                c: c.slice(s![.., index..index + 1, ..]).to_owned(),
            },
            LmState::Cached(layers) => LmState::Cached(
                layers
                    .iter()
                    .map(|l| l.slice(s![index..index + 1, .., ..]).to_owned())
                    .collect(),
            ),
        }
    }

    /// Stacks per-hypothesis states back into a batch.
    pub fn concat(states: &[&LmState]) -> Result<Self, DecodeError> {
        let first = states
            .first()
            .ok_or_else(|| DecodeError::input("cannot concat an empty LM state list"))?;
        match first {
            LmState::Recurrent { .. } => {
                let mut hs: Vec<ArrayView3<f32>> = Vec::with_capacity(states.len());
                let mut cs: Vec<ArrayView3<f32>> = Vec::with_capacity(states.len());
                for state in states {
                    match state {
                        LmState::Recurrent { h, c } => {
                            hs.push(h.view());
                            cs.push(c.view());
                        }
                        LmState::Cached(_) => {
                            return Err(DecodeError::input("mixed LM state kinds in one beam"));
                        }
                    }
                }
                Ok(LmState::Recurrent {
                    h: ndarray::concatenate(Axis(1), &hs)?,
                    c: ndarray::concatenate(Axis(1), &cs)?,
                })
            }
            LmState::Cached(first_layers) => {
                let n_layers = first_layers.len();
                let mut merged = Vec::with_capacity(n_layers);
                for l in 0..n_layers {
                    let mut views: Vec<ArrayView3<f32>> = Vec::with_capacity(states.len());
                    for state in states {
                        match state {
                            LmState::Cached(layers) if layers.len() == n_layers => {
                                views.push(layers[l].view());
                            }
                            _ => {
                                return Err(DecodeError::input(
                                    "mixed LM state kinds in one beam",
                                ));
                            }
                        }
                    }
                    merged.push(ndarray::concatenate(Axis(0), &views)?);
                }
                Ok(LmState::Cached(merged))
            }
        }
    }
}

/// One prediction step over a batch.
#[derive(Debug, Clone)]
pub struct LmOutput {
    /// Feature vectors consumed by fusion and rescoring, `[B, dim]`.
    pub features: Array2<f32>,
    pub state: LmState,
    /// Log-probabilities over the LM vocabulary, `[B, vocab]`.
    pub log_probs: Array2<f32>,
}

pub trait LanguageModel: Send {
    fn vocab(&self) -> usize;

    /// Width of the feature vectors in [`LmOutput::features`].
    fn dim(&self) -> usize;

    /// Whether the model carries a per-layer activation cache that can
    /// grow step by step instead of re-encoding the prefix.
    fn supports_cached_state(&self) -> bool {
        false
    }

    /// Whether the model consumes long-range memory across utterances.
    fn supports_memory(&self) -> bool {
        false
    }

    fn initial_state(&self, batch: usize) -> LmState;

    /// Advances one token per batch row.
    fn predict(
        &self,
        tokens: &[u32],
        state: &LmState,
        memory: Option<&LmState>,
    ) -> Result<LmOutput, DecodeError>;

    /// Folds a finished utterance's state into long-range memory.
    /// Models without memory pass it through unchanged.
    fn update_memory(
        &self,
        memory: Option<LmState>,
        state: &LmState,
    ) -> Result<Option<LmState>, DecodeError> {
        let _ = state;
        Ok(memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recurrent_select_concat_round_trip() {
        let state = LmState::Recurrent {
            h: Array3::from_shape_fn((2, 3, 4), |(l, b, u)| (l * 12 + b * 4 + u) as f32),
            c: Array3::zeros((2, 3, 4)),
        };
        let parts: Vec<LmState> = (0..3).map(|b| state.select(b)).collect();
        let refs: Vec<&LmState> = parts.iter().collect();
        let merged = LmState::concat(&refs).unwrap();
        match (&state, &merged) {
            (LmState::Recurrent { h: a, .. }, LmState::Recurrent { h: b, .. }) => {
                assert_eq!(a, b);
            }
            _ => panic!("state kind changed in round trip"),
        }
    }

    #[test]
    fn cached_concat_rejects_layer_mismatch() {
        let two = LmState::Cached(vec![Array3::zeros((1, 2, 3)), Array3::zeros((1, 2, 3))]);
        let one = LmState::Cached(vec![Array3::zeros((1, 2, 3))]);
        assert!(LmState::concat(&[&two, &one]).is_err());
    }
}
