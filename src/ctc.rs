//! CTC collaborator interfaces. The decoder consumes loss values,
//! forced-alignment triggers and prefix scores; the scorers' internals
//! belong to the CTC branch of the recognizer.

use ndarray::{Array2, ArrayView3};

use crate::error::DecodeError;

/// Training-side output of the CTC branch.
#[derive(Debug, Clone)]
pub struct CtcOutput {
    pub loss: f32,
    /// Aligned frame per reference token, one row per batch item.
    pub trigger_points: Option<Vec<Vec<usize>>>,
}

pub trait CtcScorer: Send {
    /// CTC loss over a batch, with forced-alignment trigger points when
    /// `need_triggers` is set.
    fn forward(
        &self,
        memory: &ArrayView3<f32>,
        elens: &[usize],
        refs: &[Vec<u32>],
        need_triggers: bool,
    ) -> Result<CtcOutput, DecodeError>;
}

/// Per-hypothesis carry of the CTC prefix recurrence.
#[derive(Debug, Clone)]
pub struct CtcPrefixState {
    /// Forward log-probabilities per frame, split into the paths ending
    /// in non-blank and in blank, `[T, 2]`.
    pub r: Array2<f32>,
    /// Accumulated prefix score.
    pub log_psi: f32,
}

impl CtcPrefixState {
    pub fn new(n_frames: usize) -> Self {
        Self {
            r: Array2::from_elem((n_frames, 2), f32::NEG_INFINITY),
            log_psi: 0.0,
        }
    }
}

/// Label-synchronous CTC prefix scoring for joint decoding.
pub trait CtcPrefixScorer: Send {
    fn initial_state(&self) -> CtcPrefixState;

    /// Scores every candidate continuation of `prefix` (which includes
    /// the leading start symbol). Returns one new state and one
    /// cumulative score per candidate.
    fn extend(
        &mut self,
        prefix: &[u32],
        candidates: &[u32],
        state: &CtcPrefixState,
    ) -> Result<(Vec<CtcPrefixState>, Vec<f32>), DecodeError>;

    /// Appends the frame posteriors of a freshly decoded chunk.
    fn register_new_chunk(&mut self, frame_log_probs: Array2<f32>) -> Result<(), DecodeError>;
}
