//! Attention observability. Decoders and the loss composer report
//! alignment tensors to an observer instead of accumulating them in
//! core state; recognizers plug in whatever sink they need.

use ndarray::{Array3, Array4};

pub trait AttentionObserver: Send {
    /// Attention weights for one batch, `[B, H, L, T]`, together with
    /// the valid source and target lengths.
    fn weights(&mut self, tag: &str, aws: &Array4<f32>, elens: &[usize], ylens: &[usize]);

    /// Chunkwise distributions of a monotonic scorer, `[B, L, T]`.
    fn stop_probs(&mut self, tag: &str, probs: &Array3<f32>) {
        let _ = (tag, probs);
    }
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NoopObserver;

impl AttentionObserver for NoopObserver {
    fn weights(&mut self, _tag: &str, _aws: &Array4<f32>, _elens: &[usize], _ylens: &[usize]) {}
}

/// Keeps every report; handy in tests and offline analysis.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    pub weights: Vec<(String, Array4<f32>, Vec<usize>, Vec<usize>)>,
    pub stop_probs: Vec<(String, Array3<f32>)>,
}

impl AttentionObserver for RecordingObserver {
    fn weights(&mut self, tag: &str, aws: &Array4<f32>, elens: &[usize], ylens: &[usize]) {
        self.weights
            .push((tag.to_string(), aws.clone(), elens.to_vec(), ylens.to_vec()));
    }

    fn stop_probs(&mut self, tag: &str, probs: &Array3<f32>) {
        self.stop_probs.push((tag.to_string(), probs.clone()));
    }
}
