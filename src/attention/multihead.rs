use ndarray::{s, Array1, Array2, Array3, ArrayView2, ArrayView3, Axis};
use rand::rngs::StdRng;

use super::{memory_row, AttentionMode, AttentionScorer, AttentionState};
use crate::error::DecodeError;
use crate::layers::{softmax_rows, Linear};

/// Independent additive heads over projected key/query/value slices,
/// concatenated and projected back to the memory width.
pub(crate) struct MultiheadAttention {
    w_key: Linear,
    w_value: Linear,
    w_query: Linear,
    /// Per-head energy vectors, `[n_heads, head_dim]`.
    v: Array2<f32>,
    w_out: Linear,
    n_heads: usize,
    head_dim: usize,
    cached_key: Option<Array3<f32>>,
    cached_value: Option<Array3<f32>>,
}

impl MultiheadAttention {
    pub fn new(
        enc_n_units: usize,
        qdim: usize,
        dim: usize,
        n_heads: usize,
        rng: &mut StdRng,
        scale: f32,
    ) -> Self {
        Self {
            w_key: Linear::new(enc_n_units, dim, true, rng, scale),
            w_value: Linear::new(enc_n_units, dim, true, rng, scale),
            w_query: Linear::new(qdim, dim, false, rng, scale),
            v: crate::layers::uniform2(rng, n_heads, dim / n_heads, scale),
            w_out: Linear::new(dim, enc_n_units, true, rng, scale),
            n_heads,
            head_dim: dim / n_heads,
            cached_key: None,
            cached_value: None,
        }
    }

    fn project_memory(&mut self, memory: &ArrayView3<f32>) -> (Array3<f32>, Array3<f32>) {
        let (b_mem, t, _) = memory.dim();
        if let (Some(k), Some(v)) = (&self.cached_key, &self.cached_value) {
            if k.dim().0 == b_mem && k.dim().1 == t {
                return (k.clone(), v.clone());
            }
        }
        let dim = self.w_key.out_dim();
        let mut key = Array3::zeros((b_mem, t, dim));
        let mut value = Array3::zeros((b_mem, t, dim));
        for (bm, mem) in memory.axis_iter(Axis(0)).enumerate() {
            key.index_axis_mut(Axis(0), bm)
                .assign(&self.w_key.forward(&mem));
            value
                .index_axis_mut(Axis(0), bm)
                .assign(&self.w_value.forward(&mem));
        }
        self.cached_key = Some(key.clone());
        self.cached_value = Some(value.clone());
        (key, value)
    }
}

impl AttentionScorer for MultiheadAttention {
    fn reset(&mut self) {
        self.cached_key = None;
        self.cached_value = None;
    }

    fn n_heads(&self) -> usize {
        self.n_heads
    }

    fn forward(
        &mut self,
        memory: &ArrayView3<f32>,
        elens: &[usize],
        query: &ArrayView2<f32>,
        _prev: &AttentionState,
        _mode: AttentionMode,
        _trigger_points: Option<&[usize]>,
    ) -> Result<AttentionState, DecodeError> {
        let (b_mem, t, _) = memory.dim();
        let batch = query.nrows();
        let (key, value) = self.project_memory(memory);
        let q = self.w_query.forward(query);

        let mut weights = Array3::zeros((batch, self.n_heads, t));
        let mut merged = Array2::zeros((batch, self.n_heads * self.head_dim));
        for h in 0..self.n_heads {
            let lo = h * self.head_dim;
            let hi = lo + self.head_dim;
            let v_h = self.v.row(h);

            let mut energies = Array2::zeros((batch, t));
            for b in 0..batch {
                let bm = memory_row(b, b_mem);
                let key_h = key.slice(s![bm, .., lo..hi]);
                let summed = &key_h + &q.slice(s![b, lo..hi]);
                let e: Array1<f32> = summed.mapv(f32::tanh).dot(&v_h);
                energies.row_mut(b).assign(&e);
                for tt in elens[bm]..t {
                    energies[[b, tt]] = f32::NEG_INFINITY;
                }
            }
            softmax_rows(&mut energies);

            for b in 0..batch {
                let bm = memory_row(b, b_mem);
                let value_h = value.slice(s![bm, .., lo..hi]);
                merged
                    .slice_mut(s![b, lo..hi])
                    .assign(&energies.row(b).dot(&value_h));
                weights
                    .slice_mut(s![b, h, ..])
                    .assign(&energies.row(b));
            }
        }

        Ok(AttentionState {
            context: self.w_out.forward(&merged.view()),
            weights: Some(weights),
            gmm_means: None,
            stop_probs: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use rand::SeedableRng;

    #[test]
    fn per_head_weights_are_distributions() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut att = MultiheadAttention::new(6, 4, 8, 2, &mut rng, 0.1);
        let memory = Array3::from_shape_fn((2, 5, 6), |(b, t, d)| (b + t + d) as f32 * 0.07);
        let query = Array2::from_shape_fn((2, 4), |(b, d)| (b * 4 + d) as f32 * 0.1);
        let prev = AttentionState::fresh(2, 6);
        let state = att
            .forward(
                &memory.view(),
                &[5, 3],
                &query.view(),
                &prev,
                AttentionMode::Parallel,
                None,
            )
            .unwrap();
        let aw = state.weights.unwrap();
        assert_eq!(aw.dim(), (2, 2, 5));
        for b in 0..2 {
            for h in 0..2 {
                let head = aw.slice(s![b, h, ..]);
                assert!((head.sum() - 1.0).abs() < 1e-5);
            }
        }
        assert_eq!(aw[[1, 0, 3]], 0.0);
        assert_eq!(aw[[1, 1, 4]], 0.0);
        assert_eq!(state.context.dim(), (2, 6));
    }
}
