use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};
use rand::rngs::StdRng;

use super::{memory_row, AttentionMode, AttentionScorer, AttentionState};
use crate::error::DecodeError;
use crate::layers::{sigmoid, softmax_rows, Linear};

/// Bahdanau-style additive attention over the whole memory.
pub(crate) struct AddAttention {
    w_key: Linear,
    w_query: Linear,
    v: Linear,
    sharpening_factor: f32,
    sigmoid_smoothing: bool,
    cached_key: Option<Array3<f32>>,
}

impl AddAttention {
    pub fn new(
        enc_n_units: usize,
        qdim: usize,
        dim: usize,
        sharpening_factor: f32,
        sigmoid_smoothing: bool,
        rng: &mut StdRng,
        scale: f32,
    ) -> Self {
        Self {
            w_key: Linear::new(enc_n_units, dim, true, rng, scale),
            w_query: Linear::new(qdim, dim, false, rng, scale),
            v: Linear::new(dim, 1, false, rng, scale),
            sharpening_factor,
            sigmoid_smoothing,
            cached_key: None,
        }
    }

    /// Key projections are cached per memory; the cache refreshes when
    /// the memory shape changes, which happens at every streaming chunk.
    fn key(&mut self, memory: &ArrayView3<f32>) -> Array3<f32> {
        let (b_mem, t, _) = memory.dim();
        if let Some(k) = &self.cached_key {
            if k.dim().0 == b_mem && k.dim().1 == t {
                return k.clone();
            }
        }
        let dim = self.w_key.out_dim();
        let mut key = Array3::zeros((b_mem, t, dim));
        for (bm, mem) in memory.axis_iter(Axis(0)).enumerate() {
            key.index_axis_mut(Axis(0), bm)
                .assign(&self.w_key.forward(&mem));
        }
        self.cached_key = Some(key.clone());
        key
    }
}

impl AttentionScorer for AddAttention {
    fn reset(&mut self) {
        self.cached_key = None;
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
        let (b_mem, t, enc) = memory.dim();
        let batch = query.nrows();
        let q = self.w_query.forward(query);
        let sharpening = self.sharpening_factor;
        let v = self.v.weight.row(0).to_owned();
        let key = self.key(memory);

        let mut energies = Array2::zeros((batch, t));
        for b in 0..batch {
            let bm = memory_row(b, b_mem);
            let summed = &key.index_axis(Axis(0), bm) + &q.row(b);
            let e = summed.mapv(f32::tanh).dot(&v) * sharpening;
            energies.row_mut(b).assign(&e);
            for tt in elens[bm]..t {
                energies[[b, tt]] = f32::NEG_INFINITY;
            }
        }

        let mut aw = energies;
        if self.sigmoid_smoothing {
            aw.mapv_inplace(sigmoid);
            for mut row in aw.rows_mut() {
                let sum = row.sum();
                if sum > 0.0 {
                    row.mapv_inplace(|v| v / sum);
                }
            }
        } else {
            softmax_rows(&mut aw);
        }

        let mut context = Array2::zeros((batch, enc));
        for b in 0..batch {
            let bm = memory_row(b, b_mem);
            context
                .row_mut(b)
                .assign(&aw.row(b).dot(&memory.index_axis(Axis(0), bm)));
        }

        Ok(AttentionState {
            context,
            weights: Some(aw.insert_axis(Axis(1))),
            gmm_means: None,
            stop_probs: None,
        })
    }
}
