use ndarray::{Array2, ArrayView2, ArrayView3, Axis};
use rand::rngs::StdRng;

use super::{memory_row, AttentionMode, AttentionScorer, AttentionState};
use crate::error::DecodeError;
use crate::layers::{softmax_rows, Linear};

/// Mixture-of-Gaussians attention. The mixture means only ever move
/// forward; they are carried per item in `AttentionState::gmm_means`.
pub(crate) struct GmmAttention {
    w_hidden: Linear,
    w_mixture: Linear,
    n_mixtures: usize,
    /// Variance cap keeping kernels from flattening out.
    vfloor: f32,
}

impl GmmAttention {
    pub fn new(
        qdim: usize,
        dim: usize,
        n_mixtures: usize,
        rng: &mut StdRng,
        scale: f32,
    ) -> Self {
        Self {
            w_hidden: Linear::new(qdim, dim, true, rng, scale),
            w_mixture: Linear::new(dim, 3 * n_mixtures, true, rng, scale),
            n_mixtures,
            vfloor: 1e-6,
        }
    }
}

impl AttentionScorer for GmmAttention {
    fn reset(&mut self) {}

    fn forward(
        &mut self,
        memory: &ArrayView3<f32>,
        elens: &[usize],
        query: &ArrayView2<f32>,
        prev: &AttentionState,
        _mode: AttentionMode,
        _trigger_points: Option<&[usize]>,
    ) -> Result<AttentionState, DecodeError> {
        let (b_mem, t, enc) = memory.dim();
        let batch = query.nrows();
        let k = self.n_mixtures;

        let hidden = self.w_hidden.forward(query).mapv(f32::tanh);
        let params = self.w_mixture.forward(&hidden.view());
        let mut w_hat = params.slice(ndarray::s![.., 0..k]).to_owned();
        let v_hat = params.slice(ndarray::s![.., k..2 * k]).to_owned();
        let myu_hat = params.slice(ndarray::s![.., 2 * k..3 * k]).to_owned();

        softmax_rows(&mut w_hat);
        let var = v_hat.mapv(|x| x.exp().max(self.vfloor));
        let myu = match &prev.gmm_means {
            Some(prev_myu) => {
                if prev_myu.dim() != (batch, k) {
                    return Err(DecodeError::input("GMM means do not match the batch"));
                }
                prev_myu + &myu_hat.mapv(f32::exp)
            }
            None => myu_hat.mapv(f32::exp),
        };

        let mut aw = Array2::zeros((batch, t));
        for b in 0..batch {
            let bm = memory_row(b, b_mem);
            for j in 0..elens[bm].min(t) {
                let mut mass = 0.0;
                for m in 0..k {
                    let diff = j as f32 - myu[[b, m]];
                    mass += w_hat[[b, m]] / (2.0 * std::f32::consts::PI * var[[b, m]]).sqrt()
                        * (-diff * diff / (2.0 * var[[b, m]])).exp();
                }
                aw[[b, j]] = mass;
            }
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
            gmm_means: Some(myu),
            stop_probs: None,
        })
    }
}
