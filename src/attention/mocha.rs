//! Monotonic chunkwise attention.
//!
//! Parallel mode computes the differentiable expected alignment; hard
//! mode scans for a discrete boundary from the previous one. A hard
//! step that selects no boundary returns exactly-zero weights, which is
//! the "no boundary in this chunk" signal the streaming decoder keys on.

use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use super::{memory_row, AttentionMode, AttentionScorer, AttentionState};
use crate::config::MochaConfig;
use crate::error::DecodeError;
use crate::layers::{sigmoid, softmax1, Linear};

/// Additive energy with a weight-normalized direction and a scalar bias.
struct MonotonicEnergy {
    w_key: Linear,
    w_query: Linear,
    v: Array1<f32>,
    g: f32,
    r: f32,
    cached_key: Option<Array3<f32>>,
}

impl MonotonicEnergy {
    fn new(
        enc_n_units: usize,
        qdim: usize,
        dim: usize,
        init_r: Option<f32>,
        rng: &mut StdRng,
        scale: f32,
    ) -> Self {
        Self {
            w_key: Linear::new(enc_n_units, dim, true, rng, scale),
            w_query: Linear::new(qdim, dim, false, rng, scale),
            v: crate::layers::uniform1(rng, dim, scale),
            g: 1.0 / (dim as f32).sqrt(),
            r: init_r.unwrap_or(0.0),
            cached_key: None,
        }
    }

    fn reset(&mut self) {
        self.cached_key = None;
    }

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

    /// Energies `[B, T]`, tail positions masked to `-inf`.
    fn forward(
        &mut self,
        memory: &ArrayView3<f32>,
        elens: &[usize],
        query: &ArrayView2<f32>,
    ) -> Array2<f32> {
        let (b_mem, t, _) = memory.dim();
        let batch = query.nrows();
        let key = self.key(memory);
        let q = self.w_query.forward(query);
        let norm = self.v.dot(&self.v).sqrt().max(f32::EPSILON);
        let v_hat = self.v.mapv(|x| x * self.g / norm);

        let mut energies = Array2::zeros((batch, t));
        for b in 0..batch {
            let bm = memory_row(b, b_mem);
            let summed = &key.index_axis(Axis(0), bm) + &q.row(b);
            let e = summed.mapv(f32::tanh).dot(&v_hat) + self.r;
            energies.row_mut(b).assign(&e);
            for tt in elens[bm]..t {
                energies[[b, tt]] = f32::NEG_INFINITY;
            }
        }
        energies
    }
}

pub(crate) struct MochaAttention {
    mono: MonotonicEnergy,
    chunk: Option<MonotonicEnergy>,
    config: MochaConfig,
    noise_rng: StdRng,
}

impl MochaAttention {
    pub fn new(
        enc_n_units: usize,
        qdim: usize,
        dim: usize,
        config: MochaConfig,
        rng: &mut StdRng,
        scale: f32,
    ) -> Self {
        let mono = MonotonicEnergy::new(enc_n_units, qdim, dim, Some(config.init_r), rng, scale);
        let chunk = (config.chunk_size > 1)
            .then(|| MonotonicEnergy::new(enc_n_units, qdim, dim, None, rng, scale));
        let noise_seed = rng.gen::<u64>();
        Self {
            mono,
            chunk,
            config,
            noise_rng: StdRng::seed_from_u64(noise_seed),
        }
    }

    fn selection_probs(
        &mut self,
        energies: &Array2<f32>,
        mode: AttentionMode,
    ) -> Result<Array2<f32>, DecodeError> {
        match mode {
            AttentionMode::Parallel => {
                let mut p = energies.clone();
                if self.config.noise_std > 0.0 {
                    let normal = Normal::new(0.0, self.config.noise_std)
                        .map_err(|e| DecodeError::Config(e.to_string()))?;
                    p.mapv_inplace(|e| {
                        if e.is_finite() {
                            sigmoid(e + normal.sample(&mut self.noise_rng))
                        } else {
                            0.0
                        }
                    });
                } else {
                    p.mapv_inplace(|e| if e.is_finite() { sigmoid(e) } else { 0.0 });
                }
                Ok(p)
            }
            AttentionMode::Hard => Ok(energies.mapv(|e| if e >= 0.0 { 1.0 } else { 0.0 })),
        }
    }
}

impl AttentionScorer for MochaAttention {
    fn reset(&mut self) {
        self.mono.reset();
        if let Some(chunk) = &mut self.chunk {
            chunk.reset();
        }
    }

    fn reseed(&mut self, seed: u64) {
        self.noise_rng = StdRng::seed_from_u64(seed);
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn forward(
        &mut self,
        memory: &ArrayView3<f32>,
        elens: &[usize],
        query: &ArrayView2<f32>,
        prev: &AttentionState,
        mode: AttentionMode,
        trigger_points: Option<&[usize]>,
    ) -> Result<AttentionState, DecodeError> {
        let (b_mem, t, enc) = memory.dim();
        let batch = query.nrows();
        let eps = self.config.eps;
        let w = self.config.chunk_size;

        let energies = self.mono.forward(memory, elens, query);
        let mut p_choose = self.selection_probs(&energies, mode)?;

        // First step attends to position 0 by construction.
        let aw_prev: Array2<f32> = match &prev.weights {
            Some(weights) => weights.index_axis(Axis(1), 0).to_owned(),
            None => {
                let mut init = Array2::zeros((batch, t));
                init.column_mut(0).fill(1.0);
                init
            }
        };
        if aw_prev.ncols() != t {
            return Err(DecodeError::Input(format!(
                "previous weights cover {} frames but memory has {t}",
                aw_prev.ncols()
            )));
        }

        let mut alpha = Array2::zeros((batch, t));
        match mode {
            AttentionMode::Parallel => {
                for b in 0..batch {
                    let p = p_choose.row(b);
                    let cp = safe_exclusive_cumprod_1m(&p, eps);
                    let inner: Array1<f32> = if self.config.no_denominator {
                        cumsum(&aw_prev.row(b))
                    } else {
                        let ratio = Array1::from_shape_fn(t, |i| {
                            aw_prev[[b, i]] / cp[i].clamp(eps, 1.0)
                        });
                        cumsum(&ratio.view())
                    };
                    for i in 0..t {
                        alpha[[b, i]] = p[i] * cp[i] * inner[i];
                    }
                }
            }
            AttentionMode::Hard => {
                if let Some(points) = trigger_points {
                    if points.len() != batch {
                        return Err(DecodeError::input(
                            "trigger points must cover the whole batch",
                        ));
                    }
                    p_choose.fill(0.0);
                    for (b, &point) in points.iter().enumerate() {
                        p_choose[[b, point.min(t - 1)]] = 1.0;
                    }
                }
                for b in 0..batch {
                    // Boundaries before the previous one are not revisited.
                    let reach = cumsum(&aw_prev.row(b));
                    let p = Array1::from_shape_fn(t, |i| {
                        if reach[i] > 0.0 {
                            p_choose[[b, i]]
                        } else {
                            0.0
                        }
                    });
                    let mut passed = 1.0;
                    for i in 0..t {
                        alpha[[b, i]] = p[i] * passed;
                        passed *= 1.0 - p[i];
                    }
                }
            }
        }

        // Context comes from the chunkwise distribution when a window is
        // configured, from alpha itself otherwise.
        let beta = match &mut self.chunk {
            Some(chunk_energy) => {
                let u = chunk_energy.forward(memory, elens, query);
                match mode {
                    AttentionMode::Parallel => efficient_chunkwise_attention(&alpha, &u, w),
                    AttentionMode::Hard => hard_chunkwise_attention(&alpha, &u, w),
                }
            }
            None => alpha.clone(),
        };

        let mut context = Array2::zeros((batch, enc));
        for b in 0..batch {
            let bm = memory_row(b, b_mem);
            context
                .row_mut(b)
                .assign(&beta.row(b).dot(&memory.index_axis(Axis(0), bm)));
        }

        Ok(AttentionState {
            context,
            weights: Some(alpha.insert_axis(Axis(1))),
            gmm_means: None,
            stop_probs: Some(beta),
        })
    }
}

pub(crate) fn cumsum(x: &ArrayView1<f32>) -> Array1<f32> {
    let mut out = Array1::zeros(x.len());
    let mut acc = 0.0;
    for (o, &v) in out.iter_mut().zip(x.iter()) {
        acc += v;
        *o = acc;
    }
    out
}

/// Exclusive cumulative product of `1 - p`, computed in log space with
/// an eps clamp so long products stay finite.
pub(crate) fn safe_exclusive_cumprod_1m(p: &ArrayView1<f32>, eps: f32) -> Array1<f32> {
    let mut out = Array1::zeros(p.len());
    let mut log_acc = 0.0f32;
    for (o, &v) in out.iter_mut().zip(p.iter()) {
        *o = log_acc.exp();
        log_acc += (1.0 - v).clamp(eps, 1.0).ln();
    }
    out
}

/// Sliding-window sum with `back` positions behind and `forward` ahead.
pub(crate) fn moving_sum(x: &ArrayView1<f32>, back: usize, forward: usize) -> Array1<f32> {
    let n = x.len();
    let mut out = Array1::zeros(n);
    for i in 0..n {
        let lo = i.saturating_sub(back);
        let hi = (i + forward + 1).min(n);
        out[i] = x.slice(s![lo..hi]).sum();
    }
    out
}

/// Expected chunkwise distribution for parallel mode.
fn efficient_chunkwise_attention(alpha: &Array2<f32>, u: &Array2<f32>, w: usize) -> Array2<f32> {
    let (batch, t) = alpha.dim();
    let mut beta = Array2::zeros((batch, t));
    for b in 0..batch {
        let row = u.row(b);
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        let shift = if max.is_finite() { max } else { 0.0 };
        let exp_u = Array1::from_shape_fn(t, |i| {
            let e = row[i];
            if e.is_finite() {
                (e - shift).exp().max(1e-5)
            } else {
                1e-5
            }
        });
        let denom = moving_sum(&exp_u.view(), w - 1, 0);
        let ratio = Array1::from_shape_fn(t, |i| alpha[[b, i]] / denom[i]);
        let spread = moving_sum(&ratio.view(), 0, w - 1);
        for i in 0..t {
            beta[[b, i]] = exp_u[i] * spread[i];
        }
    }
    beta
}

/// Softmax over the window ending at each hard boundary.
fn hard_chunkwise_attention(alpha: &Array2<f32>, u: &Array2<f32>, w: usize) -> Array2<f32> {
    let (batch, t) = alpha.dim();
    let mut beta = Array2::zeros((batch, t));
    for b in 0..batch {
        let boundary = alpha.row(b).iter().position(|&v| v > 0.0);
        if let Some(bd) = boundary {
            let lo = bd.saturating_sub(w - 1);
            let window = softmax1(&u.slice(s![b, lo..=bd]));
            beta.slice_mut(s![b, lo..=bd]).assign(&window);
        }
    }
    beta
}
