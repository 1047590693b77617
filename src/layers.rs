//! Forward-only neural building blocks shared by the decoder, the
//! attention scorers and the fusion layers.

use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::Rng;

use crate::error::DecodeError;

pub(crate) fn uniform1(rng: &mut StdRng, n: usize, scale: f32) -> Array1<f32> {
    Array1::from_shape_fn(n, |_| rng.gen_range(-scale..=scale))
}

pub(crate) fn uniform2(rng: &mut StdRng, rows: usize, cols: usize, scale: f32) -> Array2<f32> {
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-scale..=scale))
}

pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Numerically stable softmax over the last axis, in place.
pub(crate) fn softmax_rows(x: &mut Array2<f32>) {
    for mut row in x.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        if sum > 0.0 {
            row.mapv_inplace(|v| v / sum);
        }
    }
}

pub(crate) fn softmax1(x: &ArrayView1<f32>) -> Array1<f32> {
    let max = x.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
    let mut out = x.mapv(|v| (v - max).exp());
    let sum = out.sum();
    if sum > 0.0 {
        out.mapv_inplace(|v| v / sum);
    }
    out
}

pub(crate) fn log_softmax1(x: &ArrayView1<f32>) -> Array1<f32> {
    let max = x.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
    let logsum = x.mapv(|v| (v - max).exp()).sum().ln() + max;
    x.mapv(|v| v - logsum)
}

pub(crate) fn log_softmax_rows(x: &ArrayView2<f32>) -> Array2<f32> {
    let mut out = x.to_owned();
    for mut row in out.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        let logsum = row.mapv(|v| (v - max).exp()).sum().ln() + max;
        row.mapv_inplace(|v| v - logsum);
    }
    out
}

/// Fully-connected layer, `y = x W^T + b`.
#[derive(Debug, Clone)]
pub(crate) struct Linear {
    pub weight: Array2<f32>,
    pub bias: Option<Array1<f32>>,
}

impl Linear {
    pub fn new(in_dim: usize, out_dim: usize, bias: bool, rng: &mut StdRng, scale: f32) -> Self {
        Self {
            weight: uniform2(rng, out_dim, in_dim, scale),
            bias: bias.then(|| uniform1(rng, out_dim, scale)),
        }
    }

    pub fn out_dim(&self) -> usize {
        self.weight.nrows()
    }

    pub fn forward(&self, x: &ArrayView2<f32>) -> Array2<f32> {
        let mut out = x.dot(&self.weight.t());
        if let Some(bias) = &self.bias {
            out += bias;
        }
        out
    }
}

/// Token embedding table.
#[derive(Debug, Clone)]
pub(crate) struct Embedding {
    pub weight: Array2<f32>,
}

impl Embedding {
    /// `pad` must lie inside the vocabulary; its row is pinned to zero.
    pub fn new(vocab: usize, dim: usize, pad: u32, rng: &mut StdRng, scale: f32) -> Self {
        let mut weight = uniform2(rng, vocab, dim, scale);
        weight.row_mut(pad as usize).fill(0.0);
        Self { weight }
    }

    pub fn lookup(&self, ids: &[u32]) -> Result<Array2<f32>, DecodeError> {
        let vocab = self.weight.nrows();
        let mut out = Array2::zeros((ids.len(), self.weight.ncols()));
        for (b, &id) in ids.iter().enumerate() {
            let id = id as usize;
            if id >= vocab {
                return Err(DecodeError::Input(format!(
                    "token id {id} outside vocab of {vocab}"
                )));
            }
            out.row_mut(b).assign(&self.weight.row(id));
        }
        Ok(out)
    }
}

/// Single LSTM cell with i, f, g, o gate layout.
#[derive(Debug, Clone)]
pub(crate) struct LstmCell {
    w_ih: Array2<f32>,
    w_hh: Array2<f32>,
    b_ih: Array1<f32>,
    b_hh: Array1<f32>,
    n_units: usize,
}

impl LstmCell {
    pub fn new(in_dim: usize, n_units: usize, rng: &mut StdRng, scale: f32) -> Self {
        Self {
            w_ih: uniform2(rng, 4 * n_units, in_dim, scale),
            w_hh: uniform2(rng, 4 * n_units, n_units, scale),
            b_ih: uniform1(rng, 4 * n_units, scale),
            b_hh: uniform1(rng, 4 * n_units, scale),
            n_units,
        }
    }

    pub fn forward(
        &self,
        x: &ArrayView2<f32>,
        h: &ArrayView2<f32>,
        c: &ArrayView2<f32>,
    ) -> (Array2<f32>, Array2<f32>) {
        let u = self.n_units;
        let mut gates = x.dot(&self.w_ih.t()) + h.dot(&self.w_hh.t());
        gates += &self.b_ih;
        gates += &self.b_hh;
        let i = gates.slice(s![.., 0..u]).mapv(sigmoid);
        let f = gates.slice(s![.., u..2 * u]).mapv(sigmoid);
        let g = gates.slice(s![.., 2 * u..3 * u]).mapv(f32::tanh);
        let o = gates.slice(s![.., 3 * u..4 * u]).mapv(sigmoid);
        let c_new = &f * c + &i * &g;
        let h_new = &o * &c_new.mapv(f32::tanh);
        (h_new, c_new)
    }
}

/// Single GRU cell with r, z, n gate layout.
#[derive(Debug, Clone)]
pub(crate) struct GruCell {
    w_ih: Array2<f32>,
    w_hh: Array2<f32>,
    b_ih: Array1<f32>,
    b_hh: Array1<f32>,
    n_units: usize,
}

impl GruCell {
    pub fn new(in_dim: usize, n_units: usize, rng: &mut StdRng, scale: f32) -> Self {
        Self {
            w_ih: uniform2(rng, 3 * n_units, in_dim, scale),
            w_hh: uniform2(rng, 3 * n_units, n_units, scale),
            b_ih: uniform1(rng, 3 * n_units, scale),
            b_hh: uniform1(rng, 3 * n_units, scale),
            n_units,
        }
    }

    pub fn forward(&self, x: &ArrayView2<f32>, h: &ArrayView2<f32>) -> Array2<f32> {
        let u = self.n_units;
        let mut gx = x.dot(&self.w_ih.t());
        gx += &self.b_ih;
        let mut gh = h.dot(&self.w_hh.t());
        gh += &self.b_hh;
        let r = (&gx.slice(s![.., 0..u]) + &gh.slice(s![.., 0..u])).mapv(sigmoid);
        let z = (&gx.slice(s![.., u..2 * u]) + &gh.slice(s![.., u..2 * u])).mapv(sigmoid);
        let n = (&gx.slice(s![.., 2 * u..3 * u]) + &(&r * &gh.slice(s![.., 2 * u..3 * u])))
            .mapv(f32::tanh);
        z.mapv(|v| 1.0 - v) * &n + &z * h
    }
}

/// One recurrent layer of the decoder stack.
#[derive(Debug, Clone)]
pub(crate) enum RnnCell {
    Lstm(LstmCell),
    Gru(GruCell),
}

impl RnnCell {
    /// Advances one layer, returning the new hidden (and cell) state.
    pub fn forward(
        &self,
        x: &ArrayView2<f32>,
        h: &ArrayView2<f32>,
        c: Option<&ArrayView2<f32>>,
    ) -> Result<(Array2<f32>, Option<Array2<f32>>), DecodeError> {
        match self {
            RnnCell::Lstm(cell) => {
                let c = c.ok_or_else(|| {
                    DecodeError::input("LSTM layer stepped without a cell state")
                })?;
                let (h_new, c_new) = cell.forward(x, h, c);
                Ok((h_new, Some(c_new)))
            }
            RnnCell::Gru(cell) => Ok((cell.forward(x, h), None)),
        }
    }
}
