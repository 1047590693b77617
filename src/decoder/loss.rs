//! Training-time loss composition: label-smoothed cross-entropy with
//! scheduled sampling, plus the CTC, quantity, latency and distillation
//! terms folded in by the configured weights.

use ndarray::{s, Array2, Array3, Array4, ArrayView1, ArrayView2, ArrayView3};
use serde::Serialize;

use crate::attention::AttentionMode;
use crate::config::{AttentionKind, LatencyMetric};
use crate::error::DecodeError;
use crate::layers::{log_softmax1, softmax1};
use crate::lm::LmState;
use crate::observer::AttentionObserver;
use crate::session::SessionContext;

use super::{DecoderState, RnnDecoder};

/// Which objectives one batch composes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    All,
    Att,
    Ctc,
}

/// One training batch. Only `refs` is required.
pub struct TrainBatch<'a> {
    /// Reference transcripts, token ids without start or end symbols.
    pub refs: &'a [Vec<u32>],
    /// Per-position logits of a stronger model, `[B, L, vocab]`; enables
    /// knowledge distillation when the weight is configured.
    pub teacher_logits: Option<&'a Array3<f32>>,
    /// Encoder frame each output token should fire at, one list per item.
    /// Overrides the forced alignment a CTC scorer would produce.
    pub trigger_points: Option<&'a [Vec<usize>]>,
}

impl<'a> TrainBatch<'a> {
    pub fn new(refs: &'a [Vec<u32>]) -> Self {
        Self {
            refs,
            teacher_logits: None,
            trigger_points: None,
        }
    }
}

/// Scalar losses and teacher-forcing statistics for one batch.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LossOutput {
    pub loss: f32,
    pub loss_att: f32,
    pub loss_ctc: f32,
    pub loss_mbr: f32,
    pub loss_quantity: f32,
    pub loss_latency: f32,
    /// Token accuracy under teacher forcing, in percent.
    pub accuracy: f32,
    pub ppl: f32,
}

pub(crate) struct AttStats {
    pub loss_ce: f32,
    pub accuracy: f32,
    pub ppl: f32,
    pub loss_quantity: f32,
    pub loss_latency: f32,
}

/// Teacher-forced pass over the whole batch.
pub(crate) struct Rollout {
    /// Output logits, `[B, L, vocab]`.
    pub logits: Array3<f32>,
    /// Attention weights, `[B, H, L, T]`.
    pub aws: Array4<f32>,
    /// Chunkwise distributions when the scorer emits them, `[B, L, T]`.
    pub betas: Option<Array3<f32>>,
}

pub(crate) struct PaddedTargets {
    pub ys_in: Vec<Vec<u32>>,
    pub ys_out: Vec<Vec<u32>>,
    /// Valid output steps per item, end symbol counted.
    pub ylens: Vec<usize>,
    pub n_steps: usize,
}

impl RnnDecoder {
    /// Composes the configured losses for one batch. `session` feeds the
    /// conversation carry of a discourse-aware decoder; `observer`
    /// receives the raw attention weights of the teacher-forced pass.
    pub fn forward(
        &mut self,
        eouts: &ArrayView3<f32>,
        elens: &[usize],
        batch: &TrainBatch,
        task: Task,
        session: Option<&mut SessionContext>,
        observer: Option<&mut dyn AttentionObserver>,
    ) -> Result<LossOutput, DecodeError> {
        let (bs, tmax, enc) = eouts.dim();
        if bs != batch.refs.len() || elens.len() != bs {
            return Err(DecodeError::input("batch sizes disagree"));
        }
        if enc != self.config.enc_n_units {
            return Err(DecodeError::Input(format!(
                "encoder width {enc} differs from configured {}",
                self.config.enc_n_units
            )));
        }
        if elens.iter().any(|&l| l == 0 || l > tmax) {
            return Err(DecodeError::input("encoder length out of range"));
        }
        for ys in batch.refs {
            if ys.iter().any(|&y| y as usize >= self.config.vocab) {
                return Err(DecodeError::input("reference token outside the vocabulary"));
            }
        }
        if let Some(trig) = batch.trigger_points {
            if trig.len() != bs {
                return Err(DecodeError::input("trigger points must cover the batch"));
            }
        }

        let mut out = LossOutput::default();
        let att_task = !matches!(task, Task::Ctc);
        let ctc_task = matches!(task, Task::All | Task::Ctc);
        let mbr_cfg = self.config.mbr;

        let mut triggers: Option<Vec<Vec<usize>>> = batch.trigger_points.map(<[_]>::to_vec);

        if self.config.ctc_weight > 0.0 && ctc_task {
            let scorer = self
                .ctc
                .as_deref()
                .ok_or_else(|| DecodeError::config("ctc_weight > 0 requires a CTC scorer"))?;
            let need_align = triggers.is_none()
                && att_task
                && mbr_cfg.is_none()
                && matches!(self.config.latency_metric, Some(LatencyMetric::CtcSync));
            let ctc_out = scorer.forward(eouts, elens, batch.refs, need_align)?;
            out.loss_ctc = ctc_out.loss;
            out.loss += if self.config.mtl_per_batch {
                ctc_out.loss
            } else {
                ctc_out.loss * self.config.ctc_weight
            };
            if need_align {
                let points = ctc_out.trigger_points.ok_or_else(|| {
                    DecodeError::Scorer(
                        "alignment-synchronous latency needs forced-alignment points".into(),
                    )
                })?;
                if points.len() != bs {
                    return Err(DecodeError::Scorer(
                        "forced alignment does not cover the batch".into(),
                    ));
                }
                triggers = Some(points);
            }
        }

        if att_task {
            match mbr_cfg {
                None if self.config.att_weight() > 0.0 => {
                    let stats = self.forward_att(
                        eouts,
                        elens,
                        batch.refs,
                        batch.teacher_logits,
                        triggers.as_deref(),
                        session,
                        observer,
                    )?;
                    out.loss_att = stats.loss_ce;
                    out.accuracy = stats.accuracy;
                    out.ppl = stats.ppl;
                    out.loss_quantity = stats.loss_quantity;
                    out.loss_latency = stats.loss_latency;
                    let mut loss_att = stats.loss_ce;
                    if self.config.attention.kind == AttentionKind::Mocha
                        && self.config.quantity_loss_weight > 0.0
                    {
                        loss_att += stats.loss_quantity * self.config.quantity_loss_weight;
                    }
                    if self.config.latency_metric.is_some() && self.config.latency_loss_weight > 0.0
                    {
                        loss_att += stats.loss_latency * self.config.latency_loss_weight;
                    }
                    out.loss += if self.config.mtl_per_batch {
                        loss_att
                    } else {
                        loss_att * self.config.att_weight()
                    };
                }
                Some(mbr) => {
                    let mbr_out = self.forward_mbr(eouts, elens, batch.refs, observer)?;
                    out.loss_mbr = mbr_out.loss_mbr;
                    out.loss_att = mbr_out.loss_ce;
                    out.accuracy = mbr_out.accuracy;
                    out.ppl = mbr_out.ppl;
                    // Risk training replaces the composed loss outright.
                    out.loss = mbr_out.loss_mbr + mbr_out.loss_ce * mbr.ce_weight;
                }
                None => {}
            }
        }

        log::debug!(
            "loss={:.4} att={:.4} ctc={:.4} mbr={:.4} acc={:.2} ppl={:.2}",
            out.loss,
            out.loss_att,
            out.loss_ctc,
            out.loss_mbr,
            out.accuracy,
            out.ppl,
        );
        Ok(out)
    }

    /// Teacher-forced logits for the batch, for use as distillation
    /// targets by another model. No sampling, no loss.
    pub fn forward_att_logits(
        &mut self,
        eouts: &ArrayView3<f32>,
        elens: &[usize],
        refs: &[Vec<u32>],
    ) -> Result<Array3<f32>, DecodeError> {
        if eouts.dim().0 != refs.len() || elens.len() != refs.len() {
            return Err(DecodeError::input("batch sizes disagree"));
        }
        let targets = append_sos_eos(
            refs,
            self.config.special.eos,
            self.config.special.pad,
            self.config.backward,
        );
        let initial = self.zero_state(refs.len());
        let rollout = self.rollout(eouts, elens, &targets, initial, false, None, None)?;
        Ok(rollout.logits)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn forward_att(
        &mut self,
        eouts: &ArrayView3<f32>,
        elens: &[usize],
        refs: &[Vec<u32>],
        teacher_logits: Option<&Array3<f32>>,
        triggers: Option<&[Vec<usize>]>,
        session: Option<&mut SessionContext>,
        // Trait-object lifetime independent of the borrow, so callers
        // can reborrow one observer per call.
        observer: Option<&mut (dyn AttentionObserver + '_)>,
    ) -> Result<AttStats, DecodeError> {
        let bs = refs.len();
        let targets = append_sos_eos(
            refs,
            self.config.special.eos,
            self.config.special.pad,
            self.config.backward,
        );

        let mut initial = self.zero_state(bs);
        if self.config.discourse_aware {
            if let Some(sess) = &session {
                if !sess.new_session
                    && sess.batch_states.len() == bs
                    && sess.batch_states.iter().all(Option::is_some)
                {
                    let parts: Vec<&DecoderState> = sess.batch_states.iter().flatten().collect();
                    initial = DecoderState::concat(&parts)?;
                }
            }
        }
        let mut snaps = self.config.discourse_aware.then(|| vec![None; bs]);

        let rollout = self.rollout(eouts, elens, &targets, initial, true, triggers, snaps.as_mut())?;

        if let (Some(sess), Some(snaps)) = (session, snaps) {
            sess.batch_states = snaps;
            sess.new_session = false;
        }

        let ylens = &targets.ylens;
        let mut aws = rollout.aws;
        if let Some(obs) = observer {
            obs.weights("xy_aws", &aws, elens, ylens);
            if let Some(betas) = &rollout.betas {
                obs.stop_probs("xy_aws_beta", betas);
            }
        }

        let (mut loss_ce, ppl) = cross_entropy_lsm(
            &rollout.logits,
            &targets.ys_out,
            self.config.lsm_prob,
            self.config.special.pad,
        );

        // Padded target rows must not count as attention mass.
        if self.config.attention.kind == AttentionKind::Mocha || triggers.is_some() {
            for b in 0..bs {
                for l in ylens[b]..targets.n_steps {
                    aws.slice_mut(s![b, .., l, ..]).fill(0.0);
                }
            }
        }

        let loss_quantity = if self.config.attention.kind == AttentionKind::Mocha {
            quantity_loss(&aws, ylens)
        } else {
            0.0
        };

        let loss_latency = match (self.config.latency_metric, triggers) {
            (Some(LatencyMetric::Interval), Some(_)) => {
                return Err(DecodeError::input(
                    "interval latency cannot be combined with trigger points",
                ));
            }
            (Some(LatencyMetric::Interval), None) => interval_latency(&aws),
            (Some(LatencyMetric::CtcSync), Some(trig)) => alignment_latency(&aws, trig, ylens)?,
            _ => 0.0,
        };

        if let Some(teacher) = teacher_logits {
            if self.config.distillation_weight > 0.0 {
                let (tb, tl, tv) = teacher.dim();
                if tb != bs || tl < targets.n_steps || tv != self.config.vocab {
                    return Err(DecodeError::input(
                        "teacher logits do not cover the target batch",
                    ));
                }
                let kl = distillation_kl(&rollout.logits, teacher, ylens, 5.0);
                let w = self.config.distillation_weight;
                loss_ce = loss_ce * (1.0 - w) + kl * w;
            }
        }

        let accuracy = token_accuracy(&rollout.logits, &targets.ys_out, self.config.special.pad);

        Ok(AttStats {
            loss_ce,
            accuracy,
            ppl,
            loss_quantity,
            loss_latency,
        })
    }

    /// Teacher-forced pass shared by the loss paths. Scheduled sampling
    /// replaces the input token with the previous argmax when `sample`
    /// is set and the sampling rate admits it.
    pub(crate) fn rollout(
        &mut self,
        eouts: &ArrayView3<f32>,
        elens: &[usize],
        targets: &PaddedTargets,
        initial: DecoderState,
        sample: bool,
        triggers: Option<&[Vec<usize>]>,
        mut snapshots: Option<&mut Vec<Option<DecoderState>>>,
    ) -> Result<Rollout, DecodeError> {
        let bs = targets.ys_in.len();
        let tmax = eouts.dim().1;
        let n_steps = targets.n_steps;

        self.reset_attention_cache();
        let mut dstate = initial;
        let mut att = self.fresh_attention(bs);
        let mut lm_state: Option<LmState> = None;
        let mut prev_attn_v: Option<Array2<f32>> = None;
        let mut step_attn_v: Vec<Array2<f32>> = Vec::with_capacity(n_steps);
        let mut step_aws: Vec<Array3<f32>> = Vec::with_capacity(n_steps);
        let mut step_betas: Vec<Array2<f32>> = Vec::new();

        for t in 0..n_steps {
            let is_sample = sample && t > 0 && self.sample_step();
            let tokens: Vec<u32> = if is_sample {
                let prev = prev_attn_v
                    .as_ref()
                    .ok_or_else(|| DecodeError::input("sampling before the first step"))?;
                let logits = self.output_logits(&prev.view());
                argmax_rows(&logits.view())
            } else {
                targets.ys_in.iter().map(|y| y[t]).collect()
            };

            let lmout = self.fusion_lm_step(&tokens, lm_state.as_ref())?;
            let feats = lmout.as_ref().and_then(|o| self.fusion_features(o));
            let fview = feats.as_ref().map(|f| f.view());
            let trig: Option<Vec<usize>> = triggers.map(|tp| {
                (0..bs)
                    .map(|b| tp[b].get(t).copied().unwrap_or(0))
                    .collect()
            });

            let out = self.decode_step(
                eouts,
                elens,
                &dstate,
                &att,
                &tokens,
                fview.as_ref(),
                AttentionMode::Parallel,
                trig.as_deref(),
            )?;

            let aw = out
                .att
                .weights
                .clone()
                .ok_or_else(|| DecodeError::input("attention produced no weights"))?;
            step_aws.push(aw);
            if let Some(beta) = &out.att.stop_probs {
                if step_betas.len() == t {
                    step_betas.push(beta.clone());
                }
            }
            if let Some(o) = lmout {
                lm_state = Some(o.state);
            }
            prev_attn_v = Some(out.attn_v.clone());
            step_attn_v.push(out.attn_v);
            dstate = out.state;
            att = out.att;

            if let Some(snaps) = snapshots.as_deref_mut() {
                for b in 0..bs {
                    if t + 1 == targets.ylens[b] {
                        snaps[b] = Some(dstate.select(b));
                    }
                }
            }
        }

        let heads = step_aws
            .first()
            .map(|aw| aw.dim().1)
            .unwrap_or_else(|| self.score.n_heads());
        let mut aws = Array4::zeros((bs, heads, n_steps, tmax));
        for (t, aw) in step_aws.iter().enumerate() {
            aws.slice_mut(s![.., .., t, ..]).assign(aw);
        }

        let mut logits = Array3::zeros((bs, n_steps, self.config.vocab));
        for (t, attn_v) in step_attn_v.iter().enumerate() {
            let lg = self.output_logits(&attn_v.view());
            logits.slice_mut(s![.., t, ..]).assign(&lg);
        }

        let betas = (step_betas.len() == n_steps && n_steps > 0).then(|| {
            let mut betas = Array3::zeros((bs, n_steps, tmax));
            for (t, beta) in step_betas.iter().enumerate() {
                betas.slice_mut(s![.., t, ..]).assign(beta);
            }
            betas
        });

        Ok(Rollout { logits, aws, betas })
    }
}

/// Wraps references with the start and end symbol and pads the batch.
/// A backward decoder sees each transcript reversed.
pub(crate) fn append_sos_eos(
    refs: &[Vec<u32>],
    eos: u32,
    pad: u32,
    backward: bool,
) -> PaddedTargets {
    let ylens: Vec<usize> = refs.iter().map(|y| y.len() + 1).collect();
    let n_steps = ylens.iter().copied().max().unwrap_or(1);
    let mut ys_in = Vec::with_capacity(refs.len());
    let mut ys_out = Vec::with_capacity(refs.len());
    for ys in refs {
        let tokens: Vec<u32> = if backward {
            ys.iter().rev().copied().collect()
        } else {
            ys.clone()
        };
        let mut row_in = Vec::with_capacity(n_steps);
        row_in.push(eos);
        row_in.extend_from_slice(&tokens);
        row_in.resize(n_steps, pad);
        let mut row_out = tokens;
        row_out.push(eos);
        row_out.resize(n_steps, pad);
        ys_in.push(row_in);
        ys_out.push(row_out);
    }
    PaddedTargets {
        ys_in,
        ys_out,
        ylens,
        n_steps,
    }
}

pub(crate) fn argmax_rows(logits: &ArrayView2<f32>) -> Vec<u32> {
    logits
        .outer_iter()
        .map(|row| {
            let mut best = 0usize;
            let mut best_v = f32::NEG_INFINITY;
            for (i, &v) in row.iter().enumerate() {
                if v > best_v {
                    best_v = v;
                    best = i;
                }
            }
            best as u32
        })
        .collect()
}

/// Label-smoothed cross-entropy averaged over non-padded positions plus
/// the perplexity of the unsmoothed distribution.
fn cross_entropy_lsm(
    logits: &Array3<f32>,
    ys_out: &[Vec<u32>],
    lsm_prob: f32,
    pad: u32,
) -> (f32, f32) {
    let vocab = logits.dim().2;
    let mut smoothed = 0.0f32;
    let mut plain = 0.0f32;
    let mut count = 0usize;
    for (b, ys) in ys_out.iter().enumerate() {
        for (l, &y) in ys.iter().enumerate() {
            if y == pad {
                continue;
            }
            let lp = log_softmax1(&logits.slice(s![b, l, ..]));
            let target = lp[y as usize];
            let off_mass = (lp.sum() - target) * (lsm_prob / (vocab as f32 - 1.0));
            smoothed += -((1.0 - lsm_prob) * target + off_mass);
            plain += -target;
            count += 1;
        }
    }
    if count == 0 {
        return (0.0, 1.0);
    }
    let n = count as f32;
    (smoothed / n, (plain / n).exp())
}

/// Teacher-forcing token accuracy over non-padded positions, in percent.
fn token_accuracy(logits: &Array3<f32>, ys_out: &[Vec<u32>], pad: u32) -> f32 {
    let mut hits = 0usize;
    let mut count = 0usize;
    for (b, ys) in ys_out.iter().enumerate() {
        for (l, &y) in ys.iter().enumerate() {
            if y == pad {
                continue;
            }
            let row = logits.slice(s![b, l, ..]);
            if argmax1(&row) == y {
                hits += 1;
            }
            count += 1;
        }
    }
    if count == 0 {
        return 0.0;
    }
    hits as f32 * 100.0 / count as f32
}

fn argmax1(row: &ArrayView1<f32>) -> u32 {
    let mut best = 0usize;
    let mut best_v = f32::NEG_INFINITY;
    for (i, &v) in row.iter().enumerate() {
        if v > best_v {
            best_v = v;
            best = i;
        }
    }
    best as u32
}

/// Mean absolute gap between total attention mass and token count;
/// keeps a monotonic scorer honest about how often it fires.
fn quantity_loss(aws: &Array4<f32>, ylens: &[usize]) -> f32 {
    let (bs, heads, _, _) = aws.dim();
    let mut total = 0.0f32;
    for (b, &ylen) in ylens.iter().enumerate() {
        let pred: f32 = aws.slice(s![b, .., .., ..]).sum() / heads as f32;
        total += (pred - ylen as f32).abs();
    }
    total / bs as f32
}

/// Penalizes attention that lingers: for consecutive steps the expected
/// forward jump is squared and summed over frames.
fn interval_latency(aws: &Array4<f32>) -> f32 {
    let (bs, _, n_steps, tmax) = aws.dim();
    if n_steps == 0 {
        return 0.0;
    }
    let mut total = 0.0f32;
    for b in 0..bs {
        for l in 0..n_steps {
            let cur = aws.slice(s![b, 0, l, ..]);
            let prev = (l > 0).then(|| aws.slice(s![b, 0, l - 1, ..]));
            let mut step = 0.0f32;
            for i in 0..tmax {
                let mut expect = 0.0f32;
                if let Some(p) = &prev {
                    for j in 0..i {
                        expect += p[j] * (i - j) as f32;
                    }
                }
                let s = cur[i] * expect;
                step += s * s;
            }
            total += step;
        }
    }
    total / (bs * n_steps) as f32
}

/// Absolute gap between the expected firing frame and the aligned
/// trigger frame, averaged over all valid output positions.
fn alignment_latency(
    aws: &Array4<f32>,
    triggers: &[Vec<usize>],
    ylens: &[usize],
) -> Result<f32, DecodeError> {
    let (_, heads, _, tmax) = aws.dim();
    let mut total = 0.0f32;
    for (b, &ylen) in ylens.iter().enumerate() {
        if triggers[b].len() < ylen {
            return Err(DecodeError::input("trigger points shorter than the target"));
        }
        for h in 0..heads {
            for l in 0..ylen {
                let mut expected = 0.0f32;
                for t in 0..tmax {
                    expected += t as f32 * aws[[b, h, l, t]];
                }
                total += (expected - triggers[b][l] as f32).abs();
            }
        }
    }
    let denom: usize = ylens.iter().sum();
    if denom == 0 {
        return Ok(0.0);
    }
    Ok(total / denom as f32)
}

/// Soft-label cross-entropy against a stronger model at temperature
/// `temperature`, averaged over valid positions.
fn distillation_kl(
    student: &Array3<f32>,
    teacher: &Array3<f32>,
    ylens: &[usize],
    temperature: f32,
) -> f32 {
    let mut total = 0.0f32;
    let mut count = 0usize;
    for (b, &ylen) in ylens.iter().enumerate() {
        for l in 0..ylen {
            let s_row = student.slice(s![b, l, ..]).mapv(|v| v / temperature);
            let t_row = teacher.slice(s![b, l, ..]).mapv(|v| v / temperature);
            let s_lp = log_softmax1(&s_row.view());
            let t_p = softmax1(&t_row.view());
            total += -(&t_p * &s_lp).sum();
            count += 1;
        }
    }
    if count == 0 {
        return 0.0;
    }
    total / count as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecoderConfig;
    use crate::ctc::{CtcOutput, CtcScorer};
    use ndarray::{Array3, Array4};

    fn make_config() -> DecoderConfig {
        DecoderConfig {
            enc_n_units: 8,
            n_units: 12,
            n_layers: 1,
            bottleneck_dim: 10,
            emb_dim: 6,
            vocab: 11,
            seed: 7,
            ..Default::default()
        }
    }

    fn make_eouts(bs: usize, t: usize) -> Array3<f32> {
        Array3::from_shape_fn((bs, t, 8), |(b, i, d)| {
            ((b * 100 + i * 8 + d) as f32 * 0.013).sin()
        })
    }

    struct FixedCtc(f32);

    impl CtcScorer for FixedCtc {
        fn forward(
            &self,
            _memory: &ArrayView3<f32>,
            _elens: &[usize],
            refs: &[Vec<u32>],
            need_triggers: bool,
        ) -> Result<CtcOutput, DecodeError> {
            let trigger_points = need_triggers
                .then(|| refs.iter().map(|y| (0..=y.len()).collect()).collect());
            Ok(CtcOutput {
                loss: self.0,
                trigger_points,
            })
        }
    }

    #[test]
    fn append_sos_eos_pads_and_reverses() {
        let refs = vec![vec![5, 6, 7], vec![8]];
        let fwd = append_sos_eos(&refs, 2, 3, false);
        assert_eq!(fwd.ys_in, vec![vec![2, 5, 6, 7], vec![2, 8, 3, 3]]);
        assert_eq!(fwd.ys_out, vec![vec![5, 6, 7, 2], vec![8, 2, 3, 3]]);
        assert_eq!(fwd.ylens, vec![4, 2]);
        assert_eq!(fwd.n_steps, 4);

        let bwd = append_sos_eos(&refs, 2, 3, true);
        assert_eq!(bwd.ys_in[0], vec![2, 7, 6, 5]);
        assert_eq!(bwd.ys_out[0], vec![7, 6, 5, 2]);
    }

    #[test]
    fn lsm_zero_matches_plain_cross_entropy() {
        let mut logits = Array3::zeros((1, 2, 4));
        logits[[0, 0, 1]] = 2.0;
        logits[[0, 1, 2]] = 1.0;
        let ys = vec![vec![1, 2]];
        let (loss, ppl) = cross_entropy_lsm(&logits, &ys, 0.0, 3);
        assert!((ppl - loss.exp()).abs() < 1e-4);

        let (smoothed, ppl2) = cross_entropy_lsm(&logits, &ys, 0.1, 3);
        assert!((ppl - ppl2).abs() < 1e-5);
        assert!(smoothed > loss);
    }

    #[test]
    fn padded_positions_do_not_count() {
        let mut logits = Array3::zeros((1, 2, 4));
        logits[[0, 0, 1]] = 5.0;
        logits[[0, 1, 0]] = 5.0;
        let ys = vec![vec![1, 3]];
        let acc = token_accuracy(&logits, &ys, 3);
        assert!((acc - 100.0).abs() < 1e-6);
    }

    #[test]
    fn quantity_counts_the_end_symbol() {
        let mut aws = Array4::zeros((1, 1, 2, 3));
        aws[[0, 0, 0, 0]] = 1.0;
        aws[[0, 0, 1, 1]] = 1.0;
        assert!(quantity_loss(&aws, &[2]).abs() < 1e-6);
        assert!((quantity_loss(&aws, &[3]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn interval_latency_charges_forward_jumps() {
        let mut aws = Array4::zeros((1, 1, 2, 4));
        aws[[0, 0, 0, 0]] = 1.0;
        aws[[0, 0, 1, 2]] = 1.0;
        // Step 1 jumps two frames: contribution (1 * 2)^2, averaged over
        // two steps.
        assert!((interval_latency(&aws) - 2.0).abs() < 1e-5);

        let mut still = Array4::zeros((1, 1, 2, 4));
        still[[0, 0, 0, 0]] = 1.0;
        still[[0, 0, 1, 0]] = 1.0;
        assert!(interval_latency(&still).abs() < 1e-6);
    }

    #[test]
    fn alignment_latency_zero_on_exact_triggers() {
        let mut aws = Array4::zeros((1, 1, 2, 4));
        aws[[0, 0, 0, 1]] = 1.0;
        aws[[0, 0, 1, 3]] = 1.0;
        let exact = alignment_latency(&aws, &[vec![1, 3]], &[2]).unwrap();
        assert!(exact.abs() < 1e-6);
        let off = alignment_latency(&aws, &[vec![1, 2]], &[2]).unwrap();
        assert!((off - 0.5).abs() < 1e-6);
        assert!(alignment_latency(&aws, &[vec![1]], &[2]).is_err());
    }

    #[test]
    fn distillation_of_identical_models_is_entropy() {
        let student = Array3::zeros((1, 1, 4));
        let teacher = Array3::zeros((1, 1, 4));
        let kl = distillation_kl(&student, &teacher, &[1], 5.0);
        assert!((kl - (4.0f32).ln()).abs() < 1e-5);
    }

    #[test]
    fn ctc_only_task_skips_the_attention_loss() {
        let config = DecoderConfig {
            ctc_weight: 0.4,
            ..make_config()
        };
        let mut dec = RnnDecoder::new(config, None, Some(Box::new(FixedCtc(2.5)))).unwrap();
        let eouts = make_eouts(2, 6);
        let refs = vec![vec![4, 5], vec![6]];
        let batch = TrainBatch::new(&refs);
        let out = dec
            .forward(&eouts.view(), &[6, 5], &batch, Task::Ctc, None, None)
            .unwrap();
        assert!((out.loss_ctc - 2.5).abs() < 1e-6);
        assert!((out.loss - 1.0).abs() < 1e-6);
        assert_eq!(out.loss_att, 0.0);
    }

    #[test]
    fn attention_loss_is_deterministic() {
        let eouts = make_eouts(2, 6);
        let refs = vec![vec![4, 5, 6], vec![7]];
        let batch = TrainBatch::new(&refs);
        let mut a = RnnDecoder::new(make_config(), None, None).unwrap();
        let mut b = RnnDecoder::new(make_config(), None, None).unwrap();
        let out_a = a
            .forward(&eouts.view(), &[6, 4], &batch, Task::All, None, None)
            .unwrap();
        let out_b = b
            .forward(&eouts.view(), &[6, 4], &batch, Task::All, None, None)
            .unwrap();
        assert_eq!(out_a.loss, out_b.loss);
        assert!(out_a.loss > 0.0);
        assert!(out_a.ppl >= 1.0);
        assert!((0.0..=100.0).contains(&out_a.accuracy));
    }

    #[test]
    fn out_of_vocabulary_reference_is_rejected() {
        let mut dec = RnnDecoder::new(make_config(), None, None).unwrap();
        let eouts = make_eouts(1, 4);
        let refs = vec![vec![99]];
        let batch = TrainBatch::new(&refs);
        assert!(dec
            .forward(&eouts.view(), &[4], &batch, Task::All, None, None)
            .is_err());
    }

    #[test]
    fn discourse_batch_saves_per_item_states() {
        let config = DecoderConfig {
            discourse_aware: true,
            ..make_config()
        };
        let mut dec = RnnDecoder::new(config, None, None).unwrap();
        let mut session = SessionContext::new();
        session.start_new_session();
        let eouts = make_eouts(2, 5);
        let refs = vec![vec![4], vec![5, 6]];
        let batch = TrainBatch::new(&refs);
        dec.forward(
            &eouts.view(),
            &[5, 5],
            &batch,
            Task::All,
            Some(&mut session),
            None,
        )
        .unwrap();
        assert_eq!(session.batch_states.len(), 2);
        assert!(session.batch_states.iter().all(Option::is_some));
        assert!(!session.new_session);

        // The next batch may consume the carried states.
        let out = dec
            .forward(
                &eouts.view(),
                &[5, 5],
                &batch,
                Task::All,
                Some(&mut session),
                None,
            )
            .unwrap();
        assert!(out.loss.is_finite());
    }
}
