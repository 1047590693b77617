//! Minimum Bayes risk training pass.

use ndarray::{s, Array1, ArrayView3};

use crate::config::RecogConfig;
use crate::error::DecodeError;
use crate::layers::{log_softmax1, softmax1};
use crate::observer::AttentionObserver;

use super::beam_search::RecogResources;
use super::loss::append_sos_eos;
use super::RnnDecoder;

pub(crate) struct MbrOutput {
    pub loss_mbr: f32,
    pub loss_ce: f32,
    pub accuracy: f32,
    pub ppl: f32,
}

impl RnnDecoder {
    /// Sequence-level risk training. Hypotheses sampled by beam search
    /// are weighted by how far their error deviates from the beam's
    /// expected error; the weighted likelihoods form the risk surrogate,
    /// anchored by cross-entropy on the reference.
    pub(crate) fn forward_mbr(
        &mut self,
        eouts: &ArrayView3<f32>,
        elens: &[usize],
        refs: &[Vec<u32>],
        mut observer: Option<&mut dyn AttentionObserver>,
    ) -> Result<MbrOutput, DecodeError> {
        let mbr = self
            .config
            .mbr
            .ok_or_else(|| DecodeError::config("risk training is not configured"))?;
        let recog = RecogConfig {
            beam_width: mbr.nbest,
            nbest: mbr.nbest,
            ..RecogConfig::default()
        };

        let mut out = MbrOutput {
            loss_mbr: 0.0,
            loss_ce: 0.0,
            accuracy: 0.0,
            ppl: 0.0,
        };
        let mut counted = 0usize;
        for b in 0..refs.len() {
            if refs[b].is_empty() {
                log::warn!("utterance {b} has an empty reference, skipped");
                continue;
            }
            let eouts_b = eouts.slice(s![b..b + 1, ..elens[b], ..]);
            let elens_b = [elens[b]];
            let mut nbest = self.beam_search(
                &eouts_b,
                &elens_b,
                &recog,
                RecogResources {
                    exclude_eos: true,
                    ..Default::default()
                },
            )?;
            let hyps = nbest.pop().unwrap_or_default();
            if hyps.is_empty() {
                continue;
            }

            let scores: Vec<f32> = hyps.iter().map(|h| h.breakdown.att).collect();
            let ref_len = refs[b].len() as f32;
            let wers: Vec<f32> = hyps
                .iter()
                .map(|h| edit_distance(&h.tokens, &refs[b]) as f32 / ref_len)
                .collect();
            let (grads, exp_wer) = risk_weights(&scores, &wers, mbr.softmax_smoothing);
            log::debug!("utterance {b}: expected error {exp_wer:.4} over {} hypotheses", hyps.len());

            // Teacher-forced likelihood of every hypothesis against the
            // shared encoder output row.
            let hyp_refs: Vec<Vec<u32>> = hyps.into_iter().map(|h| h.tokens).collect();
            let targets = append_sos_eos(
                &hyp_refs,
                self.config.special.eos,
                self.config.special.pad,
                self.config.backward,
            );
            let initial = self.zero_state(hyp_refs.len());
            let rollout = self.rollout(&eouts_b, &elens_b, &targets, initial, true, None, None)?;

            for (n, grad) in grads.iter().enumerate() {
                let mut nll = 0.0f32;
                for t in 0..targets.ylens[n] {
                    let row = rollout.logits.slice(s![n, t, ..]);
                    let lp = log_softmax1(&row);
                    nll -= lp[targets.ys_out[n][t] as usize];
                }
                out.loss_mbr += grad * nll;
            }

            let stats = self.forward_att(
                &eouts_b,
                &elens_b,
                std::slice::from_ref(&refs[b]),
                None,
                None,
                None,
                observer.as_deref_mut(),
            )?;
            out.loss_ce += stats.loss_ce;
            out.accuracy += stats.accuracy;
            out.ppl += stats.ppl;
            counted += 1;
        }
        if counted > 0 {
            out.accuracy /= counted as f32;
            out.ppl /= counted as f32;
        }
        Ok(out)
    }
}

/// Deviation-from-expectation weights over one beam. The weights sum
/// to zero, so uniformly bad beams contribute nothing.
fn risk_weights(scores: &[f32], wers: &[f32], smoothing: f32) -> (Vec<f32>, f32) {
    let scaled = Array1::from_iter(scores.iter().map(|s| s * smoothing));
    let probs = softmax1(&scaled.view());
    let exp_wer: f32 = probs.iter().zip(wers).map(|(p, w)| p * w).sum();
    let grads = probs
        .iter()
        .zip(wers)
        .map(|(p, w)| p * (w - exp_wer))
        .collect();
    (grads, exp_wer)
}

/// Token-level Levenshtein distance.
fn edit_distance(hyp: &[u32], reference: &[u32]) -> usize {
    let mut prev: Vec<usize> = (0..=reference.len()).collect();
    let mut cur = vec![0usize; reference.len() + 1];
    for (i, &h) in hyp.iter().enumerate() {
        cur[0] = i + 1;
        for (j, &r) in reference.iter().enumerate() {
            let sub = prev[j] + usize::from(h != r);
            cur[j + 1] = sub.min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[reference.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DecoderConfig, MbrConfig};
    use crate::observer::RecordingObserver;
    use ndarray::Array3;

    #[test]
    fn edit_distance_counts_all_operation_kinds() {
        assert_eq!(edit_distance(&[1, 2, 3], &[1, 2, 3]), 0);
        assert_eq!(edit_distance(&[1, 3], &[1, 2, 3]), 1);
        assert_eq!(edit_distance(&[1, 4, 3], &[1, 2, 3]), 1);
        assert_eq!(edit_distance(&[1, 2, 3, 4], &[1, 2, 3]), 1);
        assert_eq!(edit_distance(&[], &[5, 6]), 2);
        assert_eq!(edit_distance(&[5, 6], &[]), 2);
    }

    #[test]
    fn risk_weights_center_on_the_expected_error() {
        let scores = [2.0f32.ln(), 0.0, 0.0];
        let wers = [0.0, 0.4, 0.4];
        let (grads, exp_wer) = risk_weights(&scores, &wers, 1.0);
        assert!((exp_wer - 0.2).abs() < 1e-6);
        assert!((grads[0] - (-0.1)).abs() < 1e-6);
        assert!((grads[1] - 0.05).abs() < 1e-6);
        assert!((grads[2] - 0.05).abs() < 1e-6);
        let sum: f32 = grads.iter().sum();
        assert!(sum.abs() < 1e-6);
    }

    #[test]
    fn a_four_way_beam_averages_errors_by_weight() {
        // Scores ln(4)..ln(1) softmax to [0.4, 0.3, 0.2, 0.1].
        let scores = [4.0f32.ln(), 3.0f32.ln(), 2.0f32.ln(), 0.0];
        let wers = [0.0, 0.2, 0.4, 0.6];
        let (grads, exp_wer) = risk_weights(&scores, &wers, 1.0);
        assert!((exp_wer - 0.2).abs() < 1e-6);
        assert!((grads[0] - (-0.08)).abs() < 1e-6);
        assert!(grads[1].abs() < 1e-6);
        assert!((grads[2] - 0.04).abs() < 1e-6);
        assert!((grads[3] - 0.04).abs() < 1e-6);
    }

    #[test]
    fn identical_errors_yield_zero_risk() {
        let (grads, exp_wer) = risk_weights(&[0.3, -1.2], &[0.5, 0.5], 0.8);
        assert!((exp_wer - 0.5).abs() < 1e-6);
        assert!(grads.iter().all(|g| g.abs() < 1e-6));
    }

    #[test]
    fn risk_pass_produces_finite_losses() {
        let config = DecoderConfig {
            enc_n_units: 8,
            n_units: 12,
            n_layers: 1,
            bottleneck_dim: 10,
            emb_dim: 6,
            vocab: 11,
            seed: 7,
            mbr: Some(MbrConfig {
                nbest: 2,
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut dec = RnnDecoder::new(config, None, None).unwrap();
        let eouts = Array3::from_shape_fn((1, 6, 8), |(b, t, d)| {
            ((b * 100 + t * 8 + d) as f32 * 0.013).sin()
        });
        let refs = vec![vec![4, 5, 6]];
        let out = dec
            .forward_mbr(&eouts.view(), &[6], &refs, None)
            .unwrap();
        assert!(out.loss_mbr.is_finite());
        assert!(out.loss_ce > 0.0);
        assert!(out.ppl >= 1.0);
    }

    #[test]
    fn one_observer_serves_every_utterance_of_the_batch() {
        let config = DecoderConfig {
            enc_n_units: 8,
            n_units: 12,
            n_layers: 1,
            bottleneck_dim: 10,
            emb_dim: 6,
            vocab: 11,
            seed: 7,
            mbr: Some(MbrConfig {
                nbest: 2,
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut dec = RnnDecoder::new(config, None, None).unwrap();
        let eouts = Array3::from_shape_fn((2, 6, 8), |(b, t, d)| {
            ((b * 100 + t * 8 + d) as f32 * 0.013).sin()
        });
        let refs = vec![vec![4, 5, 6], vec![7, 8]];
        let mut obs = RecordingObserver::default();
        dec.forward_mbr(&eouts.view(), &[6, 6], &refs, Some(&mut obs))
            .unwrap();
        // One anchor pass per utterance, each a single-row batch.
        assert_eq!(obs.weights.len(), 2);
        assert_eq!(obs.weights[0].0, "xy_aws");
        assert_eq!(obs.weights[0].1.dim().0, 1);
        assert_eq!(obs.weights[0].2, vec![6]);
    }
}
