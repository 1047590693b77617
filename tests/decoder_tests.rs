use las_decoder::config::{DecoderConfig, LatencyMetric, RecogConfig};
use las_decoder::ctc::{CtcOutput, CtcScorer};
use las_decoder::observer::RecordingObserver;
use las_decoder::{DecodeError, RnnDecoder, Task, TrainBatch};
use ndarray::{Array3, ArrayView3};

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
        ((b * 29 + i * 8 + d) as f32 * 0.013).sin()
    })
}

/// CTC branch returning a fixed loss and one trigger per target position.
struct FixedCtc {
    loss: f32,
}

impl CtcScorer for FixedCtc {
    fn forward(
        &self,
        _memory: &ArrayView3<f32>,
        _elens: &[usize],
        refs: &[Vec<u32>],
        need_triggers: bool,
    ) -> Result<CtcOutput, DecodeError> {
        let trigger_points =
            need_triggers.then(|| refs.iter().map(|ys| (0..=ys.len()).collect()).collect());
        Ok(CtcOutput {
            loss: self.loss,
            trigger_points,
        })
    }
}

#[test]
fn mixed_task_weights_fold_in_the_ctc_branch() {
    let config = DecoderConfig {
        ctc_weight: 0.3,
        ..make_config()
    };
    let mut dec = RnnDecoder::new(config, None, Some(Box::new(FixedCtc { loss: 2.0 }))).unwrap();
    let eouts = make_eouts(2, 6);
    let refs = vec![vec![4u32, 5, 6], vec![7u32, 8]];
    let out = dec
        .forward(
            &eouts.view(),
            &[6, 5],
            &TrainBatch::new(&refs),
            Task::All,
            None,
            None,
        )
        .unwrap();
    assert!((out.loss_ctc - 2.0).abs() < 1e-6);
    assert!(out.loss_att > 0.0);
    let expected = out.loss_ctc * 0.3 + out.loss_att * 0.7;
    assert!((out.loss - expected).abs() < 1e-4);
}

#[test]
fn per_batch_multitask_adds_raw_losses() {
    let config = DecoderConfig {
        ctc_weight: 0.3,
        mtl_per_batch: true,
        ..make_config()
    };
    let mut dec = RnnDecoder::new(config, None, Some(Box::new(FixedCtc { loss: 2.0 }))).unwrap();
    let eouts = make_eouts(1, 5);
    let refs = vec![vec![4u32, 5]];
    let out = dec
        .forward(
            &eouts.view(),
            &[5],
            &TrainBatch::new(&refs),
            Task::All,
            None,
            None,
        )
        .unwrap();
    assert!((out.loss - (out.loss_ctc + out.loss_att)).abs() < 1e-5);
}

#[test]
fn ctc_only_task_skips_the_attention_pass() {
    let config = DecoderConfig {
        ctc_weight: 0.3,
        ..make_config()
    };
    let mut dec = RnnDecoder::new(config, None, Some(Box::new(FixedCtc { loss: 2.0 }))).unwrap();
    let eouts = make_eouts(1, 5);
    let refs = vec![vec![4u32, 5]];
    let out = dec
        .forward(
            &eouts.view(),
            &[5],
            &TrainBatch::new(&refs),
            Task::Ctc,
            None,
            None,
        )
        .unwrap();
    assert_eq!(out.loss_att, 0.0);
    assert!((out.loss - 0.6).abs() < 1e-6);
}

#[test]
fn alignment_latency_loss_composes_with_the_others() {
    let config = DecoderConfig {
        ctc_weight: 0.3,
        latency_metric: Some(LatencyMetric::CtcSync),
        latency_loss_weight: 0.5,
        ..make_config()
    };
    let mut dec = RnnDecoder::new(config, None, Some(Box::new(FixedCtc { loss: 1.0 }))).unwrap();
    let eouts = make_eouts(1, 6);
    let refs = vec![vec![4u32, 5, 6]];
    let out = dec
        .forward(
            &eouts.view(),
            &[6],
            &TrainBatch::new(&refs),
            Task::All,
            None,
            None,
        )
        .unwrap();
    assert!(out.loss_latency.is_finite());
    assert!(out.loss_latency >= 0.0);
    let expected = out.loss_ctc * 0.3 + (out.loss_att + out.loss_latency * 0.5) * 0.7;
    assert!((out.loss - expected).abs() < 1e-4);
}

#[test]
fn teacher_forcing_statistics_stay_in_range() {
    let mut dec = RnnDecoder::new(make_config(), None, None).unwrap();
    let eouts = make_eouts(2, 6);
    let refs = vec![vec![4u32, 5, 6], vec![7u32, 8]];
    let out = dec
        .forward(
            &eouts.view(),
            &[6, 5],
            &TrainBatch::new(&refs),
            Task::All,
            None,
            None,
        )
        .unwrap();
    assert!((0.0..=100.0).contains(&out.accuracy));
    assert!(out.ppl >= 1.0);
    assert!(out.loss.is_finite());
}

#[test]
fn distillation_blends_the_exported_teacher_logits() {
    let refs = vec![vec![4u32, 5, 6], vec![7u32]];
    let eouts = make_eouts(2, 6);
    let elens = [6, 5];

    let mut teacher = RnnDecoder::new(make_config(), None, None).unwrap();
    let teacher_logits = teacher
        .forward_att_logits(&eouts.view(), &elens, &refs)
        .unwrap();

    let mut plain = RnnDecoder::new(make_config(), None, None).unwrap();
    let base = plain
        .forward(
            &eouts.view(),
            &elens,
            &TrainBatch::new(&refs),
            Task::All,
            None,
            None,
        )
        .unwrap();

    let config = DecoderConfig {
        distillation_weight: 0.4,
        ..make_config()
    };
    let mut student = RnnDecoder::new(config, None, None).unwrap();
    let batch = TrainBatch {
        refs: &refs,
        teacher_logits: Some(&teacher_logits),
        trigger_points: None,
    };
    let out = student
        .forward(&eouts.view(), &elens, &batch, Task::All, None, None)
        .unwrap();

    // Same seed everywhere, so the soft-label term against the model's
    // own logits is exactly the softened entropy: positive, at most
    // ln(vocab).
    assert!(out.loss_att > 0.6 * base.loss_att);
    assert!(out.loss_att <= 0.6 * base.loss_att + 0.4 * (11.0f32).ln() + 1e-4);
    assert_eq!(out.accuracy, base.accuracy);
    assert_eq!(out.ppl, base.ppl);
}

#[test]
fn training_attention_is_observable() {
    let mut dec = RnnDecoder::new(make_config(), None, None).unwrap();
    let eouts = make_eouts(2, 6);
    let refs = vec![vec![4u32, 5, 6], vec![7u32, 8]];
    let mut observer = RecordingObserver::default();
    dec.forward(
        &eouts.view(),
        &[6, 5],
        &TrainBatch::new(&refs),
        Task::All,
        None,
        Some(&mut observer),
    )
    .unwrap();
    assert_eq!(observer.weights.len(), 1);
    let (tag, aws, elens, ylens) = &observer.weights[0];
    assert_eq!(tag, "xy_aws");
    assert_eq!(aws.dim(), (2, 1, 4, 6));
    assert_eq!(elens[..], [6, 5]);
    assert_eq!(ylens[..], [4, 3]);
}

#[test]
fn greedy_length_is_bounded_by_the_ratio() {
    let mut dec = RnnDecoder::new(make_config(), None, None).unwrap();
    let eouts = make_eouts(1, 6);
    let recog = RecogConfig {
        max_len_ratio: 0.5,
        ..Default::default()
    };
    let hyps = dec
        .greedy(&eouts.view(), &[6], &recog, false, None, None, None)
        .unwrap();
    assert!(hyps[0].tokens.len() <= 4);
}

#[test]
fn exclude_eos_drops_only_a_generated_end_symbol() {
    let eouts = make_eouts(1, 5);
    let recog = RecogConfig::default();
    let mut a = RnnDecoder::new(make_config(), None, None).unwrap();
    let mut b = RnnDecoder::new(make_config(), None, None).unwrap();
    let kept = a
        .greedy(&eouts.view(), &[5], &recog, false, None, None, None)
        .unwrap();
    let trimmed = b
        .greedy(&eouts.view(), &[5], &recog, true, None, None, None)
        .unwrap();
    let kept = &kept[0].tokens;
    let trimmed = &trimmed[0].tokens;
    if kept.last() == Some(&2) {
        assert_eq!(&kept[..kept.len() - 1], &trimmed[..]);
    } else {
        assert_eq!(kept, trimmed);
    }
}
