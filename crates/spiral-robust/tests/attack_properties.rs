use std::sync::atomic::{AtomicUsize, Ordering};

use ndarray::{Array2, Array4, Axis};
use rand::{rngs::StdRng, Rng, SeedableRng};
use spiral_robust::reparam::{to_image, to_unconstrained};
use spiral_robust::{
    AttackConfig, AttackError, EmbeddingOracle, FnOracle, IdentityOracle, ImageBatch, LinearOracle,
    Ssah,
};

fn identity_config(iterations: usize, learning_rate: f32) -> AttackConfig {
    AttackConfig {
        num_iterations: iterations,
        learning_rate,
        normalization_profile: "identity".to_string(),
        ..AttackConfig::default()
    }
}

fn random_batch(seed: u64, shape: (usize, usize, usize, usize)) -> ImageBatch {
    let mut rng = StdRng::seed_from_u64(seed);
    Array4::from_shape_fn(shape, |_| rng.gen_range(0.0f32..=1.0))
}

fn colour_batch() -> ImageBatch {
    let colours = [[0.9f32, 0.1, 0.1], [0.1, 0.1, 0.9]];
    Array4::from_shape_fn((2, 3, 4, 4), |(b, c, _, _)| colours[b][c])
}

fn cosine_to_original(adversarial: &ImageBatch, original: &ImageBatch) -> Vec<f32> {
    adversarial
        .axis_iter(Axis(0))
        .zip(original.axis_iter(Axis(0)))
        .map(|(a, o)| {
            let dot: f32 = a.iter().zip(o.iter()).map(|(x, y)| x * y).sum();
            let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
            let no: f32 = o.iter().map(|x| x * x).sum::<f32>().sqrt();
            dot / (na * no)
        })
        .collect()
}

#[test]
fn outputs_stay_strictly_inside_the_pixel_box() {
    let batch = random_batch(11, (3, 3, 4, 4));
    for iterations in [0, 1, 25] {
        let ssah = Ssah::new(IdentityOracle, identity_config(iterations, 0.5)).unwrap();
        let adversarial = ssah.attack(&batch).unwrap();
        assert_eq!(adversarial.dim(), batch.dim());
        assert!(adversarial.iter().all(|v| *v > 0.0 && *v < 1.0));
    }
}

#[test]
fn zero_iterations_return_the_round_trip() {
    let mut batch = random_batch(5, (2, 3, 4, 4));
    batch[[0, 0, 0, 0]] = 0.0;
    batch[[1, 2, 3, 3]] = 1.0;
    let ssah = Ssah::new(IdentityOracle, identity_config(0, 0.1)).unwrap();
    let outcome = ssah.attack_with_report(&batch).unwrap();
    assert!(outcome.history.is_empty());
    assert_eq!(outcome.hard_negatives, None);
    assert_eq!(outcome.adversarial, to_image(&to_unconstrained(&batch).unwrap()));
    for (a, b) in outcome.adversarial.iter().zip(batch.iter()) {
        assert!((a - b).abs() < 1e-5);
    }
}

#[test]
fn hard_negatives_are_frozen_after_the_first_iteration() {
    let batch = random_batch(21, (4, 3, 4, 4));
    let oracle = LinearOracle::random(48, 8, Some(9)).unwrap();
    let config = AttackConfig {
        num_iterations: 30,
        learning_rate: 0.2,
        ..AttackConfig::default()
    };
    let outcome = Ssah::new(oracle, config).unwrap().attack_with_report(&batch).unwrap();
    let first = &outcome.history[0].hard_negatives;
    let last = &outcome.history.last().unwrap().hard_negatives;
    assert_eq!(first, last);
    assert_eq!(outcome.hard_negatives.as_ref(), Some(first));
}

#[test]
fn positive_similarity_follows_the_oracle_output() {
    let calls = AtomicUsize::new(0);
    let outputs = [
        Array2::from_shape_vec((2, 2), vec![1.0f32, 0.0, 0.0, 1.0]).unwrap(),
        Array2::from_shape_vec((2, 2), vec![1.0f32, 0.2, 0.3, 1.0]).unwrap(),
        Array2::from_shape_vec((2, 2), vec![0.2f32, 1.0, 1.0, 0.4]).unwrap(),
    ];
    let oracle = FnOracle::new(
        "scripted",
        |_batch: &ImageBatch| {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            Ok(outputs[call.min(outputs.len() - 1)].clone())
        },
        |batch: &ImageBatch, _grad: &Array2<f32>| Ok(Array4::zeros(batch.raw_dim())),
    );
    let ssah = Ssah::new(&oracle, identity_config(2, 0.1)).unwrap();
    let outcome = ssah.attack_with_report(&colour_batch()).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_ne!(
        outcome.history[0].positive_similarity,
        outcome.history[1].positive_similarity
    );
}

#[test]
fn contrastive_loss_does_not_increase() {
    let batch = random_batch(3, (4, 3, 4, 4));
    let oracle = LinearOracle::random(48, 16, Some(1)).unwrap();
    let config = AttackConfig {
        num_iterations: 60,
        learning_rate: 0.1,
        ..AttackConfig::default()
    };
    let outcome = Ssah::new(oracle, config).unwrap().attack_with_report(&batch).unwrap();
    let first = outcome.history[0].contrastive_loss;
    let last = outcome.history.last().unwrap().contrastive_loss;
    assert!(last <= first, "loss went from {first} to {last}");
}

#[test]
fn colour_pair_drifts_away_from_its_originals() {
    let batch = colour_batch();
    let ssah = Ssah::new(IdentityOracle, identity_config(50, 0.1)).unwrap();
    let outcome = ssah.attack_with_report(&batch).unwrap();
    let before = &outcome.history[0].positive_similarity;
    let after = cosine_to_original(&outcome.adversarial, &batch);
    for (b, a) in before.iter().zip(after.iter()) {
        assert!(b - a >= 0.01, "positive similarity only moved from {b} to {a}");
    }
}

#[test]
fn single_image_batches_fail_before_the_oracle_runs() {
    let calls = AtomicUsize::new(0);
    let oracle = FnOracle::new(
        "counting",
        |batch: &ImageBatch| {
            calls.fetch_add(1, Ordering::SeqCst);
            IdentityOracle.evaluate(batch)
        },
        |batch: &ImageBatch, grad: &Array2<f32>| IdentityOracle.backpropagate(batch, grad),
    );
    let ssah = Ssah::new(&oracle, identity_config(5, 0.1)).unwrap();
    let single = Array4::from_elem((1, 3, 4, 4), 0.5f32);
    assert!(matches!(ssah.attack(&single), Err(AttackError::Configuration(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn oracle_failures_abort_the_invocation() {
    let oracle = FnOracle::new(
        "broken",
        |_batch: &ImageBatch| Err(AttackError::Embedding("device lost".to_string())),
        |batch: &ImageBatch, _grad: &Array2<f32>| Ok(Array4::zeros(batch.raw_dim())),
    );
    let ssah = Ssah::new(oracle, identity_config(3, 0.1)).unwrap();
    assert!(matches!(
        ssah.attack(&colour_batch()),
        Err(AttackError::Embedding(_))
    ));
}

#[test]
fn non_finite_oracle_gradients_abort_the_invocation() {
    let oracle = FnOracle::new(
        "exploding",
        |batch: &ImageBatch| IdentityOracle.evaluate(batch),
        |batch: &ImageBatch, _grad: &Array2<f32>| {
            let mut grad = Array4::zeros(batch.raw_dim());
            grad[[1, 0, 2, 2]] = f32::NAN;
            Ok(grad)
        },
    );
    let ssah = Ssah::new(oracle, identity_config(3, 0.1)).unwrap();
    assert!(matches!(
        ssah.attack(&colour_batch()),
        Err(AttackError::Numerical { label: "oracle_gradient", .. })
    ));
}

#[test]
fn non_finite_candidate_embeddings_abort_the_invocation() {
    // The original batch embeds cleanly; the first candidate does not.
    let calls = AtomicUsize::new(0);
    let oracle = FnOracle::new(
        "unstable",
        |batch: &ImageBatch| {
            let mut embedding = IdentityOracle.evaluate(batch)?;
            if calls.fetch_add(1, Ordering::SeqCst) > 0 {
                embedding[[0, 1]] = f32::INFINITY;
            }
            Ok(embedding)
        },
        |batch: &ImageBatch, grad: &Array2<f32>| IdentityOracle.backpropagate(batch, grad),
    );
    let ssah = Ssah::new(&oracle, identity_config(3, 0.1)).unwrap();
    assert!(matches!(
        ssah.attack(&colour_batch()),
        Err(AttackError::Numerical { label: "embedding", .. })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn wrongly_shaped_oracle_gradients_abort_the_invocation() {
    let oracle = FnOracle::new(
        "downsampling",
        |batch: &ImageBatch| IdentityOracle.evaluate(batch),
        |batch: &ImageBatch, _grad: &Array2<f32>| {
            let (b, c, _, _) = batch.dim();
            Ok(Array4::ones((b, c, 2, 2)))
        },
    );
    let ssah = Ssah::new(oracle, identity_config(3, 0.1)).unwrap();
    assert!(matches!(
        ssah.attack(&colour_batch()),
        Err(AttackError::Shape(_))
    ));
}

#[test]
fn out_of_range_pixels_are_rejected() {
    let mut batch = colour_batch();
    batch[[0, 0, 0, 0]] = 1.5;
    let ssah = Ssah::new(IdentityOracle, identity_config(1, 0.1)).unwrap();
    assert!(matches!(ssah.attack(&batch), Err(AttackError::Configuration(_))));
}

#[test]
fn shared_attacker_serves_parallel_callers() {
    let ssah = Ssah::new(IdentityOracle, identity_config(5, 0.1)).unwrap();
    let batch = random_batch(8, (2, 3, 4, 4));
    let serial = ssah.attack(&batch).unwrap();
    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..3).map(|_| scope.spawn(|| ssah.attack(&batch).unwrap())).collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), serial);
        }
    });
}
