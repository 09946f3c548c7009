use std::error::Error;

use ndarray::Array4;
use rand::Rng;
use spiral_config::{rng_from_optional, ConfigLayering, LayeredConfig};
use spiral_robust::center::{LocalReduce, RunningCenter};
use spiral_robust::frequency::{low_band_energy, OrthogonalFilterBank, WaveletKind};
use spiral_robust::{AttackConfig, EmbeddingOracle, LinearOracle, Ssah};

const BATCH: usize = 8;
const FEATURES: usize = 32;

fn main() -> Result<(), Box<dyn Error>> {
    spiral_config::tracing::init_tracing()?;

    let layers = LayeredConfig::load(ConfigLayering::discover())?;
    let mut config = AttackConfig::from_layers(&layers)?;
    if layers.layering().base.is_none() && layers.layering().run.is_none() {
        config.num_iterations = 40;
        config.learning_rate = 0.05;
    }

    let pixels = 3 * 8 * 8;
    let oracle = LinearOracle::random(pixels, FEATURES, Some(7))?;
    let mut center = RunningCenter::new(FEATURES, 0.9, LocalReduce)?;
    let ssah = Ssah::new(oracle, config)?;
    let bank = OrthogonalFilterBank::new(WaveletKind::Haar);

    let mut rng = rng_from_optional(Some(2024), "robust.demo.batch");
    let mut last_history = Vec::new();
    for round in 0..3 {
        let batch = Array4::from_shape_fn((BATCH, 3, 8, 8), |_| rng.gen_range(0.0f32..=1.0));
        let outcome = ssah.attack_with_report(&batch)?;

        let embeddings = ssah.oracle().evaluate(&outcome.adversarial)?;
        let drift = center.update(&embeddings)?.iter().map(|v| v.abs()).sum::<f32>();
        // Relative change of the LL energy, averaged over the batch.
        let coarse_shift = low_band_energy(&bank, &batch)?
            .iter()
            .zip(low_band_energy(&bank, &outcome.adversarial)?)
            .map(|(before, after)| (after - before).abs() / before.max(f32::EPSILON))
            .sum::<f32>()
            / BATCH as f32;

        if let (Some(first), Some(last)) = (outcome.history.first(), outcome.history.last()) {
            let mean = |v: &[f32]| v.iter().sum::<f32>() / v.len() as f32;
            println!(
                "round {round}: loss {:.4} -> {:.4}, positive {:.4} -> {:.4}, negatives {:?}, center |c|₁ {drift:.4}, LL shift {coarse_shift:.4}",
                first.contrastive_loss,
                last.contrastive_loss,
                mean(&first.positive_similarity[..]),
                mean(&last.positive_similarity[..]),
                outcome.hard_negatives.unwrap_or_default(),
            );
        }
        last_history = outcome.history;
    }

    if let Ok(path) = std::env::var("SSAH_DEMO_REPORT") {
        std::fs::write(&path, serde_json::to_string_pretty(&last_history)?)?;
        println!("wrote {} iteration records to {path}", last_history.len());
    }

    spiral_config::tracing::flush_chrome_trace();
    Ok(())
}
