// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use ndarray::Array1;

use crate::frequency::FrequencyTerm;
use crate::selector::PairSimilarities;
use crate::{ensure_finite, AttackError, Result};

/// Adaptive-margin objective with an optional low-frequency penalty.
///
/// The pair weights are computed from detached similarities, so samples whose
/// positive similarity already sits below the margin, or whose negative is
/// already far enough, stop receiving gradient.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossComposer {
    margin: f32,
    alpha: f32,
    lambda_lf: f32,
    frequency_enabled: bool,
}

/// Value and analytic gradients of one composed loss evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct LossBreakdown {
    pub contrastive: f32,
    /// Present only when the frequency term is enabled.
    pub frequency: Option<f32>,
    pub total: f32,
    pub per_sample: Array1<f32>,
    /// `∂total/∂positive_similarity`.
    pub grad_positive: Array1<f32>,
    /// `∂total/∂negative_similarity`.
    pub grad_negative: Array1<f32>,
}

impl LossComposer {
    pub fn new(margin: f32, alpha: f32, lambda_lf: f32, frequency_enabled: bool) -> Result<Self> {
        if !(margin.is_finite() && margin >= 0.0) {
            return Err(AttackError::Configuration(format!(
                "margin must be >= 0, got {margin}"
            )));
        }
        if !(alpha.is_finite() && alpha > 0.0) {
            return Err(AttackError::Configuration(format!(
                "alpha must be > 0, got {alpha}"
            )));
        }
        if !(lambda_lf.is_finite() && lambda_lf >= 0.0) {
            return Err(AttackError::Configuration(format!(
                "lambda_lf must be >= 0, got {lambda_lf}"
            )));
        }
        Ok(Self {
            margin,
            alpha,
            lambda_lf,
            frequency_enabled,
        })
    }

    pub fn frequency_enabled(&self) -> bool {
        self.frequency_enabled
    }

    /// Weight multiplying the frequency gradient in the total objective.
    pub fn frequency_scale(&self) -> f32 {
        if self.frequency_enabled {
            self.lambda_lf
        } else {
            0.0
        }
    }

    /// Composes `alpha·Σ contrastive [+ lambda_lf·frequency]`.
    pub fn compose(
        &self,
        pairs: &PairSimilarities,
        frequency: Option<&FrequencyTerm>,
    ) -> Result<LossBreakdown> {
        let batch = pairs.batch();
        if pairs.negative.len() != batch || pairs.columns.len() != batch {
            return Err(AttackError::Shape(format!(
                "pair similarities disagree on batch size ({} positives, {} negatives)",
                batch,
                pairs.negative.len()
            )));
        }
        let stacked = pairs.as_pairs();
        ensure_finite("pair_similarity", stacked.iter())?;

        let mut per_sample = Array1::zeros(batch);
        let mut grad_positive = Array1::zeros(batch);
        let mut grad_negative = Array1::zeros(batch);
        for (i, pair) in stacked.rows().into_iter().enumerate() {
            let (pos, neg) = (pair[0], pair[1]);
            let weight_pos = (pos - self.margin).max(0.0);
            let weight_neg = (1.0 + self.margin - neg).max(0.0);
            let raw = weight_pos * pos - weight_neg * neg;
            per_sample[i] = raw.max(0.0);
            if raw >= 0.0 {
                grad_positive[i] = self.alpha * weight_pos;
                grad_negative[i] = -self.alpha * weight_neg;
            }
        }
        let contrastive = per_sample.sum();

        let frequency = if self.frequency_enabled {
            let term = frequency.ok_or_else(|| {
                AttackError::Configuration(
                    "frequency term enabled but no low-frequency penalty supplied".to_string(),
                )
            })?;
            Some(term.value)
        } else {
            None
        };
        let total = self.alpha * contrastive + frequency.map_or(0.0, |value| self.lambda_lf * value);

        ensure_finite("contrastive_loss", [contrastive].iter())?;
        ensure_finite("total_loss", [total].iter())?;
        ensure_finite("loss_gradient", grad_positive.iter().chain(grad_negative.iter()))?;

        Ok(LossBreakdown {
            contrastive,
            frequency,
            total,
            per_sample,
            grad_positive,
            grad_negative,
        })
    }
}
