// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use ndarray::{Array1, Array2, ArrayView1, Axis, Zip};

use crate::{AttackError, EmbeddingMatrix, Result};

/// Norm floor applied before dividing, so all-zero rows map to zero.
pub const NORM_FLOOR: f32 = 1e-12;

fn row_norms(matrix: &Array2<f32>) -> Array1<f32> {
    matrix.map_axis(Axis(1), |row| {
        row.iter().map(|v| (*v as f64).powi(2)).sum::<f64>().sqrt() as f32
    })
}

/// Divides every row by `max(‖row‖₂, NORM_FLOOR)`.
pub fn normalize_rows(matrix: &Array2<f32>) -> Array2<f32> {
    let norms = row_norms(matrix);
    let mut out = matrix.to_owned();
    for (mut row, norm) in out.axis_iter_mut(Axis(0)).zip(norms.iter()) {
        let inv = 1.0 / norm.max(NORM_FLOOR);
        row.mapv_inplace(|v| v * inv);
    }
    out
}

/// Cosine similarities between adversarial rows and original columns.
#[derive(Debug, Clone)]
pub struct SimilarityMatrix {
    values: Array2<f32>,
    adversarial_unit: Array2<f32>,
    adversarial_norms: Array1<f32>,
    original_unit: Array2<f32>,
}

impl SimilarityMatrix {
    /// Builds `S = normalize(adversarial) · original_unitᵀ`.
    ///
    /// `original_unit` must already be row-normalised; the original branch is
    /// constant for a whole invocation and is normalised once.
    pub fn compute(adversarial: &EmbeddingMatrix, original_unit: &Array2<f32>) -> Result<Self> {
        if adversarial.dim() != original_unit.dim() {
            return Err(AttackError::Shape(format!(
                "adversarial embeddings {:?} vs original embeddings {:?}",
                adversarial.dim(),
                original_unit.dim()
            )));
        }
        let adversarial_norms = row_norms(adversarial);
        let adversarial_unit = normalize_rows(adversarial);
        let values = adversarial_unit.dot(&original_unit.t());
        Ok(Self {
            values,
            adversarial_unit,
            adversarial_norms,
            original_unit: original_unit.to_owned(),
        })
    }

    pub fn batch(&self) -> usize {
        self.values.nrows()
    }

    pub fn values(&self) -> &Array2<f32> {
        &self.values
    }

    /// Negative-candidate pool of sample `i`, self-similarity included.
    pub fn row(&self, i: usize) -> ArrayView1<'_, f32> {
        self.values.row(i)
    }

    /// `S[i, i]` for every sample.
    pub fn positive(&self) -> Array1<f32> {
        self.values.diag().to_owned()
    }

    /// Gradient w.r.t. the raw adversarial embeddings given `∂L/∂S`.
    pub fn backward(&self, grad_values: &Array2<f32>) -> Result<Array2<f32>> {
        if grad_values.dim() != self.values.dim() {
            return Err(AttackError::Shape(format!(
                "similarity gradient {:?} vs similarity matrix {:?}",
                grad_values.dim(),
                self.values.dim()
            )));
        }
        let grad_unit = grad_values.dot(&self.original_unit);
        let mut grad = Array2::zeros(grad_unit.raw_dim());
        Zip::from(grad.rows_mut())
            .and(grad_unit.rows())
            .and(self.adversarial_unit.rows())
            .and(&self.adversarial_norms)
            .for_each(|mut out, g, unit, &norm| {
                if norm > NORM_FLOOR {
                    let radial = g.dot(&unit);
                    let inv = 1.0 / norm;
                    Zip::from(&mut out)
                        .and(&g)
                        .and(&unit)
                        .for_each(|o, &gv, &uv| *o = (gv - radial * uv) * inv);
                } else {
                    let inv = 1.0 / NORM_FLOOR;
                    Zip::from(&mut out).and(&g).for_each(|o, &gv| *o = gv * inv);
                }
            });
        Ok(grad)
    }
}
