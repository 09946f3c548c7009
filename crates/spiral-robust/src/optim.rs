// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use ndarray::{Array, Dimension, Zip};
use serde::{Deserialize, Serialize};

use crate::{ensure_finite, AttackError, Result};

/// Moment decay rates and denominator epsilon for [`Adam`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamSettings {
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
}

impl Default for AdamSettings {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

impl AdamSettings {
    pub fn validate(&self) -> Result<()> {
        for (name, beta) in [("beta1", self.beta1), ("beta2", self.beta2)] {
            if !(beta.is_finite() && (0.0..1.0).contains(&beta)) {
                return Err(AttackError::Configuration(format!(
                    "adam {name} must be in [0, 1), got {beta}"
                )));
            }
        }
        if !(self.eps.is_finite() && self.eps > 0.0) {
            return Err(AttackError::Configuration(format!(
                "adam eps must be > 0, got {}",
                self.eps
            )));
        }
        Ok(())
    }
}

/// Adam over a single dense parameter, with bias-corrected moments.
#[derive(Debug, Clone)]
pub struct Adam<D: Dimension> {
    learning_rate: f32,
    settings: AdamSettings,
    first_moment: Array<f32, D>,
    second_moment: Array<f32, D>,
    steps: u32,
}

impl<D: Dimension> Adam<D> {
    /// Zero moments shaped like `param`.
    pub fn new(param: &Array<f32, D>, learning_rate: f32, settings: AdamSettings) -> Result<Self> {
        if !(learning_rate.is_finite() && learning_rate > 0.0) {
            return Err(AttackError::Configuration(format!(
                "learning rate must be > 0, got {learning_rate}"
            )));
        }
        settings.validate()?;
        Ok(Self {
            learning_rate,
            settings,
            first_moment: Array::zeros(param.raw_dim()),
            second_moment: Array::zeros(param.raw_dim()),
            steps: 0,
        })
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    pub fn step(&mut self, param: &mut Array<f32, D>, grad: &Array<f32, D>) -> Result<()> {
        if param.shape() != self.first_moment.shape() || grad.shape() != param.shape() {
            return Err(AttackError::Shape(format!(
                "adam expected {:?}, got param {:?} and grad {:?}",
                self.first_moment.shape(),
                param.shape(),
                grad.shape()
            )));
        }
        ensure_finite("gradient", grad.iter())?;

        self.steps += 1;
        let AdamSettings { beta1, beta2, eps } = self.settings;
        let t = self.steps as i32;
        let bias1 = 1.0 - beta1.powi(t);
        let bias2_sqrt = (1.0 - beta2.powi(t)).sqrt();
        let step_size = self.learning_rate / bias1;

        Zip::from(param)
            .and(&mut self.first_moment)
            .and(&mut self.second_moment)
            .and(grad)
            .for_each(|p, m, v, &g| {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                let denom = v.sqrt() / bias2_sqrt + eps;
                *p -= step_size * *m / denom;
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array4};

    #[test]
    fn first_step_moves_by_learning_rate() {
        let mut param = array![1.0f32, -2.0, 0.5];
        let mut adam = Adam::new(&param, 0.1, AdamSettings::default()).unwrap();
        adam.step(&mut param, &array![3.0f32, -0.01, 0.0]).unwrap();
        assert_abs_diff_eq!(param[0], 0.9, epsilon = 1e-5);
        assert_abs_diff_eq!(param[1], -1.9, epsilon = 1e-4);
        assert_eq!(param[2], 0.5);
        assert_eq!(adam.steps(), 1);
    }

    #[test]
    fn minimises_a_quadratic() {
        let mut param = Array4::from_elem((1, 1, 2, 2), 2.0f32);
        let mut adam = Adam::new(&param, 0.05, AdamSettings::default()).unwrap();
        for _ in 0..400 {
            let grad = param.mapv(|p| 2.0 * (p - 0.5));
            adam.step(&mut param, &grad).unwrap();
        }
        for v in param.iter() {
            assert_abs_diff_eq!(*v, 0.5, epsilon = 5e-2);
        }
    }

    #[test]
    fn rejects_bad_inputs() {
        let mut param = array![0.0f32, 0.0];
        assert!(Adam::new(&param, 0.0, AdamSettings::default()).is_err());
        let bad = AdamSettings {
            beta1: 1.0,
            ..AdamSettings::default()
        };
        assert!(Adam::new(&param, 0.1, bad).is_err());

        let mut adam = Adam::new(&param, 0.1, AdamSettings::default()).unwrap();
        assert!(matches!(
            adam.step(&mut param, &array![f32::NAN, 0.0]),
            Err(AttackError::Numerical { .. })
        ));
        assert!(matches!(
            adam.step(&mut param, &array![1.0f32]),
            Err(AttackError::Shape(_))
        ));
    }
}
