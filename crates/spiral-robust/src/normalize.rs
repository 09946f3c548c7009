// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use ndarray::{Array4, Axis};
use std::fmt;
use std::str::FromStr;

use crate::{AttackError, Result};

/// Per-channel statistics applied before images reach the embedding oracle.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizationProfile {
    /// CIFAR-10 statistics, used for every dataset except ImageNet.
    Cifar10,
    /// ImageNet validation statistics.
    ImageNet,
    /// Pass-through; the oracle sees raw pixels.
    Identity,
    /// Caller-provided statistics.
    Custom { mean: Vec<f32>, std: Vec<f32> },
}

impl Default for NormalizationProfile {
    fn default() -> Self {
        Self::Cifar10
    }
}

impl FromStr for NormalizationProfile {
    type Err = AttackError;

    fn from_str(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "cifar10" | "cifar" => Ok(Self::Cifar10),
            "imagenet" | "imagenet_val" => Ok(Self::ImageNet),
            "identity" | "none" => Ok(Self::Identity),
            other => Err(AttackError::Configuration(format!(
                "unknown normalization profile '{other}'"
            ))),
        }
    }
}

impl fmt::Display for NormalizationProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cifar10 => write!(f, "cifar10"),
            Self::ImageNet => write!(f, "imagenet_val"),
            Self::Identity => write!(f, "identity"),
            Self::Custom { .. } => write!(f, "custom"),
        }
    }
}

/// Affine per-channel transform `(x − mean) / std`.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalization {
    profile: NormalizationProfile,
    mean: Vec<f32>,
    inv_std: Vec<f32>,
}

impl Normalization {
    pub fn from_profile(profile: NormalizationProfile) -> Result<Self> {
        let (mean, std) = match &profile {
            NormalizationProfile::Cifar10 => (vec![0.491, 0.482, 0.446], vec![0.202, 0.199, 0.201]),
            NormalizationProfile::ImageNet => {
                (vec![0.485, 0.456, 0.406], vec![0.229, 0.224, 0.225])
            }
            NormalizationProfile::Identity => (Vec::new(), Vec::new()),
            NormalizationProfile::Custom { mean, std } => (mean.clone(), std.clone()),
        };
        if mean.len() != std.len() {
            return Err(AttackError::Configuration(format!(
                "normalization mean has {} channels but std has {}",
                mean.len(),
                std.len()
            )));
        }
        if let Some(bad) = std.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
            return Err(AttackError::Configuration(format!(
                "normalization std must be positive, got {bad}"
            )));
        }
        if let Some(bad) = mean.iter().find(|m| !m.is_finite()) {
            return Err(AttackError::Configuration(format!(
                "normalization mean must be finite, got {bad}"
            )));
        }
        Ok(Self {
            profile,
            mean,
            inv_std: std.iter().map(|s| 1.0 / s).collect(),
        })
    }

    /// Resolves a profile name such as `cifar10` or `imagenet_val`.
    pub fn named(name: &str) -> Result<Self> {
        Self::from_profile(name.parse()?)
    }

    pub fn identity() -> Self {
        Self {
            profile: NormalizationProfile::Identity,
            mean: Vec::new(),
            inv_std: Vec::new(),
        }
    }

    pub fn profile(&self) -> &NormalizationProfile {
        &self.profile
    }

    fn is_identity(&self) -> bool {
        self.mean.is_empty()
    }

    fn check_channels(&self, batch: &Array4<f32>) -> Result<()> {
        let channels = batch.len_of(Axis(1));
        if !self.is_identity() && channels != self.mean.len() {
            return Err(AttackError::Shape(format!(
                "normalization profile '{}' expects {} channels, batch has {channels}",
                self.profile,
                self.mean.len()
            )));
        }
        Ok(())
    }

    /// Applies the forward transform.
    pub fn apply(&self, batch: &Array4<f32>) -> Result<Array4<f32>> {
        self.check_channels(batch)?;
        let mut out = batch.to_owned();
        if self.is_identity() {
            return Ok(out);
        }
        for (c, mut plane) in out.axis_iter_mut(Axis(1)).enumerate() {
            let (mean, inv_std) = (self.mean[c], self.inv_std[c]);
            plane.mapv_inplace(|x| (x - mean) * inv_std);
        }
        Ok(out)
    }

    /// Pulls a gradient taken w.r.t. the normalised batch back to raw pixels.
    pub fn backward(&self, grad_normalized: &Array4<f32>) -> Result<Array4<f32>> {
        self.check_channels(grad_normalized)?;
        let mut grad = grad_normalized.to_owned();
        if self.is_identity() {
            return Ok(grad);
        }
        for (c, mut plane) in grad.axis_iter_mut(Axis(1)).enumerate() {
            let inv_std = self.inv_std[c];
            plane.mapv_inplace(|g| g * inv_std);
        }
        Ok(grad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn profiles_resolve_by_name() {
        assert_eq!(
            "imagenet_val".parse::<NormalizationProfile>().unwrap(),
            NormalizationProfile::ImageNet
        );
        assert_eq!(
            "CIFAR10".parse::<NormalizationProfile>().unwrap(),
            NormalizationProfile::Cifar10
        );
        assert!(matches!(
            "mnist".parse::<NormalizationProfile>(),
            Err(AttackError::Configuration(_))
        ));
    }

    #[test]
    fn imagenet_statistics_are_applied_per_channel() {
        let norm = Normalization::named("imagenet").unwrap();
        let batch = Array4::from_elem((1, 3, 2, 2), 0.5f32);
        let out = norm.apply(&batch).unwrap();
        assert_abs_diff_eq!(out[[0, 0, 0, 0]], (0.5 - 0.485) / 0.229, epsilon = 1e-5);
        assert_abs_diff_eq!(out[[0, 2, 1, 1]], (0.5 - 0.406) / 0.225, epsilon = 1e-5);
    }

    #[test]
    fn backward_scales_by_inverse_std() {
        let norm = Normalization::named("cifar10").unwrap();
        let grad = Array4::from_elem((2, 3, 1, 1), 1.0f32);
        let back = norm.backward(&grad).unwrap();
        assert_abs_diff_eq!(back[[1, 1, 0, 0]], 1.0 / 0.199, epsilon = 1e-4);
    }

    #[test]
    fn channel_mismatch_is_a_shape_error() {
        let norm = Normalization::named("cifar10").unwrap();
        let batch = Array4::zeros((2, 1, 2, 2));
        assert!(matches!(norm.apply(&batch), Err(AttackError::Shape(_))));
        assert!(Normalization::identity().apply(&batch).is_ok());
    }
}
