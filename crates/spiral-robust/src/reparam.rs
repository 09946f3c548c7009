// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Change of variables between `[0, 1]` images and an unconstrained space.
//!
//! The optimiser works on `u = atanh(x·(2−2ε) − 1 + ε)` and images are read
//! back through `x = (tanh(u) + 1) / 2`, so every candidate stays inside the
//! pixel box without a projection step.

use ndarray::{Array, Dimension};

use crate::{AttackError, Result};

/// Offset that keeps `atanh` away from ±1 for pixels that are exactly 0 or 1.
pub const BOUNDARY_EPS: f32 = 3e-7;

/// Largest `f32` strictly below one.
const UPPER_INTERIOR: f32 = 1.0 - f32::EPSILON / 2.0;
/// Smallest positive normal `f32`.
const LOWER_INTERIOR: f32 = f32::MIN_POSITIVE;

/// Maps an image batch into the unconstrained optimisation space.
pub fn to_unconstrained<D: Dimension>(images: &Array<f32, D>) -> Result<Array<f32, D>> {
    if let Some(&value) = images
        .iter()
        .find(|value| !(value.is_finite() && (0.0..=1.0).contains(*value)))
    {
        return Err(AttackError::Configuration(format!(
            "pixel values must lie in [0, 1], found {value}"
        )));
    }
    let scale = 2.0 - 2.0 * BOUNDARY_EPS;
    Ok(images.mapv(|x| (x * scale - 1.0 + BOUNDARY_EPS).atanh()))
}

/// Maps the unconstrained variable back to images in the open interval (0, 1).
pub fn to_image<D: Dimension>(modifier: &Array<f32, D>) -> Array<f32, D> {
    modifier.mapv(|u| interior(0.5 * (u.tanh() + 1.0)))
}

/// Element-wise derivative `dx/du = (1 − tanh²(u)) / 2`.
pub fn image_jacobian<D: Dimension>(modifier: &Array<f32, D>) -> Array<f32, D> {
    modifier.mapv(|u| {
        let t = u.tanh();
        0.5 * (1.0 - t * t)
    })
}

// tanh saturates to ±1 in f32 once |u| exceeds ~9; keep the image on the
// representable grid inside (0, 1).
fn interior(x: f32) -> f32 {
    if x >= UPPER_INTERIOR {
        UPPER_INTERIOR
    } else if x <= LOWER_INTERIOR {
        LOWER_INTERIOR
    } else {
        x
    }
}
