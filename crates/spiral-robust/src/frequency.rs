// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Low-frequency penalty built on a single-level 2-D wavelet transform.
//!
//! Only the LL subband is kept: decomposing and reconstructing yields a
//! blurred, full-resolution copy of every channel. The penalty is the summed
//! smooth-L1 distance between the blurred candidate and the blurred original.

use ndarray::{s, Array2, Axis};
use std::fmt;
use std::str::FromStr;

use crate::{AttackError, ImageBatch, Result};

const HAAR: [f32; 2] = [
    std::f32::consts::FRAC_1_SQRT_2,
    std::f32::consts::FRAC_1_SQRT_2,
];

const DB2: [f32; 4] = [
    0.482_962_9,
    0.836_516_3,
    0.224_143_87,
    -0.129_409_52,
];

/// Orthogonal wavelet families supported by the low-pass filter bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveletKind {
    Haar,
    Daubechies2,
}

impl WaveletKind {
    /// Analysis low-pass filter taps.
    pub fn lowpass(self) -> &'static [f32] {
        match self {
            WaveletKind::Haar => &HAAR,
            WaveletKind::Daubechies2 => &DB2,
        }
    }
}

impl FromStr for WaveletKind {
    type Err = AttackError;

    fn from_str(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "haar" | "db1" => Ok(WaveletKind::Haar),
            "db2" => Ok(WaveletKind::Daubechies2),
            other => Err(AttackError::Configuration(format!(
                "unknown wavelet kind '{other}'"
            ))),
        }
    }
}

impl fmt::Display for WaveletKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaveletKind::Haar => write!(f, "haar"),
            WaveletKind::Daubechies2 => write!(f, "db2"),
        }
    }
}

/// LL coefficients of a batch together with the spatial size they came from.
#[derive(Debug, Clone, PartialEq)]
pub struct SubbandDecomposition {
    pub low: ImageBatch,
    pub height: usize,
    pub width: usize,
}

/// Wavelet transform used by the frequency regulariser.
pub trait WaveletPrimitive {
    fn kind(&self) -> WaveletKind;

    fn decompose(&self, batch: &ImageBatch) -> Result<SubbandDecomposition>;

    fn reconstruct(&self, subbands: &SubbandDecomposition) -> Result<ImageBatch>;

    /// Full-resolution low-pass copy: `reconstruct(decompose(batch))`.
    fn low_pass(&self, batch: &ImageBatch) -> Result<ImageBatch> {
        self.reconstruct(&self.decompose(batch)?)
    }

    /// Adjoint of [`low_pass`](Self::low_pass). Decompose-then-reconstruct of
    /// an LL-only bank is `Rᵀ R`, which is self-adjoint.
    fn low_pass_adjoint(&self, grad: &ImageBatch) -> Result<ImageBatch> {
        self.low_pass(grad)
    }
}

/// Single-level orthogonal filter bank with periodic boundary extension.
#[derive(Debug, Clone, PartialEq)]
pub struct OrthogonalFilterBank {
    kind: WaveletKind,
}

impl OrthogonalFilterBank {
    pub fn new(kind: WaveletKind) -> Self {
        Self { kind }
    }

    pub fn named(name: &str) -> Result<Self> {
        Ok(Self::new(name.parse()?))
    }

    /// `(n/2) × n` analysis matrix: row `i` carries the taps starting at `2i`.
    fn analysis(&self, n: usize) -> Array2<f32> {
        let taps = self.kind.lowpass();
        let mut matrix = Array2::zeros((n / 2, n));
        for i in 0..n / 2 {
            for (k, &tap) in taps.iter().enumerate() {
                matrix[[i, (2 * i + k) % n]] += tap;
            }
        }
        matrix
    }
}

fn check_spatial(height: usize, width: usize) -> Result<()> {
    if height < 2 || width < 2 || height % 2 != 0 || width % 2 != 0 {
        return Err(AttackError::Shape(format!(
            "wavelet transform needs even spatial dims >= 2, got {height}x{width}"
        )));
    }
    Ok(())
}

impl WaveletPrimitive for OrthogonalFilterBank {
    fn kind(&self) -> WaveletKind {
        self.kind
    }

    fn decompose(&self, batch: &ImageBatch) -> Result<SubbandDecomposition> {
        let (b, c, height, width) = batch.dim();
        check_spatial(height, width)?;
        let rows = self.analysis(height);
        let cols = self.analysis(width);
        let mut low = ImageBatch::zeros((b, c, height / 2, width / 2));
        for n in 0..b {
            for ch in 0..c {
                let plane = batch.slice(s![n, ch, .., ..]);
                let ll = rows.dot(&plane).dot(&cols.t());
                low.slice_mut(s![n, ch, .., ..]).assign(&ll);
            }
        }
        Ok(SubbandDecomposition { low, height, width })
    }

    fn reconstruct(&self, subbands: &SubbandDecomposition) -> Result<ImageBatch> {
        let (height, width) = (subbands.height, subbands.width);
        check_spatial(height, width)?;
        let (b, c, lh, lw) = subbands.low.dim();
        if lh != height / 2 || lw != width / 2 {
            return Err(AttackError::Shape(format!(
                "LL subband {lh}x{lw} does not match a {height}x{width} image"
            )));
        }
        let rows = self.analysis(height);
        let cols = self.analysis(width);
        let mut out = ImageBatch::zeros((b, c, height, width));
        for n in 0..b {
            for ch in 0..c {
                let ll = subbands.low.slice(s![n, ch, .., ..]);
                let plane = rows.t().dot(&ll).dot(&cols);
                out.slice_mut(s![n, ch, .., ..]).assign(&plane);
            }
        }
        Ok(out)
    }
}

/// Penalty value and its gradient w.r.t. the candidate pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct FrequencyTerm {
    pub value: f32,
    pub gradient: ImageBatch,
}

/// Smooth-L1 (β = 1) distance between low-pass copies, summed over the batch.
pub struct FrequencyRegularizer<'a, W: ?Sized> {
    wavelet: &'a W,
    reference: ImageBatch,
}

impl<'a, W: WaveletPrimitive + ?Sized> FrequencyRegularizer<'a, W> {
    /// Caches the low-pass copy of the original batch.
    pub fn new(wavelet: &'a W, original: &ImageBatch) -> Result<Self> {
        let reference = wavelet.low_pass(original)?;
        Ok(Self { wavelet, reference })
    }

    pub fn reference(&self) -> &ImageBatch {
        &self.reference
    }

    pub fn evaluate(&self, candidate: &ImageBatch) -> Result<FrequencyTerm> {
        let low = self.wavelet.low_pass(candidate)?;
        if low.dim() != self.reference.dim() {
            return Err(AttackError::Shape(format!(
                "candidate low-pass {:?} vs reference {:?}",
                low.dim(),
                self.reference.dim()
            )));
        }
        let mut value = 0.0f64;
        let mut grad_low = low;
        for (g, &r) in grad_low.iter_mut().zip(self.reference.iter()) {
            let diff = *g - r;
            let (loss, slope) = if diff.abs() < 1.0 {
                (0.5 * diff * diff, diff)
            } else {
                (diff.abs() - 0.5, diff.signum())
            };
            value += loss as f64;
            *g = slope;
        }
        let gradient = self.wavelet.low_pass_adjoint(&grad_low)?;
        Ok(FrequencyTerm {
            value: value as f32,
            gradient,
        })
    }
}

/// Spatial energy of the LL subband per image, handy for inspecting how much
/// coarse structure a perturbation moved.
pub fn low_band_energy<W: WaveletPrimitive + ?Sized>(
    wavelet: &W,
    batch: &ImageBatch,
) -> Result<Vec<f32>> {
    let subbands = wavelet.decompose(batch)?;
    Ok(subbands
        .low
        .axis_iter(Axis(0))
        .map(|image| image.iter().map(|v| v * v).sum::<f32>())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array4;

    fn ramp() -> ImageBatch {
        Array4::from_shape_fn((2, 3, 4, 4), |(b, c, h, w)| {
            0.05 * (b + c) as f32 + 0.1 * h as f32 + 0.03 * (w * w) as f32
        })
    }

    #[test]
    fn haar_low_pass_is_block_average() {
        let bank = OrthogonalFilterBank::named("haar").unwrap();
        let x = ramp();
        let low = bank.low_pass(&x).unwrap();
        let block = (x[[0, 1, 2, 0]] + x[[0, 1, 2, 1]] + x[[0, 1, 3, 0]] + x[[0, 1, 3, 1]]) / 4.0;
        assert_abs_diff_eq!(low[[0, 1, 3, 1]], block, epsilon = 1e-6);
        assert_eq!(bank.decompose(&x).unwrap().low.dim(), (2, 3, 2, 2));
    }

    #[test]
    fn constants_survive_every_kind() {
        for kind in [WaveletKind::Haar, WaveletKind::Daubechies2] {
            let bank = OrthogonalFilterBank::new(kind);
            let x = Array4::from_elem((1, 1, 6, 4), 0.3f32);
            let low = bank.low_pass(&x).unwrap();
            for v in low.iter() {
                assert_abs_diff_eq!(*v, 0.3, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn low_pass_is_idempotent() {
        let bank = OrthogonalFilterBank::new(WaveletKind::Daubechies2);
        let once = bank.low_pass(&ramp()).unwrap();
        let twice = bank.low_pass(&once).unwrap();
        for (a, b) in once.iter().zip(twice.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-4);
        }
    }

    #[test]
    fn unknown_kinds_and_odd_sizes_fail() {
        assert!(matches!(
            "sym4".parse::<WaveletKind>(),
            Err(AttackError::Configuration(_))
        ));
        let bank = OrthogonalFilterBank::new(WaveletKind::Haar);
        let odd = Array4::zeros((1, 1, 3, 4));
        assert!(matches!(bank.decompose(&odd), Err(AttackError::Shape(_))));
    }

    #[test]
    fn penalty_gradient_matches_finite_difference() {
        let bank = OrthogonalFilterBank::new(WaveletKind::Haar);
        let original = ramp();
        let regularizer = FrequencyRegularizer::new(&bank, &original).unwrap();
        let mut candidate = original.clone();
        candidate[[1, 2, 0, 3]] += 0.4;
        candidate[[0, 0, 1, 1]] -= 2.5;

        let term = regularizer.evaluate(&candidate).unwrap();
        assert!(term.value > 0.0);
        let h = 1e-2f32;
        for idx in [[1, 2, 0, 3], [0, 0, 1, 1], [0, 0, 0, 0], [1, 1, 3, 3]] {
            let mut plus = candidate.clone();
            plus[idx] += h;
            let mut minus = candidate.clone();
            minus[idx] -= h;
            let numeric = (regularizer.evaluate(&plus).unwrap().value
                - regularizer.evaluate(&minus).unwrap().value)
                / (2.0 * h);
            assert_abs_diff_eq!(term.gradient[idx], numeric, epsilon = 1e-2);
        }
    }

    #[test]
    fn identical_batches_have_no_penalty() {
        let bank = OrthogonalFilterBank::new(WaveletKind::Haar);
        let x = ramp();
        let regularizer = FrequencyRegularizer::new(&bank, &x).unwrap();
        let term = regularizer.evaluate(&x).unwrap();
        assert_abs_diff_eq!(term.value, 0.0, epsilon = 1e-10);
    }

    #[test]
    fn haar_keeps_all_energy_of_flat_images() {
        let bank = OrthogonalFilterBank::new(WaveletKind::Haar);
        let mut x = Array4::from_elem((2, 3, 4, 4), 0.5f32);
        x.slice_mut(s![1, .., .., ..]).fill(0.25);
        let energy = low_band_energy(&bank, &x).unwrap();
        assert_eq!(energy.len(), 2);
        assert_abs_diff_eq!(energy[0], 3.0 * 16.0 * 0.25, epsilon = 1e-4);
        assert_abs_diff_eq!(energy[1], 3.0 * 16.0 * 0.0625, epsilon = 1e-4);
    }
}
