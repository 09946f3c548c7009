// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Robustness attacks against learned image-similarity models.
//!
//! The centrepiece is [`attack::Ssah`], a semantic-similarity attack that
//! searches a box-constrained perturbation of every image in a batch so that
//! its embedding drifts away from the embedding of its own original while
//! approaching the hardest negative of the batch. The embedding model stays
//! outside the crate behind [`oracle::EmbeddingOracle`].

pub mod attack;
pub mod center;
pub mod frequency;
pub mod loss;
pub mod normalize;
pub mod optim;
pub mod oracle;
pub mod reparam;
pub mod selector;
pub mod similarity;

use ndarray::{Array2, Array4};
use thiserror::Error;

pub use attack::{AttackConfig, AttackOutcome, DriverPhase, IterationRecord, Ssah};
pub use oracle::{EmbeddingOracle, FnOracle, IdentityOracle, LinearOracle};

/// Batch of images laid out as `[batch, channels, height, width]` with values
/// in `[0, 1]`.
pub type ImageBatch = Array4<f32>;

/// One embedding row per image of a batch.
pub type EmbeddingMatrix = Array2<f32>;

/// Errors surfaced by the attack. Every variant aborts the running
/// invocation; no partial adversarial batch is ever returned.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AttackError {
    /// Invalid hyper-parameters, unknown profile or wavelet names, batches that
    /// are too small, or pixels outside `[0, 1]`.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Raised when tensors disagree on batch, channel, spatial or feature
    /// dimensions.
    #[error("shape mismatch: {0}")]
    Shape(String),
    /// The embedding oracle failed to produce an embedding or gradient.
    #[error("embedding oracle failed: {0}")]
    Embedding(String),
    /// A non-finite value appeared in an embedding, loss or gradient.
    #[error("non-finite value in {label}: {value}")]
    Numerical { label: &'static str, value: f32 },
}

pub type Result<T> = std::result::Result<T, AttackError>;

pub(crate) fn ensure_finite<'a, I>(label: &'static str, values: I) -> Result<()>
where
    I: IntoIterator<Item = &'a f32>,
{
    match values.into_iter().find(|value| !value.is_finite()) {
        Some(&value) => Err(AttackError::Numerical { label, value }),
        None => Ok(()),
    }
}
