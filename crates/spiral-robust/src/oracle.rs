// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Embedding oracles and the adapter that feeds them normalised batches.

use ndarray::{Array2, Axis};
use rand::Rng;

use crate::normalize::Normalization;
use crate::{ensure_finite, AttackError, EmbeddingMatrix, ImageBatch, Result};

/// Differentiable embedding model consumed by the attacks.
///
/// Implementations receive batches that were already normalised. The
/// gradient contract is a vector-Jacobian product: given `∂L/∂embedding`
/// for the rows returned by [`evaluate`](Self::evaluate), return `∂L/∂batch`.
pub trait EmbeddingOracle {
    /// Label used in logs.
    fn name(&self) -> &str {
        "oracle"
    }

    /// Embeds every image of the batch, one row per image.
    fn evaluate(&self, batch: &ImageBatch) -> Result<EmbeddingMatrix>;

    /// Backpropagates `grad_embedding` through the model evaluated at `batch`.
    fn backpropagate(
        &self,
        batch: &ImageBatch,
        grad_embedding: &EmbeddingMatrix,
    ) -> Result<ImageBatch>;
}

impl<T: EmbeddingOracle + ?Sized> EmbeddingOracle for &T {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn evaluate(&self, batch: &ImageBatch) -> Result<EmbeddingMatrix> {
        (**self).evaluate(batch)
    }

    fn backpropagate(
        &self,
        batch: &ImageBatch,
        grad_embedding: &EmbeddingMatrix,
    ) -> Result<ImageBatch> {
        (**self).backpropagate(batch, grad_embedding)
    }
}

impl<T: EmbeddingOracle + ?Sized> EmbeddingOracle for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn evaluate(&self, batch: &ImageBatch) -> Result<EmbeddingMatrix> {
        (**self).evaluate(batch)
    }

    fn backpropagate(
        &self,
        batch: &ImageBatch,
        grad_embedding: &EmbeddingMatrix,
    ) -> Result<ImageBatch> {
        (**self).backpropagate(batch, grad_embedding)
    }
}

fn flatten(batch: &ImageBatch) -> Result<Array2<f32>> {
    let rows = batch.len_of(Axis(0));
    let cols = batch.len() / rows.max(1);
    batch
        .as_standard_layout()
        .into_owned()
        .into_shape((rows, cols))
        .map_err(|err| AttackError::Shape(format!("cannot flatten batch: {err}")))
}

fn unflatten(grad: Array2<f32>, like: &ImageBatch) -> Result<ImageBatch> {
    if grad.len() != like.len() {
        return Err(AttackError::Shape(format!(
            "gradient has {} elements, batch has {}",
            grad.len(),
            like.len()
        )));
    }
    grad.as_standard_layout()
        .into_owned()
        .into_shape(like.raw_dim())
        .map_err(|err| AttackError::Shape(format!("cannot reshape gradient: {err}")))
}

/// Uses the flattened pixels as the embedding.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityOracle;

impl EmbeddingOracle for IdentityOracle {
    fn name(&self) -> &str {
        "identity"
    }

    fn evaluate(&self, batch: &ImageBatch) -> Result<EmbeddingMatrix> {
        flatten(batch)
    }

    fn backpropagate(
        &self,
        batch: &ImageBatch,
        grad_embedding: &EmbeddingMatrix,
    ) -> Result<ImageBatch> {
        unflatten(grad_embedding.to_owned(), batch)
    }
}

/// Dense projection `embedding = flatten(batch) · Wᵀ`.
#[derive(Debug, Clone)]
pub struct LinearOracle {
    weights: Array2<f32>,
}

impl LinearOracle {
    /// Wraps a `[features, pixels]` weight matrix.
    pub fn new(weights: Array2<f32>) -> Result<Self> {
        if weights.is_empty() {
            return Err(AttackError::Configuration(
                "linear oracle needs a non-empty weight matrix".to_string(),
            ));
        }
        ensure_finite("linear_oracle_weights", weights.iter())?;
        Ok(Self { weights })
    }

    /// Uniform `±1/√pixels` initialisation drawn from the labelled generator.
    pub fn random(pixels: usize, features: usize, seed: Option<u64>) -> Result<Self> {
        if pixels == 0 || features == 0 {
            return Err(AttackError::Configuration(format!(
                "linear oracle dims must be > 0, got {features}x{pixels}"
            )));
        }
        let mut rng = spiral_config::rng_from_optional(seed, "robust.oracle.linear");
        let bound = 1.0 / (pixels as f32).sqrt();
        let weights = Array2::from_shape_fn((features, pixels), |_| rng.gen_range(-bound..bound));
        Self::new(weights)
    }

    pub fn weights(&self) -> &Array2<f32> {
        &self.weights
    }

    fn check_pixels(&self, batch: &ImageBatch) -> Result<()> {
        let pixels = batch.len() / batch.len_of(Axis(0)).max(1);
        if pixels != self.weights.ncols() {
            return Err(AttackError::Shape(format!(
                "linear oracle expects {} pixels per image, got {pixels}",
                self.weights.ncols()
            )));
        }
        Ok(())
    }
}

impl EmbeddingOracle for LinearOracle {
    fn name(&self) -> &str {
        "linear"
    }

    fn evaluate(&self, batch: &ImageBatch) -> Result<EmbeddingMatrix> {
        self.check_pixels(batch)?;
        Ok(flatten(batch)?.dot(&self.weights.t()))
    }

    fn backpropagate(
        &self,
        batch: &ImageBatch,
        grad_embedding: &EmbeddingMatrix,
    ) -> Result<ImageBatch> {
        self.check_pixels(batch)?;
        if grad_embedding.ncols() != self.weights.nrows() {
            return Err(AttackError::Shape(format!(
                "embedding gradient has {} columns, oracle emits {}",
                grad_embedding.ncols(),
                self.weights.nrows()
            )));
        }
        unflatten(grad_embedding.dot(&self.weights), batch)
    }
}

/// Oracle assembled from caller closures, for models living outside Rust
/// tensors (FFI runtimes, remote accelerators, hand-written test doubles).
pub struct FnOracle<E, B> {
    name: String,
    evaluate: E,
    backpropagate: B,
}

impl<E, B> FnOracle<E, B>
where
    E: Fn(&ImageBatch) -> Result<EmbeddingMatrix>,
    B: Fn(&ImageBatch, &EmbeddingMatrix) -> Result<ImageBatch>,
{
    pub fn new(name: impl Into<String>, evaluate: E, backpropagate: B) -> Self {
        Self {
            name: name.into(),
            evaluate,
            backpropagate,
        }
    }
}

impl<E, B> core::fmt::Debug for FnOracle<E, B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FnOracle").field("name", &self.name).finish()
    }
}

impl<E, B> EmbeddingOracle for FnOracle<E, B>
where
    E: Fn(&ImageBatch) -> Result<EmbeddingMatrix>,
    B: Fn(&ImageBatch, &EmbeddingMatrix) -> Result<ImageBatch>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, batch: &ImageBatch) -> Result<EmbeddingMatrix> {
        (self.evaluate)(batch)
    }

    fn backpropagate(
        &self,
        batch: &ImageBatch,
        grad_embedding: &EmbeddingMatrix,
    ) -> Result<ImageBatch> {
        (self.backpropagate)(batch, grad_embedding)
    }
}

/// Candidate embedding kept alive for the backward pass.
#[derive(Debug, Clone)]
pub struct CandidateEmbedding {
    normalized: ImageBatch,
    embedding: EmbeddingMatrix,
}

impl CandidateEmbedding {
    pub fn embedding(&self) -> &EmbeddingMatrix {
        &self.embedding
    }
}

/// Runs `normalize → embed` for one invocation and validates every answer
/// against the batch the invocation started with.
pub struct OracleAdapter<'a, O: ?Sized> {
    oracle: &'a O,
    normalization: &'a Normalization,
    batch_shape: [usize; 4],
    width: Option<usize>,
}

impl<'a, O: EmbeddingOracle + ?Sized> OracleAdapter<'a, O> {
    pub fn new(oracle: &'a O, normalization: &'a Normalization, batch: &ImageBatch) -> Self {
        let dim = batch.dim();
        Self {
            oracle,
            normalization,
            batch_shape: [dim.0, dim.1, dim.2, dim.3],
            width: None,
        }
    }

    /// Embedding width fixed by the first oracle answer.
    pub fn width(&self) -> Option<usize> {
        self.width
    }

    fn check_batch(&self, batch: &ImageBatch) -> Result<()> {
        let dim = batch.dim();
        let shape = [dim.0, dim.1, dim.2, dim.3];
        if shape != self.batch_shape {
            return Err(AttackError::Shape(format!(
                "batch shape changed from {:?} to {shape:?}",
                self.batch_shape
            )));
        }
        Ok(())
    }

    /// Anything the oracle raises, in either direction, is an embedding
    /// failure tagged with the oracle's name.
    fn oracle_failure(&self, err: AttackError) -> AttackError {
        match err {
            AttackError::Embedding(_) => err,
            other => AttackError::Embedding(format!("{}: {other}", self.oracle.name())),
        }
    }

    fn embed(&self, normalized: &ImageBatch) -> Result<EmbeddingMatrix> {
        let embedding = self
            .oracle
            .evaluate(normalized)
            .map_err(|err| self.oracle_failure(err))?;
        let (rows, cols) = embedding.dim();
        if rows != self.batch_shape[0] {
            return Err(AttackError::Shape(format!(
                "oracle '{}' returned {rows} rows for a batch of {}",
                self.oracle.name(),
                self.batch_shape[0]
            )));
        }
        if cols == 0 {
            return Err(AttackError::Shape(format!(
                "oracle '{}' returned empty embeddings",
                self.oracle.name()
            )));
        }
        if let Some(width) = self.width {
            if cols != width {
                return Err(AttackError::Shape(format!(
                    "oracle '{}' embedding width changed from {width} to {cols}",
                    self.oracle.name()
                )));
            }
        }
        ensure_finite("embedding", embedding.iter())?;
        Ok(embedding)
    }

    /// Embeds the untouched batch once. Nothing is retained for gradients.
    pub fn embed_original(&mut self, batch: &ImageBatch) -> Result<EmbeddingMatrix> {
        self.check_batch(batch)?;
        let normalized = self.normalization.apply(batch)?;
        let embedding = self.embed(&normalized)?;
        self.width = Some(embedding.ncols());
        Ok(embedding)
    }

    /// Embeds a candidate batch and keeps what the backward pass needs.
    pub fn embed_candidate(&self, batch: &ImageBatch) -> Result<CandidateEmbedding> {
        self.check_batch(batch)?;
        let normalized = self.normalization.apply(batch)?;
        let embedding = self.embed(&normalized)?;
        Ok(CandidateEmbedding {
            normalized,
            embedding,
        })
    }

    /// Maps `∂L/∂embedding` to `∂L/∂pixels` for a candidate.
    pub fn backward(
        &self,
        candidate: &CandidateEmbedding,
        grad_embedding: &EmbeddingMatrix,
    ) -> Result<ImageBatch> {
        if grad_embedding.dim() != candidate.embedding.dim() {
            return Err(AttackError::Shape(format!(
                "embedding gradient {:?} does not match embedding {:?}",
                grad_embedding.dim(),
                candidate.embedding.dim()
            )));
        }
        let grad_normalized = self
            .oracle
            .backpropagate(&candidate.normalized, grad_embedding)
            .map_err(|err| self.oracle_failure(err))?;
        if grad_normalized.dim() != candidate.normalized.dim() {
            return Err(AttackError::Shape(format!(
                "oracle '{}' returned a gradient of shape {:?} for a batch of shape {:?}",
                self.oracle.name(),
                grad_normalized.dim(),
                candidate.normalized.dim()
            )));
        }
        ensure_finite("oracle_gradient", grad_normalized.iter())?;
        self.normalization.backward(&grad_normalized)
    }
}
