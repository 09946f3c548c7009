// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Running center of embedding statistics, shared across workers.

mod rendezvous;

use ndarray::{Array1, Array2, Axis};
use thiserror::Error;

pub use rendezvous::RendezvousReduce;

/// Errors produced while aggregating a center update.
#[derive(Debug, Error, PartialEq, Clone)]
pub enum ReduceError {
    #[error("world size must be positive, got {0}")]
    EmptyWorldSize(usize),
    #[error("rank {rank} is out of bounds for world size {world_size}")]
    RankOutOfBounds { rank: usize, world_size: usize },
    #[error("reduce group expects world size {expected}, got {got}")]
    WorldSizeMismatch { expected: usize, got: usize },
    #[error("rank {rank} already joined the reduce group")]
    DuplicateRank { rank: usize },
    #[error("rank {rank} has not joined the reduce group")]
    UnknownRank { rank: usize },
    #[error("buffer length mismatch: expected {expected}, got {got}")]
    BufferLengthMismatch { expected: usize, got: usize },
    #[error("reduce group state was poisoned by a panicking worker")]
    Poisoned,
    #[error("momentum must be in [0, 1], got {0}")]
    InvalidMomentum(f32),
    #[error("statistic has {got} columns, center has {expected}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("no rows were contributed by any worker")]
    EmptyBatch,
}

/// Sums a buffer across every worker that contributes to a center.
pub trait CenterReduce {
    fn world_size(&self) -> usize {
        1
    }

    /// Replaces `buffer` with the element-wise sum over all workers.
    fn all_reduce_sum(&self, buffer: &mut [f32]) -> Result<(), ReduceError>;
}

/// Single worker; the local sum already is the global one.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalReduce;

impl CenterReduce for LocalReduce {
    fn all_reduce_sum(&self, _buffer: &mut [f32]) -> Result<(), ReduceError> {
        Ok(())
    }
}

impl<T: CenterReduce + ?Sized> CenterReduce for &T {
    fn world_size(&self) -> usize {
        (**self).world_size()
    }

    fn all_reduce_sum(&self, buffer: &mut [f32]) -> Result<(), ReduceError> {
        (**self).all_reduce_sum(buffer)
    }
}

/// Exponential moving average of the mean embedding row:
/// `center = center·momentum + batch_center·(1 − momentum)`.
///
/// `batch_center` is the global mean over the rows of every worker. Row counts
/// travel alongside the sums, so workers may contribute batches of different
/// sizes.
#[derive(Debug, Clone)]
pub struct RunningCenter<R> {
    center: Array1<f32>,
    momentum: f32,
    reduce: R,
    updates: u64,
}

impl<R: CenterReduce> RunningCenter<R> {
    /// Zero center of width `dim`.
    pub fn new(dim: usize, momentum: f32, reduce: R) -> Result<Self, ReduceError> {
        if !(momentum.is_finite() && (0.0..=1.0).contains(&momentum)) {
            return Err(ReduceError::InvalidMomentum(momentum));
        }
        Ok(Self {
            center: Array1::zeros(dim),
            momentum,
            reduce,
            updates: 0,
        })
    }

    pub fn center(&self) -> &Array1<f32> {
        &self.center
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    pub fn reduce(&self) -> &R {
        &self.reduce
    }

    /// Folds this worker's `[rows, dim]` statistic into the center. Every
    /// worker of the group must call this the same number of times.
    pub fn update(&mut self, batch_statistic: &Array2<f32>) -> Result<&Array1<f32>, ReduceError> {
        let dim = self.center.len();
        if batch_statistic.ncols() != dim {
            return Err(ReduceError::DimensionMismatch {
                expected: dim,
                got: batch_statistic.ncols(),
            });
        }
        let mut buffer = batch_statistic.sum_axis(Axis(0)).to_vec();
        buffer.push(batch_statistic.nrows() as f32);
        self.reduce.all_reduce_sum(&mut buffer)?;

        let rows = buffer[dim];
        if rows <= 0.0 {
            return Err(ReduceError::EmptyBatch);
        }
        let keep = self.momentum;
        let blend = 1.0 - keep;
        for (c, sum) in self.center.iter_mut().zip(&buffer[..dim]) {
            *c = *c * keep + (sum / rows) * blend;
        }
        self.updates += 1;
        tracing::trace!(
            updates = self.updates,
            rows,
            world = self.reduce.world_size(),
            "center updated"
        );
        Ok(&self.center)
    }
}
