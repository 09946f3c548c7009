// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Two-phase hard-negative mining.
//!
//! The first call sorts every similarity row in descending order and keeps
//! the column that lands last (the least similar original). From then on the
//! selector is frozen: later calls only gather the current similarity at that
//! column. The diagonal stays in the candidate pool.

use ndarray::{Array1, Array2};
use std::cmp::Ordering;

use crate::similarity::SimilarityMatrix;
use crate::{AttackError, Result};

/// Where the selector is in its protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionPhase {
    /// No similarity row has been ranked yet (iteration 0).
    Discovery,
    /// Columns were ranked once and the hard negatives are fixed.
    Frozen {
        /// Full descending permutation of every row, as ranked in discovery.
        ranking: Array2<usize>,
        /// Column that occupied the last ranked position of each row.
        hard_negatives: Vec<usize>,
    },
}

/// Positive and selected negative similarity of every sample.
#[derive(Debug, Clone, PartialEq)]
pub struct PairSimilarities {
    pub positive: Array1<f32>,
    pub negative: Array1<f32>,
    /// Column each negative was gathered from.
    pub columns: Vec<usize>,
}

impl PairSimilarities {
    pub fn batch(&self) -> usize {
        self.positive.len()
    }

    /// The `[positive, negative]` pair of every sample as a `B × 2` matrix.
    pub fn as_pairs(&self) -> Array2<f32> {
        let mut pairs = Array2::zeros((self.batch(), 2));
        for (i, (p, n)) in self.positive.iter().zip(self.negative.iter()).enumerate() {
            pairs[[i, 0]] = *p;
            pairs[[i, 1]] = *n;
        }
        pairs
    }

    /// Scatters per-sample gradients back onto a `B × B` similarity gradient.
    pub fn scatter(&self, grad_positive: &Array1<f32>, grad_negative: &Array1<f32>) -> Array2<f32> {
        let batch = self.batch();
        let mut grad = Array2::zeros((batch, batch));
        for i in 0..batch {
            grad[[i, i]] += grad_positive[i];
            grad[[i, self.columns[i]]] += grad_negative[i];
        }
        grad
    }
}

/// Stateful hard-negative selector owned by one attack invocation.
#[derive(Debug, Clone)]
pub struct HardNegativeSelector {
    phase: SelectionPhase,
}

impl Default for HardNegativeSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl HardNegativeSelector {
    pub fn new() -> Self {
        Self {
            phase: SelectionPhase::Discovery,
        }
    }

    pub fn phase(&self) -> &SelectionPhase {
        &self.phase
    }

    pub fn is_frozen(&self) -> bool {
        matches!(self.phase, SelectionPhase::Frozen { .. })
    }

    /// Frozen hard-negative columns, once discovery has run.
    pub fn hard_negatives(&self) -> Option<&[usize]> {
        match &self.phase {
            SelectionPhase::Discovery => None,
            SelectionPhase::Frozen { hard_negatives, .. } => Some(hard_negatives),
        }
    }

    /// Descending column ranking captured during discovery.
    pub fn ranking(&self) -> Option<&Array2<usize>> {
        match &self.phase {
            SelectionPhase::Discovery => None,
            SelectionPhase::Frozen { ranking, .. } => Some(ranking),
        }
    }

    /// Runs the step matching the current phase.
    pub fn select(&mut self, similarity: &SimilarityMatrix) -> Result<PairSimilarities> {
        if self.is_frozen() {
            self.gather(similarity)
        } else {
            self.discover(similarity)
        }
    }

    fn discover(&mut self, similarity: &SimilarityMatrix) -> Result<PairSimilarities> {
        let batch = check_square(similarity)?;
        let values = similarity.values();
        if let Some(&value) = values.iter().find(|v| v.is_nan()) {
            return Err(AttackError::Numerical {
                label: "similarity",
                value,
            });
        }

        let mut ranking = Array2::zeros((batch, batch));
        let mut hard_negatives = Vec::with_capacity(batch);
        let mut negative = Array1::zeros(batch);
        for i in 0..batch {
            let row = similarity.row(i);
            let mut order: Vec<usize> = (0..batch).collect();
            // Stable sort: tied columns keep ascending index order.
            order.sort_by(|&a, &b| row[b].partial_cmp(&row[a]).unwrap_or(Ordering::Equal));
            for (rank, &column) in order.iter().enumerate() {
                ranking[[i, rank]] = column;
            }
            let last = order[batch - 1];
            hard_negatives.push(last);
            negative[i] = row[last];
        }

        let pairs = PairSimilarities {
            positive: similarity.positive(),
            negative,
            columns: hard_negatives.clone(),
        };
        self.phase = SelectionPhase::Frozen {
            ranking,
            hard_negatives,
        };
        Ok(pairs)
    }

    fn gather(&self, similarity: &SimilarityMatrix) -> Result<PairSimilarities> {
        let batch = check_square(similarity)?;
        let hard_negatives = match &self.phase {
            SelectionPhase::Frozen { hard_negatives, .. } => hard_negatives,
            SelectionPhase::Discovery => {
                return Err(AttackError::Configuration(
                    "hard negatives gathered before discovery".to_string(),
                ))
            }
        };
        if hard_negatives.len() != batch {
            return Err(AttackError::Shape(format!(
                "hard negatives were mined for {} samples, similarity has {batch}",
                hard_negatives.len()
            )));
        }
        let values = similarity.values();
        let negative = Array1::from_iter(
            hard_negatives
                .iter()
                .enumerate()
                .map(|(i, &column)| values[[i, column]]),
        );
        Ok(PairSimilarities {
            positive: similarity.positive(),
            negative,
            columns: hard_negatives.clone(),
        })
    }
}

fn check_square(similarity: &SimilarityMatrix) -> Result<usize> {
    let (rows, cols) = similarity.values().dim();
    if rows != cols || rows == 0 {
        return Err(AttackError::Shape(format!(
            "similarity matrix must be square and non-empty, got {rows}x{cols}"
        )));
    }
    Ok(rows)
}
