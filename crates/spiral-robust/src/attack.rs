// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Semantic similarity attack (SSAH).
//!
//! Every invocation walks `INIT → ITERATING → DONE`:
//!
//! * **INIT** embeds the original batch once, caches its low-frequency copy
//!   when the frequency term is on, maps the pixels into the unconstrained
//!   space and binds a fresh Adam state to them.
//! * **ITERATING** decodes the candidate, embeds it, scores it against the
//!   originals, mines (then reuses) the hard negatives, composes the loss and
//!   backpropagates it down to the unconstrained variable before one Adam step.
//! * **DONE** decodes the final candidate.
//!
//! The attacker itself is immutable; all mutable state lives in a per-call
//! [`OptimizationState`], so one attacker may serve several threads when its
//! oracle is `Sync`.

use ndarray::Ix4;
use serde::{Deserialize, Serialize};
use spiral_config::LayeredConfig;
use tracing::{debug, info, trace, warn};

use crate::frequency::{FrequencyRegularizer, OrthogonalFilterBank, WaveletKind};
use crate::loss::{LossBreakdown, LossComposer};
use crate::normalize::{Normalization, NormalizationProfile};
use crate::optim::{Adam, AdamSettings};
use crate::oracle::{EmbeddingOracle, OracleAdapter};
use crate::reparam::{image_jacobian, to_image, to_unconstrained};
use crate::selector::{HardNegativeSelector, PairSimilarities};
use crate::similarity::{normalize_rows, SimilarityMatrix};
use crate::{ensure_finite, AttackError, ImageBatch, Result};

/// Hyper-parameters of one attacker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttackConfig {
    pub num_iterations: usize,
    pub learning_rate: f32,
    pub margin: f32,
    pub alpha: f32,
    pub lambda_lf: f32,
    pub frequency_term_enabled: bool,
    /// `haar`, `db1` or `db2`.
    pub wavelet: String,
    /// Accepted for compatibility with untargeted/targeted run files. The
    /// objective is the same either way.
    pub targeted: bool,
    /// `cifar10`, `imagenet_val` or `identity`.
    pub normalization_profile: String,
    /// Stop before the optimizer step of the first iteration whose
    /// contrastive loss is exactly zero.
    pub stop_on_zero_loss: bool,
    pub adam: AdamSettings,
}

impl Default for AttackConfig {
    fn default() -> Self {
        Self {
            num_iterations: 100,
            learning_rate: 0.01,
            margin: 0.0,
            alpha: 1.0,
            lambda_lf: 1.0,
            frequency_term_enabled: false,
            wavelet: "haar".to_string(),
            targeted: false,
            normalization_profile: "cifar10".to_string(),
            stop_on_zero_loss: false,
            adam: AdamSettings::default(),
        }
    }
}

impl AttackConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(AttackError::Configuration(format!(
                "learning_rate must be > 0, got {}",
                self.learning_rate
            )));
        }
        LossComposer::new(
            self.margin,
            self.alpha,
            self.lambda_lf,
            self.frequency_term_enabled,
        )?;
        self.wavelet.parse::<WaveletKind>()?;
        self.normalization_profile.parse::<NormalizationProfile>()?;
        self.adam.validate()
    }

    /// Reads the `[attack]` section of a layered config, falling back to the
    /// defaults when the section is absent.
    pub fn from_layers(layers: &LayeredConfig) -> Result<Self> {
        let config = layers
            .section::<AttackConfig>(&["attack"])
            .map_err(|err| AttackError::Configuration(format!("invalid [attack] section: {err}")))?
            .unwrap_or_default();
        for event in layers.events() {
            debug!(layer = ?event.layer, key = %event.path, "attack config layer applied");
        }
        config.validate()?;
        Ok(config)
    }
}

/// Snapshot of one iteration, taken before the optimizer step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: usize,
    pub contrastive_loss: f32,
    pub frequency_loss: Option<f32>,
    pub total_loss: f32,
    pub positive_similarity: Vec<f32>,
    pub negative_similarity: Vec<f32>,
    pub hard_negatives: Vec<usize>,
}

impl IterationRecord {
    fn new(iteration: usize, pairs: &PairSimilarities, loss: &LossBreakdown) -> Self {
        Self {
            iteration,
            contrastive_loss: loss.contrastive,
            frequency_loss: loss.frequency,
            total_loss: loss.total,
            positive_similarity: pairs.positive.to_vec(),
            negative_similarity: pairs.negative.to_vec(),
            hard_negatives: pairs.columns.clone(),
        }
    }
}

/// Adversarial batch plus what the run observed on the way.
#[derive(Debug, Clone)]
pub struct AttackOutcome {
    pub adversarial: ImageBatch,
    /// `None` when no iteration ran.
    pub hard_negatives: Option<Vec<usize>>,
    pub history: Vec<IterationRecord>,
    pub stopped_early: bool,
    /// Every phase the driver entered, `Init` first and `Done` last.
    pub phases: Vec<DriverPhase>,
}

/// Where a single invocation currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverPhase {
    Init,
    Iterating { iteration: usize },
    Done,
}

impl DriverPhase {
    /// `Init → Iterating{0} → … → Iterating{n} → Done`; either of the first
    /// two may skip straight to `Done`.
    pub fn can_advance_to(self, next: DriverPhase) -> bool {
        match (self, next) {
            (DriverPhase::Init, DriverPhase::Iterating { iteration }) => iteration == 0,
            (DriverPhase::Iterating { iteration }, DriverPhase::Iterating { iteration: n }) => {
                n == iteration + 1
            }
            (DriverPhase::Init | DriverPhase::Iterating { .. }, DriverPhase::Done) => true,
            _ => false,
        }
    }
}

/// Mutable state owned by exactly one invocation.
#[derive(Debug)]
pub struct OptimizationState {
    modifier: ImageBatch,
    optimizer: Adam<Ix4>,
    selector: HardNegativeSelector,
    iteration: usize,
    phase: DriverPhase,
    phases: Vec<DriverPhase>,
    history: Vec<IterationRecord>,
}

impl OptimizationState {
    fn new(batch: &ImageBatch, config: &AttackConfig) -> Result<Self> {
        let modifier = to_unconstrained(batch)?;
        let optimizer = Adam::new(&modifier, config.learning_rate, config.adam)?;
        Ok(Self {
            modifier,
            optimizer,
            selector: HardNegativeSelector::new(),
            iteration: 0,
            phase: DriverPhase::Init,
            phases: vec![DriverPhase::Init],
            history: Vec::with_capacity(config.num_iterations),
        })
    }

    pub fn phase(&self) -> DriverPhase {
        self.phase
    }

    fn enter(&mut self, next: DriverPhase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "driver cannot move from {:?} to {next:?}",
            self.phase
        );
        trace!(from = ?self.phase, to = ?next, "driver phase");
        self.phase = next;
        self.phases.push(next);
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn selector(&self) -> &HardNegativeSelector {
        &self.selector
    }
}

enum StepOutcome {
    Stepped,
    ZeroLoss,
}

/// Box-constrained SSAH attacker bound to one embedding oracle.
#[derive(Debug)]
pub struct Ssah<O> {
    oracle: O,
    config: AttackConfig,
    normalization: Normalization,
    wavelet: OrthogonalFilterBank,
    composer: LossComposer,
}

impl<O: EmbeddingOracle> Ssah<O> {
    pub fn new(oracle: O, config: AttackConfig) -> Result<Self> {
        config.validate()?;
        let normalization = Normalization::named(&config.normalization_profile)?;
        let wavelet = OrthogonalFilterBank::named(&config.wavelet)?;
        let composer = LossComposer::new(
            config.margin,
            config.alpha,
            config.lambda_lf,
            config.frequency_term_enabled,
        )?;
        if config.targeted {
            debug!("targeted flag set; the objective is unchanged");
        }
        Ok(Self {
            oracle,
            config,
            normalization,
            wavelet,
            composer,
        })
    }

    /// Replaces the named profile, e.g. with [`NormalizationProfile::Custom`]
    /// statistics.
    pub fn with_normalization(mut self, normalization: Normalization) -> Self {
        self.normalization = normalization;
        self
    }

    pub fn config(&self) -> &AttackConfig {
        &self.config
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    pub fn normalization(&self) -> &Normalization {
        &self.normalization
    }

    /// Perturbs `batch` and returns the adversarial batch, same shape, values
    /// strictly inside (0, 1).
    pub fn attack(&self, batch: &ImageBatch) -> Result<ImageBatch> {
        Ok(self.attack_with_report(batch)?.adversarial)
    }

    pub fn attack_with_report(&self, batch: &ImageBatch) -> Result<AttackOutcome> {
        let (size, channels, height, width) = batch.dim();
        if size < 2 {
            return Err(AttackError::Configuration(format!(
                "batch needs at least 2 images to mine negatives, got {size}"
            )));
        }
        if channels == 0 || height == 0 || width == 0 {
            return Err(AttackError::Shape(format!(
                "empty image dims {channels}x{height}x{width}"
            )));
        }
        let span = tracing::info_span!("ssah", oracle = self.oracle.name(), batch = size);
        let _entered = span.enter();
        info!(
            iterations = self.config.num_iterations,
            learning_rate = self.config.learning_rate,
            margin = self.config.margin,
            alpha = self.config.alpha,
            lambda_lf = self.config.lambda_lf,
            frequency = self.config.frequency_term_enabled,
            wavelet = %self.config.wavelet,
            profile = %self.normalization.profile(),
            targeted = self.config.targeted,
            "ssah attack started"
        );

        let mut state = OptimizationState::new(batch, &self.config)?;
        let mut adapter = OracleAdapter::new(&self.oracle, &self.normalization, batch);
        let original_unit = normalize_rows(&adapter.embed_original(batch)?);
        let regularizer = if self.composer.frequency_enabled() {
            Some(FrequencyRegularizer::new(&self.wavelet, batch)?)
        } else {
            None
        };

        let mut stopped_early = false;
        while state.iteration < self.config.num_iterations {
            state.enter(DriverPhase::Iterating {
                iteration: state.iteration,
            });
            match self.step(&adapter, &original_unit, regularizer.as_ref(), &mut state)? {
                StepOutcome::Stepped => state.iteration += 1,
                StepOutcome::ZeroLoss => {
                    warn!(iteration = state.iteration, "contrastive loss reached zero, stopping");
                    stopped_early = true;
                    break;
                }
            }
        }
        state.enter(DriverPhase::Done);

        let adversarial = to_image(&state.modifier);
        if let Some(last) = state.history.last() {
            info!(
                iterations = state.history.len(),
                contrastive = last.contrastive_loss,
                total = last.total_loss,
                "ssah attack finished"
            );
        } else {
            info!("ssah attack finished without iterating");
        }
        Ok(AttackOutcome {
            adversarial,
            hard_negatives: state.selector.hard_negatives().map(<[usize]>::to_vec),
            history: state.history,
            stopped_early,
            phases: state.phases,
        })
    }

    fn step(
        &self,
        adapter: &OracleAdapter<'_, O>,
        original_unit: &ndarray::Array2<f32>,
        regularizer: Option<&FrequencyRegularizer<'_, OrthogonalFilterBank>>,
        state: &mut OptimizationState,
    ) -> Result<StepOutcome> {
        let images = to_image(&state.modifier);
        let candidate = adapter.embed_candidate(&images)?;
        let similarity = SimilarityMatrix::compute(candidate.embedding(), original_unit)?;
        let pairs = state.selector.select(&similarity)?;
        let frequency = regularizer.map(|reg| reg.evaluate(&images)).transpose()?;
        let loss = self.composer.compose(&pairs, frequency.as_ref())?;

        let record = IterationRecord::new(state.iteration, &pairs, &loss);
        debug!(
            iteration = record.iteration,
            contrastive = record.contrastive_loss,
            frequency = ?record.frequency_loss,
            total = record.total_loss,
            "ssah iteration"
        );
        state.history.push(record);
        if self.config.stop_on_zero_loss && loss.contrastive == 0.0 {
            return Ok(StepOutcome::ZeroLoss);
        }

        let grad_similarity = pairs.scatter(&loss.grad_positive, &loss.grad_negative);
        let grad_embedding = similarity.backward(&grad_similarity)?;
        let mut grad_images = adapter.backward(&candidate, &grad_embedding)?;
        if let Some(term) = &frequency {
            grad_images.scaled_add(self.composer.frequency_scale(), &term.gradient);
        }
        let grad_modifier = grad_images * image_jacobian(&state.modifier);
        ensure_finite("modifier_gradient", grad_modifier.iter())?;
        state.optimizer.step(&mut state.modifier, &grad_modifier)?;
        Ok(StepOutcome::Stepped)
    }
}
