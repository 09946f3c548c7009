//! Shared runtime configuration for SpiralTorch robustness tooling:
//! reproducible seeding, tracing setup and layered config files.

pub mod determinism;
pub mod layered;
pub mod tracing;

pub use determinism::{rng_from_label, rng_from_optional, DeterminismConfig};
pub use layered::{ConfigLayer, ConfigLayering, LayeredConfig, LayeredConfigError};
