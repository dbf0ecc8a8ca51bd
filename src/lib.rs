//! meta-icl-rs: meta-optimization of in-context learners on burn

pub mod meta;

pub use meta::settings::{settings, Settings};

use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;

/// CPU backend used by the binary and the tests.
pub type CpuBackend = NdArray<f32>;
/// Autodiff CPU backend used for training.
pub type CpuAutodiffBackend = Autodiff<CpuBackend>;
