//! Meta-optimizer configuration.

use std::fmt;
use std::str::FromStr;

use burn::config::Config;
use serde::{Deserialize, Serialize};

use super::error::{MetaError, Result as MetaResult};
use super::windowing::ContextConvention;

/// Which branch of the dual forward pass is optimized.
///
/// Both branch losses are always computed and logged; only the active one
/// contributes gradients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MetaObjective {
    /// Reconstruct points the context has already seen.
    Train,
    /// Forecast the first point the context has not seen.
    Prequential,
}

impl MetaObjective {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetaObjective::Train => "train",
            MetaObjective::Prequential => "prequential",
        }
    }
}

impl FromStr for MetaObjective {
    type Err = MetaError;

    fn from_str(s: &str) -> MetaResult<Self> {
        match s {
            "train" => Ok(MetaObjective::Train),
            "prequential" => Ok(MetaObjective::Prequential),
            other => Err(MetaError::InvalidObjective(other.to_string())),
        }
    }
}

impl TryFrom<String> for MetaObjective {
    type Error = MetaError;

    fn try_from(value: String) -> MetaResult<Self> {
        value.parse()
    }
}

impl From<MetaObjective> for String {
    fn from(value: MetaObjective) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for MetaObjective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// End-of-training diagnostics knobs.
#[derive(Config, Debug)]
pub struct DiagnosticsConfig {
    /// Number of probe tasks for the model-vs-ground-truth probe
    #[config(default = 4)]
    pub n_probe_tasks: usize,
    /// Context sizes at which the probe evaluates the predictor
    #[config(default = "vec![1, 4, 10, 50]")]
    pub probe_n_context_points: Vec<usize>,
    /// Number of query points on the dense probe grid
    #[config(default = 100)]
    pub probe_resolution: usize,
    /// Estimate the effective dimensionality of the aggregated context
    #[config(default = false)]
    pub log_eff_zdim: bool,
    /// Batch size used when replaying the task populations
    #[config(default = 32)]
    pub batch_size: usize,
}

/// Configuration of a [`MetaOptimizer`](super::optimizer::MetaOptimizer).
#[derive(Config, Debug)]
pub struct MetaOptimizerConfig {
    /// Active meta-objective
    pub meta_objective: MetaObjective,
    /// Windowing convention matching the aggregator's output layout
    #[config(default = "ContextConvention::Standard")]
    pub convention: ContextConvention,
    /// Smallest context length eligible to produce a training signal
    #[config(default = 1)]
    pub min_train_samples: usize,
    /// Adam learning rate
    #[config(default = 1e-4)]
    pub lr: f64,
    /// Seed of the generator used for train-query draws and subsampling
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = "DiagnosticsConfig::new()")]
    pub diagnostics: DiagnosticsConfig,
}

impl MetaOptimizerConfig {
    /// Rejects values no meta-optimizer can run with.
    pub fn validate(&self) -> MetaResult<()> {
        if self.min_train_samples < 1 {
            return Err(MetaError::InvalidConfig(format!(
                "min_train_samples must be >= 1, got {}",
                self.min_train_samples
            )));
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(MetaError::InvalidConfig(format!("lr must be > 0, got {}", self.lr)));
        }
        if self.diagnostics.batch_size == 0 {
            return Err(MetaError::InvalidConfig(
                "diagnostics.batch_size must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_objective_parsing() {
        assert_eq!("train".parse::<MetaObjective>().unwrap(), MetaObjective::Train);
        assert_eq!(
            "prequential".parse::<MetaObjective>().unwrap(),
            MetaObjective::Prequential
        );
        let err = "foo".parse::<MetaObjective>().unwrap_err();
        assert!(matches!(err, MetaError::InvalidObjective(ref s) if s == "foo"));
    }

    #[test]
    fn test_objective_json_roundtrip_and_rejection() {
        let json = serde_json::to_string(&MetaObjective::Prequential).unwrap();
        assert_eq!(json, "\"prequential\"");
        assert!(serde_json::from_str::<MetaObjective>("\"foo\"").is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config = MetaOptimizerConfig::new(MetaObjective::Train);
        assert_eq!(config.min_train_samples, 1);
        assert_eq!(config.convention, ContextConvention::Standard);
        assert_eq!(config.diagnostics.probe_n_context_points, vec![1, 4, 10, 50]);
        assert_eq!(config.diagnostics.probe_resolution, 100);
        assert!(!config.diagnostics.log_eff_zdim);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let config = MetaOptimizerConfig::new(MetaObjective::Train).with_min_train_samples(0);
        assert!(matches!(config.validate(), Err(MetaError::InvalidConfig(_))));

        let config = MetaOptimizerConfig::new(MetaObjective::Train).with_lr(0.0);
        assert!(matches!(config.validate(), Err(MetaError::InvalidConfig(_))));
    }
}
