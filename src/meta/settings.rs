//! Process-level settings for meta-optimization runs.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;

use super::config::{DiagnosticsConfig, MetaObjective, MetaOptimizerConfig};
use super::error::Result;
use super::windowing::ContextConvention;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerSettings {
    /// "train" or "prequential"; parsed by [`Settings::optimizer_config`].
    pub meta_objective: String,
    pub convention: ContextConvention,
    pub min_train_samples: usize,
    pub lr: f64,
    pub seed: u64,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            meta_objective: "train".to_string(),
            convention: ContextConvention::Standard,
            min_train_samples: 1,
            lr: 1e-4,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsSettings {
    pub n_probe_tasks: usize,
    pub probe_n_context_points: Vec<usize>,
    pub probe_resolution: usize,
    pub log_eff_zdim: bool,
    pub batch_size: usize,
}

impl Default for DiagnosticsSettings {
    fn default() -> Self {
        Self {
            n_probe_tasks: 4,
            probe_n_context_points: vec![1, 4, 10, 50],
            probe_resolution: 100,
            log_eff_zdim: false,
            batch_size: 32,
        }
    }
}

/// Settings of the demo training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSettings {
    pub epochs: usize,
    pub train_tasks: usize,
    pub val_tasks: usize,
    /// Samples per task sequence
    pub n_samples: usize,
    pub batch_size: usize,
    pub z_dim: usize,
    pub hidden_dim: usize,
    pub noise_std: f64,
    /// Where the JSON-lines metric log is written.
    pub metrics_path: PathBuf,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            epochs: 20,
            train_tasks: 256,
            val_tasks: 64,
            n_samples: 64,
            batch_size: 32,
            z_dim: 32,
            hidden_dim: 64,
            noise_std: 0.1,
            metrics_path: PathBuf::from("metrics.jsonl"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    pub optimizer: OptimizerSettings,
    pub diagnostics: DiagnosticsSettings,
    pub run: RunSettings,
}

impl Settings {
    /// Loads defaults, then an optional `meta_icl.toml`, then environment
    /// variables such as `METAICL_OPTIMIZER__LR=0.001`.
    pub fn new() -> std::result::Result<Self, ConfigError> {
        Self::from_environment(Self::environment())
    }

    fn environment() -> Environment {
        Environment::with_prefix("METAICL")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("diagnostics.probe_n_context_points")
    }

    fn from_environment(environment: Environment) -> std::result::Result<Self, ConfigError> {
        let defaults = Settings::default();
        let settings = Config::builder()
            .set_default("optimizer.meta_objective", defaults.optimizer.meta_objective)?
            .set_default("optimizer.convention", "standard")?
            .set_default("optimizer.min_train_samples", defaults.optimizer.min_train_samples as u64)?
            .set_default("optimizer.lr", defaults.optimizer.lr)?
            .set_default("optimizer.seed", defaults.optimizer.seed)?
            .set_default("diagnostics.n_probe_tasks", defaults.diagnostics.n_probe_tasks as u64)?
            .set_default(
                "diagnostics.probe_n_context_points",
                defaults
                    .diagnostics
                    .probe_n_context_points
                    .iter()
                    .map(|&n| n as u64)
                    .collect::<Vec<_>>(),
            )?
            .set_default("diagnostics.probe_resolution", defaults.diagnostics.probe_resolution as u64)?
            .set_default("diagnostics.log_eff_zdim", defaults.diagnostics.log_eff_zdim)?
            .set_default("diagnostics.batch_size", defaults.diagnostics.batch_size as u64)?
            .set_default("run.epochs", defaults.run.epochs as u64)?
            .set_default("run.train_tasks", defaults.run.train_tasks as u64)?
            .set_default("run.val_tasks", defaults.run.val_tasks as u64)?
            .set_default("run.n_samples", defaults.run.n_samples as u64)?
            .set_default("run.batch_size", defaults.run.batch_size as u64)?
            .set_default("run.z_dim", defaults.run.z_dim as u64)?
            .set_default("run.hidden_dim", defaults.run.hidden_dim as u64)?
            .set_default("run.noise_std", defaults.run.noise_std)?
            .set_default("run.metrics_path", "metrics.jsonl")?
            .add_source(File::with_name("meta_icl").required(false))
            .add_source(environment)
            .build()?;

        settings.try_deserialize()
    }

    /// Meta-optimizer configuration described by these settings.
    ///
    /// Fails on an unknown objective or on values no optimizer can run with.
    pub fn optimizer_config(&self) -> Result<MetaOptimizerConfig> {
        let objective: MetaObjective = self.optimizer.meta_objective.parse()?;
        let diagnostics = &self.diagnostics;
        let config = MetaOptimizerConfig::new(objective)
            .with_convention(self.optimizer.convention)
            .with_min_train_samples(self.optimizer.min_train_samples)
            .with_lr(self.optimizer.lr)
            .with_seed(self.optimizer.seed)
            .with_diagnostics(
                DiagnosticsConfig::new()
                    .with_n_probe_tasks(diagnostics.n_probe_tasks)
                    .with_probe_n_context_points(diagnostics.probe_n_context_points.clone())
                    .with_probe_resolution(diagnostics.probe_resolution)
                    .with_log_eff_zdim(diagnostics.log_eff_zdim)
                    .with_batch_size(diagnostics.batch_size),
            );
        config.validate()?;
        Ok(config)
    }
}

/// Global settings instance
static SETTINGS: OnceLock<Settings> = OnceLock::new();

/// Get the global settings instance, initializing it if necessary.
///
/// Invalid settings are replaced by defaults; callers that must fail on them
/// use [`Settings::new`].
pub fn settings() -> &'static Settings {
    SETTINGS.get_or_init(|| {
        Settings::new().unwrap_or_else(|e| {
            tracing::warn!("falling back to default settings: {}", e);
            Settings::default()
        })
    })
}
