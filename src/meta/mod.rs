//! Meta-learning of in-context learners.
//!
//! A [`MetaOptimizer`] trains a [`ContextAggregator`] and a [`Predictor`]
//! jointly on batches of tasks, optimizing either the reconstruction of seen
//! samples (`train`) or the forecast of the next unseen one (`prequential`).

pub mod channels;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod interfaces;
pub mod logging;
pub mod loss;
pub mod mode;
pub mod optimizer;
pub mod probe;
pub mod reference;
pub mod settings;
pub mod windowing;

pub use channels::Channels;
pub use config::{DiagnosticsConfig, MetaObjective, MetaOptimizerConfig};
pub use diagnostics::{participation_ratio, LossCurve};
pub use error::{MetaError, Result};
pub use interfaces::{
    ContextAggregator, DataModule, HostChannel, Predictor, RegressionTaskDataset, TaskBatch,
    TaskDataset, TaskParams,
};
pub use logging::{JsonLinesLogger, MetricLogger, RecordingLogger};
pub use loss::{ElementwiseLoss, LossFunction, RegressionLoss};
pub use mode::{EvalScope, ModeFlag, TRAIN_TASKS, VAL_TASKS};
pub use optimizer::{MetaForward, MetaOptimizer, MetaOptimizers};
pub use windowing::{ContextConvention, WindowPlan};
