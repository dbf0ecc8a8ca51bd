//! Error type shared by the meta-optimizer modules.

/// Errors raised by configuration, windowing, loss computation and diagnostics.
#[derive(thiserror::Error, Debug)]
pub enum MetaError {
    #[error("Invalid meta_objective: {0} (expected \"train\" or \"prequential\")")]
    InvalidObjective(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("SHAPE ERROR: {0}")]
    Shape(String),

    /// The per-sample loss must be shaped `[samples, tasks]`.
    #[error("LOSS SHAPE ERROR: loss function returned {got:?}, expected [samples, tasks] = {expected:?}")]
    LossShape { expected: [usize; 2], got: [usize; 2] },

    #[error("NUMERICAL ERROR: non-finite loss {0}")]
    NonFiniteLoss(f64),

    #[error("Missing channel: {0}")]
    MissingChannel(String),

    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MetaError>;
