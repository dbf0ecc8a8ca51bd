//! Interfaces of the collaborators a meta-optimizer drives.

use std::collections::HashMap;

use burn::tensor::{backend::Backend, Tensor, TensorData};
use rand::rngs::StdRng;

use super::channels::Channels;
use super::error::{MetaError, Result};
use super::windowing::ContextConvention;

/// Summarizes a batch of per-task sequences into per-position context.
///
/// Output rows follow the aggregator's [`ContextConvention`].
pub trait ContextAggregator<B: Backend> {
    fn forward(&self, x: &Channels<B>) -> Result<Channels<B>>;

    /// Row layout of the context this aggregator produces.
    fn convention(&self) -> ContextConvention;
}

/// Predicts query channels from aligned context rows.
///
/// `query` and `context` share the `[samples, tasks]` extents; row `i` of the
/// query is predicted from row `i` of the context.
pub trait Predictor<B: Backend> {
    fn forward(&self, query: &Channels<B>, context: &Channels<B>) -> Result<Channels<B>>;
}

/// Ground-truth task descriptors: parameter name -> one value per task.
pub type TaskParams = HashMap<String, Vec<f32>>;

/// Host-side channel data shaped `[samples, tasks, features]`.
#[derive(Debug, Clone, PartialEq)]
pub struct HostChannel {
    pub data: Vec<f32>,
    pub shape: [usize; 3],
}

impl HostChannel {
    pub fn new(data: Vec<f32>, shape: [usize; 3]) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(MetaError::Shape(format!(
                "channel data has {} values, shape {:?} needs {}",
                data.len(),
                shape,
                expected
            )));
        }
        Ok(Self { data, shape })
    }

    pub fn get(&self, sample: usize, task: usize, feature: usize) -> f32 {
        let [_, t, f] = self.shape;
        self.data[(sample * t + task) * f + feature]
    }

    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 3> {
        Tensor::from_data(TensorData::new(self.data.clone(), self.shape), device)
    }
}

/// One batch of tasks as yielded by a dataset.
#[derive(Debug, Clone, Default)]
pub struct TaskBatch {
    pub channels: HashMap<String, HostChannel>,
    pub task_params: Option<TaskParams>,
}

impl TaskBatch {
    /// Number of tasks in the batch.
    pub fn num_tasks(&self) -> usize {
        self.channels.values().next().map(|c| c.shape[1]).unwrap_or(0)
    }

    /// Moves the batch onto a backend device.
    pub fn to_channels<B: Backend>(&self, device: &B::Device) -> Channels<B> {
        self.channels
            .iter()
            .map(|(name, channel)| (name.clone(), channel.to_tensor(device)))
            .collect()
    }
}

/// A population of tasks.
pub trait TaskDataset {
    /// Number of tasks.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether batches carry `{name}_ood` channels.
    fn has_ood(&self) -> bool {
        false
    }

    /// All tasks, in order, split into batches of at most `batch_size` tasks.
    fn batches(&self, batch_size: usize, rng: &mut StdRng) -> Vec<TaskBatch>;

    /// Regression capabilities, if this dataset is a regression dataset.
    fn as_regression_mut(&mut self) -> Option<&mut dyn RegressionTaskDataset> {
        None
    }
}

/// Regression datasets with an analytic ground-truth function.
pub trait RegressionTaskDataset: TaskDataset {
    fn x_dim(&self) -> usize;
    fn y_dim(&self) -> usize;
    fn shuffle_samples(&self) -> bool;
    fn set_shuffle_samples(&mut self, shuffle: bool);
    /// Ground truth `f(x)` of task `task` for every point of `x` (rows of `x_dim`).
    fn function(&self, x: &[f32], params: &TaskParams, task: usize) -> Vec<f32>;
}

/// Train and validation task populations.
pub struct DataModule<D> {
    pub train: D,
    pub val: D,
}

impl<D: TaskDataset> DataModule<D> {
    pub fn new(train: D, val: D) -> Self {
        Self { train, val }
    }
}
