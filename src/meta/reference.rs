//! Small reference collaborators: a running-mean context aggregator, an MLP
//! predictor and a synthetic linear-regression task population.
//!
//! They are enough to drive a meta-optimizer end to end and are what the demo
//! binary, the integration tests and the benchmark run on.

use std::collections::HashMap;

use burn::{
    config::Config,
    module::{Ignored, Module},
    nn::{Dropout, DropoutConfig, Linear, LinearConfig},
    tensor::{activation::relu, backend::Backend, Tensor, TensorData},
};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use rand_distr::{Distribution, Normal, Uniform};

use super::channels::{self, Channels};
use super::error::{MetaError, Result as MetaResult};
use super::interfaces::{
    ContextAggregator, HostChannel, Predictor, RegressionTaskDataset, TaskBatch, TaskDataset,
    TaskParams,
};
use super::windowing::ContextConvention;

/// Name of the aggregated-context channel.
pub const Z_CHANNEL: &str = "z";

#[derive(Config, Debug)]
pub struct RunningMeanAggregatorConfig {
    pub x_dim: usize,
    pub y_dim: usize,
    pub z_dim: usize,
    #[config(default = "ContextConvention::Standard")]
    pub convention: ContextConvention,
}

impl RunningMeanAggregatorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> RunningMeanAggregator<B> {
        RunningMeanAggregator {
            encoder: LinearConfig::new(self.x_dim + self.y_dim, self.z_dim).init(device),
            convention: Ignored(self.convention),
        }
    }
}

/// Encodes every `(x, y)` sample and averages the encodings over the samples
/// each context row summarizes. Rows summarizing no sample are zero.
#[derive(Module, Debug)]
pub struct RunningMeanAggregator<B: Backend> {
    encoder: Linear<B>,
    convention: Ignored<ContextConvention>,
}

impl<B: Backend> RunningMeanAggregator<B> {
    /// `[rows, samples]` averaging weights: row `j` averages the first
    /// `samples_summarized(j)` samples.
    fn averaging_weights(&self, samples: usize, device: &B::Device) -> Tensor<B, 2> {
        let rows = self.convention.0.context_len(samples);
        let mut weights = vec![0.0f32; rows * samples];
        for row in 0..rows {
            let n = self.convention.0.samples_summarized(row).min(samples);
            for i in 0..n {
                weights[row * samples + i] = 1.0 / n as f32;
            }
        }
        Tensor::from_data(TensorData::new(weights, [rows, samples]), device)
    }
}

impl<B: Backend> ContextAggregator<B> for RunningMeanAggregator<B> {
    fn forward(&self, x: &Channels<B>) -> MetaResult<Channels<B>> {
        let inputs = channels::channel(x, "x")?.clone();
        let targets = channels::channel(x, "y")?.clone();
        let [s, t, _] = inputs.dims();

        let h = relu(self.encoder.forward(Tensor::cat(vec![inputs, targets], 2)));
        let [_, _, d] = h.dims();
        let weights = self.averaging_weights(s, &h.device());
        let rows = weights.dims()[0];
        let z = weights.matmul(h.reshape([s, t * d])).reshape([rows, t, d]);

        Ok(HashMap::from([(Z_CHANNEL.to_string(), z)]))
    }

    fn convention(&self) -> ContextConvention {
        self.convention.0
    }
}

#[derive(Config, Debug)]
pub struct MlpPredictorConfig {
    pub x_dim: usize,
    pub z_dim: usize,
    pub y_dim: usize,
    #[config(default = 64)]
    pub hidden_dim: usize,
    #[config(default = 0.0)]
    pub dropout: f64,
}

impl MlpPredictorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> MlpPredictor<B> {
        MlpPredictor {
            hidden: LinearConfig::new(self.x_dim + self.z_dim, self.hidden_dim).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            output: LinearConfig::new(self.hidden_dim, self.y_dim).init(device),
        }
    }
}

/// Predicts `y` from the query `x` and the aligned context row `z`.
#[derive(Module, Debug)]
pub struct MlpPredictor<B: Backend> {
    hidden: Linear<B>,
    dropout: Dropout,
    output: Linear<B>,
}

impl<B: Backend> Predictor<B> for MlpPredictor<B> {
    fn forward(&self, query: &Channels<B>, context: &Channels<B>) -> MetaResult<Channels<B>> {
        let x = channels::channel(query, "x")?.clone();
        let z = channels::channel(context, Z_CHANNEL)?.clone();
        if x.dims()[..2] != z.dims()[..2] {
            return Err(MetaError::Shape(format!(
                "query {:?} and context {:?} are not aligned",
                x.dims(),
                z.dims()
            )));
        }
        let h = relu(self.hidden.forward(Tensor::cat(vec![x, z], 2)));
        let y = self.output.forward(self.dropout.forward(h));
        Ok(HashMap::from([("y".to_string(), y)]))
    }
}

#[derive(Config, Debug)]
pub struct LinearRegressionTasksConfig {
    pub n_tasks: usize,
    #[config(default = 32)]
    pub n_samples: usize,
    #[config(default = 1)]
    pub x_dim: usize,
    #[config(default = 0.1)]
    pub noise_std: f64,
    /// Also emit `x_ood`/`y_ood` drawn from a shifted input range
    #[config(default = false)]
    pub ood: bool,
    #[config(default = true)]
    pub shuffle_samples: bool,
    #[config(default = 0)]
    pub seed: u64,
}

impl LinearRegressionTasksConfig {
    pub fn init(&self) -> MetaResult<LinearRegressionTasks> {
        if self.n_tasks == 0 || self.n_samples == 0 || self.x_dim == 0 {
            return Err(MetaError::InvalidConfig(format!(
                "linear regression tasks need n_tasks, n_samples and x_dim >= 1, got {}, {}, {}",
                self.n_tasks, self.n_samples, self.x_dim
            )));
        }
        let normal = Normal::new(0.0f32, 1.0)
            .map_err(|e| MetaError::InvalidConfig(format!("parameter prior: {}", e)))?;
        let noise = Normal::new(0.0f32, self.noise_std as f32)
            .map_err(|e| MetaError::InvalidConfig(format!("noise_std: {}", e)))?;
        let in_range = Uniform::new(-1.0f32, 1.0);
        let ood_range = Uniform::new(1.0f32, 3.0);
        let mut rng = StdRng::seed_from_u64(self.seed);

        let weights: Vec<f32> = (0..self.n_tasks * self.x_dim).map(|_| normal.sample(&mut rng)).collect();
        let biases: Vec<f32> = (0..self.n_tasks).map(|_| normal.sample(&mut rng)).collect();

        let mut tasks = LinearRegressionTasks {
            x_dim: self.x_dim,
            n_samples: self.n_samples,
            shuffle_samples: self.shuffle_samples,
            weights,
            biases,
            x: Vec::with_capacity(self.n_tasks),
            y: Vec::with_capacity(self.n_tasks),
            x_ood: Vec::new(),
            y_ood: Vec::new(),
        };
        for task in 0..self.n_tasks {
            let (x, y) = tasks.draw_task(task, &in_range, &noise, &mut rng);
            tasks.x.push(x);
            tasks.y.push(y);
            if self.ood {
                let (x, y) = tasks.draw_task(task, &ood_range, &noise, &mut rng);
                tasks.x_ood.push(x);
                tasks.y_ood.push(y);
            }
        }
        Ok(tasks)
    }
}

/// Tasks `y = w . x + b + noise` with `w`, `b` drawn from a standard normal.
///
/// Samples are fixed at construction; batches optionally permute their order.
#[derive(Debug, Clone)]
pub struct LinearRegressionTasks {
    x_dim: usize,
    n_samples: usize,
    shuffle_samples: bool,
    weights: Vec<f32>,
    biases: Vec<f32>,
    x: Vec<Vec<f32>>,
    y: Vec<Vec<f32>>,
    x_ood: Vec<Vec<f32>>,
    y_ood: Vec<Vec<f32>>,
}

impl LinearRegressionTasks {
    fn draw_task<R: Rng>(
        &self,
        task: usize,
        range: &Uniform<f32>,
        noise: &Normal<f32>,
        rng: &mut R,
    ) -> (Vec<f32>, Vec<f32>) {
        let x: Vec<f32> = (0..self.n_samples * self.x_dim).map(|_| range.sample(rng)).collect();
        let y = x
            .chunks(self.x_dim)
            .map(|point| self.eval(point, task) + noise.sample(rng))
            .collect();
        (x, y)
    }

    fn eval(&self, point: &[f32], task: usize) -> f32 {
        let w = &self.weights[task * self.x_dim..(task + 1) * self.x_dim];
        w.iter().zip(point).map(|(w, x)| w * x).sum::<f32>() + self.biases[task]
    }

    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    /// Stacks per-task rows into a `[samples, tasks, dim]` channel.
    fn stack(&self, source: &[Vec<f32>], tasks: &[usize], order: &[Vec<usize>], dim: usize) -> MetaResult<HostChannel> {
        let mut data = Vec::with_capacity(self.n_samples * tasks.len() * dim);
        for s in 0..self.n_samples {
            for (slot, &task) in tasks.iter().enumerate() {
                let row = order[slot][s];
                data.extend_from_slice(&source[task][row * dim..(row + 1) * dim]);
            }
        }
        HostChannel::new(data, [self.n_samples, tasks.len(), dim])
    }

    fn batch(&self, tasks: &[usize], rng: &mut StdRng) -> MetaResult<TaskBatch> {
        let order: Vec<Vec<usize>> = tasks
            .iter()
            .map(|_| {
                let mut order: Vec<usize> = (0..self.n_samples).collect();
                if self.shuffle_samples {
                    order.shuffle(rng);
                }
                order
            })
            .collect();

        let mut batch_channels = HashMap::new();
        batch_channels.insert("x".to_string(), self.stack(&self.x, tasks, &order, self.x_dim)?);
        batch_channels.insert("y".to_string(), self.stack(&self.y, tasks, &order, 1)?);
        if self.has_ood() {
            batch_channels.insert("x_ood".to_string(), self.stack(&self.x_ood, tasks, &order, self.x_dim)?);
            batch_channels.insert("y_ood".to_string(), self.stack(&self.y_ood, tasks, &order, 1)?);
        }

        let mut params = TaskParams::new();
        params.insert(
            "w".to_string(),
            tasks
                .iter()
                .flat_map(|&t| self.weights[t * self.x_dim..(t + 1) * self.x_dim].iter().copied())
                .collect(),
        );
        params.insert("b".to_string(), tasks.iter().map(|&t| self.biases[t]).collect());

        Ok(TaskBatch {
            channels: batch_channels,
            task_params: Some(params),
        })
    }
}

impl TaskDataset for LinearRegressionTasks {
    fn len(&self) -> usize {
        self.x.len()
    }

    fn has_ood(&self) -> bool {
        !self.x_ood.is_empty()
    }

    fn batches(&self, batch_size: usize, rng: &mut StdRng) -> Vec<TaskBatch> {
        let tasks: Vec<usize> = (0..self.len()).collect();
        tasks
            .chunks(batch_size.max(1))
            .filter_map(|chunk| match self.batch(chunk, rng) {
                Ok(batch) => Some(batch),
                Err(e) => {
                    tracing::warn!("skipping malformed batch: {}", e);
                    None
                }
            })
            .collect()
    }

    fn as_regression_mut(&mut self) -> Option<&mut dyn RegressionTaskDataset> {
        Some(self)
    }
}

impl RegressionTaskDataset for LinearRegressionTasks {
    fn x_dim(&self) -> usize {
        self.x_dim
    }

    fn y_dim(&self) -> usize {
        1
    }

    fn shuffle_samples(&self) -> bool {
        self.shuffle_samples
    }

    fn set_shuffle_samples(&mut self, shuffle: bool) {
        self.shuffle_samples = shuffle;
    }

    /// `params` holds `w` (`x_dim` values per task) and `b` of one batch.
    fn function(&self, x: &[f32], params: &TaskParams, task: usize) -> Vec<f32> {
        let w = params
            .get("w")
            .and_then(|w| w.get(task * self.x_dim..(task + 1) * self.x_dim));
        let b = params.get("b").and_then(|b| b.get(task));
        let (Some(w), Some(&b)) = (w, b) else {
            tracing::warn!(task, "task parameters lack `w` or `b`, no ground truth");
            return Vec::new();
        };
        x.chunks(self.x_dim)
            .map(|point| w.iter().zip(point).map(|(w, x)| w * x).sum::<f32>() + b)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn ones_channels(s: usize, t: usize) -> Channels<TestBackend> {
        let device = Default::default();
        let mut x = Channels::new();
        x.insert("x".to_string(), Tensor::ones([s, t, 1], &device));
        x.insert("y".to_string(), Tensor::ones([s, t, 1], &device));
        x
    }

    #[test]
    fn test_aggregator_rows_follow_convention() {
        let device = Default::default();
        for (convention, rows) in [
            (ContextConvention::Standard, 6),
            (ContextConvention::Implicit, 5),
            (ContextConvention::ExplicitContext, 5),
        ] {
            let aggregator = RunningMeanAggregatorConfig::new(1, 1, 4)
                .with_convention(convention)
                .init::<TestBackend>(&device);
            let z = aggregator.forward(&ones_channels(5, 3)).unwrap();
            assert_eq!(z[Z_CHANNEL].dims(), [rows, 3, 4]);
        }
    }

    #[test]
    fn test_empty_context_row_is_zero() {
        let device = Default::default();
        let aggregator = RunningMeanAggregatorConfig::new(1, 1, 4).init::<TestBackend>(&device);
        let z = aggregator.forward(&ones_channels(4, 2)).unwrap();
        let [rows, t, d] = z[Z_CHANNEL].dims();
        let values = channels::to_host(z[Z_CHANNEL].clone());
        assert!(values[..t * d].iter().all(|&v| v == 0.0));
        // identical samples: every non-empty row holds the same mean
        let first = &values[t * d..2 * t * d];
        let last = &values[(rows - 1) * t * d..];
        for (a, b) in first.iter().zip(last) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_predictor_outputs_y_aligned_with_query() {
        let device = Default::default();
        let predictor = MlpPredictorConfig::new(1, 4, 1).with_hidden_dim(8).init::<TestBackend>(&device);
        let query = ones_channels(3, 2);
        let mut context = Channels::new();
        context.insert(Z_CHANNEL.to_string(), Tensor::zeros([3, 2, 4], &device));
        let preds = predictor.forward(&query, &context).unwrap();
        assert_eq!(preds["y"].dims(), [3, 2, 1]);

        context.insert(Z_CHANNEL.to_string(), Tensor::zeros([2, 2, 4], &device));
        assert!(matches!(predictor.forward(&query, &context), Err(MetaError::Shape(_))));
    }

    #[test]
    fn test_regression_batches_cover_all_tasks() {
        let tasks = LinearRegressionTasksConfig::new(10).with_n_samples(6).init().unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let batches = tasks.batches(4, &mut rng);
        assert_eq!(batches.iter().map(|b| b.num_tasks()).collect::<Vec<_>>(), vec![4, 4, 2]);
        assert_eq!(batches[0].channels["x"].shape, [6, 4, 1]);
        assert!(!batches[0].channels.contains_key("x_ood"));
    }

    #[test]
    fn test_unshuffled_batches_match_ground_truth() {
        let mut tasks = LinearRegressionTasksConfig::new(3)
            .with_n_samples(5)
            .with_noise_std(0.0)
            .with_ood(true)
            .init()
            .unwrap();
        tasks.set_shuffle_samples(false);
        let mut rng = StdRng::seed_from_u64(0);
        let batch = tasks.batches(3, &mut rng).remove(0);
        let params = batch.task_params.as_ref().unwrap();
        assert!(batch.channels.contains_key("y_ood"));

        for task in 0..3 {
            let xs: Vec<f32> = (0..5).map(|s| batch.channels["x"].get(s, task, 0)).collect();
            let truth = tasks.function(&xs, params, task);
            for (s, expected) in truth.iter().enumerate() {
                assert!((batch.channels["y"].get(s, task, 0) - expected).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_ground_truth_needs_slope_and_intercept() {
        let tasks = LinearRegressionTasksConfig::new(2).init().unwrap();
        let mut params = TaskParams::new();
        params.insert("w".to_string(), vec![2.0, -1.0]);
        assert!(tasks.function(&[0.5, 1.0], &params, 1).is_empty());

        params.insert("b".to_string(), vec![0.0, 1.0]);
        assert_eq!(tasks.function(&[0.5, 1.0], &params, 1), vec![0.5, 0.0]);
        assert!(tasks.function(&[0.5], &params, 2).is_empty());
    }

    #[test]
    fn test_aggregator_reports_its_convention() {
        let aggregator = RunningMeanAggregatorConfig::new(1, 1, 4)
            .with_convention(ContextConvention::Implicit)
            .init::<TestBackend>(&Default::default());
        assert_eq!(aggregator.convention(), ContextConvention::Implicit);
    }

    #[test]
    fn test_invalid_task_config() {
        assert!(matches!(
            LinearRegressionTasksConfig::new(0).init(),
            Err(MetaError::InvalidConfig(_))
        ));
    }
}
