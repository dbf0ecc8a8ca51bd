//! End-of-training diagnostics: loss-vs-context-size curves, OOD curve and the
//! effective dimensionality of the aggregated context.

use std::collections::BTreeMap;

use burn::module::AutodiffModule;
use burn::tensor::backend::AutodiffBackend;
use nalgebra::{DMatrix, SymmetricEigen};
use rand::{rngs::StdRng, seq::index};

use super::channels::{self, Channels};
use super::error::Result;
use super::interfaces::{ContextAggregator, DataModule, Predictor, TaskDataset};
use super::loss::LossFunction;
use super::mode::{TRAIN_TASKS, VAL_TASKS};
use super::optimizer::{per_sample_loss, windowed_forward, MetaOptimizer};
use super::windowing::WindowPlan;

/// Sequences sampled per batch for the effective-dimensionality estimate.
pub const EFF_ZDIM_TASKS_PER_BATCH: usize = 10;
/// Upper bound on context vectors entering the estimate.
pub const EFF_ZDIM_MAX_VECTORS: usize = 10_000;

/// Per-task losses bucketed by context size.
///
/// Buckets hold sums over tasks; dividing by the population's task count makes
/// the curve independent of how tasks were split into batches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LossCurve {
    sums: BTreeMap<usize, f64>,
}

impl LossCurve {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a `[windows, tasks]` loss (row-major host copy) with `sizes[k]`
    /// context samples for window `k`.
    pub fn accumulate(&mut self, sizes: &[usize], losses: &[f32], tasks: usize) {
        for (k, &n) in sizes.iter().enumerate() {
            let row = &losses[k * tasks..(k + 1) * tasks];
            *self.sums.entry(n).or_insert(0.0) += row.iter().map(|&l| l as f64).sum::<f64>();
        }
    }

    /// Mean loss per task for every context size seen.
    pub fn normalized(&self, num_tasks: usize) -> BTreeMap<usize, f64> {
        self.sums
            .iter()
            .map(|(&n, &sum)| (n, sum / num_tasks.max(1) as f64))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sums.is_empty()
    }
}

/// Participation ratio `(sum l)^2 / sum(l^2)` of the covariance spectrum of
/// `vectors`, with the spectrum normalized to fractions of variance explained
/// (descending).
///
/// `None` for fewer than two vectors or a degenerate (zero-variance) cloud.
pub fn participation_ratio(vectors: &[Vec<f32>]) -> Option<(f64, Vec<f64>)> {
    let n = vectors.len();
    let dim = vectors.first()?.len();
    if n < 2 || dim == 0 || vectors.iter().any(|v| v.len() != dim) {
        return None;
    }

    let mut data = DMatrix::<f64>::from_fn(n, dim, |i, j| vectors[i][j] as f64);
    for j in 0..dim {
        let mean = data.column(j).mean();
        data.column_mut(j).add_scalar_mut(-mean);
    }
    let covariance = (data.transpose() * &data) / (n - 1) as f64;

    let mut spectrum: Vec<f64> = SymmetricEigen::new(covariance)
        .eigenvalues
        .iter()
        .map(|&l| l.max(0.0))
        .collect();
    spectrum.sort_by(|a, b| b.total_cmp(a));

    let total: f64 = spectrum.iter().sum();
    let squares: f64 = spectrum.iter().map(|l| l * l).sum();
    if !(total > 0.0 && squares > 0.0) {
        return None;
    }
    let ratio = total * total / squares;
    Some((ratio, spectrum.into_iter().map(|l| l / total).collect()))
}

/// Collects context vectors for the effective-dimensionality estimate.
#[derive(Debug, Clone)]
pub struct ContextSampler {
    per_batch: usize,
    max_vectors: usize,
    vectors: Vec<Vec<f32>>,
}

impl Default for ContextSampler {
    fn default() -> Self {
        Self::new(EFF_ZDIM_TASKS_PER_BATCH, EFF_ZDIM_MAX_VECTORS)
    }
}

impl ContextSampler {
    pub fn new(per_batch: usize, max_vectors: usize) -> Self {
        Self {
            per_batch,
            max_vectors,
            vectors: Vec::new(),
        }
    }

    /// Takes the listed rows of up to `per_batch` random tasks from a
    /// `[rows, tasks, dim]` host copy.
    pub fn push_batch(&mut self, values: &[f32], dims: [usize; 3], rows: &[usize], rng: &mut StdRng) {
        let [_, tasks, dim] = dims;
        if tasks == 0 {
            return;
        }
        for task in index::sample(rng, tasks, self.per_batch.min(tasks)).iter() {
            for &row in rows {
                if self.is_full() {
                    return;
                }
                let start = (row * tasks + task) * dim;
                self.vectors.push(values[start..start + dim].to_vec());
            }
        }
    }

    pub fn is_full(&self) -> bool {
        self.vectors.len() >= self.max_vectors
    }

    pub fn vectors(&self) -> &[Vec<f32>] {
        &self.vectors
    }
}

/// Accumulated curves of one task population.
#[derive(Debug, Default)]
struct PopulationCurves {
    train: LossCurve,
    nexttoken: LossCurve,
    ood: LossCurve,
}

impl<B, A, P, L> MetaOptimizer<B, A, P, L>
where
    B: AutodiffBackend,
    A: AutodiffModule<B> + ContextAggregator<B>,
    A::InnerModule: ContextAggregator<B::InnerBackend>,
    P: AutodiffModule<B> + Predictor<B>,
    P::InnerModule: Predictor<B::InnerBackend>,
    L: LossFunction,
{
    /// Logs the end-of-training diagnostics for the train and validation
    /// populations. Does nothing without a logger.
    pub fn on_train_end<D: TaskDataset>(&self, data: &mut DataModule<D>) -> Result<()> {
        if !self.has_logger() {
            tracing::debug!("no metric logger attached, skipping end-of-training diagnostics");
            return Ok(());
        }
        let _eval = self.mode.eval_scope();
        let aggregator = self.aggregator.valid();
        let predictor = self.predictor.valid();

        for (mode, dataset) in [(TRAIN_TASKS, &data.train), (VAL_TASKS, &data.val)] {
            self.log_population_curves(mode, dataset, &aggregator, &predictor)?;
        }
        for (mode, dataset) in [(TRAIN_TASKS, &mut data.train), (VAL_TASKS, &mut data.val)] {
            match dataset.as_regression_mut() {
                Some(regression) => {
                    self.log_model_vs_true(mode, regression, &aggregator, &predictor)?
                }
                None => tracing::debug!(mode, "not a regression dataset, skipping probe"),
            }
        }
        Ok(())
    }

    fn log_population_curves<D: TaskDataset>(
        &self,
        mode: &str,
        dataset: &D,
        aggregator: &A::InnerModule,
        predictor: &P::InnerModule,
    ) -> Result<()> {
        let num_tasks = dataset.len();
        if num_tasks == 0 {
            return Ok(());
        }
        let batches = dataset.batches(self.config.diagnostics.batch_size, &mut *self.rng.borrow_mut());

        let mut curves = PopulationCurves::default();
        let mut sampler = self.config.diagnostics.log_eff_zdim.then(ContextSampler::default);

        for batch in &batches {
            let x: Channels<B::InnerBackend> = batch.to_channels(&self.device);
            let inputs = channels::in_distribution(&x);
            let [samples, tasks] = channels::extents(&inputs)?;
            let plan = WindowPlan::draw(
                self.config.convention,
                samples,
                self.config.min_train_samples,
                &mut *self.rng.borrow_mut(),
            )?;
            if plan.is_empty() {
                continue;
            }
            let out = windowed_forward(aggregator, predictor, &inputs, plan)?;
            let next_sizes = out.plan.next_token_context_sizes();

            let loss_train = per_sample_loss(&self.loss, &out.x_train, &out.preds_train)?;
            curves
                .train
                .accumulate(&out.plan.train_context_sizes(), &channels::to_host(loss_train), tasks);
            let loss_nexttoken = per_sample_loss(&self.loss, &out.x_nexttoken, &out.preds_nexttoken)?;
            curves
                .nexttoken
                .accumulate(&next_sizes, &channels::to_host(loss_nexttoken), tasks);

            if dataset.has_ood() {
                let ood = channels::ood_counterparts(&x);
                match channels::extents(&ood) {
                    Ok([ood_samples, _]) if ood_samples >= samples => {
                        let queries = out.plan.next_token_queries(&ood);
                        let preds = predictor.forward(&queries, &out.z_nexttoken)?;
                        let loss_ood = per_sample_loss(&self.loss, &queries, &preds)?;
                        curves.ood.accumulate(&next_sizes, &channels::to_host(loss_ood), tasks);
                    }
                    _ => tracing::debug!(mode, "batch has no usable OOD channels"),
                }
            }

            if let Some(collector) = sampler.as_mut() {
                if out.z.len() != 1 {
                    tracing::debug!(mode, channels = out.z.len(), "multi-channel context, skipping eff_zdim");
                    sampler = None;
                } else if !collector.is_full() {
                    if let Some(z) = out.z.values().next() {
                        let dims = z.dims();
                        let rows: Vec<usize> = (0..dims[0])
                            .filter(|&row| self.config.convention.samples_summarized(row) > 0)
                            .collect();
                        collector.push_batch(&channels::to_host(z.clone()), dims, &rows, &mut *self.rng.borrow_mut());
                    }
                }
            }
        }

        self.emit_curves(mode, &curves, num_tasks);
        if let Some(collector) = sampler {
            match participation_ratio(collector.vectors()) {
                Some((ratio, spectrum)) => {
                    tracing::info!(mode, eff_zdim = ratio, vectors = collector.vectors().len(), "effective context dimensionality");
                    self.emit(|logger| {
                        logger.log_metric(&format!("{}/eff_zdim", mode), ratio, 1);
                        logger.log_histogram(&format!("{}/z_variance_explained", mode), &spectrum);
                    });
                }
                None => tracing::debug!(mode, "degenerate context cloud, skipping eff_zdim"),
            }
        }
        Ok(())
    }

    /// One row per context size at which both branches carry a signal.
    fn emit_curves(&self, mode: &str, curves: &PopulationCurves, num_tasks: usize) {
        if curves.train.is_empty() {
            tracing::debug!(mode, "no batch produced a window, no curve to log");
            return;
        }
        let train = curves.train.normalized(num_tasks);
        let nexttoken = curves.nexttoken.normalized(num_tasks);
        let ood = curves.ood.normalized(num_tasks);

        let rows: Vec<Vec<(String, f64)>> = train
            .iter()
            .filter_map(|(&n, &loss_train)| {
                let loss_nexttoken = *nexttoken.get(&n)?;
                let mut row = vec![
                    ("n_samples".to_string(), n as f64),
                    (format!("{}/n_sample_loss_train", mode), loss_train),
                    (format!("{}/n_sample_loss_nexttoken", mode), loss_nexttoken),
                ];
                if let Some(&loss_ood) = ood.get(&n) {
                    row.push((format!("{}/n_sample_loss_ood", mode), loss_ood));
                }
                Some(row)
            })
            .collect();

        tracing::info!(mode, points = rows.len(), num_tasks, "loss vs context size");
        self.emit(|logger| {
            for row in &rows {
                logger.log_row(row);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    #[test]
    fn test_loss_curve_is_batch_partition_invariant() {
        // 4 tasks, 3 windows, context sizes 2..=4
        let sizes = [2, 3, 4];
        let losses: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let mut whole = LossCurve::new();
        whole.accumulate(&sizes, &losses, 4);

        let mut split = LossCurve::new();
        for half in [[0usize, 1], [2, 3]] {
            let part: Vec<f32> = (0..3)
                .flat_map(|k| half.iter().map(move |&t| (k * 4 + t) as f32))
                .collect();
            split.accumulate(&sizes, &part, 2);
        }
        assert_eq!(whole.normalized(4), split.normalized(4));
        assert_eq!(whole.normalized(4)[&2], (0.0 + 1.0 + 2.0 + 3.0) / 4.0);
    }

    #[test]
    fn test_participation_ratio_collapsed_cloud() {
        let vectors: Vec<Vec<f32>> = (0..200)
            .map(|i| {
                let s = i as f32 / 10.0;
                vec![s, 2.0 * s, -s, 0.5 * s]
            })
            .collect();
        let (ratio, spectrum) = participation_ratio(&vectors).unwrap();
        assert!((ratio - 1.0).abs() < 1e-3, "ratio = {}", ratio);
        assert!(spectrum[0] > 0.999);
    }

    #[test]
    fn test_participation_ratio_isotropic_cloud() {
        let mut rng = StdRng::seed_from_u64(3);
        let normal = Normal::new(0.0f32, 1.0).unwrap();
        let vectors: Vec<Vec<f32>> = (0..5000)
            .map(|_| (0..6).map(|_| normal.sample(&mut rng)).collect())
            .collect();
        let (ratio, spectrum) = participation_ratio(&vectors).unwrap();
        assert!((ratio - 6.0).abs() < 0.3, "ratio = {}", ratio);
        assert!((spectrum.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!(spectrum.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_participation_ratio_degenerate() {
        assert!(participation_ratio(&[]).is_none());
        assert!(participation_ratio(&[vec![1.0, 2.0]]).is_none());
        assert!(participation_ratio(&[vec![1.0, 2.0], vec![1.0, 2.0]]).is_none());
    }

    #[test]
    fn test_context_sampler_limits() {
        let mut rng = StdRng::seed_from_u64(0);
        // 5 rows, 20 tasks, 2 dims
        let values = vec![0.5f32; 5 * 20 * 2];
        let mut sampler = ContextSampler::new(10, 65);
        sampler.push_batch(&values, [5, 20, 2], &[1, 2, 3, 4], &mut rng);
        assert_eq!(sampler.vectors().len(), 40);
        sampler.push_batch(&values, [5, 20, 2], &[1, 2, 3, 4], &mut rng);
        assert_eq!(sampler.vectors().len(), 65);
        assert!(sampler.is_full());
        assert!(sampler.vectors().iter().all(|v| v.len() == 2));
    }
}
