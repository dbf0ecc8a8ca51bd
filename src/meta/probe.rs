//! Model-vs-ground-truth probe for scalar regression tasks.
//!
//! A handful of tasks is replayed in a fixed sample order; the predictor is
//! queried on a dense grid from the contexts formed by the first `n` samples,
//! for several `n`, and compared with the dataset's analytic function.

use std::collections::HashMap;

use burn::module::AutodiffModule;
use burn::tensor::{backend::AutodiffBackend, Tensor, TensorData};

use super::channels::{self, Channels};
use super::error::{MetaError, Result};
use super::interfaces::{ContextAggregator, Predictor, RegressionTaskDataset, TaskBatch};
use super::logging::{Figure, Panel, Series, SeriesKind, Table};
use super::loss::LossFunction;
use super::optimizer::MetaOptimizer;
use super::windowing::ContextConvention;

/// Fraction of the observed input range added on both sides of the grid.
pub const PROBE_PADDING: f32 = 0.2;

/// `resolution` evenly spaced points covering `[lo, hi]` padded by
/// [`PROBE_PADDING`] of its width on both sides.
pub fn probe_grid(lo: f32, hi: f32, resolution: usize) -> Vec<f32> {
    let pad = PROBE_PADDING * (hi - lo);
    let (start, end) = (lo - pad, hi + pad);
    match resolution {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (resolution - 1) as f32;
            (0..resolution).map(|i| start + step * i as f32).collect()
        }
    }
}

/// Requested context sizes the probe can evaluate: at least
/// `min_train_samples`, at most `samples`, backed by a context row. Sorted and
/// deduplicated.
pub fn probe_context_sizes(
    requested: &[usize],
    min_train_samples: usize,
    samples: usize,
    convention: ContextConvention,
) -> Vec<usize> {
    let rows = convention.context_len(samples);
    let mut sizes: Vec<usize> = requested
        .iter()
        .copied()
        .filter(|&n| n >= min_train_samples && n <= samples)
        .filter(|&n| convention.row_for_context_size(n).is_some_and(|row| row < rows))
        .collect();
    sizes.sort_unstable();
    sizes.dedup();
    sizes
}

/// Index of the first context size that includes sample `i`.
pub fn context_group(i: usize, sizes: &[usize]) -> Option<usize> {
    sizes.iter().position(|&n| i < n)
}

/// Host-side probe results of one population.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeTables {
    pub context: Table,
    pub truth: Table,
    pub model: Table,
}

impl ProbeTables {
    /// One panel per task: ground truth, model curves per context size and the
    /// context points coloured by the smallest context containing them.
    pub fn figure(&self, n_tasks: usize, sizes: &[usize]) -> Figure {
        let select = |table: &Table, task: usize, group: Option<usize>| -> Vec<(f64, f64)> {
            let (Some(ti), Some(xi), Some(yi)) = (
                table.columns.iter().position(|c| c == "task_id"),
                table.columns.iter().position(|c| c == "x"),
                table.columns.iter().position(|c| c == "y"),
            ) else {
                return Vec::new();
            };
            let gi = table.columns.iter().position(|c| c == "n_context_group");
            table
                .rows
                .iter()
                .filter(|row| row[ti] as usize == task)
                .filter(|row| match (group, gi) {
                    (Some(g), Some(gi)) => row[gi] as usize == g,
                    _ => true,
                })
                .map(|row| (row[xi], row[yi]))
                .collect()
        };

        let panels = (0..n_tasks)
            .map(|task| {
                let mut series = vec![Series {
                    label: "true".to_string(),
                    kind: SeriesKind::Line,
                    group: None,
                    points: select(&self.truth, task, None),
                }];
                for (g, n) in sizes.iter().enumerate() {
                    series.push(Series {
                        label: format!("model n_context={}", n),
                        kind: SeriesKind::Line,
                        group: Some(g),
                        points: select(&self.model, task, Some(g)),
                    });
                    series.push(Series {
                        label: format!("context n_context={}", n),
                        kind: SeriesKind::Scatter,
                        group: Some(g),
                        points: select(&self.context, task, Some(g)),
                    });
                }
                Panel {
                    title: format!("task {}", task),
                    series,
                }
            })
            .collect();
        Figure { panels }
    }
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
    /// Probes the first `n_probe_tasks` tasks of `dataset` and logs the tables
    /// and figure under `mode`. Scalar-to-scalar tasks only.
    pub(crate) fn log_model_vs_true(
        &self,
        mode: &str,
        dataset: &mut dyn RegressionTaskDataset,
        aggregator: &A::InnerModule,
        predictor: &P::InnerModule,
    ) -> Result<()> {
        if dataset.x_dim() != 1 || dataset.y_dim() != 1 {
            tracing::debug!(mode, x_dim = dataset.x_dim(), y_dim = dataset.y_dim(), "probe needs scalar tasks");
            return Ok(());
        }
        let diagnostics = &self.config.diagnostics;

        let shuffle = dataset.shuffle_samples();
        dataset.set_shuffle_samples(false);
        let batch = dataset
            .batches(diagnostics.n_probe_tasks.max(1), &mut *self.rng.borrow_mut())
            .into_iter()
            .next();
        dataset.set_shuffle_samples(shuffle);

        let Some(batch) = batch else {
            tracing::debug!(mode, "empty dataset, skipping probe");
            return Ok(());
        };
        let Some(tables) = self.probe_batch(mode, &*dataset, &batch, aggregator, predictor)? else {
            return Ok(());
        };
        let figure = tables.figure(batch.num_tasks(), &self.probe_sizes(&batch));

        tracing::info!(mode, tasks = batch.num_tasks(), rows = tables.model.len(), "model vs ground truth probe");
        self.emit(|logger| {
            logger.log_table(&format!("tables/{}-model_vs_true-context", mode), &tables.context);
            logger.log_table(&format!("tables/{}-model_vs_true-true", mode), &tables.truth);
            logger.log_table(&format!("tables/{}-model_vs_true-model", mode), &tables.model);
            logger.log_figure(&format!("probes/{}-model_vs_true", mode), &figure);
        });
        Ok(())
    }

    fn probe_sizes(&self, batch: &TaskBatch) -> Vec<usize> {
        let samples = batch.channels.get("x").map(|c| c.shape[0]).unwrap_or(0);
        probe_context_sizes(
            &self.config.diagnostics.probe_n_context_points,
            self.config.min_train_samples,
            samples,
            self.config.convention,
        )
    }

    fn probe_batch(
        &self,
        mode: &str,
        dataset: &dyn RegressionTaskDataset,
        batch: &TaskBatch,
        aggregator: &A::InnerModule,
        predictor: &P::InnerModule,
    ) -> Result<Option<ProbeTables>> {
        let Some(params) = batch.task_params.as_ref() else {
            tracing::debug!(mode, "batch carries no task parameters, skipping probe");
            return Ok(None);
        };
        let x_context = batch
            .channels
            .get("x")
            .ok_or_else(|| MetaError::MissingChannel("x".to_string()))?;
        let y_context = batch
            .channels
            .get("y")
            .ok_or_else(|| MetaError::MissingChannel("y".to_string()))?;
        let [samples, tasks, _] = x_context.shape;

        let sizes = self.probe_sizes(batch);
        if sizes.is_empty() {
            tracing::debug!(mode, samples, "no probe context size fits the sequence");
            return Ok(None);
        }

        let lo = x_context.data.iter().copied().fold(f32::INFINITY, f32::min);
        let hi = x_context.data.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if !(lo.is_finite() && hi.is_finite()) {
            tracing::warn!(mode, lo, hi, "probe input range is not finite");
            return Ok(None);
        }
        let grid = probe_grid(lo, hi, self.config.diagnostics.probe_resolution);
        let resolution = grid.len();
        let truth: Vec<Vec<f32>> = (0..tasks).map(|t| dataset.function(&grid, params, t)).collect();
        if let Some((task, values)) = truth.iter().enumerate().find(|(_, v)| v.len() != resolution) {
            tracing::warn!(
                mode,
                task,
                expected = resolution,
                got = values.len(),
                "ground truth does not cover the probe grid, skipping probe"
            );
            return Ok(None);
        }

        // Context rows for every size, tiled once per grid point.
        let mut context: Channels<B::InnerBackend> = HashMap::new();
        context.insert("x".to_string(), x_context.to_tensor(&self.device));
        context.insert("y".to_string(), y_context.to_tensor(&self.device));
        let z = aggregator.forward(&context)?;
        let rows: Vec<usize> = sizes
            .iter()
            .filter_map(|&n| self.config.convention.row_for_context_size(n))
            .collect();
        let tiled: Vec<usize> = (0..resolution).flat_map(|_| rows.iter().copied()).collect();
        let z_probe = channels::gather_rows(&z, &tiled);

        // Query grid ordered (grid point, context size, task).
        let c = sizes.len();
        let query_x: Vec<f32> = grid
            .iter()
            .flat_map(|&x| std::iter::repeat(x).take(c * tasks))
            .collect();
        let mut query: Channels<B::InnerBackend> = HashMap::new();
        query.insert(
            "x".to_string(),
            Tensor::from_data(TensorData::new(query_x, [resolution * c, tasks, 1]), &self.device),
        );
        let preds = predictor.forward(&query, &z_probe)?;
        let y_pred = channels::channel(&preds, "y")?;
        let expected = [resolution * c, tasks, 1];
        if y_pred.dims() != expected {
            return Err(MetaError::Shape(format!(
                "probe predictions for 'y' should be {:?}, got {:?}",
                expected,
                y_pred.dims()
            )));
        }
        let y_pred = channels::to_host(y_pred.clone());

        let mut context_table = Table::new(&["task_id", "n_context", "n_context_group", "x", "y"]);
        let max_size = sizes.iter().copied().max().unwrap_or(0);
        for task in 0..tasks {
            for i in 0..max_size.min(samples) {
                if let Some(g) = context_group(i, &sizes) {
                    context_table.push(vec![
                        task as f64,
                        sizes[g] as f64,
                        g as f64,
                        x_context.get(i, task, 0) as f64,
                        y_context.get(i, task, 0) as f64,
                    ]);
                }
            }
        }

        let mut truth_table = Table::new(&["task_id", "x", "y"]);
        for (task, values) in truth.iter().enumerate() {
            for (x, y) in grid.iter().zip(values) {
                truth_table.push(vec![task as f64, *x as f64, *y as f64]);
            }
        }

        let mut model_table = Table::new(&["task_id", "n_context", "n_context_group", "x", "y"]);
        for task in 0..tasks {
            for (g, &n) in sizes.iter().enumerate() {
                for (r, &x) in grid.iter().enumerate() {
                    let y = y_pred[(r * c + g) * tasks + task];
                    model_table.push(vec![task as f64, n as f64, g as f64, x as f64, y as f64]);
                }
            }
        }

        Ok(Some(ProbeTables {
            context: context_table,
            truth: truth_table,
            model: model_table,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_is_padded_linspace() {
        let grid = probe_grid(0.0, 1.0, 8);
        assert_eq!(grid.len(), 8);
        assert!((grid[0] + 0.2).abs() < 1e-6);
        assert!((grid[7] - 1.2).abs() < 1e-6);
        assert!(grid.windows(2).all(|w| w[1] > w[0]));
        assert!(probe_grid(0.0, 1.0, 0).is_empty());
    }

    #[test]
    fn test_context_sizes_filtering() {
        let sizes = probe_context_sizes(&[50, 1, 4, 10, 4], 2, 12, ContextConvention::Standard);
        assert_eq!(sizes, vec![4, 10]);

        let sizes = probe_context_sizes(&[1, 4, 10, 50], 1, 10, ContextConvention::Implicit);
        assert_eq!(sizes, vec![1, 4, 10]);

        let sizes = probe_context_sizes(&[0, 1], 1, 5, ContextConvention::Implicit);
        assert_eq!(sizes, vec![1]);
    }

    #[test]
    fn test_context_group_is_smallest_containing_size() {
        let sizes = [1, 4, 10];
        assert_eq!(context_group(0, &sizes), Some(0));
        assert_eq!(context_group(1, &sizes), Some(1));
        assert_eq!(context_group(3, &sizes), Some(1));
        assert_eq!(context_group(4, &sizes), Some(2));
        assert_eq!(context_group(10, &sizes), None);
    }

    #[test]
    fn test_figure_panels_per_task() {
        let mut truth = Table::new(&["task_id", "x", "y"]);
        truth.push(vec![0.0, 0.0, 1.0]);
        truth.push(vec![1.0, 0.0, 2.0]);
        let mut model = Table::new(&["task_id", "n_context", "n_context_group", "x", "y"]);
        model.push(vec![0.0, 1.0, 0.0, 0.0, 0.9]);
        model.push(vec![0.0, 4.0, 1.0, 0.0, 1.1]);
        let context = Table::new(&["task_id", "n_context", "n_context_group", "x", "y"]);
        let tables = ProbeTables { context, truth, model };

        let figure = tables.figure(2, &[1, 4]);
        assert_eq!(figure.panels.len(), 2);
        // true + (model, context) per size
        assert_eq!(figure.panels[0].series.len(), 5);
        assert_eq!(figure.panels[0].series[0].points, vec![(0.0, 1.0)]);
        assert_eq!(figure.panels[0].series[3].points, vec![(0.0, 1.1)]);
        assert!(figure.panels[1].series[1].points.is_empty());
    }
}
