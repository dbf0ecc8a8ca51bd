//! Context windowing: which query rows and context rows pair up per step.
//!
//! For a sequence of `S` samples and `min_train_samples = m`, every window `k`
//! pairs
//! - a *train* query, drawn uniformly from every sample its context has seen
//!   (inclusive of the newest one), and
//! - a *next-token* query, the first sample its context has not seen,
//!
//! with the aggregated-context rows they are predicted from. How many samples a
//! context row summarizes depends on the aggregator's output layout, captured by
//! [`ContextConvention`]; all indices are derived from that single quantity.

use std::ops::Range;

use burn::tensor::backend::Backend;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::channels::{self, Channels};
use super::error::{MetaError, Result};

/// Output layout of the context aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextConvention {
    /// `S + 1` context rows, row `j` summarizes the first `j` samples (row 0 is
    /// the empty context). The train and next-token branches read different
    /// rows: `z[m + k]` and `z[m - 1 + k]`. Windows: `S - m + 1`.
    Standard,
    /// `S` context rows, row `j` summarizes samples `0..=j`. Both branches read
    /// `z[m - 1 + k]`. Windows: `S - m`.
    Implicit,
    /// `S` context rows, row `j` summarizes samples `0..j`. Both branches read
    /// `z[m + k]`. Windows: `S - m`.
    ExplicitContext,
}

impl ContextConvention {
    /// Number of context rows the aggregator emits for `samples` inputs.
    pub fn context_len(&self, samples: usize) -> usize {
        match self {
            ContextConvention::Standard => samples + 1,
            ContextConvention::Implicit | ContextConvention::ExplicitContext => samples,
        }
    }

    /// Number of samples summarized by context row `row`.
    pub fn samples_summarized(&self, row: usize) -> usize {
        match self {
            ContextConvention::Standard | ContextConvention::ExplicitContext => row,
            ContextConvention::Implicit => row + 1,
        }
    }

    /// Context row summarizing exactly `n` samples, if the layout has one.
    pub fn row_for_context_size(&self, n: usize) -> Option<usize> {
        match self {
            ContextConvention::Standard | ContextConvention::ExplicitContext => Some(n),
            ContextConvention::Implicit => n.checked_sub(1),
        }
    }

    /// First context row of the train branch (window 0).
    fn train_context_start(&self, min_train_samples: usize) -> usize {
        match self {
            ContextConvention::Standard | ContextConvention::ExplicitContext => min_train_samples,
            ContextConvention::Implicit => min_train_samples - 1,
        }
    }

    /// First context row of the next-token branch (window 0).
    fn next_token_context_start(&self, min_train_samples: usize) -> usize {
        match self {
            ContextConvention::Standard | ContextConvention::Implicit => min_train_samples - 1,
            ContextConvention::ExplicitContext => min_train_samples,
        }
    }

    /// Number of windows for a sequence of `samples`.
    pub fn window_count(&self, samples: usize, min_train_samples: usize) -> usize {
        if min_train_samples == 0 {
            return 0;
        }
        let first_next_token = self.samples_summarized(self.next_token_context_start(min_train_samples));
        samples.saturating_sub(first_next_token)
    }
}

/// Realized windows for one forward call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowPlan {
    pub convention: ContextConvention,
    pub samples: usize,
    pub min_train_samples: usize,
    /// Train query row per window, in `[0, train_context_sizes[k] - 1]`
    pub train_indices: Vec<usize>,
    /// Next-token query row per window, increasing by one
    pub next_token_indices: Vec<usize>,
    /// Context rows read by the train branch
    pub train_context_rows: Range<usize>,
    /// Context rows read by the next-token branch
    pub next_token_context_rows: Range<usize>,
}

impl WindowPlan {
    /// Draws a fresh plan. Train queries are re-drawn on every call.
    pub fn draw<R: Rng + ?Sized>(
        convention: ContextConvention,
        samples: usize,
        min_train_samples: usize,
        rng: &mut R,
    ) -> Result<Self> {
        if min_train_samples == 0 {
            return Err(MetaError::InvalidConfig(
                "min_train_samples must be >= 1".to_string(),
            ));
        }
        let len = convention.window_count(samples, min_train_samples);
        let train_start = convention.train_context_start(min_train_samples);
        let next_start = convention.next_token_context_start(min_train_samples);

        let train_indices = (0..len)
            .map(|k| {
                let seen = convention.samples_summarized(train_start + k);
                rng.gen_range(0..seen)
            })
            .collect();
        let next_token_indices = (0..len)
            .map(|k| convention.samples_summarized(next_start + k))
            .collect();

        Ok(Self {
            convention,
            samples,
            min_train_samples,
            train_indices,
            next_token_indices,
            train_context_rows: train_start..train_start + len,
            next_token_context_rows: next_start..next_start + len,
        })
    }

    pub fn len(&self) -> usize {
        self.next_token_indices.len()
    }

    /// No window fits: the batch carries no usable samples.
    pub fn is_empty(&self) -> bool {
        self.next_token_indices.is_empty()
    }

    /// Number of samples the train context of each window has seen.
    pub fn train_context_sizes(&self) -> Vec<usize> {
        self.train_context_rows
            .clone()
            .map(|row| self.convention.samples_summarized(row))
            .collect()
    }

    /// Number of samples the next-token context of each window has seen.
    pub fn next_token_context_sizes(&self) -> Vec<usize> {
        self.next_token_context_rows
            .clone()
            .map(|row| self.convention.samples_summarized(row))
            .collect()
    }

    pub fn train_queries<B: Backend>(&self, x: &Channels<B>) -> Channels<B> {
        channels::gather_rows(x, &self.train_indices)
    }

    pub fn next_token_queries<B: Backend>(&self, x: &Channels<B>) -> Channels<B> {
        channels::gather_rows(x, &self.next_token_indices)
    }

    pub fn train_context<B: Backend>(&self, z: &Channels<B>) -> Result<Channels<B>> {
        self.check_context(z)?;
        channels::slice_rows(z, self.train_context_rows.start, self.len())
    }

    pub fn next_token_context<B: Backend>(&self, z: &Channels<B>) -> Result<Channels<B>> {
        self.check_context(z)?;
        channels::slice_rows(z, self.next_token_context_rows.start, self.len())
    }

    fn check_context<B: Backend>(&self, z: &Channels<B>) -> Result<()> {
        let expected = self.convention.context_len(self.samples);
        for (name, tensor) in z {
            let rows = tensor.dims()[0];
            if rows != expected {
                return Err(MetaError::Shape(format!(
                    "{:?} convention expects {} context rows for {} samples, channel '{}' has {}",
                    self.convention, expected, self.samples, name, rows
                )));
            }
        }
        Ok(())
    }
}
