//! Per-sample loss functions.
//!
//! A loss function maps `(target, predictions)` channels shaped
//! `[samples, tasks, features]` to a loss tensor shaped `[samples, tasks]`.
//! Losses are never reduced over samples or tasks here: the loss-vs-context-size
//! diagnostics need both axes.

use burn::nn::loss::MseLoss;
use burn::tensor::{backend::Backend, Tensor};
use serde::{Deserialize, Serialize};

use super::channels::{self, Channels};
use super::error::{MetaError, Result};

/// Per-sample loss hook injected into a meta-optimizer.
pub trait LossFunction: Clone {
    /// Loss per `[sample, task]`.
    fn per_sample<B: Backend>(&self, target: &Channels<B>, preds: &Channels<B>) -> Result<Tensor<B, 2>>;
}

/// Fails unless `loss` is shaped exactly `[samples, tasks]`.
pub fn check_loss_shape<B: Backend>(loss: &Tensor<B, 2>, expected: [usize; 2]) -> Result<()> {
    let got = loss.dims();
    if got != expected {
        return Err(MetaError::LossShape { expected, got });
    }
    Ok(())
}

/// Elementwise loss with reduction disabled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementwiseLoss {
    Mse,
    L1,
}

impl ElementwiseLoss {
    pub fn forward<B: Backend>(&self, preds: Tensor<B, 3>, target: Tensor<B, 3>) -> Tensor<B, 3> {
        match self {
            ElementwiseLoss::Mse => MseLoss::new().forward_no_reduction(preds, target),
            ElementwiseLoss::L1 => (preds - target).abs(),
        }
    }
}

/// Regression loss over a single prediction channel, averaged over features only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegressionLoss {
    pub elementwise: ElementwiseLoss,
}

impl RegressionLoss {
    pub fn new(elementwise: ElementwiseLoss) -> Self {
        Self { elementwise }
    }
}

impl Default for RegressionLoss {
    fn default() -> Self {
        Self::new(ElementwiseLoss::Mse)
    }
}

impl LossFunction for RegressionLoss {
    fn per_sample<B: Backend>(&self, target: &Channels<B>, preds: &Channels<B>) -> Result<Tensor<B, 2>> {
        if preds.len() != 1 {
            return Err(MetaError::Shape(format!(
                "regression expects exactly one prediction channel, got {}",
                preds.len()
            )));
        }
        let (name, pred) = preds
            .iter()
            .next()
            .ok_or_else(|| MetaError::Shape("no prediction channel".to_string()))?;
        let target = channels::channel(target, name)?;
        if pred.dims() != target.dims() {
            return Err(MetaError::Shape(format!(
                "prediction '{}' {:?} does not match target {:?}",
                name,
                pred.dims(),
                target.dims()
            )));
        }

        let [s, t, _] = target.dims();
        let loss = self
            .elementwise
            .forward(pred.clone(), target.clone())
            .mean_dim(2)
            .squeeze::<2>(2);
        check_loss_shape(&loss, [s, t])?;
        Ok(loss)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;
    use std::collections::HashMap;

    type TestBackend = NdArray<f32>;

    fn channel_map(name: &str, data: Vec<f32>, shape: [usize; 3]) -> Channels<TestBackend> {
        let device = Default::default();
        let mut map = HashMap::new();
        map.insert(name.to_string(), Tensor::from_data(TensorData::new(data, shape), &device));
        map
    }

    #[test]
    fn test_mse_is_per_sample_and_task() {
        let target = channel_map("y", vec![0.0; 12], [3, 2, 2]);
        let preds = channel_map(
            "y",
            vec![1.0, 1.0, 2.0, 2.0, 0.0, 0.0, 1.0, 3.0, 0.0, 2.0, 4.0, 0.0],
            [3, 2, 2],
        );
        let loss = RegressionLoss::default().per_sample(&target, &preds).unwrap();
        assert_eq!(loss.dims(), [3, 2]);
        let values = channels::to_host(loss);
        assert_eq!(values, vec![1.0, 4.0, 0.0, 5.0, 2.0, 8.0]);
    }

    #[test]
    fn test_l1_loss() {
        let target = channel_map("y", vec![1.0, 1.0], [2, 1, 1]);
        let preds = channel_map("y", vec![-1.0, 4.0], [2, 1, 1]);
        let loss = RegressionLoss::new(ElementwiseLoss::L1)
            .per_sample(&target, &preds)
            .unwrap();
        assert_eq!(channels::to_host(loss), vec![2.0, 3.0]);
    }

    #[test]
    fn test_rejects_multiple_prediction_channels() {
        let target = channel_map("y", vec![0.0; 2], [2, 1, 1]);
        let mut preds = channel_map("y", vec![0.0; 2], [2, 1, 1]);
        preds.insert("w".to_string(), preds["y"].clone());
        assert!(RegressionLoss::default().per_sample(&target, &preds).is_err());
    }

    #[test]
    fn test_missing_target_channel() {
        let target = channel_map("x", vec![0.0; 2], [2, 1, 1]);
        let preds = channel_map("y", vec![0.0; 2], [2, 1, 1]);
        assert!(matches!(
            RegressionLoss::default().per_sample(&target, &preds),
            Err(MetaError::MissingChannel(_))
        ));
    }

    #[test]
    fn test_check_loss_shape() {
        let device = Default::default();
        let loss = Tensor::<TestBackend, 2>::zeros([4, 3], &device);
        assert!(check_loss_shape(&loss, [4, 3]).is_ok());
        assert!(matches!(
            check_loss_shape(&loss, [3, 4]),
            Err(MetaError::LossShape { expected: [3, 4], got: [4, 3] })
        ));
    }
}
