//! Named tensor channels in the canonical `[samples, tasks, features]` layout.
//!
//! A task batch, an aggregated context and a set of predictions are all
//! represented as a map from channel name (`"x"`, `"y"`, `"x_ood"`, `"z"`, ...)
//! to a rank-3 tensor. Every channel of one map shares the `samples` and
//! `tasks` extents.

use std::collections::HashMap;

use burn::tensor::{
    backend::{AutodiffBackend, Backend},
    ElementConversion, Int, Tensor, TensorData,
};

use super::error::{MetaError, Result};

/// Channel name -> tensor shaped `[S, T, F]`.
pub type Channels<B> = HashMap<String, Tensor<B, 3>>;

/// Suffix marking out-of-distribution counterparts of a channel.
pub const OOD_SUFFIX: &str = "_ood";

/// Shared `[samples, tasks]` extents of a channel map.
///
/// Fails if the map is empty or if channels disagree on either extent.
pub fn extents<B: Backend>(channels: &Channels<B>) -> Result<[usize; 2]> {
    let mut found: Option<(&str, [usize; 2])> = None;
    for (name, tensor) in channels {
        let [s, t, _] = tensor.dims();
        match found {
            None => found = Some((name, [s, t])),
            Some((first, dims)) if dims != [s, t] => {
                return Err(MetaError::Shape(format!(
                    "channel '{}' has [S, T] = {:?} but channel '{}' has {:?}",
                    name,
                    [s, t],
                    first,
                    dims
                )));
            }
            Some(_) => {}
        }
    }
    found
        .map(|(_, dims)| dims)
        .ok_or_else(|| MetaError::Shape("channel map is empty".to_string()))
}

/// Looks up a channel by name.
pub fn channel<'a, B: Backend>(channels: &'a Channels<B>, name: &str) -> Result<&'a Tensor<B, 3>> {
    channels
        .get(name)
        .ok_or_else(|| MetaError::MissingChannel(name.to_string()))
}

/// Gathers rows (sample positions) from every channel.
pub fn gather_rows<B: Backend>(channels: &Channels<B>, rows: &[usize]) -> Channels<B> {
    channels
        .iter()
        .map(|(name, tensor)| {
            let device = tensor.device();
            let indices: Vec<i64> = rows.iter().map(|&r| r as i64).collect();
            let indices =
                Tensor::<B, 1, Int>::from_data(TensorData::new(indices, [rows.len()]), &device);
            (name.clone(), tensor.clone().select(0, indices))
        })
        .collect()
}

/// Slices the contiguous rows `start..start + len` from every channel.
pub fn slice_rows<B: Backend>(channels: &Channels<B>, start: usize, len: usize) -> Result<Channels<B>> {
    channels
        .iter()
        .map(|(name, tensor)| {
            let [s, t, f] = tensor.dims();
            if start + len > s {
                return Err(MetaError::Shape(format!(
                    "context channel '{}' has {} positions, window needs rows {}..{}",
                    name,
                    s,
                    start,
                    start + len
                )));
            }
            Ok((name.clone(), tensor.clone().slice([start..start + len, 0..t, 0..f])))
        })
        .collect()
}

/// Detaches every channel onto the inner (non-autodiff) backend.
pub fn to_inner<B: AutodiffBackend>(channels: &Channels<B>) -> Channels<B::InnerBackend> {
    channels
        .iter()
        .map(|(name, tensor)| (name.clone(), tensor.clone().inner()))
        .collect()
}

/// Lifts inner-backend channels back without attaching them to any graph.
pub fn from_inner<B: AutodiffBackend>(channels: Channels<B::InnerBackend>) -> Channels<B> {
    channels
        .into_iter()
        .map(|(name, tensor)| (name, Tensor::from_inner(tensor)))
        .collect()
}

/// Channels whose name ends with [`OOD_SUFFIX`], renamed to their base name.
pub fn ood_counterparts<B: Backend>(channels: &Channels<B>) -> Channels<B> {
    channels
        .iter()
        .filter_map(|(name, tensor)| {
            name.strip_suffix(OOD_SUFFIX)
                .map(|base| (base.to_string(), tensor.clone()))
        })
        .collect()
}

/// Channels that are not OOD counterparts.
pub fn in_distribution<B: Backend>(channels: &Channels<B>) -> Channels<B> {
    channels
        .iter()
        .filter(|(name, _)| !name.ends_with(OOD_SUFFIX))
        .map(|(name, tensor)| (name.clone(), tensor.clone()))
        .collect()
}

/// Copies a tensor to host memory as `f32`.
pub fn to_host<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .unwrap_or_default()
}

/// Reads a single-element tensor as `f64`.
pub fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}
