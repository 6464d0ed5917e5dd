//! # Layers
//!
//! The building blocks of one RWKV-5 layer:
//!
//! - [`Linear`]: dense or block-quantized projection
//! - [`LayerNorm`] / [`GroupNorm`]
//! - [`ShiftRegister`]: per-slot carry of the previous timestep
//! - [`Attention`]: time mixing around the recurrent WKV kernel
//! - [`FeedForward`]: channel mixing
//!
//! Intermediate activations live in one [`Workspace`] shared by every layer
//! of a model. Its buffers are allocated once for the largest
//! `batch × time` the model accepts and are re-viewed with
//! [`Tensor::reshape_unchecked`] for each forward pass.

mod attention;
mod feed_forward;
mod linear;
mod norm;
mod shift;

pub use attention::Attention;
pub use feed_forward::FeedForward;
pub use linear::Linear;
pub use norm::{GroupNorm, LayerNorm};
pub use shift::ShiftRegister;

use crate::backend::Device;
use crate::error::{TensorError, WeightError};
use crate::tensor::{DType, Tensor};
use crate::weights::WeightSource;

/// Scratch activations shared by the layers of one model
#[derive(Debug)]
pub struct Workspace {
    pub(crate) xx: Tensor,
    pub(crate) mixed: Tensor,
    pub(crate) r: Tensor,
    pub(crate) k: Tensor,
    pub(crate) v: Tensor,
    pub(crate) g: Tensor,
    pub(crate) wkv: Tensor,
    pub(crate) normed: Tensor,
    /// Feed-forward intermediates, `hidden` channels wide
    pub(crate) hidden: Tensor,
    pub(crate) activated: Tensor,
    channels: usize,
    hidden_channels: usize,
}

impl Workspace {
    /// Buffers for up to `rows` (batch × time) rows
    pub fn new(rows: usize, channels: usize, hidden: usize, device: Device) -> Result<Self, TensorError> {
        let buffer = |width: usize| Tensor::zeros(&[rows, width], DType::F32, device);
        Ok(Self {
            xx: buffer(channels)?,
            mixed: buffer(channels)?,
            r: buffer(channels)?,
            k: buffer(channels)?,
            v: buffer(channels)?,
            g: buffer(channels)?,
            wkv: buffer(channels)?,
            normed: buffer(channels)?,
            hidden: buffer(hidden)?,
            activated: buffer(hidden)?,
            channels,
            hidden_channels: hidden,
        })
    }

    /// View every buffer as `[batch, time, width]`
    ///
    /// # Panics
    ///
    /// Panics if `batch × time` exceeds the rows the workspace was built for.
    pub fn resize(&mut self, batch: usize, time: usize) {
        let wide = [batch, time, self.channels];
        for buffer in [
            &mut self.xx,
            &mut self.mixed,
            &mut self.r,
            &mut self.k,
            &mut self.v,
            &mut self.g,
            &mut self.wkv,
            &mut self.normed,
        ] {
            buffer.reshape_unchecked(&wide);
        }
        let hidden = [batch, time, self.hidden_channels];
        self.hidden.reshape_unchecked(&hidden);
        self.activated.reshape_unchecked(&hidden);
    }
}

/// A per-channel parameter as a flat host f32 vector. Archives often store
/// these as `[1, 1, C]` or `[heads, size]`.
pub(crate) fn host_vector(source: &impl WeightSource, key: &str, len: usize) -> Result<Vec<f32>, WeightError> {
    let tensor = source.get(key)?;
    if tensor.element_count() != len {
        return Err(WeightError::Shape {
            key: key.to_string(),
            expected: vec![len],
            actual: tensor.shape().to_vec(),
        });
    }
    Ok(tensor.to_f32()?.to_vec::<f32>()?)
}

/// [`host_vector`] moved to `device`
pub(crate) fn load_vector(
    source: &impl WeightSource,
    key: &str,
    len: usize,
    device: Device,
) -> Result<Tensor, WeightError> {
    let values = host_vector(source, key, len)?;
    Ok(Tensor::from_slice(&values, &[len]).to_device(device)?)
}
