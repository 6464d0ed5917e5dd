//! Per-session recurrent state.
//!
//! A session owns one [`LayerState`] per layer. During a step the scheduler
//! copies it into the model's working buffers at the session's batch slot,
//! runs the forward pass, and copies it back out. Nothing else touches a
//! slot while a session occupies it.

use crate::backend::Device;
use crate::error::TensorError;
use crate::tensor::{DType, Tensor, TensorOpsMut};

/// The state one layer carries between timesteps
#[derive(Debug, Clone)]
pub struct LayerState {
    /// Per-head WKV accumulators, `[heads, head_size, head_size]`
    pub wkv: Tensor,
    /// Last input row seen by the attention shift register, `[channels]`
    pub att_shift: Tensor,
    /// Last input row seen by the feed-forward shift register, `[channels]`
    pub ffn_shift: Tensor,
}

impl LayerState {
    pub fn zeros(heads: usize, head_size: usize, channels: usize, device: Device) -> Result<Self, TensorError> {
        Ok(Self {
            wkv: Tensor::zeros(&[heads, head_size, head_size], DType::F32, device)?,
            att_shift: Tensor::zeros(&[channels], DType::F32, device)?,
            ffn_shift: Tensor::zeros(&[channels], DType::F32, device)?,
        })
    }
}

/// Everything a session needs to resume where it left off
#[derive(Debug, Clone)]
pub struct RecurrentState {
    layers: Vec<LayerState>,
}

impl RecurrentState {
    pub fn new(layers: Vec<LayerState>) -> Self {
        Self { layers }
    }

    pub fn layers(&self) -> &[LayerState] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [LayerState] {
        &mut self.layers
    }

    /// Back to the state of a fresh session
    pub fn clear(&mut self) -> Result<(), TensorError> {
        for layer in &mut self.layers {
            layer.wkv.fill(0.0)?;
            layer.att_shift.fill(0.0)?;
            layer.ffn_shift.fill(0.0)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_zeroes_every_layer() {
        let layer = LayerState {
            wkv: Tensor::full(&[1, 2, 2], 3.0, Device::Cpu).unwrap(),
            att_shift: Tensor::full(&[2], 1.0, Device::Cpu).unwrap(),
            ffn_shift: Tensor::full(&[2], 1.0, Device::Cpu).unwrap(),
        };
        let mut state = RecurrentState::new(vec![layer.clone(), layer]);
        state.clear().unwrap();
        for layer in state.layers() {
            assert!(layer.wkv.as_slice::<f32>().unwrap().iter().all(|v| *v == 0.0));
            assert!(layer.att_shift.as_slice::<f32>().unwrap().iter().all(|v| *v == 0.0));
        }
    }
}
