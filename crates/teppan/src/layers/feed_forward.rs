use crate::config::ModelConfig;
use crate::error::{TensorError, WeightError};
use crate::tensor::{Tensor, TensorOps};
use crate::weights::WeightSource;
use super::{load_vector, Linear, ShiftRegister, Workspace};

/// Channel mixing: `σ(receptance(xr)) · value(relu(key(xk))²)`, where `xk`
/// and `xr` blend the input with its time-shifted copy
#[derive(Debug)]
pub struct FeedForward {
    shift: ShiftRegister,
    mix_k: Tensor,
    mix_r: Tensor,
    key: Linear,
    receptance: Linear,
    value: Linear,
}

impl FeedForward {
    pub fn load(
        source: &impl WeightSource,
        layer: usize,
        channels: usize,
        slots: usize,
        config: &ModelConfig,
    ) -> Result<Self, WeightError> {
        let prefix = format!("blocks.{layer}.ffn");
        let device = config.device;
        let linear = |name: &str| {
            Linear::load(source, &format!("{prefix}.{name}"), config.quantize, config.quant_block, device)
        };
        Ok(Self {
            shift: ShiftRegister::new(slots, channels, device)?,
            mix_k: load_vector(source, &format!("{prefix}.time_mix_k"), channels, device)?,
            mix_r: load_vector(source, &format!("{prefix}.time_mix_r"), channels, device)?,
            key: linear("key")?,
            receptance: linear("receptance")?,
            value: linear("value")?,
        })
    }

    /// Width of the hidden projection
    pub fn hidden_size(&self) -> usize {
        self.key.out_features()
    }

    pub fn forward(&mut self, input: &Tensor, workspace: &mut Workspace, out: &mut Tensor) -> Result<(), TensorError> {
        let ws = workspace;
        self.shift.shift(input, &mut ws.xx)?;

        ws.xx.lerp(input, &self.mix_k, &mut ws.mixed)?;
        self.key.forward(&ws.mixed, &mut ws.hidden)?;
        ws.hidden.relu_square(&mut ws.activated)?;
        self.value.forward(&ws.activated, &mut ws.v)?;

        ws.xx.lerp(input, &self.mix_r, &mut ws.mixed)?;
        self.receptance.forward(&ws.mixed, &mut ws.r)?;
        ws.r.sigmoid_mul(&ws.v, out)
    }

    pub(crate) fn shift(&self) -> &ShiftRegister {
        &self.shift
    }

    pub(crate) fn shift_mut(&mut self) -> &mut ShiftRegister {
        &mut self.shift
    }
}
