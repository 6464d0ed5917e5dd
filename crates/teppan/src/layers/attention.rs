use crate::config::{DecayFormat, GateActivation, ModelConfig};
use crate::error::{TensorError, WeightError};
use crate::tensor::constant::BATCH_DIM;
use crate::tensor::{DType, Tensor, TensorOps, TensorOpsMut, TensorView, TensorViewMut};
use crate::weights::WeightSource;
use super::{host_vector, load_vector, GroupNorm, Linear, ShiftRegister, Workspace};

/// Time mixing for one layer.
///
/// For an input `x` of shape `[batch, time, channels]`:
///
/// 1. `xx` is `x` shifted one step back in time through the [`ShiftRegister`]
/// 2. receptance, key, value and gate each project `lerp(xx, x, mix)`
/// 3. the WKV kernel advances every slot's per-head `[size, size]` state
/// 4. the readout is scaled, group-normalized per head, gated and projected
///
/// Per-slot state (the WKV matrices and the shift register) is held in
/// working buffers indexed by batch row; sessions swap theirs in and out
/// between forward passes.
#[derive(Debug)]
pub struct Attention {
    shift: ShiftRegister,
    mix_k: Tensor,
    mix_v: Tensor,
    mix_r: Tensor,
    mix_g: Tensor,
    decay: Tensor,
    bonus: Tensor,
    /// `[slots, heads, head_size, head_size]`
    state: Tensor,
    receptance: Linear,
    key: Linear,
    value: Linear,
    gate: Linear,
    output: Linear,
    ln_x: GroupNorm,
    scale: f32,
    gate_activation: GateActivation,
}

impl Attention {
    /// Load `blocks.<layer>.att.*` for a model `channels` wide, with working
    /// state for `slots` batch rows
    pub fn load(
        source: &impl WeightSource,
        layer: usize,
        channels: usize,
        slots: usize,
        config: &ModelConfig,
    ) -> Result<Self, WeightError> {
        let prefix = format!("blocks.{layer}.att");
        let device = config.device;
        if channels % config.head_size != 0 {
            return Err(WeightError::Shape {
                key: format!("{prefix}.time_mix_k"),
                expected: vec![config.head_size],
                actual: vec![channels],
            });
        }
        let heads = channels / config.head_size;
        let vector = |name: &str| load_vector(source, &format!("{prefix}.{name}"), channels, device);
        let linear = |name: &str| {
            Linear::load(source, &format!("{prefix}.{name}"), config.quantize, config.quant_block, device)
        };

        let mut decay = host_vector(source, &format!("{prefix}.time_decay"), channels)?;
        if config.decay == DecayFormat::Raw {
            decay.iter_mut().for_each(|w| *w = (-w.exp()).exp());
        }

        Ok(Self {
            shift: ShiftRegister::new(slots, channels, device)?,
            mix_k: vector("time_mix_k")?,
            mix_v: vector("time_mix_v")?,
            mix_r: vector("time_mix_r")?,
            mix_g: vector("time_mix_g")?,
            decay: Tensor::from_slice(&decay, &[channels]).to_device(device)?,
            bonus: vector("time_faaaa")?,
            state: Tensor::zeros(&[slots, heads, config.head_size, config.head_size], DType::F32, device)?,
            receptance: linear("receptance")?,
            key: linear("key")?,
            value: linear("value")?,
            gate: linear("gate")?,
            output: linear("output")?,
            ln_x: GroupNorm::load(source, &format!("{prefix}.ln_x"), channels, heads, config.group_norm_eps, device)?,
            scale: 1.0 / config.head_size_divisor,
            gate_activation: config.gate,
        })
    }

    /// Run the first `input.shape()[0]` slots over `input`, writing the
    /// projected output into `out`; `workspace` must already be sized for
    /// the input
    pub fn forward(&mut self, input: &Tensor, workspace: &mut Workspace, out: &mut Tensor) -> Result<(), TensorError> {
        let batch = input.shape()[BATCH_DIM];
        let ws = workspace;
        self.shift.shift(input, &mut ws.xx)?;

        ws.xx.lerp(input, &self.mix_k, &mut ws.mixed)?;
        self.key.forward(&ws.mixed, &mut ws.k)?;
        ws.xx.lerp(input, &self.mix_v, &mut ws.mixed)?;
        self.value.forward(&ws.mixed, &mut ws.v)?;
        ws.xx.lerp(input, &self.mix_r, &mut ws.mixed)?;
        self.receptance.forward(&ws.mixed, &mut ws.r)?;
        ws.xx.lerp(input, &self.mix_g, &mut ws.mixed)?;
        self.gate.forward(&ws.mixed, &mut ws.g)?;

        self.state
            .narrow_mut(0, batch)
            .wkv(&ws.r, &ws.k, &ws.v, &self.decay, &self.bonus, &mut ws.wkv)?;

        ws.wkv.multiply_scalar(self.scale, &mut ws.mixed)?;
        self.ln_x.forward(&ws.mixed, &mut ws.normed)?;
        match self.gate_activation {
            GateActivation::Silu => ws.g.swish_mul(&ws.normed, &mut ws.mixed)?,
            GateActivation::Sigmoid => ws.g.sigmoid_mul(&ws.normed, &mut ws.mixed)?,
        }
        self.output.forward(&ws.mixed, out)
    }

    pub(crate) fn wkv_slot(&self, slot: usize) -> TensorView<'_> {
        self.state.get(slot)
    }

    pub(crate) fn wkv_slot_mut(&mut self, slot: usize) -> TensorViewMut<'_> {
        self.state.get_mut(slot)
    }

    pub(crate) fn shift(&self) -> &ShiftRegister {
        &self.shift
    }

    pub(crate) fn shift_mut(&mut self) -> &mut ShiftRegister {
        &mut self.shift
    }

    /// `(heads, head_size)`
    pub fn head_shape(&self) -> (usize, usize) {
        (self.state.shape()[1], self.state.shape()[2])
    }
}
