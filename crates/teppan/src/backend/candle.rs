use std::sync::OnceLock;
use candle_core::{D, Tensor};
use tracing::info;
use crate::error::TensorError;
use crate::tensor::{AsView, DType, TensorView, TensorViewMut};
use super::{Activation, Device, Gate, TensorBackend};

/// Backend for [`Device::Accelerator`] tensors.
///
/// The candle device is picked once per process: CUDA if present, then
/// Metal, then candle's own host device.
pub struct AcceleratorBackend {
    device: candle_core::Device,
}

static ACCELERATOR: OnceLock<AcceleratorBackend> = OnceLock::new();

impl AcceleratorBackend {
    pub fn global() -> &'static AcceleratorBackend {
        ACCELERATOR.get_or_init(|| {
            let device = select_device();
            info!(device = ?device, "accelerator backend initialized");
            AcceleratorBackend { device }
        })
    }

    pub fn candle_device(&self) -> &candle_core::Device {
        &self.device
    }
}

fn select_device() -> candle_core::Device {
    if candle_core::utils::cuda_is_available() {
        if let Ok(device) = candle_core::Device::new_cuda(0) {
            return device;
        }
    }
    if candle_core::utils::metal_is_available() {
        if let Ok(device) = candle_core::Device::new_metal(0) {
            return device;
        }
    }
    candle_core::Device::Cpu
}

fn candle_dtype(dtype: DType) -> Result<candle_core::DType, TensorError> {
    let mapped = match dtype {
        DType::U8 | DType::Bool => candle_core::DType::U8,
        DType::U32 => candle_core::DType::U32,
        DType::I64 => candle_core::DType::I64,
        DType::BF16 => candle_core::DType::BF16,
        DType::F16 => candle_core::DType::F16,
        DType::F32 => candle_core::DType::F32,
        DType::F64 => candle_core::DType::F64,
        _ => return Err(TensorError::Unsupported { op: "element type", device: Device::Accelerator }),
    };
    Ok(mapped)
}

/// A flat device tensor holding `bytes` of `dtype`
pub(crate) fn upload(bytes: &[u8], dtype: DType) -> Result<Tensor, TensorError> {
    let count = bytes.len() / dtype.size_in_bytes();
    let device = AcceleratorBackend::global().candle_device();
    Ok(Tensor::from_raw_buffer(bytes, candle_dtype(dtype)?, &[count], device)?)
}

pub(crate) fn zeros(count: usize, dtype: DType) -> Result<Tensor, TensorError> {
    let device = AcceleratorBackend::global().candle_device();
    Ok(Tensor::zeros(count, candle_dtype(dtype)?, device)?)
}

fn host_bytes<T>(tensor: &Tensor) -> Result<Vec<u8>, TensorError>
where
    T: candle_core::WithDType + bytemuck::Pod,
{
    let values = tensor.flatten_all()?.to_vec1::<T>()?;
    Ok(bytemuck::cast_slice(&values).to_vec())
}

/// Copy a device tensor into an aligned host buffer
pub(crate) fn download(
    tensor: &Tensor,
    dtype: DType,
) -> Result<crate::tensor::AlignedBuffer, TensorError> {
    let bytes = match candle_dtype(dtype)? {
        candle_core::DType::U8 => host_bytes::<u8>(tensor)?,
        candle_core::DType::U32 => host_bytes::<u32>(tensor)?,
        candle_core::DType::I64 => host_bytes::<i64>(tensor)?,
        candle_core::DType::BF16 => host_bytes::<half::bf16>(tensor)?,
        candle_core::DType::F16 => host_bytes::<half::f16>(tensor)?,
        candle_core::DType::F32 => host_bytes::<f32>(tensor)?,
        candle_core::DType::F64 => host_bytes::<f64>(tensor)?,
    };
    Ok(crate::tensor::AlignedBuffer::from_bytes(&bytes))
}

/// `b` shaped so it broadcasts against a tensor of `shape`
fn broadcastable(b: &TensorView<'_>, shape: &[usize]) -> Result<Tensor, TensorError> {
    let tensor = b.device_tensor()?;
    if b.element_count() == shape.iter().product::<usize>() {
        Ok(tensor.reshape(shape)?)
    } else {
        Ok(tensor.flatten_all()?)
    }
}

fn as_f32(view: &TensorView<'_>) -> Result<Tensor, TensorError> {
    Ok(view.device_tensor()?.to_dtype(candle_core::DType::F32)?)
}

fn sigmoid(x: &Tensor) -> Result<Tensor, TensorError> {
    Ok(x.neg()?.exp()?.affine(1.0, 1.0)?.recip()?)
}

/// Normalize over the last dimension without scale or shift
fn standardize(x: &Tensor, eps: f32) -> Result<Tensor, TensorError> {
    let mean = x.mean_keepdim(D::Minus1)?;
    let centered = x.broadcast_sub(&mean)?;
    let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
    Ok(centered.broadcast_div(&variance.affine(1.0, eps as f64)?.sqrt()?)?)
}

impl TensorBackend for AcceleratorBackend {
    fn device(&self) -> Device {
        Device::Accelerator
    }

    fn fill(&self, out: &mut TensorViewMut<'_>, value: f32) -> Result<(), TensorError> {
        let dtype = candle_dtype(out.dtype())?;
        let filled = Tensor::full(value, out.element_count(), &self.device)?.to_dtype(dtype)?;
        out.write_device(&filled)
    }

    fn copy(&self, src: &TensorView<'_>, dst: &mut TensorViewMut<'_>) -> Result<(), TensorError> {
        dst.write_device(&src.device_tensor()?)
    }

    fn add(&self, a: &TensorView<'_>, b: &TensorView<'_>, out: &mut TensorViewMut<'_>) -> Result<(), TensorError> {
        let sum = a.device_tensor()?.broadcast_add(&broadcastable(b, a.shape())?)?;
        out.write_device(&sum)
    }

    fn add_assign(&self, x: &mut TensorViewMut<'_>, y: &TensorView<'_>) -> Result<(), TensorError> {
        let current = x.view();
        let sum = current.device_tensor()?.broadcast_add(&broadcastable(y, current.shape())?)?;
        x.write_device(&sum)
    }

    fn add_scalar(&self, a: &TensorView<'_>, value: f32, out: &mut TensorViewMut<'_>) -> Result<(), TensorError> {
        out.write_device(&a.device_tensor()?.affine(1.0, value as f64)?)
    }

    fn multiply(&self, a: &TensorView<'_>, b: &TensorView<'_>, out: &mut TensorViewMut<'_>) -> Result<(), TensorError> {
        let product = a.device_tensor()?.broadcast_mul(&broadcastable(b, a.shape())?)?;
        out.write_device(&product)
    }

    fn multiply_scalar(&self, a: &TensorView<'_>, value: f32, out: &mut TensorViewMut<'_>) -> Result<(), TensorError> {
        out.write_device(&a.device_tensor()?.affine(value as f64, 0.0)?)
    }

    fn lerp(
        &self,
        weight: &TensorView<'_>,
        a: &TensorView<'_>,
        b: &TensorView<'_>,
        out: &mut TensorViewMut<'_>,
    ) -> Result<(), TensorError> {
        let (a, b) = (a.device_tensor()?, b.device_tensor()?);
        let weight = weight.device_tensor()?.flatten_all()?;
        let mixed = a.broadcast_add(&(b - &a)?.broadcast_mul(&weight)?)?;
        out.write_device(&mixed)
    }

    fn layer_norm(
        &self,
        x: &TensorView<'_>,
        weight: &TensorView<'_>,
        bias: &TensorView<'_>,
        eps: f32,
        out: &mut TensorViewMut<'_>,
    ) -> Result<(), TensorError> {
        let normalized = standardize(&x.device_tensor()?, eps)?
            .broadcast_mul(&weight.device_tensor()?.flatten_all()?)?
            .broadcast_add(&bias.device_tensor()?.flatten_all()?)?;
        out.write_device(&normalized)
    }

    fn group_norm(
        &self,
        x: &TensorView<'_>,
        weight: &TensorView<'_>,
        bias: &TensorView<'_>,
        groups: usize,
        eps: f32,
        out: &mut TensorViewMut<'_>,
    ) -> Result<(), TensorError> {
        let width = x.last_dim();
        let rows = x.element_count() / width;
        let grouped = x.device_tensor()?.reshape((rows, groups, width / groups))?;
        let normalized = standardize(&grouped, eps)?
            .reshape((rows, width))?
            .broadcast_mul(&weight.device_tensor()?.flatten_all()?)?
            .broadcast_add(&bias.device_tensor()?.flatten_all()?)?;
        out.write_device(&normalized)
    }

    fn softmax(&self, x: &mut TensorViewMut<'_>) -> Result<(), TensorError> {
        let flat = x.view().device_tensor()?.flatten_all()?;
        let shifted = flat.broadcast_sub(&flat.max_keepdim(0)?)?.exp()?;
        let normalized = shifted.broadcast_div(&shifted.sum_keepdim(0)?)?;
        x.write_device(&normalized)
    }

    fn gather(&self, table: &TensorView<'_>, indices: &[Vec<u32>], out: &mut TensorViewMut<'_>) -> Result<(), TensorError> {
        let ids: Vec<u32> = indices.iter().flatten().copied().collect();
        let ids = Tensor::new(ids.as_slice(), &self.device)?;
        let rows = table.device_tensor()?.index_select(&ids, 0)?;
        out.write_device(&rows.to_dtype(candle_core::DType::F32)?)
    }

    fn activation(&self, kind: Activation, x: &TensorView<'_>, out: &mut TensorViewMut<'_>) -> Result<(), TensorError> {
        let x = x.device_tensor()?;
        let activated = match kind {
            Activation::Relu => x.relu()?,
            Activation::ReluSquare => x.relu()?.sqr()?,
            Activation::Sigmoid => sigmoid(&x)?,
        };
        out.write_device(&activated)
    }

    fn gated(
        &self,
        kind: Gate,
        x: &TensorView<'_>,
        mult: &TensorView<'_>,
        out: &mut TensorViewMut<'_>,
    ) -> Result<(), TensorError> {
        let x = x.device_tensor()?;
        let gate = match kind {
            Gate::Sigmoid => sigmoid(&x)?,
            Gate::Swish => x.silu()?,
        };
        out.write_device(&(gate * mult.device_tensor()?)?)
    }

    fn matmul(&self, weight: &TensorView<'_>, input: &TensorView<'_>, out: &mut TensorViewMut<'_>) -> Result<(), TensorError> {
        let inputs = weight.shape()[1];
        let rows = input.element_count() / inputs;
        let input = input.device_tensor()?.reshape((rows, inputs))?;
        let product = input.matmul(&as_f32(weight)?.t()?)?;
        out.write_device(&product)
    }

    fn matmul_quantized(
        &self,
        weight: &TensorView<'_>,
        scale: &TensorView<'_>,
        offset: &TensorView<'_>,
        input: &TensorView<'_>,
        out: &mut TensorViewMut<'_>,
    ) -> Result<(), TensorError> {
        let (outputs, inputs) = (weight.shape()[0], weight.shape()[1]);
        let blocks = scale.last_dim();
        let dequantized = as_f32(weight)?
            .reshape((outputs, blocks, inputs / blocks))?
            .broadcast_mul(&scale.device_tensor()?.reshape((outputs, blocks, 1))?)?
            .broadcast_add(&offset.device_tensor()?.reshape((outputs, blocks, 1))?)?
            .reshape((outputs, inputs))?;
        let rows = input.element_count() / inputs;
        let input = input.device_tensor()?.reshape((rows, inputs))?;
        out.write_device(&input.matmul(&dequantized.t()?)?)
    }

    fn wkv(
        &self,
        state: &mut TensorViewMut<'_>,
        r: &TensorView<'_>,
        k: &TensorView<'_>,
        v: &TensorView<'_>,
        decay: &TensorView<'_>,
        bonus: &TensorView<'_>,
        out: &mut TensorViewMut<'_>,
    ) -> Result<(), TensorError> {
        let (batch, heads, size) = (state.shape()[0], state.shape()[1], state.shape()[2]);
        let time = r.shape()[1];
        let split_heads = |t: &TensorView<'_>| -> Result<Tensor, TensorError> {
            Ok(t.device_tensor()?.reshape((batch, time, heads, size))?)
        };
        let (r, k, v) = (split_heads(r)?, split_heads(k)?, split_heads(v)?);
        let decay = decay.device_tensor()?.reshape((1, heads, size, 1))?;
        let bonus = bonus.device_tensor()?.reshape((1, heads, size, 1))?;

        let mut current = state.view().device_tensor()?;
        let mut outputs = Vec::with_capacity(time);
        for t in 0..time {
            let step = |x: &Tensor, shape: (usize, usize, usize, usize)| -> Result<Tensor, TensorError> {
                Ok(x.narrow(1, t, 1)?.contiguous()?.reshape(shape)?)
            };
            let r_t = step(&r, (batch, heads, 1, size))?;
            let k_t = step(&k, (batch, heads, size, 1))?;
            let v_t = step(&v, (batch, heads, 1, size))?;
            let kv = k_t.matmul(&v_t)?;
            let attended = current.broadcast_add(&kv.broadcast_mul(&bonus)?)?;
            outputs.push(r_t.matmul(&attended)?.reshape((batch, 1, heads * size))?);
            current = current.broadcast_mul(&decay)?.broadcast_add(&kv)?;
        }
        state.write_device(&current)?;
        out.write_device(&Tensor::cat(&outputs, 1)?)
    }
}
