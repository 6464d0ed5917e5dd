use std::fmt::{Display, Formatter};
use crate::error::TensorError;
use crate::tensor::{TensorView, TensorViewMut};

/// Where a tensor's buffer lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    #[default]
    Cpu,
    Accelerator,
}

impl Display for Device {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Accelerator => f.write_str("accelerator"),
        }
    }
}

/// Pointwise activations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// `max(x, 0)`
    Relu,
    /// `max(x, 0)²`
    ReluSquare,
    /// `1 / (1 + e^-x)`
    Sigmoid,
}

/// Activations applied to one operand and multiplied into another
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// `m · σ(x)`
    Sigmoid,
    /// `m · x · σ(x)`
    Swish,
}

/// The primitive set every execution path must provide.
///
/// Callers go through [`crate::tensor::TensorOps`], which checks that all
/// operands share one device and have compatible shapes before picking a
/// backend, so implementations may assume both. Every method returns only
/// after the result is fully written.
///
/// A backend that cannot run a primitive for the given operands returns
/// [`TensorError::Unsupported`] rather than leaving `out` untouched silently.
pub trait TensorBackend: Send + Sync {
    /// The device whose tensors this backend operates on
    fn device(&self) -> Device;

    fn fill(&self, out: &mut TensorViewMut<'_>, value: f32) -> Result<(), TensorError>;

    /// Byte-for-byte copy between two windows of equal dtype and size
    fn copy(&self, src: &TensorView<'_>, dst: &mut TensorViewMut<'_>) -> Result<(), TensorError>;

    fn add(&self, a: &TensorView<'_>, b: &TensorView<'_>, out: &mut TensorViewMut<'_>) -> Result<(), TensorError>;

    /// `x += y`, with `y` either the same size as `x` or one row broadcast over it
    fn add_assign(&self, x: &mut TensorViewMut<'_>, y: &TensorView<'_>) -> Result<(), TensorError>;

    fn add_scalar(&self, a: &TensorView<'_>, value: f32, out: &mut TensorViewMut<'_>) -> Result<(), TensorError>;

    fn multiply(&self, a: &TensorView<'_>, b: &TensorView<'_>, out: &mut TensorViewMut<'_>) -> Result<(), TensorError>;

    fn multiply_scalar(&self, a: &TensorView<'_>, value: f32, out: &mut TensorViewMut<'_>) -> Result<(), TensorError>;

    /// `out = b · w + a · (1 − w)` with `weight` broadcast along the trailing dimension
    fn lerp(
        &self,
        weight: &TensorView<'_>,
        a: &TensorView<'_>,
        b: &TensorView<'_>,
        out: &mut TensorViewMut<'_>,
    ) -> Result<(), TensorError>;

    /// Normalize every row over the trailing dimension, then scale and shift
    fn layer_norm(
        &self,
        x: &TensorView<'_>,
        weight: &TensorView<'_>,
        bias: &TensorView<'_>,
        eps: f32,
        out: &mut TensorViewMut<'_>,
    ) -> Result<(), TensorError>;

    /// Like [`TensorBackend::layer_norm`] but statistics are taken per group
    /// of `last_dim / groups` channels
    fn group_norm(
        &self,
        x: &TensorView<'_>,
        weight: &TensorView<'_>,
        bias: &TensorView<'_>,
        groups: usize,
        eps: f32,
        out: &mut TensorViewMut<'_>,
    ) -> Result<(), TensorError>;

    /// Softmax over every element of the window, in place
    fn softmax(&self, x: &mut TensorViewMut<'_>) -> Result<(), TensorError>;

    /// `out[b, t] = table[indices[b][t]]`
    fn gather(&self, table: &TensorView<'_>, indices: &[Vec<u32>], out: &mut TensorViewMut<'_>) -> Result<(), TensorError>;

    fn activation(&self, kind: Activation, x: &TensorView<'_>, out: &mut TensorViewMut<'_>) -> Result<(), TensorError>;

    fn gated(
        &self,
        kind: Gate,
        x: &TensorView<'_>,
        mult: &TensorView<'_>,
        out: &mut TensorViewMut<'_>,
    ) -> Result<(), TensorError>;

    /// `out[.., o] = Σ_k weight[o, k] · input[.., k]` for an f32 or bf16 weight
    fn matmul(&self, weight: &TensorView<'_>, input: &TensorView<'_>, out: &mut TensorViewMut<'_>) -> Result<(), TensorError>;

    /// Like [`TensorBackend::matmul`] with a u8 weight dequantized per block
    /// as `q · scale[o, block] + offset[o, block]`
    fn matmul_quantized(
        &self,
        weight: &TensorView<'_>,
        scale: &TensorView<'_>,
        offset: &TensorView<'_>,
        input: &TensorView<'_>,
        out: &mut TensorViewMut<'_>,
    ) -> Result<(), TensorError>;

    /// The recurrent attention kernel.
    ///
    /// `state` is `[batch, heads, size, size]`; `r`, `k`, `v` and `out` are
    /// `[batch, time, heads · size]`; `decay` and `bonus` hold `heads · size`
    /// values. For each head and timestep:
    ///
    /// ```text
    /// out_t[j] = Σ_i r_t[i] · (S[i, j] + bonus[i] · k_t[i] · v_t[j])
    /// S[i, j]  ← decay[i] · S[i, j] + k_t[i] · v_t[j]
    /// ```
    #[allow(clippy::too_many_arguments)]
    fn wkv(
        &self,
        state: &mut TensorViewMut<'_>,
        r: &TensorView<'_>,
        k: &TensorView<'_>,
        v: &TensorView<'_>,
        decay: &TensorView<'_>,
        bonus: &TensorView<'_>,
        out: &mut TensorViewMut<'_>,
    ) -> Result<(), TensorError>;
}
