//! Host execution path. Every primitive runs over f32 lanes of
//! [`SIMD_WIDTH`] with a scalar loop for the remainder.

use half::bf16;
use half::slice::HalfFloatSliceExt;
use wide::f32x8;
use crate::error::TensorError;
use crate::tensor::constant::SIMD_WIDTH;
use crate::tensor::{DType, TensorView, TensorViewMut};
use super::{Activation, Device, Gate, TensorBackend};

/// Vectorized host backend
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

fn split(x: &[f32]) -> (&[[f32; SIMD_WIDTH]], &[f32]) {
    let (head, tail) = x.split_at(x.len() - x.len() % SIMD_WIDTH);
    (bytemuck::cast_slice(head), tail)
}

fn split_mut(x: &mut [f32]) -> (&mut [[f32; SIMD_WIDTH]], &mut [f32]) {
    let len = x.len();
    let (head, tail) = x.split_at_mut(len - len % SIMD_WIDTH);
    (bytemuck::cast_slice_mut(head), tail)
}

fn map_unary(
    x: &[f32],
    out: &mut [f32],
    simd: impl Fn(f32x8) -> f32x8,
    scalar: impl Fn(f32) -> f32,
) {
    let (x_head, x_tail) = split(x);
    let (out_head, out_tail) = split_mut(out);
    for (o, x) in out_head.iter_mut().zip(x_head) {
        *o = simd(f32x8::from(*x)).to_array();
    }
    for (o, x) in out_tail.iter_mut().zip(x_tail) {
        *o = scalar(*x);
    }
}

fn map_binary(
    a: &[f32],
    b: &[f32],
    out: &mut [f32],
    simd: impl Fn(f32x8, f32x8) -> f32x8,
    scalar: impl Fn(f32, f32) -> f32,
) {
    let (a_head, a_tail) = split(a);
    let (b_head, b_tail) = split(b);
    let (out_head, out_tail) = split_mut(out);
    for ((o, a), b) in out_head.iter_mut().zip(a_head).zip(b_head) {
        *o = simd(f32x8::from(*a), f32x8::from(*b)).to_array();
    }
    for ((o, a), b) in out_tail.iter_mut().zip(a_tail).zip(b_tail) {
        *o = scalar(*a, *b);
    }
}

/// Apply `map_binary` row by row when `b` is a single row broadcast over `a`
fn broadcast_binary(
    a: &[f32],
    b: &[f32],
    out: &mut [f32],
    simd: impl Fn(f32x8, f32x8) -> f32x8 + Copy,
    scalar: impl Fn(f32, f32) -> f32 + Copy,
) {
    if a.len() == b.len() {
        map_binary(a, b, out, simd, scalar);
        return;
    }
    for (a, out) in a.chunks_exact(b.len()).zip(out.chunks_exact_mut(b.len())) {
        map_binary(a, b, out, simd, scalar);
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    let (a_head, a_tail) = split(a);
    let (b_head, b_tail) = split(b);
    let mut acc = f32x8::ZERO;
    for (a, b) in a_head.iter().zip(b_head) {
        acc = f32x8::from(*a).mul_add(f32x8::from(*b), acc);
    }
    acc.reduce_add() + a_tail.iter().zip(b_tail).map(|(a, b)| a * b).sum::<f32>()
}

fn sum(x: &[f32]) -> f32 {
    let (head, tail) = split(x);
    let acc = head.iter().fold(f32x8::ZERO, |acc, x| acc + f32x8::from(*x));
    acc.reduce_add() + tail.iter().sum::<f32>()
}

fn sigmoid_lanes(x: f32x8) -> f32x8 {
    let one = f32x8::splat(1.0);
    one / (one + (-x).exp())
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Normalize `x` into `out`, then apply `weight` and `bias`
fn normalize(x: &[f32], weight: &[f32], bias: &[f32], eps: f32, out: &mut [f32]) {
    let n = x.len() as f32;
    let mean = sum(x) / n;
    let variance = x.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
    let inv_std = 1.0 / (variance + eps).sqrt();
    for (((o, x), w), b) in out.iter_mut().zip(x).zip(weight).zip(bias) {
        *o = (x - mean) * inv_std * w + b;
    }
}

impl TensorBackend for CpuBackend {
    fn device(&self) -> Device {
        Device::Cpu
    }

    fn fill(&self, out: &mut TensorViewMut<'_>, value: f32) -> Result<(), TensorError> {
        out.as_slice_mut::<f32>()?.fill(value);
        Ok(())
    }

    fn copy(&self, src: &TensorView<'_>, dst: &mut TensorViewMut<'_>) -> Result<(), TensorError> {
        dst.host_bytes_mut()?.copy_from_slice(src.host_bytes()?);
        Ok(())
    }

    fn add(&self, a: &TensorView<'_>, b: &TensorView<'_>, out: &mut TensorViewMut<'_>) -> Result<(), TensorError> {
        broadcast_binary(a.as_slice()?, b.as_slice()?, out.as_slice_mut()?, |a, b| a + b, |a, b| a + b);
        Ok(())
    }

    fn add_assign(&self, x: &mut TensorViewMut<'_>, y: &TensorView<'_>) -> Result<(), TensorError> {
        let y = y.as_slice::<f32>()?;
        let x = x.as_slice_mut::<f32>()?;
        for rows in x.chunks_exact_mut(y.len()) {
            let (x_head, x_tail) = split_mut(rows);
            let (y_head, y_tail) = split(y);
            for (x, y) in x_head.iter_mut().zip(y_head) {
                *x = (f32x8::from(*x) + f32x8::from(*y)).to_array();
            }
            for (x, y) in x_tail.iter_mut().zip(y_tail) {
                *x += y;
            }
        }
        Ok(())
    }

    fn add_scalar(&self, a: &TensorView<'_>, value: f32, out: &mut TensorViewMut<'_>) -> Result<(), TensorError> {
        let lanes = f32x8::splat(value);
        map_unary(a.as_slice()?, out.as_slice_mut()?, |x| x + lanes, |x| x + value);
        Ok(())
    }

    fn multiply(&self, a: &TensorView<'_>, b: &TensorView<'_>, out: &mut TensorViewMut<'_>) -> Result<(), TensorError> {
        broadcast_binary(a.as_slice()?, b.as_slice()?, out.as_slice_mut()?, |a, b| a * b, |a, b| a * b);
        Ok(())
    }

    fn multiply_scalar(&self, a: &TensorView<'_>, value: f32, out: &mut TensorViewMut<'_>) -> Result<(), TensorError> {
        let lanes = f32x8::splat(value);
        map_unary(a.as_slice()?, out.as_slice_mut()?, |x| x * lanes, |x| x * value);
        Ok(())
    }

    fn lerp(
        &self,
        weight: &TensorView<'_>,
        a: &TensorView<'_>,
        b: &TensorView<'_>,
        out: &mut TensorViewMut<'_>,
    ) -> Result<(), TensorError> {
        let weight = weight.as_slice::<f32>()?;
        let (a, b) = (a.as_slice::<f32>()?, b.as_slice::<f32>()?);
        let out = out.as_slice_mut::<f32>()?;
        let width = weight.len();
        let rows = a.chunks_exact(width).zip(b.chunks_exact(width)).zip(out.chunks_exact_mut(width));
        for ((a, b), out) in rows {
            // a + w · (b − a)
            let (w_head, w_tail) = split(weight);
            let (a_head, a_tail) = split(a);
            let (b_head, b_tail) = split(b);
            let (out_head, out_tail) = split_mut(out);
            for (((o, w), a), b) in out_head.iter_mut().zip(w_head).zip(a_head).zip(b_head) {
                let a = f32x8::from(*a);
                *o = f32x8::from(*w).mul_add(f32x8::from(*b) - a, a).to_array();
            }
            for (((o, w), a), b) in out_tail.iter_mut().zip(w_tail).zip(a_tail).zip(b_tail) {
                *o = b * w + a * (1.0 - w);
            }
        }
        Ok(())
    }

    fn layer_norm(
        &self,
        x: &TensorView<'_>,
        weight: &TensorView<'_>,
        bias: &TensorView<'_>,
        eps: f32,
        out: &mut TensorViewMut<'_>,
    ) -> Result<(), TensorError> {
        let (weight, bias) = (weight.as_slice::<f32>()?, bias.as_slice::<f32>()?);
        let width = x.last_dim();
        let x = x.as_slice::<f32>()?;
        let out = out.as_slice_mut::<f32>()?;
        for (x, out) in x.chunks_exact(width).zip(out.chunks_exact_mut(width)) {
            normalize(x, weight, bias, eps, out);
        }
        Ok(())
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
        let (weight, bias) = (weight.as_slice::<f32>()?, bias.as_slice::<f32>()?);
        let group = x.last_dim() / groups;
        let x = x.as_slice::<f32>()?;
        let out = out.as_slice_mut::<f32>()?;
        // chunk index modulo `groups` picks the channel range within a row
        let chunks = x.chunks_exact(group).zip(out.chunks_exact_mut(group)).enumerate();
        for (index, (x, out)) in chunks {
            let channel = (index % groups) * group;
            normalize(x, &weight[channel..channel + group], &bias[channel..channel + group], eps, out);
        }
        Ok(())
    }

    fn softmax(&self, x: &mut TensorViewMut<'_>) -> Result<(), TensorError> {
        let x = x.as_slice_mut::<f32>()?;
        let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        for v in x.iter_mut() {
            *v = (*v - max).exp();
        }
        let total = sum(x);
        for v in x.iter_mut() {
            *v /= total;
        }
        Ok(())
    }

    fn gather(&self, table: &TensorView<'_>, indices: &[Vec<u32>], out: &mut TensorViewMut<'_>) -> Result<(), TensorError> {
        let width = table.last_dim();
        let out = out.as_slice_mut::<f32>()?;
        let tokens = indices.iter().flatten();
        for (token, row) in tokens.zip(out.chunks_exact_mut(width)) {
            let source = table.get(*token as usize);
            match source.dtype() {
                DType::BF16 => source.as_slice::<bf16>()?.convert_to_f32_slice(row),
                _ => row.copy_from_slice(source.as_slice::<f32>()?),
            }
        }
        Ok(())
    }

    fn activation(&self, kind: Activation, x: &TensorView<'_>, out: &mut TensorViewMut<'_>) -> Result<(), TensorError> {
        let (x, out) = (x.as_slice::<f32>()?, out.as_slice_mut::<f32>()?);
        match kind {
            Activation::Relu => map_unary(x, out, |x| x.max(f32x8::ZERO), |x| x.max(0.0)),
            Activation::ReluSquare => map_unary(
                x,
                out,
                |x| {
                    let r = x.max(f32x8::ZERO);
                    r * r
                },
                |x| x.max(0.0) * x.max(0.0),
            ),
            Activation::Sigmoid => map_unary(x, out, sigmoid_lanes, sigmoid),
        }
        Ok(())
    }

    fn gated(
        &self,
        kind: Gate,
        x: &TensorView<'_>,
        mult: &TensorView<'_>,
        out: &mut TensorViewMut<'_>,
    ) -> Result<(), TensorError> {
        let (x, mult) = (x.as_slice::<f32>()?, mult.as_slice::<f32>()?);
        let out = out.as_slice_mut::<f32>()?;
        match kind {
            Gate::Sigmoid => map_binary(x, mult, out, |x, m| m * sigmoid_lanes(x), |x, m| m * sigmoid(x)),
            Gate::Swish => map_binary(x, mult, out, |x, m| m * x * sigmoid_lanes(x), |x, m| m * x * sigmoid(x)),
        }
        Ok(())
    }

    fn matmul(&self, weight: &TensorView<'_>, input: &TensorView<'_>, out: &mut TensorViewMut<'_>) -> Result<(), TensorError> {
        let (outputs, inputs) = (weight.shape()[0], weight.shape()[1]);
        let input = input.as_slice::<f32>()?;
        let out = out.as_slice_mut::<f32>()?;
        let mut scratch = vec![0f32; inputs];
        for o in 0..outputs {
            let row: &[f32] = match weight.dtype() {
                DType::BF16 => {
                    weight.get(o).as_slice::<bf16>()?.convert_to_f32_slice(&mut scratch);
                    &scratch
                }
                _ => weight.get(o).as_slice::<f32>()?,
            };
            for (n, x) in input.chunks_exact(inputs).enumerate() {
                out[n * outputs + o] = dot(row, x);
            }
        }
        Ok(())
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
        let block = inputs / scale.last_dim();
        let input = input.as_slice::<f32>()?;
        let out = out.as_slice_mut::<f32>()?;
        let mut row = vec![0f32; inputs];
        for o in 0..outputs {
            let quantized = weight.get(o).as_slice::<u8>()?;
            let scales = scale.get(o).as_slice::<f32>()?;
            let offsets = offset.get(o).as_slice::<f32>()?;
            let blocks = row.chunks_exact_mut(block).zip(quantized.chunks_exact(block));
            for (index, (dequantized, quantized)) in blocks.enumerate() {
                let (s, z) = (scales[index], offsets[index]);
                for (d, q) in dequantized.iter_mut().zip(quantized) {
                    *d = *q as f32 * s + z;
                }
            }
            for (n, x) in input.chunks_exact(inputs).enumerate() {
                out[n * outputs + o] = dot(&row, x);
            }
        }
        Ok(())
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
        let channels = heads * size;
        let (r, k, v) = (r.as_slice::<f32>()?, k.as_slice::<f32>()?, v.as_slice::<f32>()?);
        let (decay, bonus) = (decay.as_slice::<f32>()?, bonus.as_slice::<f32>()?);
        let state = state.as_slice_mut::<f32>()?;
        let out = out.as_slice_mut::<f32>()?;
        out.fill(0.0);

        for b in 0..batch {
            for h in 0..heads {
                let head_state = &mut state[(b * heads + h) * size * size..][..size * size];
                let (decay, bonus) = (&decay[h * size..][..size], &bonus[h * size..][..size]);
                for t in 0..time {
                    let base = (b * time + t) * channels + h * size;
                    let (r, k, v) = (&r[base..][..size], &k[base..][..size], &v[base..][..size]);
                    let out = &mut out[base..][..size];
                    for (i, s) in head_state.chunks_exact_mut(size).enumerate() {
                        let (r_i, k_i) = (f32x8::splat(r[i]), f32x8::splat(k[i]));
                        let (u_i, w_i) = (f32x8::splat(bonus[i]), f32x8::splat(decay[i]));
                        let (s_head, s_tail) = split_mut(s);
                        let (o_head, o_tail) = split_mut(out);
                        let (v_head, v_tail) = split(v);
                        for ((s, o), v) in s_head.iter_mut().zip(o_head.iter_mut()).zip(v_head) {
                            let kv = k_i * f32x8::from(*v);
                            let current = f32x8::from(*s);
                            *o = r_i.mul_add(u_i.mul_add(kv, current), f32x8::from(*o)).to_array();
                            *s = w_i.mul_add(current, kv).to_array();
                        }
                        for ((s, o), v) in s_tail.iter_mut().zip(o_tail.iter_mut()).zip(v_tail) {
                            let kv = k[i] * v;
                            *o += r[i] * (*s + bonus[i] * kv);
                            *s = decay[i] * *s + kv;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
