//! Tensor primitives as extension traits.
//!
//! Every primitive checks its operands, picks the backend for their device
//! via [`backend_for`], and returns once the result is written. Operands on
//! different devices and incompatible shapes are programming errors and
//! panic; a device that cannot run a primitive yields
//! [`TensorError::Unsupported`].
//!
//! Binary primitives accept a right-hand operand that is either the same size
//! as the left one or a single trailing row broadcast over it.

use tracing::warn;
use crate::backend::{backend_for, Activation, Device, Gate, TensorBackend};
use crate::error::TensorError;
use super::dtype::DType;
use super::view::{AsView, AsViewMut};

fn same_device(op: &str, devices: &[Device]) -> Device {
    let first = devices[0];
    assert!(
        devices.iter().all(|d| *d == first),
        "{op}: operands span devices {:?}",
        devices
    );
    first
}

fn same_shape(op: &str, expected: &[usize], actual: &[usize]) {
    assert_eq!(expected, actual, "{op}: shape mismatch");
}

/// `b` must match `a` in size or be exactly one row of `a`
fn broadcast_row(op: &str, a: &[usize], b: &[usize]) {
    let (a_count, b_count): (usize, usize) = (a.iter().product(), b.iter().product());
    let row = a.last().copied().unwrap_or(1);
    assert!(
        b_count == a_count || b_count == row,
        "{op}: cannot broadcast {:?} over {:?}",
        b, a
    );
}

fn run(
    op: &'static str,
    device: Device,
    call: impl FnOnce(&dyn TensorBackend) -> Result<(), TensorError>,
) -> Result<(), TensorError> {
    let result = backend_for(device).and_then(call);
    if let Err(TensorError::Unsupported { op: detail, device }) = &result {
        warn!(op, detail, %device, "primitive unsupported");
    }
    result
}

/// Read-side primitives; the receiver is the first operand and results land
/// in a caller-provided `out`
pub trait TensorOps: AsView {
    /// `out = self + other`
    fn add(&self, other: &impl AsView, out: &mut impl AsViewMut) -> Result<(), TensorError> {
        let (a, b, mut out) = (self.view(), other.view(), out.view_mut());
        let device = same_device("add", &[a.device(), b.device(), out.device()]);
        broadcast_row("add", a.shape(), b.shape());
        same_shape("add", a.shape(), out.shape());
        run("add", device, |backend| backend.add(&a, &b, &mut out))
    }

    fn add_scalar(&self, value: f32, out: &mut impl AsViewMut) -> Result<(), TensorError> {
        let (a, mut out) = (self.view(), out.view_mut());
        let device = same_device("add_scalar", &[a.device(), out.device()]);
        same_shape("add_scalar", a.shape(), out.shape());
        run("add_scalar", device, |backend| backend.add_scalar(&a, value, &mut out))
    }

    /// `out = self · other`, elementwise
    fn multiply(&self, other: &impl AsView, out: &mut impl AsViewMut) -> Result<(), TensorError> {
        let (a, b, mut out) = (self.view(), other.view(), out.view_mut());
        let device = same_device("multiply", &[a.device(), b.device(), out.device()]);
        broadcast_row("multiply", a.shape(), b.shape());
        same_shape("multiply", a.shape(), out.shape());
        run("multiply", device, |backend| backend.multiply(&a, &b, &mut out))
    }

    fn multiply_scalar(&self, value: f32, out: &mut impl AsViewMut) -> Result<(), TensorError> {
        let (a, mut out) = (self.view(), out.view_mut());
        let device = same_device("multiply_scalar", &[a.device(), out.device()]);
        same_shape("multiply_scalar", a.shape(), out.shape());
        run("multiply_scalar", device, |backend| backend.multiply_scalar(&a, value, &mut out))
    }

    /// `out = toward · weight + self · (1 − weight)`, `weight` being one row
    /// broadcast along the leading dimensions
    fn lerp(&self, toward: &impl AsView, weight: &impl AsView, out: &mut impl AsViewMut) -> Result<(), TensorError> {
        let (a, b, w, mut out) = (self.view(), toward.view(), weight.view(), out.view_mut());
        let device = same_device("lerp", &[a.device(), b.device(), w.device(), out.device()]);
        same_shape("lerp", a.shape(), b.shape());
        same_shape("lerp", a.shape(), out.shape());
        assert_eq!(w.element_count(), a.last_dim(), "lerp: weight must hold one row");
        run("lerp", device, |backend| backend.lerp(&w, &a, &b, &mut out))
    }

    fn layer_norm(
        &self,
        weight: &impl AsView,
        bias: &impl AsView,
        eps: f32,
        out: &mut impl AsViewMut,
    ) -> Result<(), TensorError> {
        let (x, w, b, mut out) = (self.view(), weight.view(), bias.view(), out.view_mut());
        let device = same_device("layer_norm", &[x.device(), w.device(), b.device(), out.device()]);
        same_shape("layer_norm", x.shape(), out.shape());
        assert_eq!(w.element_count(), x.last_dim(), "layer_norm: weight must hold one row");
        assert_eq!(b.element_count(), x.last_dim(), "layer_norm: bias must hold one row");
        run("layer_norm", device, |backend| backend.layer_norm(&x, &w, &b, eps, &mut out))
    }

    /// Layer norm over `groups` equal slices of the trailing dimension
    fn group_norm(
        &self,
        weight: &impl AsView,
        bias: &impl AsView,
        groups: usize,
        eps: f32,
        out: &mut impl AsViewMut,
    ) -> Result<(), TensorError> {
        let (x, w, b, mut out) = (self.view(), weight.view(), bias.view(), out.view_mut());
        let device = same_device("group_norm", &[x.device(), w.device(), b.device(), out.device()]);
        same_shape("group_norm", x.shape(), out.shape());
        assert!(groups > 0 && x.last_dim() % groups == 0, "group_norm: {} channels do not split into {} groups", x.last_dim(), groups);
        assert_eq!(w.element_count(), x.last_dim(), "group_norm: weight must hold one row");
        assert_eq!(b.element_count(), x.last_dim(), "group_norm: bias must hold one row");
        run("group_norm", device, |backend| backend.group_norm(&x, &w, &b, groups, eps, &mut out))
    }

    /// Embedding lookup: `out[b, t] = self[indices[b][t]]` for a `[vocab, width]` table
    ///
    /// # Panics
    ///
    /// Panics if `out` is not `[indices.len(), tokens, width]`, rows are ragged,
    /// or a token is outside the table.
    fn gather(&self, indices: &[Vec<u32>], out: &mut impl AsViewMut) -> Result<(), TensorError> {
        let (table, mut out) = (self.view(), out.view_mut());
        let device = same_device("gather", &[table.device(), out.device()]);
        assert_eq!(table.rank(), 2, "gather: table must be [vocab, width]");
        let tokens = indices.first().map(Vec::len).unwrap_or(0);
        assert!(indices.iter().all(|row| row.len() == tokens), "gather: ragged index rows");
        same_shape("gather", &[indices.len(), tokens, table.last_dim()], out.shape());
        let vocab = table.shape()[0];
        if let Some(token) = indices.iter().flatten().find(|t| **t as usize >= vocab) {
            panic!("gather: token {token} outside a vocabulary of {vocab}");
        }
        run("gather", device, |backend| backend.gather(&table, indices, &mut out))
    }

    fn relu(&self, out: &mut impl AsViewMut) -> Result<(), TensorError> {
        activate(Activation::Relu, self, out)
    }

    /// `max(x, 0)²`
    fn relu_square(&self, out: &mut impl AsViewMut) -> Result<(), TensorError> {
        activate(Activation::ReluSquare, self, out)
    }

    fn sigmoid(&self, out: &mut impl AsViewMut) -> Result<(), TensorError> {
        activate(Activation::Sigmoid, self, out)
    }

    /// `out = mult · σ(self)`
    fn sigmoid_mul(&self, mult: &impl AsView, out: &mut impl AsViewMut) -> Result<(), TensorError> {
        gate(Gate::Sigmoid, self, mult, out)
    }

    /// `out = mult · self · σ(self)`
    fn swish_mul(&self, mult: &impl AsView, out: &mut impl AsViewMut) -> Result<(), TensorError> {
        gate(Gate::Swish, self, mult, out)
    }

    /// `out[.., o] = Σ_k self[o, k] · input[.., k]` with `self` an f32 or bf16
    /// `[outputs, inputs]` weight
    fn matmul(&self, input: &impl AsView, out: &mut impl AsViewMut) -> Result<(), TensorError> {
        let (weight, x, mut out) = (self.view(), input.view(), out.view_mut());
        let device = same_device("matmul", &[weight.device(), x.device(), out.device()]);
        check_matmul("matmul", weight.shape(), x.shape(), out.shape());
        if !matches!(weight.dtype(), DType::F32 | DType::BF16) {
            return Err(TensorError::DTypeMismatch { expected: DType::F32, actual: weight.dtype() });
        }
        run("matmul", device, |backend| backend.matmul(&weight, &x, &mut out))
    }

    /// Like [`TensorOps::matmul`] with `self` a u8 weight and per-block
    /// `scale` / `offset` of shape `[outputs, inputs / block]`
    fn matmul_quantized(
        &self,
        scale: &impl AsView,
        offset: &impl AsView,
        input: &impl AsView,
        out: &mut impl AsViewMut,
    ) -> Result<(), TensorError> {
        let (weight, scale, offset) = (self.view(), scale.view(), offset.view());
        let (x, mut out) = (input.view(), out.view_mut());
        let device = same_device(
            "matmul_quantized",
            &[weight.device(), scale.device(), offset.device(), x.device(), out.device()],
        );
        check_matmul("matmul_quantized", weight.shape(), x.shape(), out.shape());
        if weight.dtype() != DType::U8 {
            return Err(TensorError::DTypeMismatch { expected: DType::U8, actual: weight.dtype() });
        }
        let blocks = scale.last_dim();
        assert_eq!(scale.shape(), &[weight.shape()[0], blocks], "matmul_quantized: scale shape");
        assert_eq!(offset.shape(), scale.shape(), "matmul_quantized: offset shape");
        assert_eq!(weight.shape()[1] % blocks, 0, "matmul_quantized: blocks must tile the input width");
        run("matmul_quantized", device, |backend| {
            backend.matmul_quantized(&weight, &scale, &offset, &x, &mut out)
        })
    }
}

impl<T: AsView + ?Sized> TensorOps for T {}

fn check_matmul(op: &str, weight: &[usize], input: &[usize], out: &[usize]) {
    assert_eq!(weight.len(), 2, "{op}: weight must be [outputs, inputs]");
    let (outputs, inputs) = (weight[0], weight[1]);
    assert_eq!(input.last().copied(), Some(inputs), "{op}: input width must be {inputs}");
    assert_eq!(out.last().copied(), Some(outputs), "{op}: output width must be {outputs}");
    let rows = input.iter().product::<usize>() / inputs;
    assert_eq!(
        out.iter().product::<usize>(),
        rows * outputs,
        "{op}: output holds the wrong number of elements"
    );
}

fn activate<X: AsView + ?Sized>(kind: Activation, x: &X, out: &mut impl AsViewMut) -> Result<(), TensorError> {
    let (x, mut out) = (x.view(), out.view_mut());
    let device = same_device("activation", &[x.device(), out.device()]);
    same_shape("activation", x.shape(), out.shape());
    run("activation", device, |backend| backend.activation(kind, &x, &mut out))
}

fn gate<X: AsView + ?Sized>(kind: Gate, x: &X, mult: &impl AsView, out: &mut impl AsViewMut) -> Result<(), TensorError> {
    let (x, m, mut out) = (x.view(), mult.view(), out.view_mut());
    let device = same_device("gated", &[x.device(), m.device(), out.device()]);
    same_shape("gated", x.shape(), m.shape());
    same_shape("gated", x.shape(), out.shape());
    run("gated", device, |backend| backend.gated(kind, &x, &m, &mut out))
}

/// In-place primitives on a writable receiver
pub trait TensorOpsMut: AsViewMut {
    /// Set every element to `value`
    fn fill(&mut self, value: f32) -> Result<(), TensorError> {
        let mut out = self.view_mut();
        let device = out.device();
        run("fill", device, |backend| backend.fill(&mut out, value))
    }

    /// Overwrite `self` with the elements of `src`
    ///
    /// # Panics
    ///
    /// Panics if the element types or counts differ.
    fn copy_from(&mut self, src: &impl AsView) -> Result<(), TensorError> {
        let (src, mut dst) = (src.view(), self.view_mut());
        let device = same_device("copy_from", &[src.device(), dst.device()]);
        assert_eq!(src.dtype(), dst.dtype(), "copy_from: element types differ");
        assert_eq!(src.element_count(), dst.element_count(), "copy_from: element counts differ");
        run("copy_from", device, |backend| backend.copy(&src, &mut dst))
    }

    /// `self += other`
    fn add_assign(&mut self, other: &impl AsView) -> Result<(), TensorError> {
        let (y, mut x) = (other.view(), self.view_mut());
        let device = same_device("add_assign", &[x.device(), y.device()]);
        broadcast_row("add_assign", x.shape(), y.shape());
        run("add_assign", device, |backend| backend.add_assign(&mut x, &y))
    }

    /// Softmax over every element of `self`
    fn softmax(&mut self) -> Result<(), TensorError> {
        let mut x = self.view_mut();
        let device = x.device();
        run("softmax", device, |backend| backend.softmax(&mut x))
    }

    /// Advance the recurrent attention state `self` (`[batch, heads, size,
    /// size]`) over every timestep of `r`, `k`, `v` (`[batch, time, heads ·
    /// size]`), writing the attention readout into `out`
    fn wkv(
        &mut self,
        r: &impl AsView,
        k: &impl AsView,
        v: &impl AsView,
        decay: &impl AsView,
        bonus: &impl AsView,
        out: &mut impl AsViewMut,
    ) -> Result<(), TensorError> {
        let (r, k, v) = (r.view(), k.view(), v.view());
        let (decay, bonus) = (decay.view(), bonus.view());
        let (mut state, mut out) = (self.view_mut(), out.view_mut());
        let device = same_device(
            "wkv",
            &[state.device(), r.device(), k.device(), v.device(), decay.device(), bonus.device(), out.device()],
        );
        let shape = state.shape().to_vec();
        assert_eq!(shape.len(), 4, "wkv: state must be [batch, heads, size, size]");
        assert_eq!(shape[2], shape[3], "wkv: state heads must be square");
        assert_eq!(r.rank(), 3, "wkv: inputs must be [batch, time, channels]");
        same_shape("wkv", r.shape(), k.shape());
        same_shape("wkv", r.shape(), v.shape());
        same_shape("wkv", r.shape(), out.shape());
        let channels = shape[1] * shape[2];
        assert_eq!(r.shape()[0], shape[0], "wkv: batch of inputs and state differ");
        assert_eq!(r.last_dim(), channels, "wkv: inputs must hold heads · size channels");
        assert_eq!(decay.element_count(), channels, "wkv: decay must hold heads · size values");
        assert_eq!(bonus.element_count(), channels, "wkv: bonus must hold heads · size values");
        run("wkv", device, |backend| backend.wkv(&mut state, &r, &k, &v, &decay, &bonus, &mut out))
    }
}

impl<T: AsViewMut + ?Sized> TensorOpsMut for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;
    use proptest::prelude::*;

    fn zeros(shape: &[usize]) -> Tensor {
        Tensor::zeros(shape, DType::F32, Device::Cpu).unwrap()
    }

    #[test]
    fn test_add_writes_into_view() {
        let a = Tensor::from_slice(&[1f32, 2., 3., 4.], &[2, 2]);
        let b = Tensor::from_slice(&[10f32, 20.], &[2]);
        let mut out = zeros(&[3, 2, 2]);
        a.add(&b, &mut out.get_mut(1)).unwrap();
        assert_eq!(out.get(1).as_slice::<f32>().unwrap(), &[11., 22., 13., 24.]);
        assert!(out.get(0).as_slice::<f32>().unwrap().iter().all(|v| *v == 0.0));
    }

    #[test]
    #[should_panic(expected = "shape mismatch")]
    fn test_mismatched_output_panics() {
        let a = zeros(&[2, 2]);
        let mut out = zeros(&[4]);
        let _ = a.add_scalar(1.0, &mut out);
    }

    #[test]
    #[should_panic(expected = "cannot broadcast")]
    fn test_bad_broadcast_panics() {
        let a = zeros(&[2, 4]);
        let b = zeros(&[3]);
        let mut out = zeros(&[2, 4]);
        let _ = a.multiply(&b, &mut out);
    }

    #[test]
    fn test_lerp_mixes_per_channel() {
        let a = Tensor::from_slice(&[1f32, 1., 1.], &[1, 3]);
        let b = Tensor::from_slice(&[5f32, 5., 5.], &[1, 3]);
        let w = Tensor::from_slice(&[0f32, 1., 0.5], &[3]);
        let mut out = zeros(&[1, 3]);
        a.lerp(&b, &w, &mut out).unwrap();
        assert_eq!(out.as_slice::<f32>().unwrap(), &[1., 5., 3.]);
    }

    #[test]
    fn test_swish_and_sigmoid_gates() {
        let x = Tensor::from_slice(&[0f32, 0.], &[2]);
        let m = Tensor::from_slice(&[2f32, 4.], &[2]);
        let mut out = zeros(&[2]);
        x.sigmoid_mul(&m, &mut out).unwrap();
        assert_eq!(out.as_slice::<f32>().unwrap(), &[1., 2.]);
        x.swish_mul(&m, &mut out).unwrap();
        assert_eq!(out.as_slice::<f32>().unwrap(), &[0., 0.]);
    }

    #[test]
    fn test_relu_square() {
        let x = Tensor::from_slice(&[-2f32, 3.], &[2]);
        let mut out = zeros(&[2]);
        x.relu_square(&mut out).unwrap();
        assert_eq!(out.as_slice::<f32>().unwrap(), &[0., 9.]);
        x.relu(&mut out).unwrap();
        assert_eq!(out.as_slice::<f32>().unwrap(), &[0., 3.]);
    }

    #[test]
    fn test_matmul_rejects_integer_weight() {
        let w = Tensor::from_slice(&[1i32, 2], &[1, 2]);
        let x = Tensor::from_slice(&[1f32, 1.], &[1, 2]);
        let mut out = zeros(&[1, 1]);
        assert!(matches!(w.matmul(&x, &mut out), Err(TensorError::DTypeMismatch { .. })));
    }

    #[test]
    #[should_panic(expected = "outside a vocabulary")]
    fn test_gather_rejects_unknown_token() {
        let table = zeros(&[4, 2]);
        let mut out = zeros(&[1, 1, 2]);
        let _ = table.gather(&[vec![4]], &mut out);
    }

    #[test]
    fn test_copy_from_and_add_assign() {
        let mut x = zeros(&[2, 2]);
        x.copy_from(&Tensor::from_slice(&[1f32, 2., 3., 4.], &[4])).unwrap();
        x.add_assign(&Tensor::from_slice(&[1f32, 1.], &[2])).unwrap();
        assert_eq!(x.as_slice::<f32>().unwrap(), &[2., 3., 4., 5.]);
    }

    fn wkv_inputs(decay: f32) -> (Tensor, Tensor, Tensor, Tensor, Tensor) {
        // one head of size 2, two timesteps
        let r = Tensor::from_slice(&[1f32, 0., 0., 1.], &[1, 2, 2]);
        let k = Tensor::from_slice(&[1f32, 2., 3., 4.], &[1, 2, 2]);
        let v = Tensor::from_slice(&[5f32, 6., 7., 8.], &[1, 2, 2]);
        let w = Tensor::from_slice(&[decay, decay], &[2]);
        let u = Tensor::from_slice(&[0f32, 0.], &[2]);
        (r, k, v, w, u)
    }

    #[test]
    fn test_wkv_zero_decay_keeps_only_last_step() {
        let (r, k, v, w, u) = wkv_inputs(0.0);
        let mut state = zeros(&[1, 1, 2, 2]);
        let mut out = zeros(&[1, 2, 2]);
        state.wkv(&r, &k, &v, &w, &u, &mut out).unwrap();
        // S = k_1 ⊗ v_1
        assert_eq!(state.as_slice::<f32>().unwrap(), &[21., 24., 28., 32.]);
        // out_1 reads S after step 0 = k_0 ⊗ v_0 = [[5, 6], [10, 12]], row 1
        assert_eq!(out.get(0).get(1).as_slice::<f32>().unwrap(), &[10., 12.]);
        assert_eq!(out.get(0).get(0).as_slice::<f32>().unwrap(), &[0., 0.]);
    }

    #[test]
    fn test_wkv_unit_decay_accumulates() {
        let (r, k, v, w, u) = wkv_inputs(1.0);
        let mut state = zeros(&[1, 1, 2, 2]);
        let mut out = zeros(&[1, 2, 2]);
        state.wkv(&r, &k, &v, &w, &u, &mut out).unwrap();
        assert_eq!(state.as_slice::<f32>().unwrap(), &[26., 30., 38., 44.]);
    }

    #[test]
    fn test_wkv_bonus_reads_current_token() {
        let r = Tensor::from_slice(&[1f32, 1.], &[1, 1, 2]);
        let k = Tensor::from_slice(&[1f32, 1.], &[1, 1, 2]);
        let v = Tensor::from_slice(&[3f32, 4.], &[1, 1, 2]);
        let w = Tensor::from_slice(&[1f32, 1.], &[2]);
        let u = Tensor::from_slice(&[2f32, 0.], &[2]);
        let mut state = zeros(&[1, 1, 2, 2]);
        let mut out = zeros(&[1, 1, 2]);
        state.wkv(&r, &k, &v, &w, &u, &mut out).unwrap();
        // only row 0 carries a bonus: 2 · 1 · v
        assert_eq!(out.as_slice::<f32>().unwrap(), &[6., 8.]);
    }

    proptest! {
        #[test]
        fn prop_softmax_is_a_distribution(values in prop::collection::vec(-50f32..50f32, 1..40)) {
            let mut x = Tensor::from_slice(&values, &[values.len()]);
            x.softmax().unwrap();
            let probs = x.as_slice::<f32>().unwrap();
            prop_assert!(probs.iter().all(|p| *p >= 0.0));
            prop_assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-4);
        }

        #[test]
        fn prop_lerp_endpoints(
            (batch, width, a, b) in (1usize..4, 1usize..20).prop_flat_map(|(batch, width)| {
                let values = prop::collection::vec(-100f32..100f32, batch * width);
                (Just(batch), Just(width), values.clone(), values)
            })
        ) {
            let (x, y) = (Tensor::from_slice(&a, &[batch, width]), Tensor::from_slice(&b, &[batch, width]));
            let mut out = zeros(&[batch, width]);
            for (weight, expected) in [(0.0, &a), (1.0, &b)] {
                let w = Tensor::full(&[width], weight, Device::Cpu).unwrap();
                x.lerp(&y, &w, &mut out).unwrap();
                for (got, want) in out.as_slice::<f32>().unwrap().iter().zip(expected.iter()) {
                    prop_assert!((got - want).abs() < 1e-3, "w={} got {} want {}", weight, got, want);
                }
            }
        }

        #[test]
        fn prop_simd_add_matches_scalar(values in prop::collection::vec(-1e3f32..1e3f32, 1..50)) {
            let a = Tensor::from_slice(&values, &[values.len()]);
            let mut out = zeros(&[values.len()]);
            a.add(&a, &mut out).unwrap();
            let expected: Vec<f32> = values.iter().map(|v| v + v).collect();
            prop_assert_eq!(out.as_slice::<f32>().unwrap(), expected.as_slice());
        }
    }
}
