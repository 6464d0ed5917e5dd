//! # Tensors
//!
//! An owned [`Tensor`] holds a shape, an element type, and a buffer on one
//! [`Device`]. Host buffers are 64-byte aligned allocations owned by the
//! tensor; accelerator buffers are flat device tensors.
//!
//! Indexing with [`Tensor::get`] or [`Tensor::get_mut`] returns a
//! [`TensorView`] / [`TensorViewMut`] that borrows the parent's buffer at an
//! offset of `index × stride`, where the stride is the product of the trailing
//! dimensions. Views never own memory and cannot outlive their parent.
//!
//! Arithmetic lives on the [`TensorOps`] and [`TensorOpsMut`] extension
//! traits, implemented for owned tensors and views alike.

mod dtype;
mod storage;
mod view;
mod operations;
pub mod constant;

use std::fmt::{Debug, Display, Formatter};
use crate::backend::Device;
use crate::error::TensorError;
use storage::Storage;
pub(crate) use storage::AlignedBuffer;

pub use dtype::{DType, Element};
pub use operations::{TensorOps, TensorOpsMut};
pub use view::{AsView, AsViewMut, TensorView, TensorViewMut};

/// An owned, shaped buffer of elements on one device
#[derive(Clone)]
pub struct Tensor {
    shape: Vec<usize>,
    dtype: DType,
    storage: Storage,
    /// Elements the buffer was allocated for; `reshape_unchecked` may shrink
    /// the logical shape below this but never grow past it
    capacity: usize,
}

impl Tensor {
    /// A zero-filled tensor
    pub fn zeros(shape: &[usize], dtype: DType, device: Device) -> Result<Self, TensorError> {
        let count: usize = shape.iter().product();
        let storage = match device {
            Device::Cpu => Storage::Host(AlignedBuffer::zeroed(count * dtype.size_in_bytes())),
            #[cfg(feature = "candle")]
            Device::Accelerator => Storage::Accelerator(crate::backend::candle::zeros(count, dtype)?),
            #[cfg(not(feature = "candle"))]
            Device::Accelerator => {
                return Err(TensorError::Unsupported { op: "allocate", device });
            }
        };
        Ok(Self {
            shape: shape.to_vec(),
            dtype,
            storage,
            capacity: count,
        })
    }

    /// An f32 tensor with every element set to `value`
    pub fn full(shape: &[usize], value: f32, device: Device) -> Result<Self, TensorError> {
        let mut tensor = Self::zeros(shape, DType::F32, device)?;
        if value != 0.0 {
            tensor.fill(value)?;
        }
        Ok(tensor)
    }

    /// A zero-filled tensor with the shape, dtype, and device of `other`
    pub fn zeros_like(other: &impl AsView) -> Result<Self, TensorError> {
        let view = other.view();
        Self::zeros(view.shape(), view.dtype(), view.device())
    }

    /// A host tensor holding a copy of `data`
    ///
    /// # Panics
    ///
    /// Panics if `data.len()` differs from the product of `shape`.
    pub fn from_slice<T: Element>(data: &[T], shape: &[usize]) -> Self {
        let count: usize = shape.iter().product();
        assert_eq!(data.len(), count, "{} values cannot fill shape {:?}", data.len(), shape);
        Self {
            shape: shape.to_vec(),
            dtype: T::DTYPE,
            storage: Storage::Host(AlignedBuffer::from_bytes(bytemuck::cast_slice(data))),
            capacity: count,
        }
    }

    /// A host tensor over raw little-endian bytes of `dtype`
    ///
    /// # Panics
    ///
    /// Panics if the byte length does not match `shape` and `dtype`.
    pub fn from_bytes(bytes: &[u8], dtype: DType, shape: &[usize]) -> Self {
        let count: usize = shape.iter().product();
        assert_eq!(
            bytes.len(),
            count * dtype.size_in_bytes(),
            "{} bytes cannot fill {} of shape {:?}",
            bytes.len(), dtype, shape
        );
        Self {
            shape: shape.to_vec(),
            dtype,
            storage: Storage::Host(AlignedBuffer::from_bytes(bytes)),
            capacity: count,
        }
    }

    /// A rank-0 host tensor
    pub fn scalar<T: Element>(value: T) -> Self {
        Self::from_slice(&[value], &[])
    }

    /// Logical dimensions, outermost first
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Element type of the buffer
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Where the buffer lives
    pub fn device(&self) -> Device {
        self.storage.device()
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn byte_size(&self) -> usize {
        self.element_count() * self.dtype.size_in_bytes()
    }

    /// Change the logical shape, keeping the element count
    ///
    /// # Panics
    ///
    /// Panics if `shape` holds a different number of elements.
    pub fn reshape(&mut self, shape: &[usize]) {
        let count: usize = shape.iter().product();
        assert_eq!(
            count,
            self.element_count(),
            "cannot reshape {:?} into {:?}",
            self.shape, shape
        );
        self.shape = shape.to_vec();
    }

    /// Change the logical shape without preserving the element count.
    ///
    /// Used to run a buffer sized for the largest batch over a smaller one.
    /// Elements past the new count keep their contents.
    ///
    /// # Panics
    ///
    /// Panics if `shape` needs more elements than were allocated.
    pub fn reshape_unchecked(&mut self, shape: &[usize]) {
        let count: usize = shape.iter().product();
        assert!(
            count <= self.capacity,
            "shape {:?} needs {} elements, buffer holds {}",
            shape, count, self.capacity
        );
        self.shape = shape.to_vec();
    }

    /// `self[index]` as a non-owning view
    ///
    /// # Panics
    ///
    /// Panics if the tensor is a scalar or `index` is out of range.
    pub fn get(&self, index: usize) -> TensorView<'_> {
        self.view().get(index)
    }

    /// `self[index]` as a mutable non-owning view; writes alias `self`
    ///
    /// # Panics
    ///
    /// Panics if the tensor is a scalar or `index` is out of range.
    pub fn get_mut(&mut self, index: usize) -> TensorViewMut<'_> {
        let (shape, offset) = view::index_leading(&self.shape, index);
        TensorViewMut {
            shape,
            dtype: self.dtype,
            storage: &mut self.storage,
            offset,
        }
    }

    /// Rows `start..start + len` along the leading dimension
    pub fn narrow(&self, start: usize, len: usize) -> TensorView<'_> {
        self.view().narrow(start, len)
    }

    /// Mutable rows `start..start + len` along the leading dimension
    pub fn narrow_mut(&mut self, start: usize, len: usize) -> TensorViewMut<'_> {
        let (shape, offset) = view::narrow_leading(&self.shape, start, len);
        TensorViewMut {
            shape,
            dtype: self.dtype,
            storage: &mut self.storage,
            offset,
        }
    }

    /// The elements of a host tensor.
    ///
    /// Returns [`TensorError::DTypeMismatch`] when `T` is not the element type
    /// and [`TensorError::Unsupported`] for accelerator tensors.
    pub fn as_slice<T: Element>(&self) -> Result<&[T], TensorError> {
        self.view().as_slice()
    }

    /// Writable elements of a host tensor; fails like [`Tensor::as_slice`]
    pub fn as_slice_mut<T: Element>(&mut self) -> Result<&mut [T], TensorError> {
        let count = self.element_count();
        let (dtype, storage) = (self.dtype, &mut self.storage);
        TensorViewMut { shape: vec![count], dtype, storage, offset: 0 }.into_slice_mut()
    }

    /// Copy the elements to the host, from either device
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>, TensorError> {
        self.view().to_vec()
    }

    /// The value of a rank-0 tensor.
    ///
    /// Returns [`TensorError::NotScalar`] for any other rank and
    /// [`TensorError::DTypeMismatch`] when `T` is not the element type.
    pub fn as_scalar<T: Element>(&self) -> Result<T, TensorError> {
        self.view().as_scalar()
    }

    /// Copy the tensor onto `device`; a same-device call clones
    pub fn to_device(&self, device: Device) -> Result<Tensor, TensorError> {
        if device == self.device() {
            return Ok(self.clone());
        }
        Ok(Self {
            shape: self.shape.clone(),
            dtype: self.dtype,
            storage: self.transfer(device)?,
            capacity: self.element_count(),
        })
    }

    #[cfg(feature = "candle")]
    fn transfer(&self, device: Device) -> Result<Storage, TensorError> {
        match (&self.storage, device) {
            (Storage::Host(buffer), Device::Accelerator) => {
                let bytes = &buffer.as_bytes()[..self.byte_size()];
                Ok(Storage::Accelerator(crate::backend::candle::upload(bytes, self.dtype)?))
            }
            (Storage::Accelerator(tensor), Device::Cpu) => {
                let window = tensor.narrow(0, 0, self.element_count())?;
                Ok(Storage::Host(crate::backend::candle::download(&window, self.dtype)?))
            }
            _ => Err(TensorError::Unsupported { op: "device transfer", device }),
        }
    }

    #[cfg(not(feature = "candle"))]
    fn transfer(&self, device: Device) -> Result<Storage, TensorError> {
        Err(TensorError::Unsupported { op: "device transfer", device })
    }

    /// A host f32 copy, widening half and double precision values
    pub fn to_f32(&self) -> Result<Tensor, TensorError> {
        let host = self.to_device(Device::Cpu)?;
        let values: Vec<f32> = match self.dtype {
            DType::F32 => return Ok(host),
            DType::BF16 => host.as_slice::<half::bf16>()?.iter().map(|v| v.to_f32()).collect(),
            DType::F16 => host.as_slice::<half::f16>()?.iter().map(|v| v.to_f32()).collect(),
            DType::F64 => host.as_slice::<f64>()?.iter().map(|v| *v as f32).collect(),
            other => {
                return Err(TensorError::DTypeMismatch { expected: DType::F32, actual: other });
            }
        };
        Ok(Tensor::from_slice(&values, &self.shape))
    }
}

impl AsView for Tensor {
    fn view(&self) -> TensorView<'_> {
        TensorView {
            shape: self.shape.clone(),
            dtype: self.dtype,
            storage: &self.storage,
            offset: 0,
        }
    }
}

impl AsViewMut for Tensor {
    fn view_mut(&mut self) -> TensorViewMut<'_> {
        TensorViewMut {
            shape: self.shape.clone(),
            dtype: self.dtype,
            storage: &mut self.storage,
            offset: 0,
        }
    }
}

impl Debug for Tensor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("device", &self.device())
            .finish()
    }
}

/// Prints the first and last four values of f32 tensors, e.g.
/// `Tensor(0.1, 0.2, 0.3, 0.4, ..., 0.7, 0.8, 0.9, 1.0, shape=(2, 5))`
impl Display for Tensor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let shape = self.shape.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(", ");
        let values = match self.dtype {
            DType::F32 => self.to_vec::<f32>().ok(),
            _ => None,
        };
        let Some(values) = values else {
            return write!(f, "Tensor({}, {}, shape=({}))", self.dtype, self.device(), shape);
        };
        if self.shape.is_empty() {
            return write!(f, "{}", values[0]);
        }
        let head = values.iter().take(4).map(|v| v.to_string()).collect::<Vec<_>>();
        write!(f, "Tensor({}", head.join(", "))?;
        if values.len() > 8 {
            let tail = values[values.len() - 4..].iter().map(|v| v.to_string()).collect::<Vec<_>>();
            write!(f, ", ..., {}", tail.join(", "))?;
        } else if values.len() > 4 {
            let rest = values[4..].iter().map(|v| v.to_string()).collect::<Vec<_>>();
            write!(f, ", {}", rest.join(", "))?;
        }
        write!(f, ", shape=({}))", shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_zeros_allocates_product_of_shape() {
        let tensor = Tensor::zeros(&[2, 3, 4], DType::F32, Device::Cpu).unwrap();
        assert_eq!(tensor.element_count(), 24);
        assert_eq!(tensor.byte_size(), 96);
        assert!(tensor.as_slice::<f32>().unwrap().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_get_returns_view_at_stride() {
        let tensor = Tensor::from_slice(&[0f32, 1., 2., 3., 4., 5.], &[3, 2]);
        let row = tensor.get(2);
        assert_eq!(row.shape(), &[2]);
        assert_eq!(row.as_slice::<f32>().unwrap(), &[4., 5.]);
    }

    #[test]
    fn test_mutation_through_view_aliases_parent() {
        let mut tensor = Tensor::zeros(&[2, 3], DType::F32, Device::Cpu).unwrap();
        {
            let mut row = tensor.get_mut(1);
            row.as_slice_mut::<f32>().unwrap().copy_from_slice(&[7., 8., 9.]);
        }
        assert_eq!(tensor.as_slice::<f32>().unwrap(), &[0., 0., 0., 7., 8., 9.]);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_get_out_of_range_panics() {
        let tensor = Tensor::zeros(&[2, 3], DType::F32, Device::Cpu).unwrap();
        let _ = tensor.get(2);
    }

    #[test]
    #[should_panic(expected = "cannot reshape")]
    fn test_checked_reshape_rejects_count_change() {
        let mut tensor = Tensor::zeros(&[2, 3], DType::F32, Device::Cpu).unwrap();
        tensor.reshape(&[4, 2]);
    }

    #[test]
    fn test_unchecked_reshape_shrinks_within_capacity() {
        let mut tensor = Tensor::zeros(&[4, 8], DType::F32, Device::Cpu).unwrap();
        tensor.reshape_unchecked(&[2, 8]);
        assert_eq!(tensor.element_count(), 16);
        tensor.reshape_unchecked(&[4, 8]);
        assert_eq!(tensor.element_count(), 32);
    }

    #[test]
    #[should_panic(expected = "buffer holds")]
    fn test_unchecked_reshape_cannot_grow() {
        let mut tensor = Tensor::zeros(&[2, 2], DType::F32, Device::Cpu).unwrap();
        tensor.reshape_unchecked(&[3, 2]);
    }

    #[test]
    fn test_as_scalar() {
        assert_eq!(Tensor::scalar(3.5f32).as_scalar::<f32>().unwrap(), 3.5);
        let matrix = Tensor::zeros(&[2], DType::F32, Device::Cpu).unwrap();
        assert!(matches!(matrix.as_scalar::<f32>(), Err(TensorError::NotScalar { .. })));
        assert!(matches!(
            Tensor::scalar(1u8).as_scalar::<f32>(),
            Err(TensorError::DTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_to_f32_widens_bf16() {
        let values = [half::bf16::from_f32(1.5), half::bf16::from_f32(-2.0)];
        let tensor = Tensor::from_slice(&values, &[2]).to_f32().unwrap();
        assert_eq!(tensor.as_slice::<f32>().unwrap(), &[1.5, -2.0]);
    }

    #[cfg(not(feature = "candle"))]
    #[test]
    fn test_accelerator_unavailable_without_feature() {
        let result = Tensor::zeros(&[2], DType::F32, Device::Accelerator);
        assert!(matches!(result, Err(TensorError::Unsupported { .. })));
        let host = Tensor::from_slice(&[1f32, 2.], &[2]);
        assert!(matches!(host.to_device(Device::Accelerator), Err(TensorError::Unsupported { .. })));
    }

    #[test]
    fn test_clones_own_their_buffer() {
        let original = Tensor::zeros(&[4], DType::F32, Device::Cpu).unwrap();
        let mut copy = original.clone();
        copy.as_slice_mut::<f32>().unwrap().fill(7.0);
        let mut moved = original.to_device(Device::Cpu).unwrap();
        moved.as_slice_mut::<f32>().unwrap().fill(3.0);
        assert_eq!(original.as_slice::<f32>().unwrap(), &[0.0; 4]);
        assert_eq!(copy.as_slice::<f32>().unwrap(), &[7.0; 4]);
    }

    #[test]
    fn test_display_elides_middle() {
        let tensor = Tensor::from_slice(&(0..10).map(|v| v as f32).collect::<Vec<_>>(), &[2, 5]);
        assert_eq!(tensor.to_string(), "Tensor(0, 1, 2, 3, ..., 6, 7, 8, 9, shape=(2, 5))");
    }

    proptest! {
        #[test]
        fn prop_reshape_round_trip_keeps_data(dims in prop::collection::vec(1usize..5, 1..4)) {
            let count: usize = dims.iter().product();
            let data: Vec<f32> = (0..count).map(|v| v as f32).collect();
            let mut tensor = Tensor::from_slice(&data, &dims);
            tensor.reshape(&[count]);
            tensor.reshape(&dims);
            prop_assert_eq!(tensor.element_count(), count);
            prop_assert_eq!(tensor.shape(), dims.as_slice());
            prop_assert_eq!(tensor.as_slice::<f32>().unwrap(), data.as_slice());
        }
    }
}
