//! Non-owning views into a tensor's storage.
//!
//! A view borrows its parent for `'a`, so the parent cannot be dropped, moved,
//! or mutated elsewhere while the view lives. Writes through a
//! [`TensorViewMut`] land in the parent's buffer.

use crate::backend::Device;
use crate::error::TensorError;
use super::dtype::{DType, Element};
use super::storage::Storage;

/// Anything that can be read as a tensor view: owned tensors and both view kinds
pub trait AsView {
    fn view(&self) -> TensorView<'_>;
}

/// Anything that can be written through a mutable tensor view
pub trait AsViewMut: AsView {
    fn view_mut(&mut self) -> TensorViewMut<'_>;
}

/// A read-only window of `product(shape)` elements starting at `offset`
#[derive(Clone)]
pub struct TensorView<'a> {
    pub(crate) shape: Vec<usize>,
    pub(crate) dtype: DType,
    pub(crate) storage: &'a Storage,
    pub(crate) offset: usize,
}

/// A writable window of `product(shape)` elements starting at `offset`
pub struct TensorViewMut<'a> {
    pub(crate) shape: Vec<usize>,
    pub(crate) dtype: DType,
    pub(crate) storage: &'a mut Storage,
    pub(crate) offset: usize,
}

/// Shape and element offset of `tensor[index]` for a tensor of `shape`
///
/// # Panics
///
/// Panics on a rank-0 shape or an out of range index.
pub(crate) fn index_leading(shape: &[usize], index: usize) -> (Vec<usize>, usize) {
    assert!(!shape.is_empty(), "cannot index into a scalar tensor");
    assert!(
        index < shape[0],
        "index {} out of bounds for leading dimension of size {}",
        index, shape[0]
    );
    let stride: usize = shape[1..].iter().product();
    (shape[1..].to_vec(), index * stride)
}

/// Shape and element offset of rows `start..start + len` along the leading dimension
///
/// # Panics
///
/// Panics on a rank-0 shape or a range past the end of the leading dimension.
pub(crate) fn narrow_leading(shape: &[usize], start: usize, len: usize) -> (Vec<usize>, usize) {
    assert!(!shape.is_empty(), "cannot narrow a scalar tensor");
    assert!(
        start + len <= shape[0],
        "range {}..{} out of bounds for leading dimension of size {}",
        start, start + len, shape[0]
    );
    let stride: usize = shape[1..].iter().product();
    let mut narrowed = shape.to_vec();
    narrowed[0] = len;
    (narrowed, start * stride)
}

fn check_dtype<T: Element>(dtype: DType) -> Result<(), TensorError> {
    let compatible = T::DTYPE == dtype || (dtype == DType::Bool && T::DTYPE == DType::U8);
    if compatible {
        Ok(())
    } else {
        Err(TensorError::DTypeMismatch { expected: dtype, actual: T::DTYPE })
    }
}

fn host_slice<T: Element>(
    storage: &Storage,
    dtype: DType,
    offset: usize,
    count: usize,
) -> Result<&[T], TensorError> {
    check_dtype::<T>(dtype)?;
    match storage {
        Storage::Host(buffer) => {
            let size = size_of::<T>();
            Ok(bytemuck::cast_slice(&buffer.as_bytes()[offset * size..(offset + count) * size]))
        }
        #[cfg(feature = "candle")]
        Storage::Accelerator(_) => Err(TensorError::Unsupported {
            op: "host slice access",
            device: Device::Accelerator,
        }),
    }
}

fn host_slice_mut<T: Element>(
    storage: &mut Storage,
    dtype: DType,
    offset: usize,
    count: usize,
) -> Result<&mut [T], TensorError> {
    check_dtype::<T>(dtype)?;
    match storage {
        Storage::Host(buffer) => {
            let size = size_of::<T>();
            Ok(bytemuck::cast_slice_mut(&mut buffer.as_bytes_mut()[offset * size..(offset + count) * size]))
        }
        #[cfg(feature = "candle")]
        Storage::Accelerator(_) => Err(TensorError::Unsupported {
            op: "host slice access",
            device: Device::Accelerator,
        }),
    }
}

fn byte_window(dtype: DType, offset: usize, count: usize) -> std::ops::Range<usize> {
    let size = dtype.size_in_bytes();
    offset * size..(offset + count) * size
}

fn read_vec<T: Element>(
    storage: &Storage,
    dtype: DType,
    offset: usize,
    count: usize,
) -> Result<Vec<T>, TensorError> {
    check_dtype::<T>(dtype)?;
    match storage {
        Storage::Host(_) => Ok(host_slice::<T>(storage, dtype, offset, count)?.to_vec()),
        #[cfg(feature = "candle")]
        Storage::Accelerator(tensor) => {
            let window = tensor.narrow(0, offset, count)?;
            let host = crate::backend::candle::download(&window, dtype)?;
            Ok(bytemuck::cast_slice::<u8, T>(host.as_bytes()).to_vec())
        }
    }
}

impl<'a> TensorView<'a> {
    /// Logical dimensions of the window
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Element type, shared with the parent
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Device of the parent's buffer
    pub fn device(&self) -> Device {
        self.storage.device()
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Size of the trailing dimension, or 1 for a scalar
    pub fn last_dim(&self) -> usize {
        self.shape.last().copied().unwrap_or(1)
    }

    /// Borrow the elements as a host slice
    pub fn as_slice<T: Element>(&self) -> Result<&'a [T], TensorError> {
        host_slice(self.storage, self.dtype, self.offset, self.element_count())
    }

    /// Copy the elements out, from either device
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>, TensorError> {
        read_vec(self.storage, self.dtype, self.offset, self.element_count())
    }

    /// The window's raw bytes, whatever the element type
    pub(crate) fn host_bytes(&self) -> Result<&'a [u8], TensorError> {
        match self.storage {
            Storage::Host(buffer) => Ok(&buffer.as_bytes()[byte_window(self.dtype, self.offset, self.element_count())]),
            #[cfg(feature = "candle")]
            Storage::Accelerator(_) => Err(TensorError::Unsupported {
                op: "host byte access",
                device: Device::Accelerator,
            }),
        }
    }

    /// Read the single value of a rank-0 view
    pub fn as_scalar<T: Element>(&self) -> Result<T, TensorError> {
        if !self.shape.is_empty() {
            return Err(TensorError::NotScalar { shape: self.shape.clone() });
        }
        Ok(self.to_vec::<T>()?[0])
    }

    /// `self[index]`, a view of one slice along the leading dimension
    ///
    /// # Panics
    ///
    /// Panics if the view is a scalar or `index` is out of range.
    pub fn get(&self, index: usize) -> TensorView<'a> {
        let (shape, delta) = index_leading(&self.shape, index);
        TensorView {
            shape,
            dtype: self.dtype,
            storage: self.storage,
            offset: self.offset + delta,
        }
    }

    /// Rows `start..start + len` along the leading dimension
    ///
    /// # Panics
    ///
    /// Panics if the range does not fit the leading dimension.
    pub fn narrow(&self, start: usize, len: usize) -> TensorView<'a> {
        let (shape, delta) = narrow_leading(&self.shape, start, len);
        TensorView {
            shape,
            dtype: self.dtype,
            storage: self.storage,
            offset: self.offset + delta,
        }
    }

    /// The same elements under another logical shape
    ///
    /// # Panics
    ///
    /// Panics if the element count changes.
    pub fn reshaped(&self, shape: &[usize]) -> TensorView<'a> {
        assert_eq!(
            shape.iter().product::<usize>(),
            self.element_count(),
            "cannot view {:?} as {:?}",
            self.shape, shape
        );
        TensorView {
            shape: shape.to_vec(),
            dtype: self.dtype,
            storage: self.storage,
            offset: self.offset,
        }
    }

    /// The window as a device tensor in the view's logical shape
    #[cfg(feature = "candle")]
    pub(crate) fn device_tensor(&self) -> Result<candle_core::Tensor, TensorError> {
        match self.storage {
            Storage::Accelerator(tensor) => Ok(tensor
                .narrow(0, self.offset, self.element_count())?
                .reshape(self.shape.as_slice())?),
            Storage::Host(_) => Err(TensorError::Unsupported {
                op: "device access",
                device: Device::Cpu,
            }),
        }
    }
}

impl<'a> TensorViewMut<'a> {
    /// Logical dimensions of the window
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Element type, shared with the parent
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Device of the parent's buffer
    pub fn device(&self) -> Device {
        self.storage.device()
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn last_dim(&self) -> usize {
        self.shape.last().copied().unwrap_or(1)
    }

    /// Borrow the elements as a host slice
    pub fn as_slice<T: Element>(&self) -> Result<&[T], TensorError> {
        host_slice(self.storage, self.dtype, self.offset, self.element_count())
    }

    /// Borrow the elements as a writable host slice; writes alias the parent
    pub fn as_slice_mut<T: Element>(&mut self) -> Result<&mut [T], TensorError> {
        let count = self.element_count();
        host_slice_mut(self.storage, self.dtype, self.offset, count)
    }

    /// Consume the view into a slice borrowing the parent for `'a`
    pub fn into_slice_mut<T: Element>(self) -> Result<&'a mut [T], TensorError> {
        let count = self.element_count();
        host_slice_mut(self.storage, self.dtype, self.offset, count)
    }

    /// Copy the elements out, from either device
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>, TensorError> {
        read_vec(self.storage, self.dtype, self.offset, self.element_count())
    }

    pub(crate) fn host_bytes_mut(&mut self) -> Result<&mut [u8], TensorError> {
        let window = byte_window(self.dtype, self.offset, self.element_count());
        match self.storage {
            Storage::Host(buffer) => Ok(&mut buffer.as_bytes_mut()[window]),
            #[cfg(feature = "candle")]
            Storage::Accelerator(_) => Err(TensorError::Unsupported {
                op: "host byte access",
                device: Device::Accelerator,
            }),
        }
    }

    /// Shorter-lived mutable view over the same window
    pub fn reborrow(&mut self) -> TensorViewMut<'_> {
        TensorViewMut {
            shape: self.shape.clone(),
            dtype: self.dtype,
            storage: &mut *self.storage,
            offset: self.offset,
        }
    }

    /// Mutable `self[index]`
    ///
    /// # Panics
    ///
    /// Panics if the view is a scalar or `index` is out of range.
    pub fn get_mut(&mut self, index: usize) -> TensorViewMut<'_> {
        let (shape, delta) = index_leading(&self.shape, index);
        TensorViewMut {
            shape,
            dtype: self.dtype,
            storage: &mut *self.storage,
            offset: self.offset + delta,
        }
    }

    /// Mutable rows `start..start + len` along the leading dimension
    ///
    /// # Panics
    ///
    /// Panics if the range does not fit the leading dimension.
    pub fn narrow_mut(&mut self, start: usize, len: usize) -> TensorViewMut<'_> {
        let (shape, delta) = narrow_leading(&self.shape, start, len);
        TensorViewMut {
            shape,
            dtype: self.dtype,
            storage: &mut *self.storage,
            offset: self.offset + delta,
        }
    }

    /// The same elements under another logical shape
    ///
    /// # Panics
    ///
    /// Panics if the element count changes.
    pub fn reshaped_mut(&mut self, shape: &[usize]) -> TensorViewMut<'_> {
        assert_eq!(
            shape.iter().product::<usize>(),
            self.element_count(),
            "cannot view {:?} as {:?}",
            self.shape, shape
        );
        TensorViewMut {
            shape: shape.to_vec(),
            dtype: self.dtype,
            storage: &mut *self.storage,
            offset: self.offset,
        }
    }

    /// Overwrite the window with `value`, which must hold exactly as many elements
    #[cfg(feature = "candle")]
    pub(crate) fn write_device(&mut self, value: &candle_core::Tensor) -> Result<(), TensorError> {
        let (count, offset) = (self.element_count(), self.offset);
        match &mut *self.storage {
            Storage::Accelerator(tensor) => {
                let flat = value.flatten_all()?.contiguous()?;
                assert_eq!(flat.elem_count(), count, "device write size mismatch");
                tensor.slice_set(&flat, 0, offset)?;
                Ok(())
            }
            Storage::Host(_) => Err(TensorError::Unsupported {
                op: "device access",
                device: Device::Cpu,
            }),
        }
    }
}

impl AsView for TensorView<'_> {
    fn view(&self) -> TensorView<'_> {
        self.clone()
    }
}

impl AsView for TensorViewMut<'_> {
    fn view(&self) -> TensorView<'_> {
        TensorView {
            shape: self.shape.clone(),
            dtype: self.dtype,
            storage: &*self.storage,
            offset: self.offset,
        }
    }
}

impl AsViewMut for TensorViewMut<'_> {
    fn view_mut(&mut self) -> TensorViewMut<'_> {
        self.reborrow()
    }
}
