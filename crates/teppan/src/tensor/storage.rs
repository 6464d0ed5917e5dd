use bytemuck::{Pod, Zeroable};
use crate::backend::Device;
use super::constant::ALIGNMENT;

/// One cache line of raw bytes; a `Vec` of these is always 64-byte aligned.
#[derive(Clone, Copy)]
#[repr(C, align(64))]
struct Line([u8; ALIGNMENT]);

// SAFETY: `Line` is a plain byte array with no padding (size == align == 64),
// so every bit pattern is valid and the all-zero pattern is a valid value.
unsafe impl Zeroable for Line {}
unsafe impl Pod for Line {}

/// An owned host allocation whose first byte sits on a 64-byte boundary.
#[derive(Clone)]
pub(crate) struct AlignedBuffer {
    lines: Vec<Line>,
    len: usize,
}

impl AlignedBuffer {
    pub(crate) fn zeroed(len: usize) -> Self {
        let line_count = len.div_ceil(ALIGNMENT).max(1);
        Self {
            lines: vec![Line([0; ALIGNMENT]); line_count],
            len,
        }
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Self {
        let mut buffer = Self::zeroed(bytes.len());
        buffer.as_bytes_mut().copy_from_slice(bytes);
        buffer
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.lines)[..self.len]
    }

    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.lines)[..self.len]
    }
}

/// Backing memory of an owned tensor.
pub(crate) enum Storage {
    Host(AlignedBuffer),
    /// A flat, contiguous device tensor holding every element of the owner
    #[cfg(feature = "candle")]
    Accelerator(candle_core::Tensor),
}

/// Clones never share memory: device writes go through `slice_set`, which
/// mutates candle's storage in place, so a shallow clone would alias.
///
/// # Panics
///
/// Panics if the device cannot allocate the copy, as a failed host
/// allocation would abort.
impl Clone for Storage {
    fn clone(&self) -> Self {
        match self {
            Storage::Host(buffer) => Storage::Host(buffer.clone()),
            #[cfg(feature = "candle")]
            Storage::Accelerator(tensor) => Storage::Accelerator(
                tensor
                    .copy()
                    .unwrap_or_else(|error| panic!("device copy failed: {error}")),
            ),
        }
    }
}

impl Storage {
    pub(crate) fn device(&self) -> Device {
        match self {
            Storage::Host(_) => Device::Cpu,
            #[cfg(feature = "candle")]
            Storage::Accelerator(_) => Device::Accelerator,
        }
    }
}
