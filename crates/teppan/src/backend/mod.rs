//! # Tensor Backend
//!
//! This module provides the execution paths behind every tensor primitive,
//! allowing the model and scheduler to stay device agnostic.
//!
//! ## Feature Flags
//!
//! - `candle`: Enables the accelerator path, built on candle-core devices
//!
//! ## Dispatch
//!
//! Each tensor carries a [`Device`] tag. [`backend_for`] maps a tag to the
//! [`TensorBackend`] that executes primitives for tensors on that device:
//!
//! - [`Device::Cpu`] runs on [`CpuBackend`], vectorized host loops
//! - [`Device::Accelerator`] runs on the candle backend when the `candle`
//!   feature is enabled, and is reported as unsupported otherwise

mod core_trait;
mod cpu;

#[cfg_attr(docsrs, doc(cfg(feature = "candle")))]
#[cfg(feature = "candle")]
/// Accelerator backend implementation.
///
/// This module is only available when the `candle` feature flag is enabled.
/// Device tensors are flat `candle_core::Tensor`s; each primitive is built
/// from candle ops and written back into the destination window before the
/// call returns.
pub mod candle;

pub use core_trait::*;
pub use cpu::CpuBackend;

use crate::error::TensorError;

/// The backend that executes primitives for tensors on `device`
pub fn backend_for(device: Device) -> Result<&'static dyn TensorBackend, TensorError> {
    match device {
        Device::Cpu => Ok(&CpuBackend),
        #[cfg(feature = "candle")]
        Device::Accelerator => Ok(candle::AcceleratorBackend::global()),
        #[cfg(not(feature = "candle"))]
        Device::Accelerator => Err(TensorError::Unsupported {
            op: "accelerator backend (built without the `candle` feature)",
            device,
        }),
    }
}
