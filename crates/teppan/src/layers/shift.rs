use crate::backend::Device;
use crate::error::TensorError;
use crate::tensor::constant::{BATCH_DIM, SEQ_DIM};
use crate::tensor::{AsView, AsViewMut, DType, Tensor, TensorOpsMut, TensorView, TensorViewMut};

/// Carries each batch slot's last input row across forward passes, so a
/// sequence split over prefill chunks and decode steps sees one continuous
/// token-shift.
#[derive(Debug)]
pub struct ShiftRegister {
    /// `[slots, channels]`
    register: Tensor,
}

impl ShiftRegister {
    pub fn new(slots: usize, channels: usize, device: Device) -> Result<Self, TensorError> {
        Ok(Self {
            register: Tensor::zeros(&[slots, channels], DType::F32, device)?,
        })
    }

    /// Write the input shifted one step back in time into `out`:
    /// `out[b, 0]` is slot `b`'s carried row and `out[b, t] = input[b, t - 1]`.
    /// Slot `b` then carries `input[b, time - 1]`.
    ///
    /// # Panics
    ///
    /// Panics if `input` holds more rows than the register has slots, or if
    /// `out` is not shaped like `input`.
    pub fn shift(&mut self, input: &impl AsView, out: &mut impl AsViewMut) -> Result<(), TensorError> {
        let (input, mut out) = (input.view(), out.view_mut());
        assert_eq!(input.shape(), out.shape(), "shift output must match its input");
        let (batch, time) = (input.shape()[BATCH_DIM], input.shape()[SEQ_DIM]);
        assert!(batch <= self.register.shape()[0], "{batch} rows exceed the register's slots");
        for b in 0..batch {
            let row = input.get(b);
            let mut shifted = out.get_mut(b);
            shifted.get_mut(0).copy_from(&self.register.get(b))?;
            if time > 1 {
                shifted.narrow_mut(1, time - 1).copy_from(&row.narrow(0, time - 1))?;
            }
            self.register.get_mut(b).copy_from(&row.get(time - 1))?;
        }
        Ok(())
    }

    pub fn slot(&self, slot: usize) -> TensorView<'_> {
        self.register.get(slot)
    }

    pub fn slot_mut(&mut self, slot: usize) -> TensorViewMut<'_> {
        self.register.get_mut(slot)
    }
}
