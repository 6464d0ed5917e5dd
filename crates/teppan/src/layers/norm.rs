use crate::backend::Device;
use crate::error::{TensorError, WeightError};
use crate::tensor::{AsView, AsViewMut, Tensor, TensorOps};
use crate::weights::WeightSource;
use super::load_vector;

/// Affine normalization over the trailing dimension
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f32,
}

impl LayerNorm {
    pub fn new(weight: Tensor, bias: Tensor, eps: f32) -> Self {
        Self { weight, bias, eps }
    }

    /// Load `<prefix>.weight` and `<prefix>.bias`, each `width` values
    pub fn load(
        source: &impl WeightSource,
        prefix: &str,
        width: usize,
        eps: f32,
        device: Device,
    ) -> Result<Self, WeightError> {
        Ok(Self::new(
            load_vector(source, &format!("{prefix}.weight"), width, device)?,
            load_vector(source, &format!("{prefix}.bias"), width, device)?,
            eps,
        ))
    }

    pub fn forward(&self, x: &impl AsView, out: &mut impl AsViewMut) -> Result<(), TensorError> {
        x.layer_norm(&self.weight, &self.bias, self.eps, out)
    }
}

/// Normalization within `groups` equal channel slices (one per attention
/// head), then a per-channel affine
#[derive(Debug, Clone)]
pub struct GroupNorm {
    weight: Tensor,
    bias: Tensor,
    groups: usize,
    eps: f32,
}

impl GroupNorm {
    pub fn new(weight: Tensor, bias: Tensor, groups: usize, eps: f32) -> Self {
        Self { weight, bias, groups, eps }
    }

    pub fn load(
        source: &impl WeightSource,
        prefix: &str,
        width: usize,
        groups: usize,
        eps: f32,
        device: Device,
    ) -> Result<Self, WeightError> {
        Ok(Self::new(
            load_vector(source, &format!("{prefix}.weight"), width, device)?,
            load_vector(source, &format!("{prefix}.bias"), width, device)?,
            groups,
            eps,
        ))
    }

    pub fn forward(&self, x: &impl AsView, out: &mut impl AsViewMut) -> Result<(), TensorError> {
        x.group_norm(&self.weight, &self.bias, self.groups, self.eps, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DType;
    use proptest::prelude::*;

    fn identity(width: usize) -> (Tensor, Tensor) {
        (
            Tensor::from_slice(&vec![1f32; width], &[width]),
            Tensor::from_slice(&vec![0f32; width], &[width]),
        )
    }

    #[test]
    fn test_layer_norm_applies_affine() {
        let norm = LayerNorm::new(
            Tensor::from_slice(&[2f32, 2.], &[2]),
            Tensor::from_slice(&[1f32, 1.], &[2]),
            0.0,
        );
        let x = Tensor::from_slice(&[3f32, 5.], &[1, 1, 2]);
        let mut out = Tensor::zeros(&[1, 1, 2], DType::F32, Device::Cpu).unwrap();
        norm.forward(&x, &mut out).unwrap();
        assert_eq!(out.as_slice::<f32>().unwrap(), &[-1., 3.]);
    }

    proptest! {
        #[test]
        fn prop_group_norm_moments(values in prop::collection::vec(-10f32..10f32, 16)) {
            for group in values.chunks(4) {
                let mean = group.iter().sum::<f32>() / 4.0;
                let variance = group.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / 4.0;
                prop_assume!(variance > 1e-2);
            }
            let (weight, bias) = identity(8);
            let norm = GroupNorm::new(weight, bias, 2, 1e-5);
            let x = Tensor::from_slice(&values, &[2, 8]);
            let mut out = Tensor::zeros(&[2, 8], DType::F32, Device::Cpu).unwrap();
            norm.forward(&x, &mut out).unwrap();
            for group in out.as_slice::<f32>().unwrap().chunks(4) {
                let mean = group.iter().sum::<f32>() / 4.0;
                let variance = group.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / 4.0;
                prop_assert!(mean.abs() < 1e-3);
                prop_assert!((variance - 1.0).abs() < 1e-2);
            }
        }
    }
}
