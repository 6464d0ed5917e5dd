use tracing::debug;
use crate::backend::Device;
use crate::error::{TensorError, WeightError};
use crate::tensor::{AsView, AsViewMut, DType, Tensor, TensorOps};
use crate::weights::WeightSource;

/// A projection `out[.., o] = Σ_k W[o, k] · x[.., k]`.
///
/// The weight is either kept dense (f32 or bf16) or block-quantized to u8,
/// where every run of `block` input channels in a row shares a scale and an
/// offset: `W[o, k] ≈ q[o, k] · scale[o, k / block] + offset[o, k / block]`.
#[derive(Debug, Clone)]
pub enum Linear {
    Dense {
        weight: Tensor,
    },
    Quantized {
        weight: Tensor,
        scale: Tensor,
        offset: Tensor,
    },
}

impl Linear {
    /// Load `<prefix>.weight`, quantizing it when `quantize` is set and the
    /// input width is a multiple of `block`
    pub fn load(
        source: &impl WeightSource,
        prefix: &str,
        quantize: bool,
        block: usize,
        device: Device,
    ) -> Result<Self, WeightError> {
        let key = format!("{prefix}.weight");
        let weight = source.get(&key)?;
        if weight.rank() != 2 {
            return Err(WeightError::Shape {
                key,
                expected: vec![0, 0],
                actual: weight.shape().to_vec(),
            });
        }
        let weight = match weight.dtype() {
            DType::F32 | DType::BF16 => weight,
            DType::F16 | DType::F64 => weight.to_f32()?,
            other => {
                return Err(WeightError::UnsupportedDType { key, dtype: other.to_string() });
            }
        };
        let linear = if quantize && weight.shape()[1] % block == 0 {
            Linear::quantize(&weight.to_f32()?, block)?
        } else {
            if quantize {
                debug!(key = %key, block, "input width does not tile into blocks, keeping dense");
            }
            Linear::Dense { weight }
        };
        Ok(linear.to_device(device)?)
    }

    /// Block-quantize a host f32 `[out, in]` weight with per-(row, block)
    /// min/max ranges.
    ///
    /// # Panics
    ///
    /// Panics if `in` is not a multiple of `block`.
    pub fn quantize(weight: &Tensor, block: usize) -> Result<Self, TensorError> {
        let (outputs, inputs) = (weight.shape()[0], weight.shape()[1]);
        assert!(block > 0 && inputs % block == 0, "{inputs} inputs do not tile into blocks of {block}");
        let values = weight.as_slice::<f32>()?;
        let blocks = inputs / block;
        let mut quantized = Vec::with_capacity(outputs * inputs);
        let mut scales = Vec::with_capacity(outputs * blocks);
        let mut offsets = Vec::with_capacity(outputs * blocks);
        for chunk in values.chunks_exact(block) {
            let min = chunk.iter().copied().fold(f32::INFINITY, f32::min);
            let max = chunk.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let scale = (max - min) / 255.0;
            quantized.extend(chunk.iter().map(|v| {
                if scale > 0.0 {
                    ((v - min) / scale).round().clamp(0.0, 255.0) as u8
                } else {
                    0
                }
            }));
            scales.push(scale);
            offsets.push(min);
        }
        Ok(Linear::Quantized {
            weight: Tensor::from_slice(&quantized, &[outputs, inputs]),
            scale: Tensor::from_slice(&scales, &[outputs, blocks]),
            offset: Tensor::from_slice(&offsets, &[outputs, blocks]),
        })
    }

    pub fn to_device(self, device: Device) -> Result<Self, TensorError> {
        Ok(match self {
            Linear::Dense { weight } => Linear::Dense { weight: weight.to_device(device)? },
            Linear::Quantized { weight, scale, offset } => Linear::Quantized {
                weight: weight.to_device(device)?,
                scale: scale.to_device(device)?,
                offset: offset.to_device(device)?,
            },
        })
    }

    fn weight(&self) -> &Tensor {
        match self {
            Linear::Dense { weight } | Linear::Quantized { weight, .. } => weight,
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight().shape()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight().shape()[0]
    }

    /// Project `input` (`[.., in]`) into `out` (`[.., out]`).
    ///
    /// # Panics
    ///
    /// Panics unless `out` holds exactly `rows × out_features` elements, where
    /// `rows` is the number of input rows.
    pub fn forward(&self, input: &impl AsView, out: &mut impl AsViewMut) -> Result<(), TensorError> {
        let rows = input.view().element_count() / self.in_features();
        assert_eq!(
            out.view().element_count(),
            rows * self.out_features(),
            "linear output buffer must hold {} rows of {}",
            rows,
            self.out_features()
        );
        match self {
            Linear::Dense { weight } => weight.matmul(input, out),
            Linear::Quantized { weight, scale, offset } => weight.matmul_quantized(scale, offset, input, out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use proptest::prelude::*;

    fn project(linear: &Linear, input: &Tensor) -> Vec<f32> {
        let rows = input.element_count() / linear.in_features();
        let mut out = Tensor::zeros(&[rows, linear.out_features()], DType::F32, Device::Cpu).unwrap();
        linear.forward(input, &mut out).unwrap();
        out.to_vec::<f32>().unwrap()
    }

    #[test]
    fn test_constant_block_round_trips_exactly() {
        let weight = Tensor::from_slice(&[0.25f32; 64], &[2, 32]);
        let Linear::Quantized { scale, offset, .. } = Linear::quantize(&weight, 32).unwrap() else {
            panic!("expected a quantized projection");
        };
        assert_eq!(scale.as_slice::<f32>().unwrap(), &[0., 0.]);
        assert_eq!(offset.as_slice::<f32>().unwrap(), &[0.25, 0.25]);
    }

    #[test]
    #[should_panic(expected = "must hold")]
    fn test_wrong_output_size_panics() {
        let linear = Linear::Dense { weight: Tensor::from_slice(&[1f32, 0., 0., 1.], &[2, 2]) };
        let input = Tensor::from_slice(&[1f32, 2.], &[1, 2]);
        let mut out = Tensor::zeros(&[3], DType::F32, Device::Cpu).unwrap();
        let _ = linear.forward(&input, &mut out);
    }

    #[test]
    fn test_load_quantizes_only_tiling_weights() {
        let mut weights = HashMap::new();
        weights.insert("a.weight".to_string(), Tensor::from_slice(&[1f32; 64], &[1, 64]));
        weights.insert("b.weight".to_string(), Tensor::from_slice(&[1f32; 6], &[2, 3]));
        let a = Linear::load(&weights, "a", true, 32, Device::Cpu).unwrap();
        let b = Linear::load(&weights, "b", true, 32, Device::Cpu).unwrap();
        assert!(matches!(a, Linear::Quantized { .. }));
        assert!(matches!(b, Linear::Dense { .. }));
        assert!(matches!(
            Linear::load(&weights, "c", false, 32, Device::Cpu),
            Err(WeightError::Missing(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_quantized_projection_tracks_dense(
            values in prop::collection::vec(-1f32..1f32, 128),
            input in prop::collection::vec(-1f32..1f32, 64),
        ) {
            let weight = Tensor::from_slice(&values, &[2, 64]);
            let input = Tensor::from_slice(&input, &[1, 64]);
            let dense = project(&Linear::Dense { weight: weight.clone() }, &input);
            let quantized = project(&Linear::quantize(&weight, 32).unwrap(), &input);
            // each weight is off by at most half a step of 2/255
            let bound = 64.0 * (1.0 / 255.0) + 1e-4;
            for (d, q) in dense.iter().zip(&quantized) {
                prop_assert!((d - q).abs() <= bound, "{} vs {}", d, q);
            }
        }
    }
}
