//! # Weight Sources
//!
//! The model resolves every parameter by name (`emb.weight`,
//! `blocks.<n>.att.key.weight`, ...) through a [`WeightSource`]. Two sources
//! ship with the crate:
//!
//! - `HashMap<String, Tensor>` for weights built in memory
//! - [`SafeTensorsArchive`] for `.safetensors` files (feature `safetensors`)
//!
//! Returned tensors live on the host; the model moves them to its device.

use std::collections::HashMap;
use crate::error::WeightError;
use crate::tensor::Tensor;

/// Named-tensor lookup
pub trait WeightSource {
    /// The tensor stored under `key`, or [`WeightError::Missing`]
    fn get(&self, key: &str) -> Result<Tensor, WeightError>;

    fn contains(&self, key: &str) -> bool;

    /// Like [`WeightSource::get`], also checking the shape
    fn get_shaped(&self, key: &str, shape: &[usize]) -> Result<Tensor, WeightError> {
        let tensor = self.get(key)?;
        if tensor.shape() != shape {
            return Err(WeightError::Shape {
                key: key.to_string(),
                expected: shape.to_vec(),
                actual: tensor.shape().to_vec(),
            });
        }
        Ok(tensor)
    }
}

impl WeightSource for HashMap<String, Tensor> {
    fn get(&self, key: &str) -> Result<Tensor, WeightError> {
        HashMap::get(self, key)
            .cloned()
            .ok_or_else(|| WeightError::Missing(key.to_string()))
    }

    fn contains(&self, key: &str) -> bool {
        self.contains_key(key)
    }
}

#[cfg(feature = "safetensors")]
pub use archive::SafeTensorsArchive;

#[cfg(feature = "safetensors")]
mod archive {
    use std::collections::HashMap;
    use std::path::Path;
    use safetensors::{Dtype, SafeTensors};
    use tracing::info;
    use crate::error::WeightError;
    use crate::tensor::{DType, Tensor};
    use super::WeightSource;

    struct Entry {
        dtype: Dtype,
        shape: Vec<usize>,
        start: usize,
        end: usize,
    }

    /// A `.safetensors` file held in memory with its header parsed once
    pub struct SafeTensorsArchive {
        bytes: Vec<u8>,
        data_start: usize,
        entries: HashMap<String, Entry>,
    }

    fn dtype_of(dtype: Dtype) -> Option<DType> {
        let mapped = match dtype {
            Dtype::BOOL => DType::Bool,
            Dtype::U8 => DType::U8,
            Dtype::I8 => DType::I8,
            Dtype::I16 => DType::I16,
            Dtype::U16 => DType::U16,
            Dtype::F16 => DType::F16,
            Dtype::BF16 => DType::BF16,
            Dtype::I32 => DType::I32,
            Dtype::U32 => DType::U32,
            Dtype::F32 => DType::F32,
            Dtype::F64 => DType::F64,
            Dtype::I64 => DType::I64,
            Dtype::U64 => DType::U64,
            _ => return None,
        };
        Some(mapped)
    }

    impl SafeTensorsArchive {
        pub fn open(path: impl AsRef<Path>) -> Result<Self, WeightError> {
            let path = path.as_ref();
            let archive = Self::from_bytes(std::fs::read(path)?)?;
            info!(path = %path.display(), tensors = archive.entries.len(), "weight archive opened");
            Ok(archive)
        }

        pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, WeightError> {
            let (header_len, metadata) = SafeTensors::read_metadata(&bytes)
                .map_err(|e| WeightError::Archive(e.to_string()))?;
            let entries = metadata
                .tensors()
                .into_iter()
                .map(|(name, info)| {
                    let (start, end) = info.data_offsets;
                    let entry = Entry { dtype: info.dtype, shape: info.shape.clone(), start, end };
                    (name, entry)
                })
                .collect();
            Ok(Self {
                bytes,
                data_start: 8 + header_len,
                entries,
            })
        }

        pub fn keys(&self) -> impl Iterator<Item = &str> {
            self.entries.keys().map(String::as_str)
        }
    }

    impl WeightSource for SafeTensorsArchive {
        fn get(&self, key: &str) -> Result<Tensor, WeightError> {
            let entry = self.entries.get(key).ok_or_else(|| WeightError::Missing(key.to_string()))?;
            let dtype = dtype_of(entry.dtype).ok_or_else(|| WeightError::UnsupportedDType {
                key: key.to_string(),
                dtype: format!("{:?}", entry.dtype),
            })?;
            let bytes = self
                .bytes
                .get(self.data_start + entry.start..self.data_start + entry.end)
                .ok_or_else(|| WeightError::Archive(format!("`{key}` points past the end of the file")))?;
            let expected = entry.shape.iter().product::<usize>() * dtype.size_in_bytes();
            if bytes.len() != expected {
                return Err(WeightError::Archive(format!(
                    "`{key}` holds {} bytes, its shape needs {expected}",
                    bytes.len()
                )));
            }
            Ok(Tensor::from_bytes(bytes, dtype, &entry.shape))
        }

        fn contains(&self, key: &str) -> bool {
            self.entries.contains_key(key)
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_source() {
        let mut weights = HashMap::new();
        weights.insert("ln_out.weight".to_string(), Tensor::from_slice(&[1f32, 1.], &[2]));
        assert!(weights.contains("ln_out.weight"));
        assert_eq!(WeightSource::get(&weights, "ln_out.weight").unwrap().shape(), &[2]);
        assert!(matches!(WeightSource::get(&weights, "x"), Err(WeightError::Missing(_))));
    }
}
