//! # Errors
//!
//! Recoverable failures are reported through the enums below. Contract
//! violations (operands on different devices, mismatched shapes, slot indices
//! out of range) are programming errors and panic instead; the functions that
//! can panic say so under `# Panics`.

use thiserror::Error;
use crate::backend::Device;
use crate::tensor::DType;
use crate::scheduler::SessionId;

/// Failures of a tensor primitive that the caller can act on
#[derive(Debug, Error)]
pub enum TensorError {
    /// The device has no implementation of this primitive for these operands
    #[error("{op} is not supported on {device}")]
    Unsupported {
        op: &'static str,
        device: Device,
    },

    #[error("expected element type {expected}, found {actual}")]
    DTypeMismatch {
        expected: DType,
        actual: DType,
    },

    #[error("tensor of shape {shape:?} is not a scalar")]
    NotScalar {
        shape: Vec<usize>,
    },

    /// The accelerator runtime reported a failure
    #[error("accelerator backend: {0}")]
    Backend(String),
}

#[cfg(feature = "candle")]
impl From<candle_core::Error> for TensorError {
    fn from(value: candle_core::Error) -> Self {
        TensorError::Backend(value.to_string())
    }
}

/// Failures while resolving named tensors from a weight archive
#[derive(Debug, Error)]
pub enum WeightError {
    #[error("weight `{0}` is missing from the archive")]
    Missing(String),

    #[error("weight `{key}` has shape {actual:?}, expected {expected:?}")]
    Shape {
        key: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("weight `{key}` has unsupported element type {dtype}")]
    UnsupportedDType {
        key: String,
        dtype: String,
    },

    #[error("malformed archive: {0}")]
    Archive(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// Request-level failures returned to the host; other sessions are unaffected
#[derive(Debug, Error)]
pub enum SessionError {
    /// Every slot of the pool is occupied
    #[error("session pool is full ({capacity} slots)")]
    CapacityExceeded {
        capacity: usize,
    },

    /// The session is prefilling, decoding, or still holds unconsumed text
    #[error("session {id} is busy")]
    Busy {
        id: SessionId,
    },

    #[error("no session with id {0}")]
    UnknownSession(SessionId),

    /// A token id the model has no embedding row for
    #[error("token {token} is outside the vocabulary of {vocab}")]
    InvalidToken {
        token: u32,
        vocab: usize,
    },

    #[error("tokenizer: {0}")]
    Tokenizer(String),
}

/// Crate level error
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Tensor(#[from] TensorError),

    #[error(transparent)]
    Weight(#[from] WeightError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

pub type Result<T> = std::result::Result<T, Error>;
