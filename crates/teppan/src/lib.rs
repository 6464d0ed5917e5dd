//! # Teppan
//!
//! Batched inference for RWKV-5 models: many independent sessions decode
//! together over one set of shared weights, each resuming from its own
//! fixed-size recurrent state.
//!
//! ## Overview
//!
//! RWKV summarizes everything a sequence has seen in a per-layer state of
//! constant size. That makes continuous batching cheap: a session joins a
//! decode step by copying its state into a working slot and leaves by copying
//! it back. No key/value cache grows with the conversation and no padding is
//! needed.
//!
//! Key components:
//!
//! - [`tensor`] - an owned tensor with borrowed views, on host or accelerator
//! - [`backend`] - the primitives a forward pass needs, per device
//! - [`layers`] and [`model`] - the RWKV-5 network, with dense or u8
//!   block-quantized projections
//! - [`scheduler`] - the session pool and the step algorithm
//! - [`driver`] - a tokio task that steps the scheduler and streams tokens
//!
//! ## Assumptions
//!
//! Tensors fed to the model reserve two dimensions:
//!  - The `0th` dimension is the batch dimension
//!  - The `1st` dimension is the sequence dimension
//!
//! Row `b` of a batch always runs in working slot `b`.
//!
//! ## Example
//!
//! ```no_run
//! use teppan::config::{ModelConfig, SchedulerConfig};
//! use teppan::model::Rwkv;
//! use teppan::sampler::TypicalSampler;
//! use teppan::scheduler::{BatchScheduler, Tokenizer};
//! use teppan::weights::SafeTensorsArchive;
//! use teppan::error::SessionError;
//!
//! struct Bytes;
//!
//! impl Tokenizer for Bytes {
//!     fn encode(&self, text: &str) -> Result<Vec<u32>, SessionError> {
//!         Ok(text.bytes().map(u32::from).collect())
//!     }
//!
//!     fn decode(&self, tokens: &[u32]) -> Result<String, SessionError> {
//!         Ok(tokens.iter().map(|&t| t as u8 as char).collect())
//!     }
//! }
//!
//! # fn main() -> teppan::error::Result<()> {
//! let archive = SafeTensorsArchive::open("rwkv-5.safetensors")?;
//! let config = SchedulerConfig::default().with_max_sessions(4);
//! let model = Rwkv::load(&archive, ModelConfig::default(), 4, config.prefill_chunk())?;
//! let mut scheduler = BatchScheduler::new(model, Bytes, TypicalSampler::new(), config);
//!
//! let id = scheduler.create_session()?;
//! scheduler.ingest(id, "The quick brown fox")?;
//! scheduler.run_until_idle();
//! scheduler.generate(id, 16)?;
//! scheduler.run_until_idle();
//! println!("{}", scheduler.context(id)?);
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **safetensors** (default) - load weights from `.safetensors` archives
//! - **candle** - run on a candle device (CUDA or Metal when available)

pub mod backend;
pub mod config;
mod core;
pub mod driver;
pub mod error;
pub mod layers;
pub mod model;
pub mod sampler;
pub mod scheduler;
pub mod state;
pub mod tensor;
pub mod weights;

#[cfg(test)]
pub(crate) mod testing;

/// Constants for client reference
pub use tensor::constant;

pub use backend::Device;
pub use error::{Error, Result};
pub use model::Rwkv;
pub use scheduler::{BatchScheduler, SessionId};
