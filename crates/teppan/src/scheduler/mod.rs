//! # Continuous Batching
//!
//! Many independent sessions share one [`RecurrentModel`]. Because the model
//! summarizes a session's whole history in a fixed-size state, sessions can
//! join and leave the decode batch at any step: their state is copied into a
//! working slot for the forward pass and copied back out afterwards.
//!
//! ```text
//!  ingest("...")        generate(n)
//!  Idle ──────► Prefilling ──► Idle ─────────► Decoding ──► Idle
//!                   step()                  step() × ≤ n
//! ```
//!
//! ## Key Components
//!
//! * [`BatchScheduler`] - session pool and the [`step`](BatchScheduler::step) algorithm
//! * [`RecurrentModel`], [`Tokenizer`], [`Sampler`] - the collaborators it drives
//! * [`SessionId`], [`Phase`], [`StepReport`]

mod batcher;
mod core_trait;
mod session;

pub use batcher::{BatchScheduler, StepReport};
pub use core_trait::*;
pub use session::{Phase, SessionId};
