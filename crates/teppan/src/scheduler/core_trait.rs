use crate::error::{SessionError, TensorError};
use crate::tensor::Tensor;

/// # RecurrentModel
///
/// A model whose whole history is summarized by a fixed-size state, advanced
/// one batch at a time.
///
/// The model keeps working state for [`RecurrentModel::max_batch`] slots.
/// Row `b` of a [`RecurrentModel::forward`] call reads and advances slot `b`,
/// so the scheduler loads each participating session's state into its row's
/// slot before the call and stores it back afterwards.
///
/// ## Input/Output Dimensions
///
/// `forward` takes `tokens[batch][time]` (every row the same length) and
/// returns logits shaped `(batch, time, vocab)`.
pub trait RecurrentModel {
    /// A session's saved state
    type State: Send;

    /// A state equal to that of a session that has seen no tokens
    fn new_state(&self) -> Result<Self::State, TensorError>;

    /// Copy `state` into working slot `slot`
    fn load_state(&mut self, state: &Self::State, slot: usize) -> Result<(), TensorError>;

    /// Copy working slot `slot` out into `state`
    fn store_state(&mut self, state: &mut Self::State, slot: usize) -> Result<(), TensorError>;

    /// Run `tokens` through slots `0..tokens.len()`
    fn forward(&mut self, tokens: &[Vec<u32>]) -> Result<Tensor, TensorError>;

    /// Number of working slots, the widest batch `forward` accepts
    fn max_batch(&self) -> usize;

    /// Upper bound on `batch × time` for one `forward` call
    fn max_tokens(&self) -> usize;

    /// Token ids `forward` accepts are `0..vocab_size()`
    fn vocab_size(&self) -> usize;
}

/// Text to token ids and back
pub trait Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>, SessionError>;

    fn decode(&self, tokens: &[u32]) -> Result<String, SessionError>;
}

/// Picks the next token from one row of logits
pub trait Sampler {
    /// `temperature` flattens (`> 1`) or sharpens (`< 1`) the distribution;
    /// `tau` is the probability mass kept around the expected surprise
    fn select(&mut self, logits: &[f32], temperature: f32, tau: f32) -> u32;
}
