//! Deterministic collaborators shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use crate::backend::Device;
use crate::error::{SessionError, TensorError};
use crate::scheduler::{RecurrentModel, Sampler, Tokenizer};
use crate::tensor::{DType, Tensor};

pub(crate) const VOCAB: usize = 256;
pub(crate) const CHANNELS: usize = 8;
pub(crate) const HIDDEN: usize = 16;
pub(crate) const LAYERS: usize = 2;
/// Two heads of four channels
pub(crate) const HEADS: usize = 2;

/// One token per byte
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ByteTokenizer;

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>, SessionError> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn decode(&self, tokens: &[u32]) -> Result<String, SessionError> {
        let bytes = tokens
            .iter()
            .map(|&t| u8::try_from(t).map_err(|_| SessionError::Tokenizer(format!("{t} is not a byte"))))
            .collect::<Result<Vec<_>, _>>()?;
        String::from_utf8(bytes).map_err(|e| SessionError::Tokenizer(e.to_string()))
    }
}

/// Replays a fixed token sequence, then `fallback` forever
#[derive(Debug, Clone)]
pub(crate) struct ScriptedSampler {
    script: VecDeque<u32>,
    fallback: u32,
}

impl ScriptedSampler {
    /// The script followed by token 0
    pub(crate) fn new(script: impl IntoIterator<Item = u32>) -> Self {
        Self { script: script.into_iter().collect(), fallback: 0 }
    }

    pub(crate) fn repeat(token: u32) -> Self {
        Self { script: VecDeque::new(), fallback: token }
    }
}

impl Sampler for ScriptedSampler {
    fn select(&mut self, _logits: &[f32], _temperature: f32, _tau: f32) -> u32 {
        self.script.pop_front().unwrap_or(self.fallback)
    }
}

/// A model whose state is the list of tokens it has been fed. Every forward
/// call is recorded; logits are all zero.
#[derive(Debug, Clone)]
pub(crate) struct EchoModel {
    slots: Vec<Vec<u32>>,
    max_tokens: usize,
    calls: Vec<Vec<Vec<u32>>>,
    failing_on: Option<u32>,
}

impl EchoModel {
    pub(crate) fn new(slots: usize, max_tokens: usize) -> Self {
        Self { slots: vec![Vec::new(); slots], max_tokens, calls: Vec::new(), failing_on: None }
    }

    /// Fail every forward pass whose input contains `token`
    pub(crate) fn failing_on(mut self, token: u32) -> Self {
        self.failing_on = Some(token);
        self
    }

    pub(crate) fn calls(&self) -> &[Vec<Vec<u32>>] {
        &self.calls
    }
}

impl RecurrentModel for EchoModel {
    type State = Vec<u32>;

    fn new_state(&self) -> Result<Vec<u32>, TensorError> {
        Ok(Vec::new())
    }

    fn load_state(&mut self, state: &Vec<u32>, slot: usize) -> Result<(), TensorError> {
        self.slots[slot] = state.clone();
        Ok(())
    }

    fn store_state(&mut self, state: &mut Vec<u32>, slot: usize) -> Result<(), TensorError> {
        state.clone_from(&self.slots[slot]);
        Ok(())
    }

    fn forward(&mut self, tokens: &[Vec<u32>]) -> Result<Tensor, TensorError> {
        let time = tokens[0].len();
        assert!(tokens.len() <= self.slots.len(), "batch exceeds slots");
        assert!(tokens.len() * time <= self.max_tokens, "batch exceeds token budget");
        assert!(tokens.iter().flatten().all(|&t| (t as usize) < VOCAB), "token outside vocabulary");
        if self.failing_on.is_some_and(|poison| tokens.iter().flatten().any(|&t| t == poison)) {
            return Err(TensorError::Unsupported { op: "forward", device: Device::Cpu });
        }
        for (slot, row) in tokens.iter().enumerate() {
            self.slots[slot].extend_from_slice(row);
        }
        self.calls.push(tokens.to_vec());
        Tensor::zeros(&[tokens.len(), time, VOCAB], DType::F32, Device::Cpu)
    }

    fn max_batch(&self) -> usize {
        self.slots.len()
    }

    fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    fn vocab_size(&self) -> usize {
        VOCAB
    }
}

/// A two-layer RWKV-5 checkpoint with seeded random weights:
/// vocabulary 256, 8 channels in two heads of 4, feed-forward width 16.
pub(crate) fn tiny_checkpoint() -> HashMap<String, Tensor> {
    let mut rng = StdRng::seed_from_u64(5);
    let mut weights = HashMap::new();
    let mut put = |key: String, shape: &[usize], low: f32, high: f32| {
        let count: usize = shape.iter().product();
        let values: Vec<f32> = (0..count).map(|_| rng.gen_range(low..high)).collect();
        weights.insert(key, Tensor::from_slice(&values, shape));
    };

    put("emb.weight".to_string(), &[VOCAB, CHANNELS], -1.0, 1.0);
    fn norm(put: &mut dyn FnMut(String, &[usize], f32, f32), prefix: &str) {
        put(format!("{prefix}.weight"), &[CHANNELS], 0.8, 1.2);
        put(format!("{prefix}.bias"), &[CHANNELS], -0.1, 0.1);
    }
    norm(&mut put, "blocks.0.ln0");
    for layer in 0..LAYERS {
        let block = format!("blocks.{layer}");
        norm(&mut put, &format!("{block}.ln1"));
        norm(&mut put, &format!("{block}.ln2"));
        norm(&mut put, &format!("{block}.att.ln_x"));
        for mix in ["k", "v", "r", "g"] {
            put(format!("{block}.att.time_mix_{mix}"), &[1, 1, CHANNELS], 0.1, 0.9);
        }
        put(format!("{block}.att.time_decay"), &[HEADS, CHANNELS / HEADS], 0.5, 0.95);
        put(format!("{block}.att.time_faaaa"), &[HEADS, CHANNELS / HEADS], -0.2, 0.2);
        for projection in ["receptance", "key", "value", "gate", "output"] {
            put(format!("{block}.att.{projection}.weight"), &[CHANNELS, CHANNELS], -0.5, 0.5);
        }
        put(format!("{block}.ffn.time_mix_k"), &[1, 1, CHANNELS], 0.1, 0.9);
        put(format!("{block}.ffn.time_mix_r"), &[1, 1, CHANNELS], 0.1, 0.9);
        put(format!("{block}.ffn.key.weight"), &[HIDDEN, CHANNELS], -0.5, 0.5);
        put(format!("{block}.ffn.receptance.weight"), &[CHANNELS, CHANNELS], -0.5, 0.5);
        put(format!("{block}.ffn.value.weight"), &[CHANNELS, HIDDEN], -0.5, 0.5);
    }
    norm(&mut put, "ln_out");
    put("head.weight".to_string(), &[VOCAB, CHANNELS], -0.5, 0.5);
    weights
}
