//! # RWKV-5 Model
//!
//! [`Rwkv`] wires the layers into the full network:
//!
//! ```text
//! tokens ─ emb ─ ln0 ─┬─ [ ln1 ─ attention ─ + ─ ln2 ─ feed-forward ─ + ] × layers ─ ln_out ─ head ─ logits
//! ```
//!
//! The model holds working state for a fixed number of batch slots. Row `b`
//! of a forward pass reads and advances slot `b`; [`Rwkv::load_state`] and
//! [`Rwkv::store_state`] move a session's [`RecurrentState`] in and out of a
//! slot.
//!
//! Dimensions are read from the archive: vocabulary and width from
//! `emb.weight`, the layer count from the `blocks.<n>` prefixes, the head
//! count from the width and [`ModelConfig::head_size`].

use tracing::{debug_span, info};
use crate::backend::Device;
use crate::config::ModelConfig;
use crate::error::{TensorError, WeightError};
use crate::layers::{Attention, FeedForward, LayerNorm, Linear, Workspace};
use crate::scheduler::RecurrentModel;
use crate::state::{LayerState, RecurrentState};
use crate::tensor::{DType, Tensor, TensorOps, TensorOpsMut};
use crate::weights::WeightSource;

#[derive(Debug)]
struct Block {
    ln1: LayerNorm,
    att: Attention,
    ln2: LayerNorm,
    ffn: FeedForward,
}

#[derive(Debug)]
pub struct Rwkv {
    config: ModelConfig,
    /// `[vocab, channels]`, f32 or bf16
    embedding: Tensor,
    ln0: LayerNorm,
    blocks: Vec<Block>,
    ln_out: LayerNorm,
    head: Linear,
    max_batch: usize,
    max_tokens: usize,
    workspace: Workspace,
    /// Residual stream
    x: Tensor,
    normed: Tensor,
    block_out: Tensor,
}

fn count_layers(source: &impl WeightSource) -> usize {
    (0..).take_while(|n| source.contains(&format!("blocks.{n}.att.key.weight"))).count()
}

impl Rwkv {
    /// Load every parameter from `source`.
    ///
    /// `max_batch` is the number of slots (the widest batch a forward pass
    /// may carry) and `max_tokens` bounds `batch × time` of any single pass.
    pub fn load(
        source: &impl WeightSource,
        config: ModelConfig,
        max_batch: usize,
        max_tokens: usize,
    ) -> Result<Self, WeightError> {
        let device = config.device;
        let embedding = source.get("emb.weight")?;
        if embedding.rank() != 2 {
            return Err(WeightError::Shape {
                key: "emb.weight".to_string(),
                expected: vec![0, 0],
                actual: embedding.shape().to_vec(),
            });
        }
        let (vocab, channels) = (embedding.shape()[0], embedding.shape()[1]);
        let embedding = match embedding.dtype() {
            DType::F32 | DType::BF16 => embedding,
            _ => embedding.to_f32()?,
        }
        .to_device(device)?;

        let layers = count_layers(source);
        let eps = config.layer_norm_eps;
        let mut blocks = Vec::with_capacity(layers);
        for layer in 0..layers {
            blocks.push(Block {
                ln1: LayerNorm::load(source, &format!("blocks.{layer}.ln1"), channels, eps, device)?,
                att: Attention::load(source, layer, channels, max_batch, &config)?,
                ln2: LayerNorm::load(source, &format!("blocks.{layer}.ln2"), channels, eps, device)?,
                ffn: FeedForward::load(source, layer, channels, max_batch, &config)?,
            });
        }
        let hidden = blocks.first().map(|b| b.ffn.hidden_size()).unwrap_or(channels);
        let head = Linear::load(source, "head", config.quantize, config.quant_block, device)?;
        if head.out_features() != vocab || head.in_features() != channels {
            return Err(WeightError::Shape {
                key: "head.weight".to_string(),
                expected: vec![vocab, channels],
                actual: vec![head.out_features(), head.in_features()],
            });
        }

        let rows = max_tokens.max(max_batch);
        info!(layers, channels, vocab, hidden, %device, quantized = config.quantize, "model loaded");
        Ok(Self {
            ln0: LayerNorm::load(source, "blocks.0.ln0", channels, eps, device)?,
            ln_out: LayerNorm::load(source, "ln_out", channels, eps, device)?,
            embedding,
            blocks,
            head,
            max_batch,
            max_tokens: rows,
            workspace: Workspace::new(rows, channels, hidden, device)?,
            x: Tensor::zeros(&[rows, channels], DType::F32, device)?,
            normed: Tensor::zeros(&[rows, channels], DType::F32, device)?,
            block_out: Tensor::zeros(&[rows, channels], DType::F32, device)?,
            config,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn vocab_size(&self) -> usize {
        self.embedding.shape()[0]
    }

    pub fn hidden_size(&self) -> usize {
        self.embedding.shape()[1]
    }

    pub fn layer_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn device(&self) -> Device {
        self.config.device
    }

    /// Logits `[batch, time, vocab]` for `tokens[b][t]`, advancing slots
    /// `0..batch`.
    ///
    /// # Panics
    ///
    /// Panics if rows differ in length or are empty, if there are more rows
    /// than slots, or if `batch × time` exceeds the model's token budget.
    pub fn forward(&mut self, tokens: &[Vec<u32>]) -> Result<Tensor, TensorError> {
        let batch = tokens.len();
        let time = tokens.first().map(Vec::len).unwrap_or(0);
        let span = debug_span!("model.forward", batch, time);
        let _guard = span.enter();
        assert!(batch > 0 && time > 0, "forward needs at least one token");
        assert!(batch <= self.max_batch, "{batch} rows exceed {} slots", self.max_batch);
        assert!(
            batch * time <= self.max_tokens,
            "{batch}×{time} tokens exceed a budget of {}",
            self.max_tokens
        );

        let shape = [batch, time, self.hidden_size()];
        self.workspace.resize(batch, time);
        for buffer in [&mut self.x, &mut self.normed, &mut self.block_out] {
            buffer.reshape_unchecked(&shape);
        }

        self.embedding.gather(tokens, &mut self.block_out)?;
        self.ln0.forward(&self.block_out, &mut self.x)?;
        for block in &mut self.blocks {
            block.ln1.forward(&self.x, &mut self.normed)?;
            block.att.forward(&self.normed, &mut self.workspace, &mut self.block_out)?;
            self.x.add_assign(&self.block_out)?;
            block.ln2.forward(&self.x, &mut self.normed)?;
            block.ffn.forward(&self.normed, &mut self.workspace, &mut self.block_out)?;
            self.x.add_assign(&self.block_out)?;
        }
        self.ln_out.forward(&self.x, &mut self.normed)?;

        let mut logits = Tensor::zeros(&[batch, time, self.vocab_size()], DType::F32, self.device())?;
        self.head.forward(&self.normed, &mut logits)?;
        Ok(logits)
    }

    /// A zeroed state for a new session
    pub fn new_state(&self) -> Result<RecurrentState, TensorError> {
        let layers = self
            .blocks
            .iter()
            .map(|block| {
                let (heads, size) = block.att.head_shape();
                LayerState::zeros(heads, size, self.hidden_size(), self.device())
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RecurrentState::new(layers))
    }

    /// Copy `state` into `slot`
    ///
    /// # Panics
    ///
    /// Panics if `slot` is out of range or `state` belongs to another model shape.
    pub fn load_state(&mut self, state: &RecurrentState, slot: usize) -> Result<(), TensorError> {
        assert_eq!(state.layers().len(), self.blocks.len(), "state has the wrong number of layers");
        for (block, layer) in self.blocks.iter_mut().zip(state.layers()) {
            block.att.wkv_slot_mut(slot).copy_from(&layer.wkv)?;
            block.att.shift_mut().slot_mut(slot).copy_from(&layer.att_shift)?;
            block.ffn.shift_mut().slot_mut(slot).copy_from(&layer.ffn_shift)?;
        }
        Ok(())
    }

    /// Copy `slot` out into `state`
    ///
    /// # Panics
    ///
    /// Panics if `slot` is out of range or `state` belongs to another model shape.
    pub fn store_state(&self, state: &mut RecurrentState, slot: usize) -> Result<(), TensorError> {
        assert_eq!(state.layers().len(), self.blocks.len(), "state has the wrong number of layers");
        for (block, layer) in self.blocks.iter().zip(state.layers_mut()) {
            layer.wkv.copy_from(&block.att.wkv_slot(slot))?;
            layer.att_shift.copy_from(&block.att.shift().slot(slot))?;
            layer.ffn_shift.copy_from(&block.ffn.shift().slot(slot))?;
        }
        Ok(())
    }

    /// Zero `slot`, as if a fresh session occupied it
    pub fn reset_slot(&mut self, slot: usize) -> Result<(), TensorError> {
        for block in &mut self.blocks {
            block.att.wkv_slot_mut(slot).fill(0.0)?;
            block.att.shift_mut().slot_mut(slot).fill(0.0)?;
            block.ffn.shift_mut().slot_mut(slot).fill(0.0)?;
        }
        Ok(())
    }
}

impl RecurrentModel for Rwkv {
    type State = RecurrentState;

    fn new_state(&self) -> Result<RecurrentState, TensorError> {
        Rwkv::new_state(self)
    }

    fn load_state(&mut self, state: &RecurrentState, slot: usize) -> Result<(), TensorError> {
        Rwkv::load_state(self, state, slot)
    }

    fn store_state(&mut self, state: &mut RecurrentState, slot: usize) -> Result<(), TensorError> {
        Rwkv::store_state(self, state, slot)
    }

    fn forward(&mut self, tokens: &[Vec<u32>]) -> Result<Tensor, TensorError> {
        Rwkv::forward(self, tokens)
    }

    fn max_batch(&self) -> usize {
        self.max_batch
    }

    fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    fn vocab_size(&self) -> usize {
        Rwkv::vocab_size(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GateActivation;
    use crate::testing::tiny_checkpoint;

    fn model(slots: usize, tokens: usize) -> Rwkv {
        let config = ModelConfig::default().with_head_size(4);
        Rwkv::load(&tiny_checkpoint(), config, slots, tokens).unwrap()
    }

    fn last_logits(logits: &Tensor, row: usize) -> Vec<f32> {
        let time = logits.shape()[1];
        logits.get(row).get(time - 1).to_vec::<f32>().unwrap()
    }

    fn close(a: &[f32], b: &[f32]) -> bool {
        a.iter().zip(b).all(|(a, b)| (a - b).abs() < 1e-4)
    }

    #[test]
    fn test_dimensions_come_from_the_archive() {
        let model = model(2, 8);
        assert_eq!(model.layer_count(), 2);
        assert_eq!(model.hidden_size(), 8);
        assert_eq!(model.vocab_size(), 256);
        let state = model.new_state().unwrap();
        assert_eq!(state.layers()[0].wkv.shape(), &[2, 4, 4]);
    }

    #[test]
    fn test_chunked_prefill_matches_one_pass() {
        let mut whole = model(1, 8);
        let mut chunked = model(1, 8);
        let logits = whole.forward(&[vec![1, 2, 3, 4]]).unwrap();
        chunked.forward(&[vec![1, 2]]).unwrap();
        let tail = chunked.forward(&[vec![3, 4]]).unwrap();
        assert_eq!(logits.shape(), &[1, 4, 256]);
        assert!(close(&last_logits(&logits, 0), &last_logits(&tail, 0)));
    }

    #[test]
    fn test_batched_rows_are_independent() {
        let mut single = model(2, 8);
        let mut batched = model(2, 8);
        let alone = single.forward(&[vec![5]]).unwrap();
        let together = batched.forward(&[vec![5], vec![9]]).unwrap();
        assert!(close(&last_logits(&alone, 0), &last_logits(&together, 0)));
    }

    #[test]
    fn test_state_moves_between_slots() {
        let mut model = model(2, 8);
        model.forward(&[vec![1, 2, 3]]).unwrap();
        let mut state = model.new_state().unwrap();
        model.store_state(&mut state, 0).unwrap();
        model.reset_slot(0).unwrap();
        model.load_state(&state, 1).unwrap();

        // slot 1 now continues the sequence, slot 0 starts fresh
        let logits = model.forward(&[vec![4], vec![4]]).unwrap();
        let mut reference = self::model(1, 8);
        let continued = reference.forward(&[vec![1, 2, 3, 4]]).unwrap();
        assert!(close(&last_logits(&logits, 1), &last_logits(&continued, 0)));
        assert!(!close(&last_logits(&logits, 0), &last_logits(&logits, 1)));
    }

    #[test]
    fn test_quantized_model_stays_close() {
        let mut dense = model(1, 4);
        let config = ModelConfig::default().with_head_size(4).with_quantize(true).with_quant_block(8);
        let mut quantized = Rwkv::load(&tiny_checkpoint(), config, 1, 4).unwrap();
        let a = dense.forward(&[vec![3, 7]]).unwrap().to_vec::<f32>().unwrap();
        let b = quantized.forward(&[vec![3, 7]]).unwrap().to_vec::<f32>().unwrap();
        assert!(a.iter().zip(&b).all(|(a, b)| (a - b).abs() < 0.1));
    }

    #[test]
    fn test_sigmoid_gate_changes_output() {
        let mut silu = model(1, 4);
        let config = ModelConfig::default().with_head_size(4).with_gate(GateActivation::Sigmoid);
        let mut sigmoid = Rwkv::load(&tiny_checkpoint(), config, 1, 4).unwrap();
        let a = silu.forward(&[vec![2]]).unwrap().to_vec::<f32>().unwrap();
        let b = sigmoid.forward(&[vec![2]]).unwrap().to_vec::<f32>().unwrap();
        assert!(!close(&a, &b));
    }

    #[test]
    #[should_panic(expected = "exceed")]
    fn test_token_budget_is_enforced() {
        let mut model = model(1, 4);
        let _ = model.forward(&[vec![1, 2, 3, 4, 5]]);
    }

    #[test]
    fn test_missing_weight_is_reported() {
        let mut weights = tiny_checkpoint();
        weights.remove("blocks.1.ffn.value.weight");
        let result = Rwkv::load(&weights, ModelConfig::default().with_head_size(4), 1, 4);
        assert!(matches!(result, Err(WeightError::Missing(key)) if key == "blocks.1.ffn.value.weight"));
    }
}
