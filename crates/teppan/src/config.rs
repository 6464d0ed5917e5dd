//! Model and scheduler configuration.
//!
//! Both structs are plain data with [`Default`] values matching stock RWKV-5
//! checkpoints and the reference host, and `with_*` builders for overrides:
//!
//! ```
//! use teppan::config::{ModelConfig, SchedulerConfig};
//!
//! let model = ModelConfig::default().with_quantize(true);
//! let scheduler = SchedulerConfig::default()
//!     .with_max_sessions(8)
//!     .with_prefill_chunk(32);
//! assert_eq!(scheduler.prefill_chunk(), 32);
//! assert!(model.quantize);
//! ```

use crate::backend::Device;

/// How `time_decay` is stored in the archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecayFormat {
    /// Already the per-step multiplier `w`
    #[default]
    Precomputed,
    /// The raw parameter `x`; `w = exp(-exp(x))` is applied at load
    Raw,
}

/// Activation applied to the gate projection before it scales the
/// normalized attention output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GateActivation {
    /// `g · σ(g)`, as in RWKV-5.2 checkpoints
    #[default]
    Silu,
    /// `σ(g)`
    Sigmoid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    /// Channels per attention head
    pub head_size: usize,
    /// The attention readout is scaled by `1 / head_size_divisor` before the
    /// grouped norm
    pub head_size_divisor: f32,
    pub layer_norm_eps: f32,
    pub group_norm_eps: f32,
    /// Block-quantize every projection to u8 at load
    pub quantize: bool,
    /// Input channels sharing one scale and offset
    pub quant_block: usize,
    pub decay: DecayFormat,
    pub gate: GateActivation,
    /// Where weights and working buffers live
    pub device: Device,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            head_size: 64,
            head_size_divisor: 8.0,
            layer_norm_eps: 1e-5,
            group_norm_eps: 1e-5,
            quantize: false,
            quant_block: 32,
            decay: DecayFormat::default(),
            gate: GateActivation::default(),
            device: Device::Cpu,
        }
    }
}

impl ModelConfig {
    pub fn with_head_size(mut self, head_size: usize) -> Self {
        self.head_size = head_size;
        self
    }

    pub fn with_head_size_divisor(mut self, divisor: f32) -> Self {
        self.head_size_divisor = divisor;
        self
    }

    pub fn with_quantize(mut self, quantize: bool) -> Self {
        self.quantize = quantize;
        self
    }

    pub fn with_quant_block(mut self, block: usize) -> Self {
        self.quant_block = block;
        self
    }

    pub fn with_decay(mut self, decay: DecayFormat) -> Self {
        self.decay = decay;
        self
    }

    pub fn with_gate(mut self, gate: GateActivation) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Session slots, which is also the widest decode batch
    pub max_sessions: usize,
    /// Tokens per prefill forward pass; `None` uses `max_sessions`
    pub prefill_chunk: Option<usize>,
    /// History tokens decoded together with each candidate for stop-string checks
    pub stop_window: usize,
    /// Token a new session feeds first
    pub default_last_token: u32,
    pub default_temperature: f32,
    pub default_tau: f32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_sessions: 50,
            prefill_chunk: None,
            stop_window: 5,
            default_last_token: 187,
            default_temperature: 0.9,
            default_tau: 0.7,
        }
    }
}

impl SchedulerConfig {
    /// Effective prefill chunk width, never below 1
    pub fn prefill_chunk(&self) -> usize {
        self.prefill_chunk.unwrap_or(self.max_sessions).max(1)
    }

    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    pub fn with_prefill_chunk(mut self, chunk: usize) -> Self {
        self.prefill_chunk = Some(chunk);
        self
    }

    pub fn with_stop_window(mut self, window: usize) -> Self {
        self.stop_window = window;
        self
    }

    pub fn with_default_last_token(mut self, token: u32) -> Self {
        self.default_last_token = token;
        self
    }

    pub fn with_default_temperature(mut self, temperature: f32) -> Self {
        self.default_temperature = temperature;
        self
    }

    pub fn with_default_tau(mut self, tau: f32) -> Self {
        self.default_tau = tau;
        self
    }
}
