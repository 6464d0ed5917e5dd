//! Reference [`Sampler`]s.
//!
//! [`TypicalSampler`] implements locally typical sampling: tokens are ranked
//! by how far their surprise `-ln p` is from the distribution's entropy, the
//! closest ones are kept until their mass reaches `tau`, and the survivors are
//! drawn from with probabilities raised to `1 / temperature`.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::trace;
use crate::scheduler::Sampler;

fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
        .0 as u32
}

fn probabilities(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
    let total: f32 = exp.iter().sum();
    exp.into_iter().map(|v| v / total).collect()
}

/// Locally typical sampling over a seedable [`StdRng`]
#[derive(Debug, Clone)]
pub struct TypicalSampler {
    rng: StdRng,
}

impl TypicalSampler {
    pub fn new() -> Self {
        Self { rng: StdRng::from_entropy() }
    }

    /// Reproducible draws for a fixed `seed`
    pub fn from_seed(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }

    /// Indices of the typical set, in order of increasing distance from the
    /// entropy
    fn typical_set(probs: &[f32], tau: f32) -> Vec<usize> {
        let entropy: f32 = probs.iter().filter(|p| **p > 0.0).map(|p| -p * p.ln()).sum();
        let mut ranked: Vec<(usize, f32)> = probs
            .iter()
            .enumerate()
            .filter(|(_, p)| **p > 0.0)
            .map(|(i, p)| (i, (-p.ln() - entropy).abs()))
            .collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1));

        let mut mass = 0.0;
        let mut kept = Vec::new();
        for (index, _) in ranked {
            kept.push(index);
            mass += probs[index];
            if mass >= tau {
                break;
            }
        }
        kept
    }
}

impl Default for TypicalSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler for TypicalSampler {
    fn select(&mut self, logits: &[f32], temperature: f32, tau: f32) -> u32 {
        if temperature <= 0.0 || logits.len() < 2 {
            return argmax(logits);
        }
        let probs = probabilities(logits);
        let kept = Self::typical_set(&probs, tau);
        let weights: Vec<f32> = kept.iter().map(|&i| probs[i].powf(1.0 / temperature)).collect();
        let token = match WeightedIndex::new(&weights) {
            Ok(distribution) => kept[distribution.sample(&mut self.rng)] as u32,
            // every weight underflowed
            Err(_) => kept.first().map(|&i| i as u32).unwrap_or_else(|| argmax(logits)),
        };
        trace!(token, candidates = kept.len(), temperature, tau, "sampled");
        token
    }
}

/// Always the highest logit
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedySampler;

impl Sampler for GreedySampler {
    fn select(&mut self, logits: &[f32], _temperature: f32, _tau: f32) -> u32 {
        argmax(logits)
    }
}
