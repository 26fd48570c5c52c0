//! Autoregressive sampling decoder.
//!
//! Runs the model over an assembled prompt and samples a continuation,
//! stopping at the end-of-sequence token or the new-token budget. The
//! sampling policy at every step: restrict to the top-k most probable
//! tokens, then nucleus (top-p) filter, then temperature-scale, then sample
//! — candle's `Sampling::TopKThenTopP`.
//!
//! Output is exactly the newly generated span; the prompt is never echoed
//! back. With `seed` unset every call draws a fresh seed, so replies vary
//! between identical requests on purpose. Fix the seed to make a call
//! reproducible.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use rand::Rng;

use kohai_core::{DecodeConfig, DecodeError};

/// The seam between the sampling loop and the model weights.
///
/// `forward` runs the model over `input` (shape `[1, n]`) with the KV cache
/// positioned at `pos` and returns logits for the last position
/// (`[1, 1, vocab]`). `reset` drops cached state from a prior generation.
pub trait TokenForward {
    fn forward(&mut self, input: &Tensor, pos: usize) -> candle_core::Result<Tensor>;
    fn reset(&mut self);
}

pub struct Decoder {
    device: Device,
    eos_token_id: u32,
    config: DecodeConfig,
}

impl Decoder {
    pub fn new(device: Device, eos_token_id: u32, config: DecodeConfig) -> Self {
        Self {
            device,
            eos_token_id,
            config,
        }
    }

    /// Generate a continuation of `prompt`, returning only the new tokens.
    ///
    /// `cancel` is checked between steps — a cooperative hook so a caller
    /// can abandon a generation without tearing the process down. `deadline`
    /// bounds wall-clock time when set; no budget is enforced by default.
    pub fn generate(
        &self,
        model: &mut dyn TokenForward,
        prompt: &[u32],
        cancel: &AtomicBool,
        deadline: Option<Instant>,
    ) -> Result<Vec<u32>, DecodeError> {
        let seed = self
            .config
            .seed
            .unwrap_or_else(|| rand::rng().random::<u64>());
        let sampling = Sampling::TopKThenTopP {
            k: self.config.top_k,
            p: self.config.top_p,
            temperature: self.config.temperature,
        };
        let mut processor = LogitsProcessor::from_sampling(seed, sampling);

        model.reset();
        let input = Tensor::new(prompt, &self.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(forward_err)?;
        let mut logits = model.forward(&input, 0).map_err(forward_err)?;
        let mut pos = prompt.len();

        let mut generated: Vec<u32> = Vec::new();
        loop {
            if cancel.load(Ordering::Relaxed) {
                return Err(DecodeError::Cancelled);
            }
            if let Some(deadline) = deadline {
                if Instant::now() > deadline {
                    return Err(DecodeError::Timeout);
                }
            }

            let step_logits = logits
                .squeeze(0)
                .and_then(|t| t.squeeze(0))
                .and_then(|t| t.to_dtype(DType::F32))
                .map_err(forward_err)?;
            let next = processor
                .sample(&step_logits)
                .map_err(|e| DecodeError::Sampling(e.to_string()))?;

            if next == self.eos_token_id {
                break;
            }
            generated.push(next);
            if generated.len() >= self.config.max_new_tokens {
                break;
            }

            let step = Tensor::new(&[next][..], &self.device)
                .and_then(|t| t.unsqueeze(0))
                .map_err(forward_err)?;
            logits = model.forward(&step, pos).map_err(forward_err)?;
            pos += 1;
        }

        Ok(generated)
    }
}

fn forward_err(e: candle_core::Error) -> DecodeError {
    DecodeError::Forward(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const VOCAB: usize = 16;
    const EOS: u32 = 9;

    /// Emits one-hot logits following a fixed script, one entry per step.
    struct ScriptedModel {
        script: Vec<u32>,
        step: usize,
        resets: usize,
    }

    impl ScriptedModel {
        fn new(script: Vec<u32>) -> Self {
            Self {
                script,
                step: 0,
                resets: 0,
            }
        }
    }

    impl TokenForward for ScriptedModel {
        fn forward(&mut self, _input: &Tensor, _pos: usize) -> candle_core::Result<Tensor> {
            let token = self.script[self.step.min(self.script.len() - 1)];
            self.step += 1;
            let mut logits = vec![0f32; VOCAB];
            logits[token as usize] = 100.0;
            Tensor::from_vec(logits, (1, 1, VOCAB), &Device::Cpu)
        }

        fn reset(&mut self) {
            self.step = 0;
            self.resets += 1;
        }
    }

    /// Emits the same mildly-peaked distribution at every step, so sampling
    /// outcomes depend only on the RNG stream.
    struct ConstModel;

    impl TokenForward for ConstModel {
        fn forward(&mut self, _input: &Tensor, _pos: usize) -> candle_core::Result<Tensor> {
            let logits: Vec<f32> = (0..VOCAB).map(|i| (i as f32) * 0.05).collect();
            Tensor::from_vec(logits, (1, 1, VOCAB), &Device::Cpu)
        }

        fn reset(&mut self) {}
    }

    fn decoder(config: DecodeConfig) -> Decoder {
        Decoder::new(Device::Cpu, EOS, config)
    }

    fn unset_cancel() -> AtomicBool {
        AtomicBool::new(false)
    }

    #[test]
    fn returns_only_the_generated_span() {
        let mut model = ScriptedModel::new(vec![3, 5, 7, EOS]);
        let prompt = [11u32, 12, 13];
        let cancel = unset_cancel();
        let out = decoder(DecodeConfig::default())
            .generate(&mut model, &prompt, &cancel, None)
            .unwrap();

        assert_eq!(out, vec![3, 5, 7]);
        for token in &prompt {
            assert!(!out.contains(token));
        }
        assert_eq!(model.resets, 1);
    }

    #[test]
    fn stops_at_eos() {
        let mut model = ScriptedModel::new(vec![EOS]);
        let cancel = unset_cancel();
        let out = decoder(DecodeConfig::default())
            .generate(&mut model, &[1, 2], &cancel, None)
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn respects_max_new_tokens() {
        // script never reaches EOS
        let mut model = ScriptedModel::new(vec![4]);
        let config = DecodeConfig {
            max_new_tokens: 5,
            ..DecodeConfig::default()
        };
        let cancel = unset_cancel();
        let out = decoder(config)
            .generate(&mut model, &[1], &cancel, None)
            .unwrap();
        assert_eq!(out.len(), 5);
    }

    #[test]
    fn fixed_seed_reproduces_the_same_continuation() {
        let config = DecodeConfig {
            seed: Some(7),
            max_new_tokens: 32,
            ..DecodeConfig::default()
        };
        let cancel = unset_cancel();

        // EOS outside the stub vocab: both runs sample the full 32 tokens
        let first = Decoder::new(Device::Cpu, 99, config.clone())
            .generate(&mut ConstModel, &[1, 2, 3], &cancel, None)
            .unwrap();
        let second = Decoder::new(Device::Cpu, 99, config)
            .generate(&mut ConstModel, &[1, 2, 3], &cancel, None)
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
    }

    #[test]
    fn cancel_flag_aborts_generation() {
        let mut model = ScriptedModel::new(vec![4]);
        let cancel = AtomicBool::new(true);
        let result = decoder(DecodeConfig::default()).generate(&mut model, &[1], &cancel, None);
        assert!(matches!(result, Err(DecodeError::Cancelled)));
    }

    #[test]
    fn expired_deadline_times_out() {
        let mut model = ScriptedModel::new(vec![4]);
        let cancel = unset_cancel();
        let past = Instant::now() - std::time::Duration::from_secs(1);
        let result =
            decoder(DecodeConfig::default()).generate(&mut model, &[1], &cancel, Some(past));
        assert!(matches!(result, Err(DecodeError::Timeout)));
    }
}
