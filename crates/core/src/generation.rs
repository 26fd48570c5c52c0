//! Generation request/reply types and decode settings.
//!
//! `ChatRequest` is what arrives at the inference entry point; `ChatReply`
//! is what leaves. The service never stores either — history is owned by
//! the caller, who appends each reply before the next turn.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conversation::{ConversationTurn, Language};

/// A single inference request: one new message plus the prior history.
///
/// Immutable once constructed; owned exclusively by one in-flight call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// The new user message
    pub message: String,

    /// Prior turns, oldest first (user/assistant alternating)
    #[serde(default)]
    pub history: Vec<ConversationTurn>,

    /// Which system directive to use
    #[serde(default)]
    pub lang: Language,
}

/// The generated continuation. Not persisted — the caller appends it to
/// its own history for subsequent turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatReply {
    pub response: String,
}

/// Health report for the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    pub loaded: bool,
    pub device: String,
}

/// Raised when decode settings violate their invariants.
#[derive(Debug, Clone, Error)]
#[error("invalid decode settings: {0}")]
pub struct InvalidDecodeConfig(pub String);

/// Sampling and budget settings for the decoder.
///
/// Validated at construction time (service startup) so the decode loop can
/// rely on the invariants without re-checking per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodeConfig {
    /// Token budget for the assembled prompt
    #[serde(default = "default_max_prompt_tokens")]
    pub max_prompt_tokens: usize,

    /// Maximum number of tokens to generate
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,

    /// Sampling temperature; > 0 (varied replies are a design choice)
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Nucleus sampling threshold, in (0, 1]
    #[serde(default = "default_top_p")]
    pub top_p: f64,

    /// Top-k restriction, ≥ 1
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Fixed RNG seed. Absent ⇒ fresh entropy per call; set it to make
    /// sampling reproducible (test harnesses, debugging).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// History window: only the most recent N turns are considered before
    /// token-level truncation
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
}

fn default_max_prompt_tokens() -> usize {
    1024
}
fn default_max_new_tokens() -> usize {
    512
}
fn default_temperature() -> f64 {
    0.9
}
fn default_top_p() -> f64 {
    0.9
}
fn default_top_k() -> usize {
    50
}
fn default_history_turns() -> usize {
    16
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            max_prompt_tokens: default_max_prompt_tokens(),
            max_new_tokens: default_max_new_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            seed: None,
            history_turns: default_history_turns(),
        }
    }
}

impl DecodeConfig {
    /// Check all invariants. Called once at startup; any violation is a
    /// configuration error, not a per-request condition.
    pub fn validate(&self) -> std::result::Result<(), InvalidDecodeConfig> {
        if self.max_prompt_tokens == 0 {
            return Err(InvalidDecodeConfig("max_prompt_tokens must be > 0".into()));
        }
        if self.max_new_tokens == 0 {
            return Err(InvalidDecodeConfig("max_new_tokens must be > 0".into()));
        }
        if self.temperature <= 0.0 {
            return Err(InvalidDecodeConfig("temperature must be > 0".into()));
        }
        if self.top_p <= 0.0 || self.top_p > 1.0 {
            return Err(InvalidDecodeConfig("top_p must be in (0, 1]".into()));
        }
        if self.top_k == 0 {
            return Err(InvalidDecodeConfig("top_k must be ≥ 1".into()));
        }
        if self.history_turns == 0 {
            return Err(InvalidDecodeConfig("history_turns must be ≥ 1".into()));
        }
        Ok(())
    }
}
