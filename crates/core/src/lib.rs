//! # Kōhai Core
//!
//! Domain types and error definitions for the Kōhai bilingual inference
//! service. This crate has **zero framework dependencies** — it defines the
//! vocabulary (conversation turns, generation requests, decode settings,
//! error taxonomy) that the engine, gateway, and CLI crates implement
//! against.
//!
//! ## Design Philosophy
//!
//! Everything here is a value type. The engine owns the model; the gateway
//! owns the transport; this crate owns the words they use to talk to each
//! other. All crates depend inward on core.

pub mod conversation;
pub mod error;
pub mod generation;

// Re-export key types at crate root for ergonomics
pub use conversation::{ConversationTurn, Language, Role};
pub use error::{AdapterError, DecodeError, EngineError, Error, PromptError, Result};
pub use generation::{ChatReply, ChatRequest, DecodeConfig, Health, InvalidDecodeConfig};
