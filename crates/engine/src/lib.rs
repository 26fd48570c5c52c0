//! # Kōhai Engine
//!
//! The adapter-routed generation pipeline: model/adapter loading, adapter
//! routing, prompt assembly, and sampling-based decoding, orchestrated by a
//! single-owner [`InferenceEngine`].
//!
//! The pipeline flows strictly downward:
//!
//! ```text
//! InferenceEngine ─▶ PromptAssembler ─▶ Decoder (over the merged weights
//!                                        the AdapterRouter selected)
//! ```
//!
//! One process owns one model. Generation is a critical section — concurrent
//! requests serialize through the engine's mutex rather than sharing the
//! forward pass, because weight-sharing with a mutable active-adapter
//! selection makes concurrent divergent selections unsafe. Scale out by
//! running more replicas, not more threads.

pub mod adapters;
pub mod decode;
pub mod engine;
pub mod loader;
pub mod prompt;

pub use adapters::{AdapterRouter, AdapterTopology, LoraAdapter};
pub use decode::{Decoder, TokenForward};
pub use engine::{Directives, EngineState, InferenceEngine};
pub use loader::{LoadError, ModelSources, select_device};
pub use prompt::PromptAssembler;
