//! The inference engine — per-request orchestration and lifecycle.
//!
//! One explicitly constructed `InferenceEngine` owns the model, tokenizer,
//! and adapter router for the whole process; request handlers share it via
//! `Arc`. Lifecycle: `Loading → Ready` on a successful one-time load,
//! `Loading → Failed` otherwise. Failed is terminal — every chat request is
//! rejected until an operator restarts the process. There is no
//! partially-ready state.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::qwen2;
use tokenizers::Tokenizer;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info};

use kohai_core::{
    ChatReply, ChatRequest, DecodeConfig, DecodeError, EngineError, Health, Language,
};

use crate::adapters::{AdapterRouter, AdapterTopology};
use crate::decode::{Decoder, TokenForward};
use crate::loader::{self, LoadError, ModelSources};
use crate::prompt::PromptAssembler;

/// The two system directives, selected per request by language.
#[derive(Debug, Clone)]
pub struct Directives {
    pub indonesian: String,
    pub english: String,
}

impl Directives {
    pub fn for_language(&self, lang: Language) -> &str {
        match lang {
            Language::Id => &self.indonesian,
            Language::En => &self.english,
        }
    }
}

/// Service lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Loading,
    Ready,
    Failed,
}

/// The Qwen2 model behind the decode seam.
struct QwenModel {
    inner: qwen2::ModelForCausalLM,
}

impl TokenForward for QwenModel {
    fn forward(&mut self, input: &Tensor, pos: usize) -> candle_core::Result<Tensor> {
        self.inner.forward(input, pos)
    }

    fn reset(&mut self) {
        self.inner.clear_kv_cache();
    }
}

/// Everything guarded by the generation critical section.
struct EngineInner {
    model: QwenModel,
    tokenizer: Tokenizer,
    router: AdapterRouter,
    // kept for adapter hot-swap: selection changes rebuild the merged model
    base_tensors: HashMap<String, Tensor>,
    model_config: qwen2::Config,
    dtype: DType,
    eos_token_id: u32,
}

/// Single owner of the shared model + adapter state.
///
/// Generation runs inside `inner`'s mutex on a blocking thread — one
/// generation at a time per process. The adapter selection is only mutated
/// under the same mutex, so every decode observes a consistent selection.
pub struct InferenceEngine {
    sources: ModelSources,
    directives: Directives,
    decode: DecodeConfig,
    device: Device,
    device_label: String,
    state: RwLock<EngineState>,
    inner: Arc<Mutex<Option<EngineInner>>>,
}

impl InferenceEngine {
    /// Construct an engine in the `Loading` state. No weights are touched
    /// until [`load`](Self::load) runs.
    pub fn new(
        sources: ModelSources,
        directives: Directives,
        decode: DecodeConfig,
        device_preference: &str,
    ) -> Result<Self, EngineError> {
        decode
            .validate()
            .map_err(|e| EngineError::Load(e.to_string()))?;
        let (device, device_label) =
            loader::select_device(device_preference).map_err(|e| EngineError::Load(e.to_string()))?;

        Ok(Self {
            sources,
            directives,
            decode,
            device,
            device_label,
            state: RwLock::new(EngineState::Loading),
            inner: Arc::new(Mutex::new(None)),
        })
    }

    /// One-time load: fetch weights, classify and activate adapters, build
    /// the model. Transitions to `Ready` on success and to the terminal
    /// `Failed` state on any error.
    pub async fn load(&self) -> Result<(), EngineError> {
        {
            let state = self.state.read().await;
            if *state != EngineState::Loading {
                return Err(EngineError::Load(format!(
                    "load invoked in {state:?} state"
                )));
            }
        }

        let sources = self.sources.clone();
        let device = self.device.clone();
        let built =
            tokio::task::spawn_blocking(move || build_inner(&sources, &device)).await;

        match built {
            Ok(Ok(inner)) => {
                *self.inner.lock().await = Some(inner);
                *self.state.write().await = EngineState::Ready;
                info!(device = %self.device_label, "model ready");
                Ok(())
            }
            Ok(Err(e)) => {
                *self.state.write().await = EngineState::Failed;
                error!(error = %e, "model load failed — restart required");
                Err(EngineError::Load(e.to_string()))
            }
            Err(join) => {
                *self.state.write().await = EngineState::Failed;
                error!(error = %join, "model load task panicked — restart required");
                Err(EngineError::Load("load task panicked".into()))
            }
        }
    }

    /// Run one chat request end to end: directive selection, prompt
    /// assembly, decode, detokenize.
    pub async fn chat(&self, request: ChatRequest) -> Result<ChatReply, EngineError> {
        if *self.state.read().await != EngineState::Ready {
            return Err(EngineError::Unavailable);
        }

        let directive = self.directives.for_language(request.lang).to_string();
        let decode = self.decode.clone();
        let device = self.device.clone();
        let inner = Arc::clone(&self.inner);
        // hook for future disconnect-driven cancellation; never set today
        let cancel = Arc::new(AtomicBool::new(false));

        let reply = tokio::task::spawn_blocking(move || -> Result<ChatReply, EngineError> {
            let mut guard = inner.blocking_lock();
            let inner = guard.as_mut().ok_or(EngineError::Unavailable)?;

            let assembler = PromptAssembler::new(
                &inner.tokenizer,
                decode.max_prompt_tokens,
                decode.history_turns,
            );
            let prompt = assembler.assemble(&directive, &request.history, &request.message)?;

            let decoder = Decoder::new(device, inner.eos_token_id, decode);
            let tokens = decoder
                .generate(&mut inner.model, &prompt, &cancel, None)
                .map_err(EngineError::Generation)?;

            let text = inner
                .tokenizer
                .decode(&tokens, true)
                .map_err(|e| {
                    EngineError::Generation(DecodeError::Detokenize(e.to_string()))
                })?;

            Ok(ChatReply {
                response: text.trim().to_string(),
            })
        })
        .await
        .map_err(|e| {
            EngineError::Generation(DecodeError::Forward(format!("generation task failed: {e}")))
        })??;

        Ok(reply)
    }

    /// Hot-swap the active adapter selection.
    ///
    /// Unknown ids fail the call and leave the current selection untouched;
    /// re-activating the current set skips the weight rebuild entirely. Runs
    /// inside the generation critical section, so in-flight decodes always
    /// finish on the selection they started with.
    pub async fn set_adapters(&self, ids: BTreeSet<String>) -> Result<(), EngineError> {
        if *self.state.read().await != EngineState::Ready {
            return Err(EngineError::Unavailable);
        }

        let inner = Arc::clone(&self.inner);
        let device = self.device.clone();
        tokio::task::spawn_blocking(move || -> Result<(), EngineError> {
            let mut guard = inner.blocking_lock();
            let inner = guard.as_mut().ok_or(EngineError::Unavailable)?;

            let changed = inner.router.set_active(&ids)?;
            if changed {
                let merged = inner.router.merge_into(&inner.base_tensors)?;
                let vb = VarBuilder::from_tensors(merged, inner.dtype, &device);
                let model = qwen2::ModelForCausalLM::new(&inner.model_config, vb)
                    .map_err(|e| EngineError::Load(e.to_string()))?;
                inner.model = QwenModel { inner: model };
                info!(active = ?inner.router.active(), "adapter selection rebuilt");
            }
            Ok(())
        })
        .await
        .map_err(|e| EngineError::Load(format!("adapter swap task failed: {e}")))?
    }

    pub async fn state(&self) -> EngineState {
        *self.state.read().await
    }

    pub async fn health(&self) -> Health {
        Health {
            loaded: *self.state.read().await == EngineState::Ready,
            device: self.device_label.clone(),
        }
    }
}

/// Blocking assembly of the servable model from its sources.
fn build_inner(sources: &ModelSources, device: &Device) -> Result<EngineInner, LoadError> {
    let loaded = loader::load(sources, device)?;

    let eos_token_id = resolve_eos(&loaded.tokenizer)?;

    let router = AdapterRouter::new(loaded.adapters);
    match router.topology() {
        AdapterTopology::Routed(names) => {
            info!(experts = names.len(), "numeric adapter set active (routed mixture)");
        }
        AdapterTopology::Single(name) => info!(adapter = %name, "dedicated adapter active"),
        AdapterTopology::None => {}
    }

    let merged = router
        .merge_into(&loaded.base_tensors)
        .map_err(|e| LoadError::Weights(e.to_string()))?;
    let vb = VarBuilder::from_tensors(merged, loaded.dtype, device);
    let model = qwen2::ModelForCausalLM::new(&loaded.model_config, vb)
        .map_err(|e| LoadError::Model(e.to_string()))?;

    Ok(EngineInner {
        model: QwenModel { inner: model },
        tokenizer: loaded.tokenizer,
        router,
        base_tensors: loaded.base_tensors,
        model_config: loaded.model_config,
        dtype: loaded.dtype,
        eos_token_id,
    })
}

/// The ChatML end marker, with fallbacks for retagged tokenizers.
fn resolve_eos(tokenizer: &Tokenizer) -> Result<u32, LoadError> {
    ["<|im_end|>", "<|endoftext|>", "</s>"]
        .iter()
        .find_map(|t| tokenizer.token_to_id(t))
        .ok_or_else(|| LoadError::Tokenizer("no end-of-sequence token found".into()))
}
