//! Model and adapter loading.
//!
//! Loading is the service's one opaque external capability: given two string
//! identifiers (base model repo, adapter repo) it either produces a ready
//! tokenizer + weight map + named adapter set, or fails. Everything comes
//! from the Hugging Face hub via `hf-hub`, which caches downloads locally.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use candle_core::{DType, Device, Tensor};
use candle_transformers::models::qwen2;
use hf_hub::api::sync::{Api, ApiRepo};
use serde::Deserialize;
use thiserror::Error;
use tokenizers::Tokenizer;

use crate::adapters::LoraAdapter;

/// The two identifiers that name everything the engine needs.
#[derive(Debug, Clone)]
pub struct ModelSources {
    /// Base model repo (config + tokenizer + safetensors weights)
    pub base_model: String,

    /// Adapter repo with one PEFT-format subfolder per named adapter.
    /// `None` ⇒ run the bare base model.
    pub adapter_repo: Option<String>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("hub download failed: {0}")]
    Hub(String),

    #[error("tokenizer failed to load: {0}")]
    Tokenizer(String),

    #[error("weights failed to load: {0}")]
    Weights(String),

    #[error("model construction failed: {0}")]
    Model(String),
}

fn hub_err(e: hf_hub::api::sync::ApiError) -> LoadError {
    LoadError::Hub(e.to_string())
}

/// Everything `build` needs to assemble a servable model.
pub struct LoadedModel {
    pub tokenizer: Tokenizer,
    pub model_config: qwen2::Config,
    pub base_tensors: HashMap<String, Tensor>,
    pub adapters: BTreeMap<String, LoraAdapter>,
    pub dtype: DType,
}

/// Pick the compute device from a config preference.
///
/// `"auto"` takes CUDA when present and falls back to CPU; `"cuda"` is a
/// hard requirement. Returns the device plus the label `/health` reports.
pub fn select_device(preference: &str) -> Result<(Device, String), LoadError> {
    match preference {
        "cpu" => Ok((Device::Cpu, "cpu".into())),
        "cuda" => Device::new_cuda(0)
            .map(|d| (d, "cuda:0".into()))
            .map_err(|e| LoadError::Model(format!("CUDA requested but unavailable: {e}"))),
        _ => match Device::new_cuda(0) {
            Ok(d) => Ok((d, "cuda:0".into())),
            Err(_) => Ok((Device::Cpu, "cpu".into())),
        },
    }
}

/// Fetch and deserialize the base model and every adapter the repo ships.
///
/// Blocking (network + mmap) — run under `spawn_blocking`.
pub fn load(sources: &ModelSources, device: &Device) -> Result<LoadedModel, LoadError> {
    let api = Api::new().map_err(hub_err)?;
    let repo = api.model(sources.base_model.clone());

    tracing::info!(model = %sources.base_model, "fetching base model");

    let tokenizer_path = repo.get("tokenizer.json").map_err(hub_err)?;
    let tokenizer = Tokenizer::from_file(&tokenizer_path)
        .map_err(|e| LoadError::Tokenizer(e.to_string()))?;

    let config_path = repo.get("config.json").map_err(hub_err)?;
    let config_raw =
        std::fs::read(&config_path).map_err(|e| LoadError::Model(e.to_string()))?;
    let model_config: qwen2::Config =
        serde_json::from_slice(&config_raw).map_err(|e| LoadError::Model(e.to_string()))?;

    // bf16 where the hardware supports it, f32 on CPU
    let dtype = if device.is_cuda() { DType::BF16 } else { DType::F32 };

    let mut base_tensors = HashMap::new();
    for file in resolve_weight_files(&repo)? {
        let tensors = candle_core::safetensors::load(&file, device)
            .map_err(|e| LoadError::Weights(e.to_string()))?;
        for (name, tensor) in tensors {
            let tensor = tensor
                .to_dtype(dtype)
                .map_err(|e| LoadError::Weights(e.to_string()))?;
            base_tensors.insert(name, tensor);
        }
    }
    if base_tensors.is_empty() {
        return Err(LoadError::Weights("base model has no tensors".into()));
    }

    let adapters = match sources.adapter_repo.as_deref() {
        Some(repo_id) if !repo_id.is_empty() => load_adapters(&api, repo_id, device)?,
        _ => BTreeMap::new(),
    };
    if adapters.is_empty() {
        // degraded mode: serve the base model alone
        tracing::warn!("no adapters loaded — serving the bare base model");
    } else {
        tracing::info!(count = adapters.len(), "adapters loaded");
    }

    Ok(LoadedModel {
        tokenizer,
        model_config,
        base_tensors,
        adapters,
        dtype,
    })
}

#[derive(Deserialize)]
struct WeightIndex {
    weight_map: HashMap<String, String>,
}

/// Sharded checkpoints carry an index file naming their shards; single-file
/// checkpoints just have `model.safetensors`.
fn resolve_weight_files(repo: &ApiRepo) -> Result<Vec<PathBuf>, LoadError> {
    match repo.get("model.safetensors.index.json") {
        Ok(index_path) => {
            let raw =
                std::fs::read(&index_path).map_err(|e| LoadError::Weights(e.to_string()))?;
            let index: WeightIndex =
                serde_json::from_slice(&raw).map_err(|e| LoadError::Weights(e.to_string()))?;
            let mut files: Vec<&String> = index.weight_map.values().collect();
            files.sort();
            files.dedup();
            files
                .into_iter()
                .map(|f| repo.get(f).map_err(hub_err))
                .collect()
        }
        Err(_) => Ok(vec![repo.get("model.safetensors").map_err(hub_err)?]),
    }
}

/// The subset of a PEFT `adapter_config.json` the merge math needs.
#[derive(Debug, Deserialize)]
struct PeftAdapterConfig {
    r: usize,
    lora_alpha: f64,
}

/// Discover and load every adapter in the repo.
///
/// Layout contract: each adapter lives in its own top-level folder named
/// after the adapter (`0/`, `1/`, `finetune_custom/`, …) holding
/// `adapter_model.safetensors` + `adapter_config.json`; a root-level pair is
/// loaded under the name `default`.
fn load_adapters(
    api: &Api,
    repo_id: &str,
    device: &Device,
) -> Result<BTreeMap<String, LoraAdapter>, LoadError> {
    let repo = api.model(repo_id.to_string());
    let info = repo.info().map_err(hub_err)?;

    let mut adapters = BTreeMap::new();
    for sibling in &info.siblings {
        let Some(name) = adapter_name(&sibling.rfilename) else {
            continue;
        };

        let config_file = if name == "default" && sibling.rfilename == "adapter_model.safetensors"
        {
            "adapter_config.json".to_string()
        } else {
            format!("{name}/adapter_config.json")
        };
        let config_path = repo.get(&config_file).map_err(hub_err)?;
        let config_raw =
            std::fs::read(&config_path).map_err(|e| LoadError::Weights(e.to_string()))?;
        let peft: PeftAdapterConfig =
            serde_json::from_slice(&config_raw).map_err(|e| LoadError::Weights(e.to_string()))?;

        let weights_path = repo.get(&sibling.rfilename).map_err(hub_err)?;
        let tensors = candle_core::safetensors::load(&weights_path, device)
            .map_err(|e| LoadError::Weights(e.to_string()))?;

        let adapter = LoraAdapter::from_peft(tensors, peft.r, peft.lora_alpha)
            .map_err(|e| LoadError::Weights(format!("adapter {name}: {e}")))?;
        tracing::debug!(adapter = %name, "adapter loaded");
        adapters.insert(name, adapter);
    }

    Ok(adapters)
}

/// Map a repo file path to the adapter it belongs to, if it is an adapter
/// weights file at a recognized location.
fn adapter_name(rfilename: &str) -> Option<String> {
    if rfilename == "adapter_model.safetensors" {
        return Some("default".to_string());
    }
    let dir = rfilename.strip_suffix("/adapter_model.safetensors")?;
    if dir.is_empty() || dir.contains('/') {
        return None; // only top-level adapter folders
    }
    Some(dir.to_string())
}
