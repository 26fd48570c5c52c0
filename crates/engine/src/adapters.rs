//! Adapter routing — which LoRA adapters are wired into the forward pass.
//!
//! Adapter repos come in two shapes. An X-LoRA style mixture publishes its
//! expert adapters under numeric names ("0", "1", …) and expects them
//! jointly active; a plain fine-tune publishes one dedicated adapter under a
//! descriptive name and expects exclusive activation. The router classifies
//! the loaded set once into an [`AdapterTopology`] and applies the matching
//! policy: the full numeric set together when any numeric name exists,
//! otherwise the single dedicated adapter, otherwise bare base-model
//! operation.
//!
//! Active adapters are merged into the base weights as
//! `W' = W + Σᵢ gᵢ·(αᵢ/rᵢ)·Bᵢ·Aᵢ` with uniform gates `gᵢ = 1/n` over the
//! active set.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use candle_core::{DType, Tensor};

use kohai_core::AdapterError;

/// One named LoRA adapter: a low-rank (A, B) pair per target tensor plus
/// the `α/r` scaling from its training config.
pub struct LoraAdapter {
    scale: f64,
    /// base tensor path (e.g. `model.layers.0.self_attn.q_proj.weight`)
    /// → (lora_A `[r, in]`, lora_B `[out, r]`)
    layers: HashMap<String, (Tensor, Tensor)>,
}

impl LoraAdapter {
    /// Build an adapter from a PEFT safetensors tensor map.
    ///
    /// PEFT names tensors
    /// `base_model.model.<module path>.lora_{A,B}.weight`; the prefix is
    /// stripped and A/B paired up per module. Unpaired halves are malformed.
    pub fn from_peft(
        tensors: HashMap<String, Tensor>,
        rank: usize,
        alpha: f64,
    ) -> Result<Self, AdapterError> {
        if rank == 0 {
            return Err(AdapterError::Malformed("adapter rank must be ≥ 1".into()));
        }
        let mut a_mats: HashMap<String, Tensor> = HashMap::new();
        let mut b_mats: HashMap<String, Tensor> = HashMap::new();
        for (name, tensor) in tensors {
            if let Some(module) = name.strip_suffix(".lora_A.weight") {
                a_mats.insert(normalize_module(module), tensor);
            } else if let Some(module) = name.strip_suffix(".lora_B.weight") {
                b_mats.insert(normalize_module(module), tensor);
            }
            // anything else (embeddings, classifier heads) is not a LoRA pair
        }

        let mut layers = HashMap::new();
        for (module, a) in a_mats {
            let b = b_mats.remove(&module).ok_or_else(|| {
                AdapterError::Malformed(format!("{module} has lora_A but no lora_B"))
            })?;
            layers.insert(format!("{module}.weight"), (a, b));
        }
        if let Some(orphan) = b_mats.keys().next() {
            return Err(AdapterError::Malformed(format!(
                "{orphan} has lora_B but no lora_A"
            )));
        }
        if layers.is_empty() {
            return Err(AdapterError::Malformed(
                "no LoRA weight pairs found in adapter".into(),
            ));
        }

        Ok(Self {
            scale: alpha / rank as f64,
            layers,
        })
    }
}

/// Strip the PEFT wrapper prefix, leaving the base model's own module path.
fn normalize_module(peft_path: &str) -> String {
    peft_path
        .strip_prefix("base_model.model.")
        .unwrap_or(peft_path)
        .to_string()
}

/// How the loaded adapter set is wired, decided once at load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterTopology {
    /// No adapters — degraded mode, bare base model
    None,
    /// One dedicated adapter, exclusively active
    Single(String),
    /// Numeric-named experts, jointly active
    Routed(Vec<String>),
}

/// Owns the adapter set and the process-wide active selection.
///
/// The selection is single-writer/multi-reader state: the engine mutates it
/// only inside the same critical section that serializes generations, so a
/// decode always observes one consistent selection.
pub struct AdapterRouter {
    adapters: BTreeMap<String, LoraAdapter>,
    active: BTreeSet<String>,
    topology: AdapterTopology,
}

impl AdapterRouter {
    /// Classify the set and activate per policy.
    pub fn new(adapters: BTreeMap<String, LoraAdapter>) -> Self {
        let topology = classify(adapters.keys());
        let active = match &topology {
            AdapterTopology::None => BTreeSet::new(),
            AdapterTopology::Single(name) => BTreeSet::from([name.clone()]),
            AdapterTopology::Routed(names) => names.iter().cloned().collect(),
        };
        Self {
            adapters,
            active,
            topology,
        }
    }

    pub fn topology(&self) -> &AdapterTopology {
        &self.topology
    }

    pub fn active(&self) -> &BTreeSet<String> {
        &self.active
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Replace the active selection.
    ///
    /// Fails without touching the selection if any id is unknown. Returns
    /// `false` when the requested set is already active (idempotent no-op —
    /// callers skip the weight rebuild).
    pub fn set_active(&mut self, ids: &BTreeSet<String>) -> Result<bool, AdapterError> {
        for id in ids {
            if !self.adapters.contains_key(id) {
                return Err(AdapterError::NotFound(id.clone()));
            }
        }
        if *ids == self.active {
            return Ok(false);
        }
        self.active = ids.clone();
        Ok(true)
    }

    /// Merge the active adapters into `base`, returning the effective
    /// weight map. An empty selection returns the base weights untouched.
    pub fn merge_into(
        &self,
        base: &HashMap<String, Tensor>,
    ) -> Result<HashMap<String, Tensor>, AdapterError> {
        let mut merged = base.clone();
        if self.active.is_empty() {
            return Ok(merged);
        }
        let gate = 1.0 / self.active.len() as f64;
        for name in &self.active {
            let adapter = &self.adapters[name];
            for (path, (a, b)) in &adapter.layers {
                let weight = merged.get(path).ok_or_else(|| {
                    AdapterError::Malformed(format!(
                        "adapter {name} targets unknown tensor {path}"
                    ))
                })?;
                let updated = apply_delta(weight, a, b, adapter.scale * gate)
                    .map_err(|e| AdapterError::Malformed(format!("merging {path}: {e}")))?;
                merged.insert(path.clone(), updated);
            }
        }
        Ok(merged)
    }
}

/// Numeric names are routable experts; anything else is a dedicated
/// adapter. When both exist the numeric set wins ("default" or the first
/// name breaks ties on the dedicated side).
fn classify<'a>(names: impl Iterator<Item = &'a String>) -> AdapterTopology {
    let mut numeric: Vec<String> = Vec::new();
    let mut dedicated: Vec<String> = Vec::new();
    for name in names {
        if !name.is_empty() && name.chars().all(|c| c.is_ascii_digit()) {
            numeric.push(name.clone());
        } else {
            dedicated.push(name.clone());
        }
    }
    if !numeric.is_empty() {
        AdapterTopology::Routed(numeric)
    } else if let Some(name) = dedicated
        .iter()
        .find(|n| *n == "default")
        .or_else(|| dedicated.first())
    {
        AdapterTopology::Single(name.clone())
    } else {
        AdapterTopology::None
    }
}

/// `W + scaling · B·A`, computed in f32 and cast back to the weight dtype.
fn apply_delta(
    weight: &Tensor,
    a: &Tensor,
    b: &Tensor,
    scaling: f64,
) -> candle_core::Result<Tensor> {
    let delta = (b
        .to_dtype(DType::F32)?
        .matmul(&a.to_dtype(DType::F32)?)?
        * scaling)?;
    weight
        .to_dtype(DType::F32)?
        .add(&delta)?
        .to_dtype(weight.dtype())
}
