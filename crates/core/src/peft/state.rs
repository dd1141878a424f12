//! Adapter state extraction, loading and the on-disk artifact.
//!
//! Only adapter-owned tensors are ever written; the frozen base model is
//! never serialized. The artifact `adapter_model.bin` holds safetensors
//! content with flattened keys:
//!
//! ```text
//! prompt_embeddings                         single table
//! prompt_embeddings.{i}                     per-submodule tables, in order
//! attention_module.peft.attn_W_down.weight  ATTEMPT only
//! attention_module.peft.attn_W_up.weight
//! attention_module.peft.layer_norm.weight
//! attention_module.peft.layer_norm.bias
//! ```
//!
//! Reading also accepts a pickled PyTorch state dict.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use tracing::{debug, info};

use super::attention::{
    ATTN_DOWN_KEY, ATTN_UP_KEY, LAYER_NORM_BIAS_KEY, LAYER_NORM_WEIGHT_KEY,
};
use super::error::{PeftError, Result};
use super::model::PeftModel;
use crate::device::infer_device;
use crate::models::Seq2SeqModel;

pub const WEIGHTS_NAME: &str = "adapter_model.bin";
pub const PROMPT_EMBEDDINGS_KEY: &str = "prompt_embeddings";
pub const ATTENTION_MODULE_KEY: &str = "attention_module";

const ATTENTION_KEYS: [&str; 4] = [
    ATTN_DOWN_KEY,
    ATTN_UP_KEY,
    LAYER_NORM_WEIGHT_KEY,
    LAYER_NORM_BIAS_KEY,
];

/// Virtual-token table(s) as plain tensors.
#[derive(Debug, Clone)]
pub enum EmbeddingState {
    /// One `(total_virtual_tokens, token_dim)` table.
    Single(Tensor),
    /// One `(num_virtual_tokens, token_dim)` table per transformer submodule.
    PerSubmodule(Vec<Tensor>),
}

impl EmbeddingState {
    pub fn num_tables(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::PerSubmodule(tables) => tables.len(),
        }
    }

    /// All rows stacked into a single table.
    pub fn to_single(&self) -> Result<Tensor> {
        match self {
            Self::Single(table) => Ok(table.clone()),
            Self::PerSubmodule(tables) => Ok(Tensor::cat(tables, 0)?),
        }
    }
}

/// Everything an adapter owns, keyed independently of the adapter name.
#[derive(Debug, Clone)]
pub struct AdapterState {
    pub prompt_embeddings: EmbeddingState,
    /// ATTEMPT weights keyed `peft.attn_W_down.weight` etc.
    pub attention_module: Option<BTreeMap<String, Tensor>>,
}

/// Keys in a loaded artifact that no part of the adapter consumed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub unexpected_keys: Vec<String>,
}

impl AdapterState {
    /// Flatten into artifact keys.
    pub fn to_tensors(&self) -> HashMap<String, Tensor> {
        let mut tensors = HashMap::new();
        match &self.prompt_embeddings {
            EmbeddingState::Single(table) => {
                tensors.insert(PROMPT_EMBEDDINGS_KEY.to_string(), table.clone());
            }
            EmbeddingState::PerSubmodule(tables) => {
                for (i, table) in tables.iter().enumerate() {
                    tensors.insert(format!("{PROMPT_EMBEDDINGS_KEY}.{i}"), table.clone());
                }
            }
        }
        if let Some(attention) = &self.attention_module {
            for (key, tensor) in attention {
                tensors.insert(format!("{ATTENTION_MODULE_KEY}.{key}"), tensor.clone());
            }
        }
        tensors
    }

    /// Rebuild from flattened artifact keys.
    ///
    /// Any `.{adapter_name}` path segment is stripped first, so artifacts
    /// written under a different adapter name load the same way. Keys that
    /// belong to neither the prompt table nor the attention module are
    /// returned as unexpected.
    pub fn from_tensors(
        tensors: &HashMap<String, Tensor>,
        adapter_name: &str,
    ) -> Result<(Self, Vec<String>)> {
        let mut single: Option<Tensor> = None;
        let mut indexed: BTreeMap<usize, Tensor> = BTreeMap::new();
        let mut attention: BTreeMap<String, Tensor> = BTreeMap::new();
        let mut unexpected = Vec::new();

        for (raw_key, tensor) in tensors {
            let key = normalize_key(raw_key, adapter_name);
            if key == PROMPT_EMBEDDINGS_KEY {
                single = Some(tensor.clone());
            } else if let Some(rest) = key.strip_prefix(&format!("{PROMPT_EMBEDDINGS_KEY}.")) {
                match rest.parse::<usize>() {
                    Ok(i) => {
                        indexed.insert(i, tensor.clone());
                    }
                    Err(_) => unexpected.push(raw_key.clone()),
                }
            } else if let Some(rest) = key.strip_prefix(&format!("{ATTENTION_MODULE_KEY}.")) {
                attention.insert(rest.to_string(), tensor.clone());
            } else {
                unexpected.push(raw_key.clone());
            }
        }
        unexpected.sort();

        let prompt_embeddings = match (single, indexed.is_empty()) {
            (Some(table), true) => EmbeddingState::Single(table),
            (None, false) => {
                let count = indexed.len();
                if indexed.keys().copied().ne(0..count) {
                    return Err(PeftError::mismatch(
                        PROMPT_EMBEDDINGS_KEY,
                        format!(
                            "per-submodule tables must be numbered 0..{count}, got {:?}",
                            indexed.keys().collect::<Vec<_>>()
                        ),
                    ));
                }
                EmbeddingState::PerSubmodule(indexed.into_values().collect())
            }
            (Some(_), false) => {
                return Err(PeftError::mismatch(
                    PROMPT_EMBEDDINGS_KEY,
                    "artifact holds both a single table and per-submodule tables",
                ))
            }
            (None, true) => {
                return Err(PeftError::mismatch(PROMPT_EMBEDDINGS_KEY, "missing from state"))
            }
        };

        let attention_module = if attention.is_empty() {
            None
        } else {
            Some(attention)
        };

        Ok((
            Self {
                prompt_embeddings,
                attention_module,
            },
            unexpected,
        ))
    }
}

/// Drop a `.{adapter_name}` scope directly under the top-level key.
///
/// Keys that are already canonical are kept as they are, so an adapter
/// named `peft` or `1` never loses an attention sub-key or a table index.
fn normalize_key(key: &str, adapter_name: &str) -> String {
    if adapter_name.is_empty() || is_canonical_key(key) {
        return key.to_string();
    }
    for top in [PROMPT_EMBEDDINGS_KEY, ATTENTION_MODULE_KEY] {
        let rest = key
            .strip_prefix(top)
            .and_then(|r| r.strip_prefix('.'))
            .and_then(|r| r.strip_prefix(adapter_name));
        if let Some(rest) = rest {
            if rest.is_empty() || rest.starts_with('.') {
                return format!("{top}{rest}");
            }
        }
    }
    key.to_string()
}

fn is_canonical_key(key: &str) -> bool {
    if key == PROMPT_EMBEDDINGS_KEY {
        return true;
    }
    if let Some(index) = key.strip_prefix(&format!("{PROMPT_EMBEDDINGS_KEY}.")) {
        return index.parse::<usize>().is_ok();
    }
    key.strip_prefix(&format!("{ATTENTION_MODULE_KEY}."))
        .is_some_and(|k| ATTENTION_KEYS.contains(&k))
}

/// Snapshot the named adapter's trainable tensors.
///
/// Inference-mode adapters are read straight from their stored tables;
/// trainable ones go through the lookup path and are detached onto the CPU.
pub fn extract_state<M: Seq2SeqModel>(
    model: &PeftModel<M>,
    adapter_name: &str,
) -> Result<AdapterState> {
    let entry = model
        .adapter(adapter_name)
        .ok_or_else(|| PeftError::UnknownAdapter(adapter_name.to_string()))?;
    entry.module.extract(entry.config.inference_mode)
}

/// Load artifact tensors into the named adapter.
///
/// The prompt table and (for ATTEMPT) the attention weights are restored
/// strictly; everything is validated before any tensor is assigned, so a
/// failed load leaves the adapter untouched. Base-model keys are never
/// applied: the base is frozen and they are reported as unexpected.
///
/// Adapter tensors are `Var`s updated in place, so a shared borrow suffices.
pub fn apply_state<M: Seq2SeqModel>(
    model: &PeftModel<M>,
    tensors: &HashMap<String, Tensor>,
    adapter_name: &str,
) -> Result<LoadReport> {
    let entry = model
        .adapter(adapter_name)
        .ok_or_else(|| PeftError::UnknownAdapter(adapter_name.to_string()))?;

    let (state, mut unexpected_keys) = AdapterState::from_tensors(tensors, adapter_name)?;
    if entry.module.attention().is_none() {
        if let Some(attention) = &state.attention_module {
            unexpected_keys.extend(
                attention
                    .keys()
                    .map(|k| format!("{ATTENTION_MODULE_KEY}.{k}")),
            );
        }
    }

    entry.module.apply(&state)?;

    if !unexpected_keys.is_empty() {
        debug!(adapter = adapter_name, keys = ?unexpected_keys, "ignored unexpected keys");
    }
    Ok(LoadReport { unexpected_keys })
}

/// Write adapter state to `path` as safetensors content.
pub fn save_artifact(state: &AdapterState, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PeftError::io(parent, e))?;
    }
    let tensors = state.to_tensors();
    candle_core::safetensors::save(&tensors, path)?;
    info!(path = %path.display(), tensors = tensors.len(), "saved adapter weights");
    Ok(())
}

/// Read `adapter_model.bin` from `dir` onto `device`.
///
/// With no device the best available one is used (CUDA, Metal, CPU).
pub fn load_artifact(dir: &Path, device: Option<&Device>) -> Result<HashMap<String, Tensor>> {
    let path = dir.join(WEIGHTS_NAME);
    if !path.is_file() {
        return Err(PeftError::not_found(path));
    }
    let device = match device {
        Some(device) => device.clone(),
        None => infer_device(),
    };
    read_tensors(&path, &device)
}

/// Read a tensor file: safetensors first, then a pickled PyTorch state dict.
pub fn read_tensors(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    if !path.is_file() {
        return Err(PeftError::not_found(path));
    }

    let safetensors_err = match candle_core::safetensors::load(path, device) {
        Ok(tensors) => return Ok(tensors),
        Err(e) => e,
    };

    match candle_core::pickle::read_all(path) {
        Ok(entries) if !entries.is_empty() => {
            debug!(path = %path.display(), "read pickled state dict");
            let mut tensors = HashMap::with_capacity(entries.len());
            for (name, tensor) in entries {
                tensors.insert(name, tensor.to_device(device)?);
            }
            Ok(tensors)
        }
        Ok(_) => Err(unreadable(path, &safetensors_err, "pickle held no tensors")),
        Err(pickle_err) => Err(unreadable(path, &safetensors_err, &pickle_err.to_string())),
    }
}

fn unreadable(path: &Path, safetensors_err: &candle_core::Error, pickle_err: &str) -> PeftError {
    let source = std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("not safetensors ({safetensors_err}) nor a pickled state dict ({pickle_err})"),
    );
    PeftError::io(PathBuf::from(path), source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn table(rows: usize, value: f32) -> Tensor {
        Tensor::full(value, (rows, 4), &Device::Cpu).unwrap()
    }

    #[test]
    fn normalize_strips_adapter_segment() {
        assert_eq!(
            normalize_key("prompt_embeddings.default", "default"),
            "prompt_embeddings"
        );
        assert_eq!(
            normalize_key("attention_module.task_a.peft.attn_W_up.weight", "task_a"),
            "attention_module.peft.attn_W_up.weight"
        );
        assert_eq!(normalize_key("prompt_embeddings", "default"), "prompt_embeddings");
        assert_eq!(
            normalize_key("prompt_embeddings.default.1", "default"),
            "prompt_embeddings.1"
        );
    }

    #[test]
    fn normalize_keeps_canonical_keys_matching_the_name() {
        assert_eq!(
            normalize_key("attention_module.peft.attn_W_down.weight", "peft"),
            "attention_module.peft.attn_W_down.weight"
        );
        assert_eq!(
            normalize_key("attention_module.peft.peft.layer_norm.bias", "peft"),
            "attention_module.peft.layer_norm.bias"
        );
        assert_eq!(normalize_key("prompt_embeddings.1", "1"), "prompt_embeddings.1");
        assert_eq!(normalize_key("prompt_embeddings.1.0", "1"), "prompt_embeddings.0");
        assert_eq!(normalize_key("encoder.peft.weight", "peft"), "encoder.peft.weight");
    }

    #[test]
    fn per_submodule_tables_load_under_numeric_name() {
        let state = AdapterState {
            prompt_embeddings: EmbeddingState::PerSubmodule(vec![table(2, 1.0), table(2, 2.0)]),
            attention_module: None,
        };
        let (rebuilt, unexpected) = AdapterState::from_tensors(&state.to_tensors(), "1").unwrap();
        assert!(unexpected.is_empty());
        assert_eq!(rebuilt.prompt_embeddings.num_tables(), 2);
    }

    #[test]
    fn flatten_and_rebuild_per_submodule() {
        let state = AdapterState {
            prompt_embeddings: EmbeddingState::PerSubmodule(vec![table(2, 1.0), table(2, 2.0)]),
            attention_module: None,
        };
        let tensors = state.to_tensors();
        assert!(tensors.contains_key("prompt_embeddings.0"));
        assert!(tensors.contains_key("prompt_embeddings.1"));

        let (rebuilt, unexpected) = AdapterState::from_tensors(&tensors, "default").unwrap();
        assert!(unexpected.is_empty());
        match rebuilt.prompt_embeddings {
            EmbeddingState::PerSubmodule(tables) => {
                assert_eq!(tables.len(), 2);
                let second: Vec<Vec<f32>> = tables[1].to_vec2().unwrap();
                assert_eq!(second[0][0], 2.0);
            }
            other => panic!("expected per-submodule tables, got {other:?}"),
        }
    }

    #[test]
    fn from_tensors_reports_unexpected_keys() {
        let mut tensors = HashMap::new();
        tensors.insert("prompt_embeddings".to_string(), table(3, 0.5));
        tensors.insert("shared.weight".to_string(), table(8, 0.0));

        let (state, unexpected) = AdapterState::from_tensors(&tensors, "default").unwrap();
        assert_eq!(unexpected, vec!["shared.weight".to_string()]);
        assert!(state.attention_module.is_none());
        assert_eq!(state.prompt_embeddings.num_tables(), 1);
    }

    #[test]
    fn from_tensors_requires_prompt_embeddings() {
        let mut tensors = HashMap::new();
        tensors.insert("shared.weight".to_string(), table(8, 0.0));
        assert!(matches!(
            AdapterState::from_tensors(&tensors, "default"),
            Err(PeftError::StateMismatch { .. })
        ));
    }

    #[test]
    fn from_tensors_rejects_gaps_in_table_numbering() {
        let mut tensors = HashMap::new();
        tensors.insert("prompt_embeddings.0".to_string(), table(2, 0.0));
        tensors.insert("prompt_embeddings.2".to_string(), table(2, 0.0));
        assert!(matches!(
            AdapterState::from_tensors(&tensors, "default"),
            Err(PeftError::StateMismatch { .. })
        ));
    }

    #[test]
    fn artifact_round_trips_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut attention = BTreeMap::new();
        attention.insert(
            "peft.layer_norm.bias".to_string(),
            Tensor::zeros(4, DType::F32, &Device::Cpu).unwrap(),
        );
        let state = AdapterState {
            prompt_embeddings: EmbeddingState::Single(table(3, 1.5)),
            attention_module: Some(attention),
        };

        save_artifact(&state, &dir.path().join(WEIGHTS_NAME)).unwrap();
        let tensors = load_artifact(dir.path(), Some(&Device::Cpu)).unwrap();

        assert_eq!(tensors["prompt_embeddings"].dims(), &[3, 4]);
        assert!(tensors.contains_key("attention_module.peft.layer_norm.bias"));
    }

    #[test]
    fn load_artifact_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        match load_artifact(dir.path(), Some(&Device::Cpu)) {
            Err(PeftError::Io { path, source }) => {
                assert!(path.ends_with(WEIGHTS_NAME));
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("expected Io error, got {other:?}"),
        }
    }

    #[test]
    fn garbage_file_is_invalid_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(WEIGHTS_NAME);
        std::fs::write(&path, b"definitely not tensors").unwrap();
        match read_tensors(&path, &Device::Cpu) {
            Err(PeftError::Io { source, .. }) => {
                assert_eq!(source.kind(), std::io::ErrorKind::InvalidData)
            }
            other => panic!("expected Io error, got {other:?}"),
        }
    }
}
