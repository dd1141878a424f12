use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use hf_hub::{api::sync::Api, Repo, RepoType};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::ModelConfig;
use crate::models::T5ForConditionalGeneration;

pub struct ModelFiles {
    /// Hub id or directory the files were resolved from.
    pub name_or_path: String,
    pub config: ModelConfig,
    pub weights: Vec<PathBuf>,
    pub tokenizer: Option<PathBuf>,
}

/// Resolve model files from a local directory or the HuggingFace Hub (cached).
pub fn fetch_model(model_id: &str) -> anyhow::Result<ModelFiles> {
    let local = Path::new(model_id);
    if local.is_dir() {
        return fetch_local(local);
    }

    let api = Api::new()?;
    let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

    let config_path = repo.get("config.json")?;
    let config = read_config(&config_path)?;
    let tokenizer = repo.get("tokenizer.json").ok();
    let weights = load_safetensor_paths(&repo)?;

    info!(model = model_id, shards = weights.len(), "resolved model from hub");
    Ok(ModelFiles {
        name_or_path: model_id.to_string(),
        config,
        weights,
        tokenizer,
    })
}

fn fetch_local(dir: &Path) -> anyhow::Result<ModelFiles> {
    let config = read_config(&dir.join("config.json"))?;

    let single = dir.join("model.safetensors");
    let weights = if single.exists() {
        vec![single]
    } else {
        let index_path = dir.join("model.safetensors.index.json");
        let index = std::fs::read_to_string(&index_path).map_err(|e| {
            anyhow::anyhow!("no safetensors weights in {}: {e}", dir.display())
        })?;
        shard_filenames(&index)?
            .into_iter()
            .map(|f| dir.join(f))
            .collect()
    };

    let tokenizer = Some(dir.join("tokenizer.json")).filter(|p| p.exists());

    info!(path = %dir.display(), shards = weights.len(), "resolved model from local directory");
    Ok(ModelFiles {
        name_or_path: dir.display().to_string(),
        config,
        weights,
        tokenizer,
    })
}

fn read_config(path: &Path) -> anyhow::Result<ModelConfig> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Creates a VarBuilder from safetensor weight files.
pub fn load_weights(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> anyhow::Result<VarBuilder<'static>> {
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
    Ok(vb)
}

/// Load a frozen T5 from resolved model files.
pub fn load_t5(
    files: &ModelFiles,
    dtype: DType,
    device: &Device,
) -> anyhow::Result<T5ForConditionalGeneration> {
    let vb = load_weights(&files.weights, dtype, device)?;
    let model = T5ForConditionalGeneration::new(&files.config, vb)?;
    Ok(model.with_name_or_path(files.name_or_path.clone()))
}

/// Natural sort key: splits a filename into alternating text/numeric segments
/// so that "model-2-of-10" sorts before "model-10-of-10".
fn natural_sort_key(s: &str) -> Vec<Result<u64, String>> {
    let basename = Path::new(s)
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or(s);
    let mut parts = Vec::new();
    let mut chars = basename.chars().peekable();
    while let Some(&first) = chars.peek() {
        let is_digit = first.is_ascii_digit();
        let mut segment = String::new();
        while let Some(c) = chars.next_if(|c| c.is_ascii_digit() == is_digit) {
            segment.push(c);
        }
        if is_digit {
            parts.push(Ok(segment.parse::<u64>().unwrap_or(0)));
        } else {
            parts.push(Err(segment));
        }
    }
    parts
}

/// Shard filenames listed in a `model.safetensors.index.json`, deduplicated
/// and in natural order.
fn shard_filenames(index_json: &str) -> anyhow::Result<Vec<String>> {
    let index: serde_json::Value = serde_json::from_str(index_json)?;
    let weight_map = index["weight_map"]
        .as_object()
        .ok_or_else(|| anyhow::anyhow!("missing weight_map in index"))?;

    let mut filenames: Vec<String> = weight_map
        .values()
        .filter_map(|v| v.as_str().map(String::from))
        .collect();
    filenames.sort_by_key(|a| natural_sort_key(a));
    filenames.dedup();
    Ok(filenames)
}

fn load_safetensor_paths(repo: &hf_hub::api::sync::ApiRepo) -> anyhow::Result<Vec<PathBuf>> {
    if let Ok(path) = repo.get("model.safetensors") {
        return Ok(vec![path]);
    }

    let index_path = repo.get("model.safetensors.index.json")?;
    let filenames = shard_filenames(&std::fs::read_to_string(&index_path)?)?;

    let mut paths = Vec::new();
    for filename in &filenames {
        paths.push(repo.get(filename)?);
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn natural_sort_orders_numerically() {
        let mut files = vec![
            "model-00010-of-00020.safetensors".to_string(),
            "model-00002-of-00020.safetensors".to_string(),
            "model-00001-of-00020.safetensors".to_string(),
            "model-00011-of-00020.safetensors".to_string(),
        ];
        files.sort_by(|a, b| natural_sort_key(a).cmp(&natural_sort_key(b)));
        assert_eq!(
            files,
            vec![
                "model-00001-of-00020.safetensors",
                "model-00002-of-00020.safetensors",
                "model-00010-of-00020.safetensors",
                "model-00011-of-00020.safetensors",
            ]
        );
    }

    #[test]
    fn shard_filenames_dedups() {
        let index = r#"{
            "metadata": {"total_size": 1},
            "weight_map": {
                "shared.weight": "model-00002-of-00002.safetensors",
                "encoder.block.0.layer.0.SelfAttention.q.weight": "model-00001-of-00002.safetensors",
                "encoder.block.0.layer.0.SelfAttention.k.weight": "model-00001-of-00002.safetensors"
            }
        }"#;
        let files = shard_filenames(index).unwrap();
        assert_eq!(
            files,
            vec![
                "model-00001-of-00002.safetensors",
                "model-00002-of-00002.safetensors"
            ]
        );
    }

    #[test]
    fn local_dir_without_weights_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"d_model": 64, "num_heads": 2, "num_layers": 2, "d_ff": 128, "vocab_size": 256}"#,
        )
        .unwrap();

        let result = fetch_model(dir.path().to_str().unwrap());
        assert!(result.is_err());
    }

    #[test]
    fn local_dir_resolves_single_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"d_model": 64, "num_heads": 2, "num_layers": 2, "d_ff": 128, "vocab_size": 256}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("model.safetensors"), b"").unwrap();

        let files = fetch_model(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(files.config.hidden_size, 64);
        assert_eq!(files.weights.len(), 1);
        assert!(files.tokenizer.is_none());
    }

    #[test]
    #[ignore] // requires network access
    fn fetch_t5_small_from_hub() {
        let files = fetch_model("google-t5/t5-small").unwrap();
        assert_eq!(files.config.hidden_size, 512);
        assert!(!files.weights.is_empty());
    }
}
