//! Adapter configuration (`adapter_config.json`).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::error::{PeftError, Result};
use crate::config::ModelConfig;

pub const CONFIG_NAME: &str = "adapter_config.json";

/// Adapter family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeftType {
    #[serde(alias = "PROMPT_TUNING")]
    PromptTuning,
    #[serde(alias = "ATTEMPT")]
    Attempt,
}

/// How the virtual-token table is initialised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PromptInit {
    #[default]
    #[serde(rename = "random", alias = "RANDOM")]
    Random,
    /// Rows copied from distinct ids among the first 5000 vocabulary entries.
    #[serde(rename = "vocab", alias = "vocab-sampled")]
    VocabSampled,
    /// Rows loaded from `prompt_init_embedding`.
    #[serde(rename = "embedding", alias = "from-file")]
    FromFile,
}

fn default_attention_dim() -> usize {
    100
}

/// Shape and initialisation policy of one adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub peft_type: PeftType,
    pub num_virtual_tokens: usize,
    /// 2 for encoder-decoder base models, 1 otherwise. Filled by [`AdapterConfig::prepared_for`].
    #[serde(default)]
    pub num_transformer_submodules: Option<usize>,
    /// Must equal the base model's hidden size.
    #[serde(default)]
    pub token_dim: Option<usize>,
    #[serde(default)]
    pub num_attention_heads: Option<usize>,
    #[serde(default)]
    pub num_layers: Option<usize>,
    #[serde(default)]
    pub prompt_init: PromptInit,
    #[serde(default)]
    pub prompt_init_embedding: Option<PathBuf>,
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
    #[serde(default)]
    pub inference_mode: bool,
    /// Store one table per transformer submodule instead of a single table.
    #[serde(default)]
    pub per_submodule_embeddings: bool,
    /// Bottleneck width of the ATTEMPT attention adapter.
    #[serde(default = "default_attention_dim")]
    pub attention_dim: usize,
    /// Softmax temperature of the ATTEMPT scores; `sqrt(token_dim)` when unset.
    #[serde(default)]
    pub attention_temperature: Option<f64>,
    /// Seed for random and vocab-sampled initialisation.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl AdapterConfig {
    pub fn new(peft_type: PeftType, num_virtual_tokens: usize) -> Self {
        Self {
            peft_type,
            num_virtual_tokens,
            num_transformer_submodules: None,
            token_dim: None,
            num_attention_heads: None,
            num_layers: None,
            prompt_init: PromptInit::Random,
            prompt_init_embedding: None,
            base_model_name_or_path: None,
            inference_mode: false,
            per_submodule_embeddings: false,
            attention_dim: default_attention_dim(),
            attention_temperature: None,
            seed: None,
        }
    }

    pub fn prompt_tuning(num_virtual_tokens: usize) -> Self {
        Self::new(PeftType::PromptTuning, num_virtual_tokens)
    }

    pub fn attempt(num_virtual_tokens: usize) -> Self {
        Self::new(PeftType::Attempt, num_virtual_tokens)
    }

    /// Every current adapter family learns a soft prompt.
    pub fn is_prompt_learning(&self) -> bool {
        matches!(self.peft_type, PeftType::PromptTuning | PeftType::Attempt)
    }

    pub fn num_transformer_submodules(&self) -> usize {
        self.num_transformer_submodules.unwrap_or(1)
    }

    /// Rows in the virtual-token table.
    pub fn total_virtual_tokens(&self) -> usize {
        self.num_virtual_tokens * self.num_transformer_submodules()
    }

    /// `token_dim`, or a config error when it has not been set yet.
    pub fn token_dim(&self) -> Result<usize> {
        self.token_dim.ok_or_else(|| {
            PeftError::config("token_dim must be set before the adapter is constructed")
        })
    }

    pub fn attention_temperature(&self) -> Result<f64> {
        match self.attention_temperature {
            Some(t) => Ok(t),
            None => Ok((self.token_dim()? as f64).sqrt()),
        }
    }

    /// Check that the config is complete and self-consistent.
    pub fn validate(&self) -> Result<()> {
        if self.num_virtual_tokens == 0 {
            return Err(PeftError::config("num_virtual_tokens must be positive"));
        }
        let token_dim = self.token_dim()?;
        if token_dim == 0 {
            return Err(PeftError::config("token_dim must be positive"));
        }
        if let Some(n) = self.num_transformer_submodules {
            if n != 1 && n != 2 {
                return Err(PeftError::config(format!(
                    "num_transformer_submodules must be 1 or 2, got {n}"
                )));
            }
        }
        match (self.prompt_init, &self.prompt_init_embedding) {
            (PromptInit::FromFile, None) => {
                return Err(PeftError::config(
                    "prompt_init 'embedding' requires prompt_init_embedding",
                ))
            }
            (PromptInit::Random | PromptInit::VocabSampled, Some(path)) => {
                return Err(PeftError::config(format!(
                    "prompt_init_embedding {} is only used with prompt_init 'embedding'",
                    path.display()
                )))
            }
            _ => {}
        }
        if self.peft_type == PeftType::Attempt {
            if self.attention_dim == 0 {
                return Err(PeftError::config("attention_dim must be positive"));
            }
            if let Some(t) = self.attention_temperature {
                if t.is_nan() || t <= 0.0 {
                    return Err(PeftError::config("attention_temperature must be positive"));
                }
            }
        }
        Ok(())
    }

    /// Fill the fields that depend on the base model and check the rest against it.
    pub fn prepared_for(&self, model: &ModelConfig, name_or_path: &str) -> Result<Self> {
        let mut config = self.clone();

        match config.token_dim {
            Some(dim) if dim != model.hidden_size => {
                return Err(PeftError::config(format!(
                    "token_dim {dim} does not match the base model hidden size {}",
                    model.hidden_size
                )))
            }
            _ => config.token_dim = Some(model.hidden_size),
        }
        config
            .num_transformer_submodules
            .get_or_insert(model.num_transformer_submodules());
        config
            .num_attention_heads
            .get_or_insert(model.num_attention_heads);
        config.num_layers.get_or_insert(model.num_hidden_layers);
        if config.base_model_name_or_path.is_none() {
            config.base_model_name_or_path = Some(name_or_path.to_string());
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_pretrained(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(CONFIG_NAME);
        let content = std::fs::read_to_string(&path).map_err(|e| PeftError::io(&path, e))?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save_pretrained(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| PeftError::io(dir, e))?;
        let path = dir.join(CONFIG_NAME);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content).map_err(|e| PeftError::io(&path, e))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::tiny_t5_config;

    #[test]
    fn total_virtual_tokens_scales_with_submodules() {
        let mut config = AdapterConfig::prompt_tuning(10);
        assert_eq!(config.total_virtual_tokens(), 10);

        config.num_transformer_submodules = Some(2);
        assert_eq!(config.total_virtual_tokens(), 20);
        assert!(config.is_prompt_learning());
    }

    #[test]
    fn validate_requires_token_dim() {
        let config = AdapterConfig::prompt_tuning(10);
        match config.validate() {
            Err(PeftError::Config(msg)) => assert!(msg.contains("token_dim")),
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[test]
    fn validate_from_file_needs_path() {
        let mut config = AdapterConfig::prompt_tuning(4);
        config.token_dim = Some(64);
        config.prompt_init = PromptInit::FromFile;
        assert!(matches!(config.validate(), Err(PeftError::Config(_))));

        config.prompt_init_embedding = Some(PathBuf::from("/tmp/init.safetensors"));
        assert!(config.validate().is_ok());

        config.prompt_init = PromptInit::Random;
        assert!(matches!(config.validate(), Err(PeftError::Config(_))));
    }

    #[test]
    fn validate_rejects_zero_tokens() {
        let mut config = AdapterConfig::prompt_tuning(0);
        config.token_dim = Some(64);
        assert!(matches!(config.validate(), Err(PeftError::Config(_))));
    }

    #[test]
    fn prepared_for_fills_model_fields() {
        let model = tiny_t5_config();
        let config = AdapterConfig::attempt(5)
            .prepared_for(&model, "tiny-t5")
            .unwrap();

        assert_eq!(config.token_dim, Some(64));
        assert_eq!(config.num_transformer_submodules, Some(2));
        assert_eq!(config.num_attention_heads, Some(2));
        assert_eq!(config.num_layers, Some(2));
        assert_eq!(config.base_model_name_or_path.as_deref(), Some("tiny-t5"));
        assert_eq!(config.total_virtual_tokens(), 10);
        assert_eq!(config.attention_temperature().unwrap(), 8.0);
    }

    #[test]
    fn prepared_for_rejects_wrong_token_dim() {
        let model = tiny_t5_config();
        let mut config = AdapterConfig::prompt_tuning(5);
        config.token_dim = Some(768);
        assert!(matches!(
            config.prepared_for(&model, "tiny-t5"),
            Err(PeftError::Config(_))
        ));
    }

    #[test]
    fn parses_peft_style_json() {
        let json = r#"{
            "peft_type": "PROMPT_TUNING",
            "num_virtual_tokens": 20,
            "num_transformer_submodules": 2,
            "token_dim": 768,
            "prompt_init": "vocab",
            "prompt_init_embedding": null,
            "inference_mode": true
        }"#;
        let config: AdapterConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.peft_type, PeftType::PromptTuning);
        assert_eq!(config.prompt_init, PromptInit::VocabSampled);
        assert_eq!(config.total_virtual_tokens(), 40);
        assert_eq!(config.attention_dim, 100);
        assert!(config.inference_mode);
    }

    #[test]
    fn save_and_load_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AdapterConfig::attempt(8);
        config.token_dim = Some(64);
        config.prompt_init = PromptInit::VocabSampled;

        let path = config.save_pretrained(dir.path()).unwrap();
        assert!(path.ends_with(CONFIG_NAME));

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"attempt\""));
        assert!(text.contains("\"vocab\""));

        let loaded = AdapterConfig::from_pretrained(dir.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_config_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            AdapterConfig::from_pretrained(dir.path()),
            Err(PeftError::Io { .. })
        ));
    }
}
