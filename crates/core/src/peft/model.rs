//! A frozen seq2seq model with named prompt adapters.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use candle_core::{Device, Tensor, Var};
use candle_nn::Embedding;
use tracing::{debug, info};

use super::attention::AttentionAdapter;
use super::config::{AdapterConfig, PeftType, PromptInit};
use super::embedding::VirtualTokenEmbedding;
use super::error::{PeftError, Result};
use super::state::{
    apply_state, extract_state, load_artifact, save_artifact, AdapterState, LoadReport,
    WEIGHTS_NAME,
};
use crate::models::{GenerationConfig, Seq2SeqModel, Seq2SeqOutput};

pub const DEFAULT_ADAPTER_NAME: &str = "default";

/// Trainable parts of one adapter.
#[derive(Debug, Clone)]
pub enum AdapterModule {
    PromptTuning {
        embedding: VirtualTokenEmbedding,
    },
    Attempt {
        embedding: VirtualTokenEmbedding,
        attention: AttentionAdapter,
    },
}

impl AdapterModule {
    /// `config` must already be prepared for the base model.
    pub fn build(config: &AdapterConfig, word_embeddings: &Embedding, device: &Device) -> Result<Self> {
        let embedding = VirtualTokenEmbedding::new(config, word_embeddings, device)?;
        Ok(match config.peft_type {
            PeftType::PromptTuning => Self::PromptTuning { embedding },
            PeftType::Attempt => Self::Attempt {
                embedding,
                attention: AttentionAdapter::new(config, device)?,
            },
        })
    }

    pub fn peft_type(&self) -> PeftType {
        match self {
            Self::PromptTuning { .. } => PeftType::PromptTuning,
            Self::Attempt { .. } => PeftType::Attempt,
        }
    }

    pub fn embedding(&self) -> &VirtualTokenEmbedding {
        match self {
            Self::PromptTuning { embedding } | Self::Attempt { embedding, .. } => embedding,
        }
    }

    pub fn attention(&self) -> Option<&AttentionAdapter> {
        match self {
            Self::PromptTuning { .. } => None,
            Self::Attempt { attention, .. } => Some(attention),
        }
    }

    pub fn vars(&self) -> Vec<Var> {
        let mut vars = self.embedding().vars();
        if let Some(attention) = self.attention() {
            vars.extend(attention.vars());
        }
        vars
    }

    /// Prompt rows to prepend, `[batch, total_virtual_tokens, token_dim]` in f32.
    pub fn prompts(&self, inputs_embeds: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let batch = inputs_embeds.dim(0)?;
        match self {
            Self::PromptTuning { embedding } => embedding.prompt_embeddings(batch),
            Self::Attempt {
                embedding,
                attention,
            } => attention.forward(&embedding.weight()?, inputs_embeds, attention_mask),
        }
    }

    pub fn extract(&self, inference_mode: bool) -> Result<AdapterState> {
        let embedding = self.embedding();
        let prompt_embeddings = if inference_mode {
            embedding.stored()
        } else {
            embedding.to_save()?
        };
        let attention_module = match self.attention() {
            Some(attention) => Some(attention.state()?),
            None => None,
        };
        Ok(AdapterState {
            prompt_embeddings,
            attention_module,
        })
    }

    /// Validate all of `state` first, then assign it.
    pub fn apply(&self, state: &AdapterState) -> Result<()> {
        let tables = self.embedding().conform(&state.prompt_embeddings)?;
        let attention = match (self.attention(), &state.attention_module) {
            (Some(attention), Some(weights)) => Some((attention, attention.conform(weights)?)),
            (Some(_), None) => {
                return Err(PeftError::mismatch(
                    "attention_module",
                    "missing from state of an attempt adapter",
                ))
            }
            (None, _) => None,
        };

        self.embedding().assign(&tables)?;
        if let Some((attention, weights)) = attention {
            attention.assign(&weights)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct AdapterEntry {
    pub config: AdapterConfig,
    pub module: AdapterModule,
}

/// Frozen base model plus a registry of named adapters, one of them active.
///
/// Only adapter tensors are trainable. The base model is shared read-only.
pub struct PeftModel<M: Seq2SeqModel> {
    base: Arc<M>,
    adapters: BTreeMap<String, AdapterEntry>,
    active: String,
}

impl<M: Seq2SeqModel> PeftModel<M> {
    /// Wrap `base` and register `config` as the active adapter `adapter_name`.
    pub fn new(base: Arc<M>, config: AdapterConfig, adapter_name: &str) -> Result<Self> {
        let mut model = Self {
            base,
            adapters: BTreeMap::new(),
            active: adapter_name.to_string(),
        };
        model.attach(adapter_name, config)?;
        Ok(model)
    }

    /// Register a new adapter. Does not change the active adapter.
    pub fn attach(&mut self, adapter_name: &str, config: AdapterConfig) -> Result<()> {
        if self.adapters.contains_key(adapter_name) {
            return Err(PeftError::DuplicateAdapter(adapter_name.to_string()));
        }
        self.insert(adapter_name, config, false)
    }

    /// Register an adapter, replacing any existing one of the same name.
    pub fn attach_or_replace(&mut self, adapter_name: &str, config: AdapterConfig) -> Result<()> {
        self.insert(adapter_name, config, false)
    }

    /// With `restoring` set the tables are about to be overwritten from an
    /// artifact, so they start random instead of following `prompt_init`.
    fn insert(&mut self, adapter_name: &str, config: AdapterConfig, restoring: bool) -> Result<()> {
        let config = config.prepared_for(self.base.config(), self.base.name_or_path())?;

        if config.peft_type == PeftType::Attempt {
            if let Some(other) = self
                .adapters
                .iter()
                .find(|(name, entry)| {
                    name.as_str() != adapter_name && entry.config.peft_type == PeftType::Attempt
                })
                .map(|(name, _)| name)
            {
                return Err(PeftError::config(format!(
                    "attempt adapter '{other}' already attached; only one attention module is allowed"
                )));
            }
        }

        let module = if restoring {
            let mut placeholder = config.clone();
            placeholder.prompt_init = PromptInit::Random;
            placeholder.prompt_init_embedding = None;
            AdapterModule::build(&placeholder, self.base.word_embeddings(), self.base.device())?
        } else {
            AdapterModule::build(&config, self.base.word_embeddings(), self.base.device())?
        };
        info!(
            adapter = adapter_name,
            peft_type = ?config.peft_type,
            virtual_tokens = config.total_virtual_tokens(),
            trainable_params = module.vars().iter().map(|v| v.elem_count()).sum::<usize>(),
            "attached adapter"
        );
        self.adapters
            .insert(adapter_name.to_string(), AdapterEntry { config, module });
        Ok(())
    }

    /// Make a registered adapter the one used by `forward` and `generate`.
    pub fn set_active(&mut self, adapter_name: &str) -> Result<()> {
        if !self.adapters.contains_key(adapter_name) {
            return Err(PeftError::UnknownAdapter(adapter_name.to_string()));
        }
        debug!(from = %self.active, to = adapter_name, "switched active adapter");
        self.active = adapter_name.to_string();
        Ok(())
    }

    pub fn active_adapter(&self) -> &str {
        &self.active
    }

    pub fn adapter_names(&self) -> Vec<&str> {
        self.adapters.keys().map(String::as_str).collect()
    }

    pub fn adapter(&self, adapter_name: &str) -> Option<&AdapterEntry> {
        self.adapters.get(adapter_name)
    }

    pub fn active_entry(&self) -> Result<&AdapterEntry> {
        self.adapters
            .get(&self.active)
            .ok_or_else(|| PeftError::UnknownAdapter(self.active.clone()))
    }

    pub fn peft_config(&self) -> Result<&AdapterConfig> {
        Ok(&self.active_entry()?.config)
    }

    pub fn base_model(&self) -> &Arc<M> {
        &self.base
    }

    /// Variables the optimizer should update: the active adapter's, unless
    /// it is in inference mode.
    pub fn trainable_vars(&self) -> Result<Vec<Var>> {
        let entry = self.active_entry()?;
        if entry.config.inference_mode {
            return Ok(Vec::new());
        }
        Ok(entry.module.vars())
    }

    pub fn num_trainable_parameters(&self) -> Result<usize> {
        Ok(self.trainable_vars()?.iter().map(|v| v.elem_count()).sum())
    }

    /// Embed `input_ids` and prepend the active adapter's virtual tokens.
    ///
    /// Returns the combined embeddings `[b, total_virtual_tokens + s, d]` in
    /// the base model dtype and the mask extended with ones for every
    /// virtual token.
    pub fn prepare_inputs(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<(Tensor, Tensor)> {
        let entry = self.active_entry()?;
        let inputs_embeds = self.base.embed_tokens(input_ids)?;
        let prompts = entry
            .module
            .prompts(&inputs_embeds, attention_mask)?
            .to_dtype(inputs_embeds.dtype())?;
        let inputs_embeds = Tensor::cat(&[&prompts, &inputs_embeds], 1)?;

        let (batch, _) = attention_mask.dims2()?;
        let prefix_mask = Tensor::ones(
            (batch, entry.config.total_virtual_tokens()),
            attention_mask.dtype(),
            attention_mask.device(),
        )?;
        let attention_mask = Tensor::cat(&[&prefix_mask, attention_mask], 1)?;
        Ok((inputs_embeds, attention_mask))
    }

    /// Forward pass of the base model over the prompted input.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        labels: Option<&Tensor>,
    ) -> Result<Seq2SeqOutput> {
        let (inputs_embeds, attention_mask) = self.prepare_inputs(input_ids, attention_mask)?;
        Ok(self.base.forward(&inputs_embeds, &attention_mask, labels)?)
    }

    /// Decode from the prompted input.
    pub fn generate(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        config: &GenerationConfig,
    ) -> Result<Tensor> {
        let (inputs_embeds, attention_mask) = self.prepare_inputs(input_ids, attention_mask)?;
        Ok(self.base.generate(&inputs_embeds, &attention_mask, config)?)
    }

    /// Write the active adapter's config and weights to `dir`.
    pub fn save_pretrained(&self, dir: impl AsRef<Path>) -> Result<()> {
        let name = self.active.clone();
        self.save_adapter(dir, &name)
    }

    pub fn save_adapter(&self, dir: impl AsRef<Path>, adapter_name: &str) -> Result<()> {
        let dir = dir.as_ref();
        let entry = self
            .adapter(adapter_name)
            .ok_or_else(|| PeftError::UnknownAdapter(adapter_name.to_string()))?;
        let state = extract_state(self, adapter_name)?;
        entry.config.save_pretrained(dir)?;
        save_artifact(&state, &dir.join(WEIGHTS_NAME))?;
        info!(adapter = adapter_name, dir = %dir.display(), "saved adapter");
        Ok(())
    }

    /// Wrap `base` with an adapter saved by [`Self::save_pretrained`].
    ///
    /// The loaded adapter is in inference mode and becomes active.
    pub fn from_pretrained(base: Arc<M>, dir: impl AsRef<Path>, adapter_name: &str) -> Result<Self> {
        let dir = dir.as_ref();
        let mut config = AdapterConfig::from_pretrained(dir)?;
        config.inference_mode = true;
        let tensors = load_artifact(dir, Some(base.device()))?;

        let mut model = Self {
            base,
            adapters: BTreeMap::new(),
            active: adapter_name.to_string(),
        };
        model.insert(adapter_name, config, true)?;
        let report = apply_state(&model, &tensors, adapter_name)?;
        info!(
            adapter = adapter_name,
            dir = %dir.display(),
            unexpected = report.unexpected_keys.len(),
            "loaded adapter"
        );
        Ok(model)
    }

    /// Register an adapter saved in `dir` under `adapter_name` without
    /// activating it. Nothing is registered if loading fails.
    pub fn load_adapter(
        &mut self,
        dir: impl AsRef<Path>,
        adapter_name: &str,
        inference_mode: bool,
    ) -> Result<LoadReport> {
        let dir = dir.as_ref();
        if self.adapters.contains_key(adapter_name) {
            return Err(PeftError::DuplicateAdapter(adapter_name.to_string()));
        }
        let mut config = AdapterConfig::from_pretrained(dir)?;
        config.inference_mode = inference_mode;
        let tensors = load_artifact(dir, Some(self.base.device()))?;

        self.insert(adapter_name, config, true)?;
        match apply_state(self, &tensors, adapter_name) {
            Ok(report) => Ok(report),
            Err(e) => {
                self.adapters.remove(adapter_name);
                Err(e)
            }
        }
    }

    /// Reload the active adapter's weights from `dir` in place.
    pub fn reload_weights(&mut self, dir: impl AsRef<Path>) -> Result<LoadReport> {
        let tensors = load_artifact(dir.as_ref(), Some(self.base.device()))?;
        let name = self.active.clone();
        apply_state(self, &tensors, &name)
    }
}
