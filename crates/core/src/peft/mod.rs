//! Prompt-learning adapters over a frozen seq2seq model.
//!
//! Two adapter families are supported:
//!
//! - **Prompt tuning**: a trainable table of virtual-token embeddings is
//!   prepended to every input.
//! - **ATTEMPT**: the same table, mixed per example by a small attention
//!   module conditioned on the pooled input.
//!
//! [`PeftModel`] owns the frozen base model and a registry of named
//! adapters. Adapters round-trip through a directory holding
//! `adapter_config.json` and `adapter_model.bin`.

mod attention;
mod config;
mod embedding;
mod error;
mod model;
mod state;

pub use attention::{
    AttentionAdapter, ATTN_DOWN_KEY, ATTN_UP_KEY, LAYER_NORM_BIAS_KEY, LAYER_NORM_WEIGHT_KEY,
};
pub use config::{AdapterConfig, PeftType, PromptInit, CONFIG_NAME};
pub use embedding::{PromptEmbedding, VirtualTokenEmbedding, VOCAB_SAMPLE_POOL};
pub use error::{PeftError, Result};
pub use model::{AdapterEntry, AdapterModule, PeftModel, DEFAULT_ADAPTER_NAME};
pub use state::{
    apply_state, extract_state, load_artifact, read_tensors, save_artifact, AdapterState,
    EmbeddingState, LoadReport, ATTENTION_MODULE_KEY, PROMPT_EMBEDDINGS_KEY, WEIGHTS_NAME,
};
