//! Base seq2seq models that adapters are attached to.
//!
//! The adapter layer only needs a narrow surface from the frozen model:
//! its word-embedding table, a forward pass that starts from input
//! embeddings, and a decoding procedure that does the same. That surface is
//! the [`Seq2SeqModel`] trait.

pub mod t5;

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::Embedding;

use crate::config::ModelConfig;

pub use t5::T5ForConditionalGeneration;

/// Output of a seq2seq forward pass.
#[derive(Debug, Clone)]
pub struct Seq2SeqOutput {
    /// Mean token cross-entropy, present when labels were supplied.
    pub loss: Option<Tensor>,
    /// Decoder logits `[batch, tgt_len, vocab_size]`.
    pub logits: Tensor,
    /// Final encoder hidden states `[batch, src_len, hidden_size]`.
    pub encoder_hidden_states: Tensor,
}

/// Encoder output together with the padding mask it was computed under.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// Hidden states from the encoder `[batch, src_len, hidden_size]`.
    pub hidden_states: Tensor,
    /// Additive padding mask `[batch, 1, 1, src_len]`, reused for cross-attention.
    pub attention_mask: Option<Tensor>,
}

/// Decoding parameters for [`Seq2SeqModel::generate`].
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    /// 1 selects greedy decoding.
    pub num_beams: usize,
    pub length_penalty: f32,
    pub early_stopping: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 128,
            num_beams: 1,
            length_penalty: 1.0,
            early_stopping: false,
        }
    }
}

impl GenerationConfig {
    pub fn greedy(max_new_tokens: usize) -> Self {
        Self {
            max_new_tokens,
            ..Default::default()
        }
    }
}

/// A frozen encoder-decoder language model.
///
/// Implementations hold their weights as plain tensors, never as
/// `candle_core::Var`, so gradients never flow into them.
pub trait Seq2SeqModel {
    fn config(&self) -> &ModelConfig;

    /// Hub id or local path the weights were loaded from.
    fn name_or_path(&self) -> &str;

    fn device(&self) -> &Device;

    fn dtype(&self) -> DType;

    /// The shared input embedding table.
    fn word_embeddings(&self) -> &Embedding;

    /// Look up `[batch, seq_len]` token ids in the input embedding table.
    fn embed_tokens(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.word_embeddings().forward(input_ids)
    }

    /// Forward pass on label-shifted decoder inputs, starting from input embeddings.
    ///
    /// `attention_mask` is the `[batch, src_len]` 0/1 mask matching
    /// `inputs_embeds`. When `labels` is given the decoder input is the
    /// labels shifted right and the loss ignores `pad_token_id` positions.
    fn forward(
        &self,
        inputs_embeds: &Tensor,
        attention_mask: &Tensor,
        labels: Option<&Tensor>,
    ) -> Result<Seq2SeqOutput>;

    /// Autoregressive decoding starting from input embeddings.
    ///
    /// Returns `[batch, 1 + generated]` token ids including the decoder start
    /// token, right-padded with `pad_token_id`.
    fn generate(
        &self,
        inputs_embeds: &Tensor,
        attention_mask: &Tensor,
        config: &GenerationConfig,
    ) -> Result<Tensor>;
}
