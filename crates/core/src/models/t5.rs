//! T5 encoder-decoder model for conditional generation.
//!
//! Key architectural features:
//! - Relative position bias (not RoPE or absolute embeddings)
//! - Pre-norm (RMS LayerNorm before attention and FFN)
//! - Bidirectional encoder, autoregressive decoder with cross-attention
//! - Gated GELU/SiLU FFN (T5 v1.1, Flan-T5) or standard ReLU FFN (T5 v1.0)
//! - Shared input embeddings between encoder and decoder
//! - No bias in any linear projections
//!
//! The forward pass starts from input embeddings rather than token ids so
//! that virtual tokens can be spliced in front of the embedded source.

use candle_core::{DType, Device, IndexOp, Module, Result, Tensor, D};
use candle_nn::{embedding, linear_no_bias, Activation, Embedding, Linear, VarBuilder};

use super::{EncoderOutput, GenerationConfig, Seq2SeqModel, Seq2SeqOutput};
use crate::config::ModelConfig;
use crate::layers::{causal_mask, padding_mask};
use crate::sampling::{argmax, beam_search_top_k, BeamSearchConfig, BeamSearchState};

// ─── T5 RMS LayerNorm ──────────────────────────────────────────────────────

/// T5-style RMS LayerNorm (scale only, no bias, no mean subtraction).
struct T5LayerNorm {
    weight: Tensor,
    eps: f64,
}

impl T5LayerNorm {
    fn new(hidden_size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get(hidden_size, "weight")?;
        Ok(Self { weight, eps })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dtype = xs.dtype();
        let xs_f32 = xs.to_dtype(DType::F32)?;
        let variance = xs_f32.sqr()?.mean_keepdim(D::Minus1)?;
        let xs_normed = xs_f32.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        let weight = self.weight.to_dtype(DType::F32)?;
        (xs_normed.broadcast_mul(&weight))?.to_dtype(dtype)
    }
}

// ─── Relative Position Bias ────────────────────────────────────────────────

/// Learned relative position bias for T5 attention.
///
/// Maps relative distances between query and key positions to bias values
/// using logarithmic bucketing to handle long distances efficiently.
struct RelativePositionBias {
    embeddings: Embedding,
    num_buckets: usize,
    max_distance: usize,
    bidirectional: bool,
}

impl RelativePositionBias {
    fn new(
        num_heads: usize,
        num_buckets: usize,
        max_distance: usize,
        bidirectional: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let embeddings = embedding(num_buckets, num_heads, vb.pp("relative_attention_bias"))?;
        Ok(Self {
            embeddings,
            num_buckets,
            max_distance,
            bidirectional,
        })
    }

    /// Compute relative position bucket indices.
    ///
    /// Follows the HuggingFace T5 algorithm:
    /// - Bidirectional: split buckets in half, track sign separately
    /// - Small distances get exact buckets
    /// - Large distances get logarithmically spaced buckets
    fn relative_position_bucket(&self, relative_position: i64) -> usize {
        let mut bucket: usize = 0;
        let mut rel_pos = relative_position;

        if self.bidirectional {
            let half = self.num_buckets / 2;
            if rel_pos > 0 {
                bucket += half;
            }
            rel_pos = rel_pos.unsigned_abs() as i64;

            let max_exact = half / 2;
            if (rel_pos as usize) < max_exact {
                return bucket + rel_pos as usize;
            }

            let val = ((rel_pos as f64 / max_exact as f64).ln()
                / (self.max_distance as f64 / max_exact as f64).ln()
                * (half - max_exact) as f64) as usize;
            bucket + max_exact + val.min(half - max_exact - 1)
        } else {
            rel_pos = (-rel_pos).max(0);
            let max_exact = self.num_buckets / 2;

            if (rel_pos as usize) < max_exact {
                return rel_pos as usize;
            }

            let val = ((rel_pos as f64 / max_exact as f64).ln()
                / (self.max_distance as f64 / max_exact as f64).ln()
                * (self.num_buckets - max_exact) as f64) as usize;
            max_exact + val.min(self.num_buckets - max_exact - 1)
        }
    }

    /// Compute the relative position bias tensor.
    ///
    /// Returns `[1, num_heads, query_len, key_len]`.
    fn compute_bias(&self, query_len: usize, key_len: usize, device: &Device) -> Result<Tensor> {
        let mut bucket_indices = vec![0u32; query_len * key_len];
        for qi in 0..query_len {
            for ki in 0..key_len {
                let rel_pos = ki as i64 - qi as i64;
                bucket_indices[qi * key_len + ki] = self.relative_position_bucket(rel_pos) as u32;
            }
        }

        let indices = Tensor::from_vec(bucket_indices, (query_len, key_len), device)?;

        // [query_len, key_len, num_heads] -> [1, num_heads, query_len, key_len]
        let bias = self.embeddings.forward(&indices)?;
        bias.permute((2, 0, 1))?.unsqueeze(0)
    }
}

// ─── Attention ─────────────────────────────────────────────────────────────

/// Split `[b, len, heads * head_dim]` into `[b, heads, len, head_dim]`.
fn split_heads(xs: &Tensor, num_heads: usize, head_dim: usize) -> Result<Tensor> {
    let (b_sz, len, _) = xs.dims3()?;
    xs.reshape((b_sz, len, num_heads, head_dim))?
        .transpose(1, 2)?
        .contiguous()
}

fn merge_heads(xs: &Tensor) -> Result<Tensor> {
    let (b_sz, num_heads, len, head_dim) = xs.dims4()?;
    xs.transpose(1, 2)?
        .contiguous()?
        .reshape((b_sz, len, num_heads * head_dim))
}

struct T5SelfAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    relative_bias: Option<RelativePositionBias>,
}

impl T5SelfAttention {
    fn new(
        cfg: &ModelConfig,
        has_relative_bias: bool,
        bidirectional: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let hidden_size = cfg.hidden_size;
        let num_heads = cfg.num_attention_heads;
        let head_dim = cfg.head_dim();
        let inner_dim = num_heads * head_dim;

        let q_proj = linear_no_bias(hidden_size, inner_dim, vb.pp("q"))?;
        let k_proj = linear_no_bias(hidden_size, inner_dim, vb.pp("k"))?;
        let v_proj = linear_no_bias(hidden_size, inner_dim, vb.pp("v"))?;
        let o_proj = linear_no_bias(inner_dim, hidden_size, vb.pp("o"))?;

        let relative_bias = if has_relative_bias {
            Some(RelativePositionBias::new(
                num_heads,
                cfg.relative_attention_num_buckets,
                cfg.relative_attention_max_distance,
                bidirectional,
                vb,
            )?)
        } else {
            None
        };

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_heads,
            head_dim,
            relative_bias,
        })
    }

    /// Returns the output and the position bias used, so later layers can
    /// reuse the bias computed by the first one.
    fn forward(
        &self,
        xs: &Tensor,
        attention_mask: Option<&Tensor>,
        position_bias: Option<&Tensor>,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let (_, seq_len, _) = xs.dims3()?;

        let q = split_heads(&self.q_proj.forward(xs)?, self.num_heads, self.head_dim)?;
        let k = split_heads(&self.k_proj.forward(xs)?, self.num_heads, self.head_dim)?;
        let v = split_heads(&self.v_proj.forward(xs)?, self.num_heads, self.head_dim)?;

        // T5 does NOT scale attention by 1/sqrt(d_k)
        let mut attn_weights = q.matmul(&k.transpose(2, 3)?.contiguous()?)?;

        let bias = if let Some(bias) = position_bias {
            attn_weights = attn_weights.broadcast_add(bias)?;
            Some(bias.clone())
        } else if let Some(ref rel_bias) = self.relative_bias {
            let bias = rel_bias.compute_bias(seq_len, seq_len, xs.device())?;
            let bias = bias.to_dtype(attn_weights.dtype())?;
            attn_weights = attn_weights.broadcast_add(&bias)?;
            Some(bias)
        } else {
            None
        };

        if let Some(mask) = attention_mask {
            attn_weights = attn_weights.broadcast_add(mask)?;
        }

        // Composite softmax so gradients reach the prompt embeddings.
        let attn_weights = candle_nn::ops::softmax(&attn_weights, D::Minus1)?;
        let attn_output = merge_heads(&attn_weights.matmul(&v)?)?;

        Ok((self.o_proj.forward(&attn_output)?, bias))
    }
}

/// T5 cross-attention for decoder → encoder attention.
///
/// Uses T5 weight names (q/k/v/o) and no 1/sqrt(d_k) scaling.
struct T5CrossAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl T5CrossAttention {
    fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let hidden_size = cfg.hidden_size;
        let num_heads = cfg.num_attention_heads;
        let head_dim = cfg.head_dim();
        let inner_dim = num_heads * head_dim;

        Ok(Self {
            q_proj: linear_no_bias(hidden_size, inner_dim, vb.pp("q"))?,
            k_proj: linear_no_bias(hidden_size, inner_dim, vb.pp("k"))?,
            v_proj: linear_no_bias(hidden_size, inner_dim, vb.pp("v"))?,
            o_proj: linear_no_bias(inner_dim, hidden_size, vb.pp("o"))?,
            num_heads,
            head_dim,
        })
    }

    fn forward(
        &self,
        decoder_hidden: &Tensor,
        encoder_hidden: &Tensor,
        encoder_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let q = split_heads(&self.q_proj.forward(decoder_hidden)?, self.num_heads, self.head_dim)?;
        let k = split_heads(&self.k_proj.forward(encoder_hidden)?, self.num_heads, self.head_dim)?;
        let v = split_heads(&self.v_proj.forward(encoder_hidden)?, self.num_heads, self.head_dim)?;

        let mut attn_weights = q.matmul(&k.transpose(2, 3)?.contiguous()?)?;
        if let Some(mask) = encoder_mask {
            attn_weights = attn_weights.broadcast_add(mask)?;
        }
        let attn_weights = candle_nn::ops::softmax(&attn_weights, D::Minus1)?;
        let attn_output = merge_heads(&attn_weights.matmul(&v)?)?;

        self.o_proj.forward(&attn_output)
    }
}

// ─── T5 FFN ────────────────────────────────────────────────────────────────

/// T5 feed-forward network.
///
/// Two variants:
/// - Standard: wi → act → wo
/// - Gated (T5 v1.1+): act(wi_0) * wi_1 → wo
enum T5Ffn {
    Dense {
        wi: Linear,
        wo: Linear,
        act: Activation,
    },
    Gated {
        wi_0: Linear,
        wi_1: Linear,
        wo: Linear,
        act: Activation,
    },
}

fn dense_activation(cfg: &ModelConfig) -> Result<Activation> {
    match (cfg.dense_act(), cfg.is_gated_act()) {
        ("relu", _) => Ok(Activation::Relu),
        // HF maps gated-gelu to the tanh approximation (gelu_new).
        ("gelu", true) | ("gelu_new", _) => Ok(Activation::NewGelu),
        ("gelu", false) => Ok(Activation::Gelu),
        ("silu", _) => Ok(Activation::Silu),
        (other, _) => candle_core::bail!("unsupported feed_forward_proj activation '{other}'"),
    }
}

impl T5Ffn {
    fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let hidden_size = cfg.hidden_size;
        let d_ff = cfg.intermediate_size;
        let act = dense_activation(cfg)?;
        let wo = linear_no_bias(d_ff, hidden_size, vb.pp("wo"))?;

        if cfg.is_gated_act() {
            Ok(Self::Gated {
                wi_0: linear_no_bias(hidden_size, d_ff, vb.pp("wi_0"))?,
                wi_1: linear_no_bias(hidden_size, d_ff, vb.pp("wi_1"))?,
                wo,
                act,
            })
        } else {
            Ok(Self::Dense {
                wi: linear_no_bias(hidden_size, d_ff, vb.pp("wi"))?,
                wo,
                act,
            })
        }
    }

    fn is_gated(&self) -> bool {
        matches!(self, Self::Gated { .. })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Dense { wi, wo, act } => wo.forward(&act.forward(&wi.forward(xs)?)?),
            Self::Gated {
                wi_0,
                wi_1,
                wo,
                act,
            } => {
                let gate = act.forward(&wi_0.forward(xs)?)?;
                let up = wi_1.forward(xs)?;
                wo.forward(&(gate * up)?)
            }
        }
    }
}

// ─── T5 Encoder Layer ──────────────────────────────────────────────────────

struct T5EncoderLayer {
    self_attention: T5SelfAttention,
    norm1: T5LayerNorm,
    ffn: T5Ffn,
    norm2: T5LayerNorm,
}

impl T5EncoderLayer {
    fn new(cfg: &ModelConfig, has_relative_bias: bool, vb: VarBuilder) -> Result<Self> {
        let eps = cfg.layer_norm_epsilon;
        let block0 = vb.pp("layer").pp("0");
        let block1 = vb.pp("layer").pp("1");
        Ok(Self {
            self_attention: T5SelfAttention::new(
                cfg,
                has_relative_bias,
                true,
                block0.pp("SelfAttention"),
            )?,
            norm1: T5LayerNorm::new(cfg.hidden_size, eps, block0.pp("layer_norm"))?,
            ffn: T5Ffn::new(cfg, block1.pp("DenseReluDense"))?,
            norm2: T5LayerNorm::new(cfg.hidden_size, eps, block1.pp("layer_norm"))?,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        attention_mask: Option<&Tensor>,
        position_bias: Option<&Tensor>,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let normed = self.norm1.forward(xs)?;
        let (attn_output, bias) =
            self.self_attention
                .forward(&normed, attention_mask, position_bias)?;
        let xs = (xs + attn_output)?;

        let normed = self.norm2.forward(&xs)?;
        let xs = (&xs + self.ffn.forward(&normed)?)?;

        Ok((xs, bias))
    }
}

// ─── T5 Decoder Layer ──────────────────────────────────────────────────────

struct T5DecoderLayer {
    self_attention: T5SelfAttention,
    norm1: T5LayerNorm,
    cross_attention: T5CrossAttention,
    norm2: T5LayerNorm,
    ffn: T5Ffn,
    norm3: T5LayerNorm,
}

impl T5DecoderLayer {
    fn new(cfg: &ModelConfig, has_relative_bias: bool, vb: VarBuilder) -> Result<Self> {
        let eps = cfg.layer_norm_epsilon;
        let block0 = vb.pp("layer").pp("0");
        let block1 = vb.pp("layer").pp("1");
        let block2 = vb.pp("layer").pp("2");
        Ok(Self {
            self_attention: T5SelfAttention::new(
                cfg,
                has_relative_bias,
                false,
                block0.pp("SelfAttention"),
            )?,
            norm1: T5LayerNorm::new(cfg.hidden_size, eps, block0.pp("layer_norm"))?,
            cross_attention: T5CrossAttention::new(cfg, block1.pp("EncDecAttention"))?,
            norm2: T5LayerNorm::new(cfg.hidden_size, eps, block1.pp("layer_norm"))?,
            ffn: T5Ffn::new(cfg, block2.pp("DenseReluDense"))?,
            norm3: T5LayerNorm::new(cfg.hidden_size, eps, block2.pp("layer_norm"))?,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        encoder: &EncoderOutput,
        causal_mask: Option<&Tensor>,
        self_attn_bias: Option<&Tensor>,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let normed = self.norm1.forward(xs)?;
        let (attn_output, bias) =
            self.self_attention
                .forward(&normed, causal_mask, self_attn_bias)?;
        let xs = (xs + attn_output)?;

        let normed = self.norm2.forward(&xs)?;
        let cross_output = self.cross_attention.forward(
            &normed,
            &encoder.hidden_states,
            encoder.attention_mask.as_ref(),
        )?;
        let xs = (xs + cross_output)?;

        let normed = self.norm3.forward(&xs)?;
        let xs = (&xs + self.ffn.forward(&normed)?)?;

        Ok((xs, bias))
    }
}

// ─── Full T5 Model ─────────────────────────────────────────────────────────

/// T5 encoder-decoder model for conditional generation.
///
/// All weights are plain tensors taken from the `VarBuilder`; the model is
/// frozen by construction.
pub struct T5ForConditionalGeneration {
    config: ModelConfig,
    name_or_path: String,
    shared_embeddings: Embedding,
    encoder_layers: Vec<T5EncoderLayer>,
    encoder_final_norm: T5LayerNorm,
    decoder_layers: Vec<T5DecoderLayer>,
    decoder_final_norm: T5LayerNorm,
    lm_head: Linear,
    device: Device,
    dtype: DType,
}

impl T5ForConditionalGeneration {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let shared_embeddings = embedding(cfg.vocab_size, cfg.hidden_size, vb.pp("shared"))?;

        let mut encoder_layers = Vec::with_capacity(cfg.num_hidden_layers);
        for i in 0..cfg.num_hidden_layers {
            // Only the first layer owns a relative bias; the rest reuse it.
            encoder_layers.push(T5EncoderLayer::new(
                cfg,
                i == 0,
                vb.pp("encoder").pp(format!("block.{i}")),
            )?);
        }
        let encoder_final_norm = T5LayerNorm::new(
            cfg.hidden_size,
            cfg.layer_norm_epsilon,
            vb.pp("encoder").pp("final_layer_norm"),
        )?;

        let num_decoder_layers = cfg.num_decoder_layers();
        let mut decoder_layers = Vec::with_capacity(num_decoder_layers);
        for i in 0..num_decoder_layers {
            decoder_layers.push(T5DecoderLayer::new(
                cfg,
                i == 0,
                vb.pp("decoder").pp(format!("block.{i}")),
            )?);
        }
        let decoder_final_norm = T5LayerNorm::new(
            cfg.hidden_size,
            cfg.layer_norm_epsilon,
            vb.pp("decoder").pp("final_layer_norm"),
        )?;

        let lm_head = if cfg.tie_word_embeddings {
            Linear::new(shared_embeddings.embeddings().clone(), None)
        } else {
            linear_no_bias(cfg.hidden_size, cfg.vocab_size, vb.pp("lm_head"))?
        };

        Ok(Self {
            config: cfg.clone(),
            name_or_path: cfg
                .architectures
                .first()
                .cloned()
                .unwrap_or_else(|| "t5".to_string()),
            shared_embeddings,
            encoder_layers,
            encoder_final_norm,
            decoder_layers,
            decoder_final_norm,
            lm_head,
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }

    /// Record where the weights came from (hub id or directory).
    pub fn with_name_or_path(mut self, name_or_path: impl Into<String>) -> Self {
        self.name_or_path = name_or_path.into();
        self
    }

    /// Run the encoder stack over already-embedded inputs.
    pub fn encode(&self, inputs_embeds: &Tensor, attention_mask: &Tensor) -> Result<EncoderOutput> {
        let mask = padding_mask(attention_mask, self.dtype)?;
        let mut hidden = inputs_embeds.to_dtype(self.dtype)?;
        let mut position_bias: Option<Tensor> = None;

        for layer in &self.encoder_layers {
            let (h, bias) = layer.forward(&hidden, Some(&mask), position_bias.as_ref())?;
            hidden = h;
            if position_bias.is_none() {
                position_bias = bias;
            }
        }

        Ok(EncoderOutput {
            hidden_states: self.encoder_final_norm.forward(&hidden)?,
            attention_mask: Some(mask),
        })
    }

    /// Run the decoder stack and LM head. Returns `[b, tgt_len, vocab]` logits.
    pub fn decode(&self, decoder_input_ids: &Tensor, encoder: &EncoderOutput) -> Result<Tensor> {
        let (_, tgt_len) = decoder_input_ids.dims2()?;
        let mut hidden = self.shared_embeddings.forward(decoder_input_ids)?;

        let causal = if tgt_len > 1 {
            Some(causal_mask(tgt_len, 0, self.dtype, &self.device)?)
        } else {
            None
        };

        let mut position_bias: Option<Tensor> = None;
        for layer in &self.decoder_layers {
            let (h, bias) =
                layer.forward(&hidden, encoder, causal.as_ref(), position_bias.as_ref())?;
            hidden = h;
            if position_bias.is_none() {
                position_bias = bias;
            }
        }

        let mut hidden = self.decoder_final_norm.forward(&hidden)?;
        if self.config.tie_word_embeddings {
            // Tied heads rescale before projecting onto the vocabulary.
            hidden = (hidden * (self.config.hidden_size as f64).powf(-0.5))?;
        }
        self.lm_head.forward(&hidden)
    }

    /// Labels shifted one position right, with the decoder start token in front.
    fn shift_right(&self, labels: &Tensor) -> Result<Tensor> {
        let (b_sz, tgt_len) = labels.dims2()?;
        let labels = labels.to_dtype(DType::U32)?;
        let start = Tensor::full(self.config.decoder_start_token_id, (b_sz, 1), &self.device)?;
        if tgt_len <= 1 {
            return Ok(start);
        }
        Tensor::cat(&[&start, &labels.narrow(1, 0, tgt_len - 1)?], 1)
    }

    fn greedy_generate(&self, encoder: &EncoderOutput, max_new_tokens: usize) -> Result<Tensor> {
        let b_sz = encoder.hidden_states.dim(0)?;
        let start = self.config.decoder_start_token_id;
        let pad = self.config.pad_token_id;
        let eos = self.config.eos_token_id;

        let mut sequences: Vec<Vec<u32>> = vec![vec![start]; b_sz];
        let mut finished = vec![false; b_sz];

        for _ in 0..max_new_tokens {
            let len = sequences[0].len();
            let flat: Vec<u32> = sequences.iter().flatten().copied().collect();
            let ids = Tensor::from_vec(flat, (b_sz, len), &self.device)?;
            let logits = self.decode(&ids, encoder)?;
            let last: Vec<Vec<f32>> = logits
                .i((.., len - 1, ..))?
                .to_dtype(DType::F32)?
                .to_vec2()?;

            for (row, seq) in sequences.iter_mut().enumerate() {
                if finished[row] {
                    seq.push(pad);
                    continue;
                }
                let next = argmax(&last[row]);
                finished[row] = next == eos;
                seq.push(next);
            }
            if finished.iter().all(|f| *f) {
                break;
            }
        }

        let len = sequences[0].len();
        let flat: Vec<u32> = sequences.into_iter().flatten().collect();
        Tensor::from_vec(flat, (b_sz, len), &self.device)
    }

    /// Beam search for a single source row (`[1, src_len, hidden]`).
    fn beam_generate_row(&self, encoder: &EncoderOutput, config: &GenerationConfig) -> Result<Vec<u32>> {
        let start = self.config.decoder_start_token_id;
        let width = config.num_beams;
        let mut state = BeamSearchState::new(
            BeamSearchConfig {
                beam_width: width,
                length_penalty: config.length_penalty,
                early_stopping: config.early_stopping,
                num_return_beams: 1,
            },
            self.config.eos_token_id,
        );
        let (_, src_len, hidden) = encoder.hidden_states.dims3()?;

        for _ in 0..config.max_new_tokens {
            if state.is_done() {
                break;
            }
            let n = state.beams.len();
            let len = state.beams[0].token_ids.len() + 1;
            let flat: Vec<u32> = state
                .beams
                .iter()
                .flat_map(|b| std::iter::once(start).chain(b.token_ids.iter().copied()))
                .collect();
            let ids = Tensor::from_vec(flat, (n, len), &self.device)?;

            let expanded = EncoderOutput {
                hidden_states: encoder
                    .hidden_states
                    .broadcast_as((n, src_len, hidden))?
                    .contiguous()?,
                attention_mask: encoder.attention_mask.clone(),
            };
            let logits = self.decode(&ids, &expanded)?;
            let last: Vec<Vec<f32>> = logits
                .i((.., len - 1, ..))?
                .to_dtype(DType::F32)?
                .to_vec2()?;

            let candidates: Vec<Vec<(u32, f32)>> = last
                .iter()
                .map(|row| beam_search_top_k(row, 2 * width))
                .collect();
            state.step(&candidates);
        }

        let best = state
            .get_best_hypotheses()
            .first()
            .map(|h| h.token_ids.clone())
            .unwrap_or_default();
        Ok(best)
    }

    fn beam_generate(&self, encoder: &EncoderOutput, config: &GenerationConfig) -> Result<Tensor> {
        let b_sz = encoder.hidden_states.dim(0)?;
        let mut rows = Vec::with_capacity(b_sz);
        for row in 0..b_sz {
            let row_encoder = EncoderOutput {
                hidden_states: encoder.hidden_states.narrow(0, row, 1)?,
                attention_mask: match &encoder.attention_mask {
                    Some(mask) => Some(mask.narrow(0, row, 1)?),
                    None => None,
                },
            };
            rows.push(self.beam_generate_row(&row_encoder, config)?);
        }

        let width = rows.iter().map(Vec::len).max().unwrap_or(0) + 1;
        let mut flat = Vec::with_capacity(b_sz * width);
        for tokens in rows {
            flat.push(self.config.decoder_start_token_id);
            let used = tokens.len() + 1;
            flat.extend(tokens);
            flat.extend(std::iter::repeat(self.config.pad_token_id).take(width - used));
        }
        Tensor::from_vec(flat, (b_sz, width), &self.device)
    }
}

/// Mean cross-entropy over label positions that are not `pad_token_id`.
fn token_cross_entropy(logits: &Tensor, labels: &Tensor, pad_token_id: u32) -> Result<Tensor> {
    let labels = labels.to_dtype(DType::U32)?;
    let log_probs = candle_nn::ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;
    let picked = log_probs
        .gather(&labels.unsqueeze(D::Minus1)?.contiguous()?, D::Minus1)?
        .squeeze(D::Minus1)?;
    let keep = labels.ne(pad_token_id)?.to_dtype(DType::F32)?;
    let count = keep.sum_all()?.to_scalar::<f32>()?.max(1.0);
    (picked * keep)?.sum_all()?.neg()? / count as f64
}

impl Seq2SeqModel for T5ForConditionalGeneration {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn name_or_path(&self) -> &str {
        &self.name_or_path
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn word_embeddings(&self) -> &Embedding {
        &self.shared_embeddings
    }

    fn forward(
        &self,
        inputs_embeds: &Tensor,
        attention_mask: &Tensor,
        labels: Option<&Tensor>,
    ) -> Result<Seq2SeqOutput> {
        let encoder = self.encode(inputs_embeds, attention_mask)?;
        let b_sz = inputs_embeds.dim(0)?;

        let decoder_input_ids = match labels {
            Some(labels) => self.shift_right(labels)?,
            None => Tensor::full(self.config.decoder_start_token_id, (b_sz, 1), &self.device)?,
        };
        let logits = self.decode(&decoder_input_ids, &encoder)?;

        let loss = match labels {
            Some(labels) => Some(token_cross_entropy(&logits, labels, self.config.pad_token_id)?),
            None => None,
        };

        Ok(Seq2SeqOutput {
            loss,
            logits,
            encoder_hidden_states: encoder.hidden_states,
        })
    }

    fn generate(
        &self,
        inputs_embeds: &Tensor,
        attention_mask: &Tensor,
        config: &GenerationConfig,
    ) -> Result<Tensor> {
        let encoder = self.encode(inputs_embeds, attention_mask)?;
        if config.num_beams <= 1 {
            self.greedy_generate(&encoder, config.max_new_tokens)
        } else {
            self.beam_generate(&encoder, config)
        }
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{random_frozen_t5, tiny_t5_config};

    fn tiny_t5_standard_config() -> ModelConfig {
        let mut cfg = tiny_t5_config();
        cfg.feed_forward_proj = "relu".to_string();
        cfg
    }

    // ─── Construction ─────────────────────────────────────────────────────

    #[test]
    fn test_t5_construction() {
        let cfg = tiny_t5_config();
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);

        let model = T5ForConditionalGeneration::new(&cfg, vb);
        assert!(model.is_ok(), "T5 should construct: {:?}", model.err());

        let model = model.unwrap();
        assert_eq!(model.encoder_layers.len(), 2);
        assert_eq!(model.decoder_layers.len(), 2);
        assert_eq!(model.name_or_path(), "T5ForConditionalGeneration");
    }

    #[test]
    fn test_t5_standard_ffn_construction() {
        let cfg = tiny_t5_standard_config();
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);

        let model = T5ForConditionalGeneration::new(&cfg, vb);
        assert!(model.is_ok(), "T5 with standard FFN should construct");
    }

    #[test]
    fn test_t5_rejects_unknown_activation() {
        let mut cfg = tiny_t5_config();
        cfg.feed_forward_proj = "gated-swish3".to_string();
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        assert!(T5ForConditionalGeneration::new(&cfg, vb).is_err());
    }

    // ─── RelativePositionBias ─────────────────────────────────────────────

    #[test]
    fn test_relative_position_bias_bidirectional() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let bias = RelativePositionBias::new(2, 32, 128, true, vb).unwrap();

        assert_eq!(bias.relative_position_bucket(0), 0);

        let bucket = bias.relative_position_bucket(1);
        assert!(bucket >= 16, "positive should be in upper half, got {bucket}");

        let bucket = bias.relative_position_bucket(-1);
        assert!(bucket < 16, "negative should be in lower half, got {bucket}");
    }

    #[test]
    fn test_relative_position_bias_causal() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let bias = RelativePositionBias::new(2, 32, 128, false, vb).unwrap();

        assert_eq!(bias.relative_position_bucket(0), 0);
        assert!(bias.relative_position_bucket(-5) > 0);
        // Looking forward is clamped to the zero bucket.
        assert_eq!(bias.relative_position_bucket(5), 0);
    }

    #[test]
    fn test_relative_position_bias_compute_shape() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let bias = RelativePositionBias::new(4, 32, 128, true, vb).unwrap();

        let result = bias.compute_bias(3, 7, &device).unwrap();
        assert_eq!(result.dims(), &[1, 4, 3, 7]);
    }

    // ─── Layers ───────────────────────────────────────────────────────────

    #[test]
    fn test_t5_layer_norm_shape() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);

        let norm = T5LayerNorm::new(64, 1e-6, vb).unwrap();
        let input = Tensor::ones((2, 5, 64), DType::F32, &device).unwrap();
        let output = norm.forward(&input).unwrap();
        assert_eq!(output.dims(), &[2, 5, 64]);
    }

    #[test]
    fn test_t5_ffn_variants() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let gated = T5Ffn::new(&tiny_t5_config(), vb.clone()).unwrap();
        assert!(gated.is_gated());

        let dense = T5Ffn::new(&tiny_t5_standard_config(), vb).unwrap();
        assert!(!dense.is_gated());

        let input = Tensor::ones((1, 3, 64), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(dense.forward(&input).unwrap().dims(), &[1, 3, 64]);
    }

    // ─── Forward / generate ───────────────────────────────────────────────

    fn inputs(model: &T5ForConditionalGeneration) -> (Tensor, Tensor) {
        let device = Device::Cpu;
        let ids = Tensor::new(&[[5u32, 6, 7, 1], [8, 9, 1, 0]], &device).unwrap();
        let mask = Tensor::new(&[[1u32, 1, 1, 1], [1, 1, 1, 0]], &device).unwrap();
        (model.embed_tokens(&ids).unwrap(), mask)
    }

    #[test]
    fn test_forward_with_labels_produces_finite_loss() {
        let cfg = tiny_t5_config();
        let model = random_frozen_t5(&cfg, &Device::Cpu).unwrap();
        let (embeds, mask) = inputs(&model);
        let labels = Tensor::new(&[[10u32, 11, 1], [12, 1, 0]], &Device::Cpu).unwrap();

        let out = model.forward(&embeds, &mask, Some(&labels)).unwrap();
        assert_eq!(out.logits.dims(), &[2, 3, cfg.vocab_size]);
        assert_eq!(out.encoder_hidden_states.dims(), &[2, 4, cfg.hidden_size]);

        let loss = out.loss.unwrap().to_scalar::<f32>().unwrap();
        assert!(loss.is_finite() && loss > 0.0, "loss = {loss}");
    }

    #[test]
    fn test_shift_right_prepends_start_token() {
        let cfg = tiny_t5_config();
        let model = random_frozen_t5(&cfg, &Device::Cpu).unwrap();
        let labels = Tensor::new(&[[10u32, 11, 1]], &Device::Cpu).unwrap();
        let shifted: Vec<Vec<u32>> = model.shift_right(&labels).unwrap().to_vec2().unwrap();
        assert_eq!(shifted, vec![vec![cfg.decoder_start_token_id, 10, 11]]);
    }

    #[test]
    fn test_pad_labels_do_not_contribute_to_loss() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((1, 2, 4), DType::F32, &device).unwrap();
        let labels = Tensor::new(&[[3u32, 0]], &device).unwrap();
        let loss = token_cross_entropy(&logits, &labels, 0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        // Uniform logits over 4 classes, one counted position.
        assert!((loss - 4f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_greedy_generate_shape() {
        let cfg = tiny_t5_config();
        let model = random_frozen_t5(&cfg, &Device::Cpu).unwrap();
        let (embeds, mask) = inputs(&model);

        let out = model
            .generate(&embeds, &mask, &GenerationConfig::greedy(3))
            .unwrap();
        let (b, len) = out.dims2().unwrap();
        assert_eq!(b, 2);
        assert!((2..=4).contains(&len));

        let rows: Vec<Vec<u32>> = out.to_vec2().unwrap();
        assert!(rows.iter().all(|r| r[0] == cfg.decoder_start_token_id));
    }

    #[test]
    fn test_beam_generate_shape() {
        let cfg = tiny_t5_config();
        let model = random_frozen_t5(&cfg, &Device::Cpu).unwrap();
        let (embeds, mask) = inputs(&model);

        let config = GenerationConfig {
            max_new_tokens: 3,
            num_beams: 2,
            ..Default::default()
        };
        let out = model.generate(&embeds, &mask, &config).unwrap();
        let (b, len) = out.dims2().unwrap();
        assert_eq!(b, 2);
        assert!((2..=4).contains(&len));
    }
}
