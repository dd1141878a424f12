use serde::Deserialize;

/// Base model configuration, read from a HuggingFace T5-family `config.json`.
///
/// HF T5 checkpoints use their own key names (`d_model`, `num_heads`, ...);
/// those are accepted as aliases of the generic names used here.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub architectures: Vec<String>,
    #[serde(alias = "d_model")]
    pub hidden_size: usize,
    #[serde(alias = "num_heads")]
    pub num_attention_heads: usize,
    #[serde(alias = "num_layers")]
    pub num_hidden_layers: usize,
    #[serde(default)]
    pub num_decoder_layers: Option<usize>,
    #[serde(alias = "d_ff")]
    pub intermediate_size: usize,
    #[serde(default, alias = "d_kv")]
    pub head_dim: Option<usize>,
    pub vocab_size: usize,
    #[serde(default = "default_num_buckets")]
    pub relative_attention_num_buckets: usize,
    #[serde(default = "default_max_distance")]
    pub relative_attention_max_distance: usize,
    #[serde(default = "default_eps")]
    pub layer_norm_epsilon: f64,
    /// `relu`, `gelu`, `gated-gelu` or `gated-silu`.
    #[serde(default = "default_feed_forward_proj")]
    pub feed_forward_proj: String,
    #[serde(default = "default_true")]
    pub tie_word_embeddings: bool,
    #[serde(default = "default_true")]
    pub is_encoder_decoder: bool,
    #[serde(default)]
    pub decoder_start_token_id: u32,
    #[serde(default)]
    pub pad_token_id: u32,
    #[serde(default = "default_eos")]
    pub eos_token_id: u32,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_num_buckets() -> usize {
    32
}

fn default_max_distance() -> usize {
    128
}

fn default_eps() -> f64 {
    1e-6
}

fn default_feed_forward_proj() -> String {
    "relu".to_string()
}

fn default_true() -> bool {
    true
}

fn default_eos() -> u32 {
    1
}

impl ModelConfig {
    /// Per-head projection width (`d_kv`), falling back to `hidden / heads`.
    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads.max(1))
    }

    pub fn num_decoder_layers(&self) -> usize {
        self.num_decoder_layers.unwrap_or(self.num_hidden_layers)
    }

    /// Whether the FFN is the gated variant (T5 v1.1, Flan-T5).
    pub fn is_gated_act(&self) -> bool {
        self.feed_forward_proj.starts_with("gated-")
    }

    /// The dense activation name with any `gated-` prefix removed.
    pub fn dense_act(&self) -> &str {
        self.feed_forward_proj
            .strip_prefix("gated-")
            .unwrap_or(&self.feed_forward_proj)
    }

    /// Number of transformer stacks that consume the input embeddings.
    pub fn num_transformer_submodules(&self) -> usize {
        if self.is_encoder_decoder {
            2
        } else {
            1
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            architectures: vec!["T5ForConditionalGeneration".to_string()],
            hidden_size: 768,
            num_attention_heads: 12,
            num_hidden_layers: 12,
            num_decoder_layers: None,
            intermediate_size: 2048,
            head_dim: Some(64),
            vocab_size: 32128,
            relative_attention_num_buckets: 32,
            relative_attention_max_distance: 128,
            layer_norm_epsilon: 1e-6,
            feed_forward_proj: "gated-gelu".to_string(),
            tie_word_embeddings: false,
            is_encoder_decoder: true,
            decoder_start_token_id: 0,
            pad_token_id: 0,
            eos_token_id: 1,
            extra: serde_json::Map::new(),
        }
    }
}
