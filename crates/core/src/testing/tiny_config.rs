use crate::config::ModelConfig;

/// Create a tiny gated-GELU T5 config for testing (2+2 layers, 64 hidden, 2 heads).
/// Uses < 1MB of parameters.
pub fn tiny_t5_config() -> ModelConfig {
    ModelConfig {
        architectures: vec!["T5ForConditionalGeneration".to_string()],
        hidden_size: 64,
        num_attention_heads: 2,
        num_hidden_layers: 2,
        num_decoder_layers: Some(2),
        intermediate_size: 128,
        head_dim: Some(32),
        vocab_size: 256,
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

/// Original T5 v1.0 flavour: ReLU FFN and tied LM head.
pub fn tiny_t5_relu_config() -> ModelConfig {
    ModelConfig {
        feed_forward_proj: "relu".to_string(),
        tie_word_embeddings: true,
        ..tiny_t5_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiny_t5_config_is_valid() {
        let config = tiny_t5_config();
        assert_eq!(config.hidden_size, 64);
        assert_eq!(config.head_dim() * config.num_attention_heads, 64);
        assert_eq!(config.num_decoder_layers(), 2);
        assert!(config.is_gated_act());
        assert_eq!(config.num_transformer_submodules(), 2);
    }

    #[test]
    fn tiny_relu_config_ties_embeddings() {
        let config = tiny_t5_relu_config();
        assert!(!config.is_gated_act());
        assert!(config.tie_word_embeddings);
    }
}
