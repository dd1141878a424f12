//! ATTEMPT input-conditioned prompt mixing.
//!
//! The input is max-pooled over its unmasked positions, projected through a
//! down/up bottleneck with SiLU and layer norm, and scored against every
//! virtual-token row. The softmax-weighted mixture of rows is added to each
//! row, giving a per-example prompt `[batch, total_virtual_tokens, token_dim]`.
//!
//! Weights use the `(in, out)` layout, so the down projection of a base
//! model with hidden size 768 and `attention_dim = 64` is `(768, 64)`.

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor, Var, D};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::config::AdapterConfig;
use super::error::{PeftError, Result};

pub const ATTN_DOWN_KEY: &str = "peft.attn_W_down.weight";
pub const ATTN_UP_KEY: &str = "peft.attn_W_up.weight";
pub const LAYER_NORM_WEIGHT_KEY: &str = "peft.layer_norm.weight";
pub const LAYER_NORM_BIAS_KEY: &str = "peft.layer_norm.bias";

const LAYER_NORM_EPS: f64 = 1e-5;
const MASKED_FILL: f64 = 1e9;

#[derive(Debug, Clone)]
pub struct AttentionAdapter {
    down: Var,
    up: Var,
    norm_weight: Var,
    norm_bias: Var,
    token_dim: usize,
    attention_dim: usize,
    temperature: f64,
}

impl AttentionAdapter {
    pub fn new(config: &AdapterConfig, device: &Device) -> Result<Self> {
        // Offset keeps the projection init independent of the prompt-table draw.
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
            None => StdRng::from_entropy(),
        };
        Self::new_with_rng(config, device, &mut rng)
    }

    pub fn new_with_rng<R: Rng>(config: &AdapterConfig, device: &Device, rng: &mut R) -> Result<Self> {
        let token_dim = config.token_dim()?;
        let attention_dim = config.attention_dim;
        if attention_dim == 0 {
            return Err(PeftError::config("attention_dim must be positive"));
        }

        let down = Var::from_tensor(&uniform((token_dim, attention_dim), device, rng)?)?;
        let up = Var::from_tensor(&uniform((attention_dim, token_dim), device, rng)?)?;
        let norm_weight = Var::ones(token_dim, DType::F32, device)?;
        let norm_bias = Var::zeros(token_dim, DType::F32, device)?;

        Ok(Self {
            down,
            up,
            norm_weight,
            norm_bias,
            token_dim,
            attention_dim,
            temperature: config.attention_temperature()?,
        })
    }

    pub fn attention_dim(&self) -> usize {
        self.attention_dim
    }

    /// Mix `prompts` `[total, d]` per example of `inputs_embeds` `[b, s, d]`.
    ///
    /// `attention_mask` is the `[b, s]` 0/1 mask of the input.
    pub fn forward(
        &self,
        prompts: &Tensor,
        inputs_embeds: &Tensor,
        attention_mask: &Tensor,
    ) -> Result<Tensor> {
        let (batch, _, _) = inputs_embeds.dims3()?;
        let (total, _) = prompts.dims2()?;

        let embeds = inputs_embeds.to_dtype(DType::F32)?;
        let mask = attention_mask.to_dtype(DType::F32)?.unsqueeze(D::Minus1)?;
        let penalty = ((mask - 1.0)? * MASKED_FILL)?;
        let pooled = embeds.broadcast_add(&penalty)?.max(1)?;

        let hidden = pooled.matmul(self.down.as_tensor())?.silu()?;
        let hidden = hidden.matmul(self.up.as_tensor())?;
        let hidden = self.layer_norm(&hidden)?;

        let scores = (hidden.matmul(&prompts.t()?)? / self.temperature)?;
        let scores = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let mixed = scores.matmul(prompts)?;

        Ok(prompts
            .unsqueeze(0)?
            .broadcast_as((batch, total, self.token_dim))?
            .broadcast_add(&mixed.unsqueeze(1)?)?)
    }

    fn layer_norm(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + LAYER_NORM_EPS)?.sqrt()?)?;
        Ok(normed
            .broadcast_mul(self.norm_weight.as_tensor())?
            .broadcast_add(self.norm_bias.as_tensor())?)
    }

    pub fn vars(&self) -> Vec<Var> {
        vec![
            self.down.clone(),
            self.up.clone(),
            self.norm_weight.clone(),
            self.norm_bias.clone(),
        ]
    }

    fn named(&self) -> [(&'static str, &Var); 4] {
        [
            (ATTN_DOWN_KEY, &self.down),
            (ATTN_UP_KEY, &self.up),
            (LAYER_NORM_WEIGHT_KEY, &self.norm_weight),
            (LAYER_NORM_BIAS_KEY, &self.norm_bias),
        ]
    }

    /// Detached CPU copies of every weight.
    pub fn state(&self) -> Result<BTreeMap<String, Tensor>> {
        let mut state = BTreeMap::new();
        for (key, var) in self.named() {
            state.insert(
                key.to_string(),
                var.as_tensor().detach().to_device(&Device::Cpu)?,
            );
        }
        Ok(state)
    }

    /// Check `state` against every weight and return them in assignment order.
    pub fn conform(&self, state: &BTreeMap<String, Tensor>) -> Result<Vec<Tensor>> {
        self.named()
            .into_iter()
            .map(|(key, var)| {
                let tensor = state
                    .get(key)
                    .ok_or_else(|| PeftError::mismatch(key, "missing from attention_module"))?;
                if tensor.dims() != var.as_tensor().dims() {
                    return Err(PeftError::mismatch(
                        key,
                        format!(
                            "expected {:?}, got {:?}",
                            var.as_tensor().dims(),
                            tensor.dims()
                        ),
                    ));
                }
                Ok(tensor
                    .to_dtype(DType::F32)?
                    .to_device(var.as_tensor().device())?)
            })
            .collect()
    }

    pub fn assign(&self, tensors: &[Tensor]) -> Result<()> {
        for ((_, var), tensor) in self.named().into_iter().zip(tensors) {
            var.set(tensor)?;
        }
        Ok(())
    }
}

/// `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`, fan_in being the first dim.
fn uniform<R: Rng>(shape: (usize, usize), device: &Device, rng: &mut R) -> Result<Tensor> {
    let bound = 1.0 / (shape.0 as f32).sqrt();
    let values: Vec<f32> = (0..shape.0 * shape.1)
        .map(|_| rng.gen_range(-bound..bound))
        .collect();
    Ok(Tensor::from_vec(values, shape, device)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(token_dim: usize, attention_dim: usize) -> AttentionAdapter {
        let mut config = AdapterConfig::attempt(3);
        config.token_dim = Some(token_dim);
        config.attention_dim = attention_dim;
        config.seed = Some(3);
        AttentionAdapter::new(&config, &Device::Cpu).unwrap()
    }

    #[test]
    fn weight_layout_is_in_by_out() {
        let state = adapter(768, 64).state().unwrap();
        assert_eq!(state[ATTN_DOWN_KEY].dims(), &[768, 64]);
        assert_eq!(state[ATTN_UP_KEY].dims(), &[64, 768]);
        assert_eq!(state[LAYER_NORM_WEIGHT_KEY].dims(), &[768]);
        assert_eq!(state[LAYER_NORM_BIAS_KEY].dims(), &[768]);
    }

    #[test]
    fn forward_gives_per_example_prompts() {
        let adapter = adapter(8, 4);
        let prompts = Tensor::randn(0f32, 1f32, (6, 8), &Device::Cpu).unwrap();
        let embeds = Tensor::randn(0f32, 1f32, (2, 5, 8), &Device::Cpu).unwrap();
        let mask = Tensor::new(&[[1u32, 1, 1, 0, 0], [1, 1, 1, 1, 1]], &Device::Cpu).unwrap();

        let out = adapter.forward(&prompts, &embeds, &mask).unwrap();
        assert_eq!(out.dims(), &[2, 6, 8]);

        let rows: Vec<Vec<Vec<f32>>> = out.to_vec3().unwrap();
        assert!(rows.iter().flatten().flatten().all(|v| v.is_finite()));
    }

    #[test]
    fn padding_does_not_change_pooled_prompt() {
        let adapter = adapter(8, 4);
        let prompts = Tensor::randn(0f32, 1f32, (3, 8), &Device::Cpu).unwrap();
        let real = Tensor::randn(0f32, 1f32, (1, 3, 8), &Device::Cpu).unwrap();
        let pad = Tensor::full(100f32, (1, 2, 8), &Device::Cpu).unwrap();
        let padded = Tensor::cat(&[&real, &pad], 1).unwrap();

        let short = adapter
            .forward(&prompts, &real, &Tensor::ones((1, 3), DType::U32, &Device::Cpu).unwrap())
            .unwrap();
        let mask = Tensor::new(&[[1u32, 1, 1, 0, 0]], &Device::Cpu).unwrap();
        let long = adapter.forward(&prompts, &padded, &mask).unwrap();

        let diff = (short - long)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-5);
    }

    #[test]
    fn conform_rejects_missing_and_misshapen() {
        let adapter = adapter(8, 4);
        let mut state = adapter.state().unwrap();
        state.remove(LAYER_NORM_BIAS_KEY);
        assert!(matches!(
            adapter.conform(&state),
            Err(PeftError::StateMismatch { .. })
        ));

        let mut state = adapter.state().unwrap();
        state.insert(
            ATTN_DOWN_KEY.to_string(),
            Tensor::zeros((4, 8), DType::F32, &Device::Cpu).unwrap(),
        );
        match adapter.conform(&state) {
            Err(PeftError::StateMismatch { key, .. }) => assert_eq!(key, ATTN_DOWN_KEY),
            other => panic!("expected StateMismatch, got {other:?}"),
        }
    }

    #[test]
    fn state_round_trips_through_assign() {
        let source = adapter(8, 4);
        let mut config = AdapterConfig::attempt(3);
        config.token_dim = Some(8);
        config.attention_dim = 4;
        config.seed = Some(99);
        let target = AttentionAdapter::new(&config, &Device::Cpu).unwrap();

        let tensors = target.conform(&source.state().unwrap()).unwrap();
        target.assign(&tensors).unwrap();

        let a: Vec<Vec<f32>> = source.state().unwrap()[ATTN_UP_KEY].to_vec2().unwrap();
        let b: Vec<Vec<f32>> = target.state().unwrap()[ATTN_UP_KEY].to_vec2().unwrap();
        assert_eq!(a, b);
    }
}
