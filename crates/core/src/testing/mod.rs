//! Shared test utilities for cpeft-core.
//!
//! Tiny T5 configurations and randomly initialised frozen models, small
//! enough to run forward and backward passes on the CPU in unit tests.

mod tiny_config;

use std::collections::HashMap;

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};

use crate::config::ModelConfig;
use crate::models::T5ForConditionalGeneration;

pub use tiny_config::{tiny_t5_config, tiny_t5_relu_config};

/// Build a T5 with random weights held as plain (frozen) tensors.
///
/// A `VarMap` pass records every parameter name and shape, then the model
/// is rebuilt from detached random tensors so nothing in it is a `Var`.
pub fn random_frozen_t5(cfg: &ModelConfig, device: &Device) -> Result<T5ForConditionalGeneration> {
    let varmap = VarMap::new();
    T5ForConditionalGeneration::new(cfg, VarBuilder::from_varmap(&varmap, DType::F32, device))?;

    let mut tensors = HashMap::new();
    {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| candle_core::Error::Msg("varmap lock poisoned".to_string()))?;
        for (name, var) in data.iter() {
            let shape = var.shape().clone();
            let tensor = if name.ends_with("layer_norm.weight") {
                Tensor::ones(shape, DType::F32, device)?
            } else {
                Tensor::randn(0f32, 0.05, shape, device)?
            };
            tensors.insert(name.clone(), tensor);
        }
    }

    let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
    Ok(T5ForConditionalGeneration::new(cfg, vb)?.with_name_or_path("tiny-t5"))
}
