//! Trainable virtual-token table.

use std::path::Path;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::Embedding;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use super::config::{AdapterConfig, PromptInit};
use super::error::{PeftError, Result};
use super::state::{read_tensors, EmbeddingState, PROMPT_EMBEDDINGS_KEY};

/// Vocabulary-sampled initialisation draws from ids `[0, VOCAB_SAMPLE_POOL)`.
pub const VOCAB_SAMPLE_POOL: usize = 5000;

/// Storage layout of the table.
#[derive(Debug, Clone)]
pub enum PromptEmbedding {
    Single(Var),
    PerSubmodule(Vec<Var>),
}

/// Maps virtual-token indices `[0, total_virtual_tokens)` to `token_dim` vectors.
///
/// Always held in f32 on the base model's device, independent of the base
/// model dtype.
#[derive(Debug, Clone)]
pub struct VirtualTokenEmbedding {
    table: PromptEmbedding,
    num_virtual_tokens: usize,
    total_virtual_tokens: usize,
    token_dim: usize,
    device: Device,
}

impl VirtualTokenEmbedding {
    /// Build the table, seeding from `config.seed` when set.
    pub fn new(config: &AdapterConfig, word_embeddings: &Embedding, device: &Device) -> Result<Self> {
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self::new_with_rng(config, word_embeddings, device, &mut rng)
    }

    pub fn new_with_rng<R: Rng>(
        config: &AdapterConfig,
        word_embeddings: &Embedding,
        device: &Device,
        rng: &mut R,
    ) -> Result<Self> {
        config.validate()?;
        let token_dim = config.token_dim()?;
        let total = config.total_virtual_tokens();

        let init = match config.prompt_init {
            PromptInit::Random => random_table(total, token_dim, device, rng)?,
            PromptInit::VocabSampled => vocab_sampled_table(total, word_embeddings, device, rng)?,
            PromptInit::FromFile => {
                let path = config.prompt_init_embedding.as_deref().ok_or_else(|| {
                    PeftError::config("prompt_init 'embedding' requires prompt_init_embedding")
                })?;
                table_from_file(path, total, token_dim, device)?
            }
        };
        debug!(init = ?config.prompt_init, total, token_dim, "initialised virtual tokens");

        let table = if config.per_submodule_embeddings {
            let n = config.num_virtual_tokens;
            let vars = (0..config.num_transformer_submodules())
                .map(|i| Var::from_tensor(&init.narrow(0, i * n, n)?))
                .collect::<candle_core::Result<Vec<_>>>()?;
            PromptEmbedding::PerSubmodule(vars)
        } else {
            PromptEmbedding::Single(Var::from_tensor(&init)?)
        };

        Ok(Self {
            table,
            num_virtual_tokens: config.num_virtual_tokens,
            total_virtual_tokens: total,
            token_dim,
            device: device.clone(),
        })
    }

    pub fn total_virtual_tokens(&self) -> usize {
        self.total_virtual_tokens
    }

    pub fn token_dim(&self) -> usize {
        self.token_dim
    }

    pub fn layout(&self) -> &PromptEmbedding {
        &self.table
    }

    /// The full `(total_virtual_tokens, token_dim)` table, still attached to the graph.
    pub fn weight(&self) -> Result<Tensor> {
        match &self.table {
            PromptEmbedding::Single(var) => Ok(var.as_tensor().clone()),
            PromptEmbedding::PerSubmodule(vars) => {
                let tables: Vec<&Tensor> = vars.iter().map(|v| v.as_tensor()).collect();
                Ok(Tensor::cat(&tables, 0)?)
            }
        }
    }

    /// Look up rows for `indices` (u32, any shape).
    pub fn forward(&self, indices: &Tensor) -> Result<Tensor> {
        let weight = self.weight()?;
        let flat = indices.flatten_all()?;
        let rows = weight.index_select(&flat, 0)?;
        let mut shape = indices.dims().to_vec();
        shape.push(self.token_dim);
        Ok(rows.reshape(shape)?)
    }

    /// The whole table broadcast over the batch: `[batch, total_virtual_tokens, token_dim]`.
    pub fn prompt_embeddings(&self, batch_size: usize) -> Result<Tensor> {
        let prompts = self.forward(&self.indices()?)?;
        Ok(prompts.unsqueeze(0)?.broadcast_as((
            batch_size,
            self.total_virtual_tokens,
            self.token_dim,
        ))?)
    }

    fn indices(&self) -> Result<Tensor> {
        Ok(Tensor::arange(0u32, self.total_virtual_tokens as u32, &self.device)?)
    }

    pub fn vars(&self) -> Vec<Var> {
        match &self.table {
            PromptEmbedding::Single(var) => vec![var.clone()],
            PromptEmbedding::PerSubmodule(vars) => vars.clone(),
        }
    }

    /// Stored tables as-is, detached.
    pub fn stored(&self) -> EmbeddingState {
        match &self.table {
            PromptEmbedding::Single(var) => EmbeddingState::Single(var.as_tensor().detach()),
            PromptEmbedding::PerSubmodule(vars) => {
                EmbeddingState::PerSubmodule(vars.iter().map(|v| v.as_tensor().detach()).collect())
            }
        }
    }

    /// Tables recomputed through the lookup path, detached and moved to the CPU.
    pub fn to_save(&self) -> Result<EmbeddingState> {
        let table = self
            .forward(&self.indices()?)?
            .detach()
            .to_device(&Device::Cpu)?;
        match &self.table {
            PromptEmbedding::Single(_) => Ok(EmbeddingState::Single(table)),
            PromptEmbedding::PerSubmodule(vars) => {
                let n = self.num_virtual_tokens;
                let tables = (0..vars.len())
                    .map(|i| table.narrow(0, i * n, n))
                    .collect::<candle_core::Result<Vec<_>>>()?;
                Ok(EmbeddingState::PerSubmodule(tables))
            }
        }
    }

    /// Reshape `state` into this table's layout and check every shape.
    ///
    /// A single table is split positionally across submodules and
    /// per-submodule tables are stacked into a single one.
    pub fn conform(&self, state: &EmbeddingState) -> Result<Vec<Tensor>> {
        let n = self.num_virtual_tokens;
        let tables = match (&self.table, state) {
            (PromptEmbedding::Single(_), EmbeddingState::Single(t)) => vec![t.clone()],
            (PromptEmbedding::Single(_), EmbeddingState::PerSubmodule(ts)) => {
                for (i, t) in ts.iter().enumerate() {
                    self.check_width(&format!("{PROMPT_EMBEDDINGS_KEY}.{i}"), t)?;
                }
                vec![state.to_single()?]
            }
            (PromptEmbedding::PerSubmodule(vars), EmbeddingState::Single(t)) => {
                self.check_rows(PROMPT_EMBEDDINGS_KEY, t, self.total_virtual_tokens)?;
                (0..vars.len())
                    .map(|i| t.narrow(0, i * n, n))
                    .collect::<candle_core::Result<Vec<_>>>()?
            }
            (PromptEmbedding::PerSubmodule(vars), EmbeddingState::PerSubmodule(ts)) => {
                if ts.len() != vars.len() {
                    return Err(PeftError::mismatch(
                        PROMPT_EMBEDDINGS_KEY,
                        format!("expected {} tables, got {}", vars.len(), ts.len()),
                    ));
                }
                ts.clone()
            }
        };

        let rows = match &self.table {
            PromptEmbedding::Single(_) => self.total_virtual_tokens,
            PromptEmbedding::PerSubmodule(_) => n,
        };
        let single = tables.len() == 1 && matches!(self.table, PromptEmbedding::Single(_));
        tables
            .into_iter()
            .enumerate()
            .map(|(i, t)| {
                let key = if single {
                    PROMPT_EMBEDDINGS_KEY.to_string()
                } else {
                    format!("{PROMPT_EMBEDDINGS_KEY}.{i}")
                };
                self.check_rows(&key, &t, rows)?;
                Ok(t.to_dtype(DType::F32)?.to_device(&self.device)?)
            })
            .collect()
    }

    /// Overwrite the stored tables with tensors produced by [`Self::conform`].
    pub fn assign(&self, tables: &[Tensor]) -> Result<()> {
        for (var, table) in self.vars().iter().zip(tables) {
            var.set(table)?;
        }
        Ok(())
    }

    fn check_width(&self, key: &str, t: &Tensor) -> Result<()> {
        match t.dims() {
            [_, d] if *d == self.token_dim => Ok(()),
            dims => Err(PeftError::mismatch(
                key,
                format!("expected [_, {}], got {dims:?}", self.token_dim),
            )),
        }
    }

    fn check_rows(&self, key: &str, t: &Tensor, rows: usize) -> Result<()> {
        if t.dims() == [rows, self.token_dim] {
            Ok(())
        } else {
            Err(PeftError::mismatch(
                key,
                format!("expected [{rows}, {}], got {:?}", self.token_dim, t.dims()),
            ))
        }
    }
}

/// Standard normal rows via Box-Muller so a seed fully determines the table.
fn random_table<R: Rng>(rows: usize, cols: usize, device: &Device, rng: &mut R) -> Result<Tensor> {
    let len = rows * cols;
    let mut values = Vec::with_capacity(len + 1);
    while values.len() < len {
        let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
        let u2: f32 = rng.gen();
        let r = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f32::consts::PI * u2;
        values.push(r * theta.cos());
        values.push(r * theta.sin());
    }
    values.truncate(len);
    Ok(Tensor::from_vec(values, (rows, cols), device)?)
}

fn vocab_sampled_table<R: Rng>(
    rows: usize,
    word_embeddings: &Embedding,
    device: &Device,
    rng: &mut R,
) -> Result<Tensor> {
    let vocab_size = word_embeddings.embeddings().dim(0)?;
    let pool = vocab_size.min(VOCAB_SAMPLE_POOL);
    if rows > pool {
        return Err(PeftError::config(format!(
            "vocab-sampled init needs {rows} distinct ids but only {pool} are available \
             (vocab size {vocab_size}, sampling pool {VOCAB_SAMPLE_POOL})"
        )));
    }
    let ids: Vec<u32> = rand::seq::index::sample(rng, pool, rows)
        .into_iter()
        .map(|i| i as u32)
        .collect();
    let ids = Tensor::new(ids.as_slice(), word_embeddings.embeddings().device())?;
    let table = word_embeddings
        .embeddings()
        .index_select(&ids, 0)?
        .detach()
        .to_dtype(DType::F32)?
        .to_device(device)?;
    Ok(table)
}

fn table_from_file(path: &Path, rows: usize, cols: usize, device: &Device) -> Result<Tensor> {
    let tensors = read_tensors(path, device)?;
    let table = match tensors.get(PROMPT_EMBEDDINGS_KEY) {
        Some(t) => t.clone(),
        None if tensors.len() == 1 => tensors.into_values().next().ok_or_else(|| {
            PeftError::config(format!("{} holds no tensors", path.display()))
        })?,
        None => {
            let mut keys: Vec<_> = tensors.keys().cloned().collect();
            keys.sort();
            return Err(PeftError::config(format!(
                "{} has no '{PROMPT_EMBEDDINGS_KEY}' tensor (found {keys:?})",
                path.display()
            )));
        }
    };
    if table.dims() != [rows, cols] {
        return Err(PeftError::config(format!(
            "init embedding in {} has shape {:?}, expected [{rows}, {cols}]",
            path.display(),
            table.dims()
        )));
    }
    Ok(table.to_dtype(DType::F32)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    fn word_embeddings(vocab: usize, dim: usize) -> Embedding {
        let values: Vec<f32> = (0..vocab * dim).map(|i| (i / dim) as f32).collect();
        let table = Tensor::from_vec(values, (vocab, dim), &Device::Cpu).unwrap();
        Embedding::new(table, dim)
    }

    fn config(init: PromptInit, tokens: usize, submodules: usize) -> AdapterConfig {
        let mut config = AdapterConfig::prompt_tuning(tokens);
        config.token_dim = Some(8);
        config.num_transformer_submodules = Some(submodules);
        config.prompt_init = init;
        config.seed = Some(7);
        config
    }

    #[test]
    fn random_table_has_expected_shape() {
        let emb = VirtualTokenEmbedding::new(
            &config(PromptInit::Random, 5, 2),
            &word_embeddings(32, 8),
            &Device::Cpu,
        )
        .unwrap();
        assert_eq!(emb.weight().unwrap().dims(), &[10, 8]);
        assert_eq!(emb.prompt_embeddings(3).unwrap().dims(), &[3, 10, 8]);
    }

    #[test]
    fn seed_makes_init_reproducible() {
        let cfg = config(PromptInit::Random, 4, 1);
        let words = word_embeddings(32, 8);
        let a = VirtualTokenEmbedding::new(&cfg, &words, &Device::Cpu).unwrap();
        let b = VirtualTokenEmbedding::new(&cfg, &words, &Device::Cpu).unwrap();
        let a: Vec<Vec<f32>> = a.weight().unwrap().to_vec2().unwrap();
        let b: Vec<Vec<f32>> = b.weight().unwrap().to_vec2().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn vocab_sampled_rows_are_distinct_words() {
        let emb = VirtualTokenEmbedding::new(
            &config(PromptInit::VocabSampled, 6, 2),
            &word_embeddings(64, 8),
            &Device::Cpu,
        )
        .unwrap();
        let rows: Vec<Vec<f32>> = emb.weight().unwrap().to_vec2().unwrap();
        // Each word row is filled with its own id.
        let ids: HashSet<u32> = rows.iter().map(|r| r[0] as u32).collect();
        assert_eq!(ids.len(), 12);
        assert!(ids.iter().all(|&id| id < 64));
    }

    #[test]
    fn vocab_sampled_beyond_pool_is_config_error() {
        let result = VirtualTokenEmbedding::new(
            &config(PromptInit::VocabSampled, 2501, 2),
            &word_embeddings(6000, 8),
            &Device::Cpu,
        );
        assert!(matches!(result, Err(PeftError::Config(_))));
    }

    #[test]
    fn vocab_sampled_beyond_small_vocab_is_config_error() {
        let result = VirtualTokenEmbedding::new(
            &config(PromptInit::VocabSampled, 20, 1),
            &word_embeddings(16, 8),
            &Device::Cpu,
        );
        assert!(matches!(result, Err(PeftError::Config(_))));
    }

    #[test]
    fn from_file_loads_named_tensor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("init.safetensors");
        let init = Tensor::full(0.25f32, (6, 8), &Device::Cpu).unwrap();
        let mut tensors = HashMap::new();
        tensors.insert(PROMPT_EMBEDDINGS_KEY.to_string(), init);
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let mut cfg = config(PromptInit::FromFile, 3, 2);
        cfg.prompt_init_embedding = Some(path);
        let emb = VirtualTokenEmbedding::new(&cfg, &word_embeddings(32, 8), &Device::Cpu).unwrap();
        let rows: Vec<Vec<f32>> = emb.weight().unwrap().to_vec2().unwrap();
        assert!(rows.iter().flatten().all(|&v| v == 0.25));
    }

    #[test]
    fn from_file_wrong_shape_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("init.safetensors");
        let mut tensors = HashMap::new();
        tensors.insert(
            "weights".to_string(),
            Tensor::zeros((4, 8), DType::F32, &Device::Cpu).unwrap(),
        );
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let mut cfg = config(PromptInit::FromFile, 3, 2);
        cfg.prompt_init_embedding = Some(path);
        let result = VirtualTokenEmbedding::new(&cfg, &word_embeddings(32, 8), &Device::Cpu);
        assert!(matches!(result, Err(PeftError::Config(_))));
    }

    #[test]
    fn from_file_missing_is_io_error() {
        let mut cfg = config(PromptInit::FromFile, 3, 2);
        cfg.prompt_init_embedding = Some("/nonexistent/init.safetensors".into());
        let result = VirtualTokenEmbedding::new(&cfg, &word_embeddings(32, 8), &Device::Cpu);
        assert!(matches!(result, Err(PeftError::Io { .. })));
    }

    #[test]
    fn per_submodule_split_and_save() {
        let mut cfg = config(PromptInit::VocabSampled, 3, 2);
        cfg.per_submodule_embeddings = true;
        let emb = VirtualTokenEmbedding::new(&cfg, &word_embeddings(32, 8), &Device::Cpu).unwrap();

        assert_eq!(emb.vars().len(), 2);
        assert_eq!(emb.weight().unwrap().dims(), &[6, 8]);
        match emb.to_save().unwrap() {
            EmbeddingState::PerSubmodule(tables) => {
                assert_eq!(tables.len(), 2);
                assert_eq!(tables[0].dims(), &[3, 8]);
            }
            other => panic!("expected per-submodule state, got {other:?}"),
        }
    }

    #[test]
    fn conform_splits_single_table_positionally() {
        let mut cfg = config(PromptInit::Random, 2, 2);
        cfg.per_submodule_embeddings = true;
        let emb = VirtualTokenEmbedding::new(&cfg, &word_embeddings(32, 8), &Device::Cpu).unwrap();

        let first = Tensor::full(1f32, (2, 8), &Device::Cpu).unwrap();
        let second = Tensor::full(2f32, (2, 8), &Device::Cpu).unwrap();
        let single = Tensor::cat(&[&first, &second], 0).unwrap();
        let tables = emb.conform(&EmbeddingState::Single(single)).unwrap();
        emb.assign(&tables).unwrap();

        let vars = emb.vars();
        let second_row: Vec<Vec<f32>> = vars[1].as_tensor().to_vec2().unwrap();
        assert_eq!(second_row[0][0], 2.0);
    }

    #[test]
    fn conform_rejects_wrong_shape() {
        let emb = VirtualTokenEmbedding::new(
            &config(PromptInit::Random, 4, 1),
            &word_embeddings(32, 8),
            &Device::Cpu,
        )
        .unwrap();
        let bad = Tensor::zeros((5, 8), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            emb.conform(&EmbeddingState::Single(bad)),
            Err(PeftError::StateMismatch { .. })
        ));
    }
}
