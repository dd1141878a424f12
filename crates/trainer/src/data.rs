//! JSONL task datasets and batch collation.
//!
//! Each task lives in `{data_dir}/{task}/{split}.jsonl`, one record per line:
//!
//! ```text
//! {"source": "premise: ... hypothesis: ...", "target": "entailment", "idx": 17}
//! ```
//!
//! Fields other than `source` and `target` are carried through as
//! `extra_fields` for the metrics provider.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use cpeft_core::tokenizer::TokenizerWrapper;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::config::RunConfig;

pub type ExtraFields = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{}:{line}: {source}", path.display())]
    Json {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },
    #[error("tokenization failed: {0}")]
    Tokenize(anyhow::Error),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Valid,
    Test,
}

impl Split {
    pub fn as_str(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Valid => "valid",
            Split::Test => "test",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Record {
    pub source: String,
    pub target: String,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

#[derive(Debug, Clone)]
pub struct Example {
    pub input_ids: Vec<u32>,
    pub labels: Vec<u32>,
    pub task_id: u32,
    pub extra: ExtraFields,
}

/// A materialized, right-padded batch.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[b, src_len]` u32
    pub input_ids: Tensor,
    /// `[b, src_len]` u32, 1 for real tokens
    pub attention_mask: Tensor,
    /// `[b, tgt_len]` u32, padded with `pad_token_id`
    pub labels: Tensor,
    /// `[b]` u32 dataset index of each example
    pub task_ids: Option<Tensor>,
    pub extra_fields: Vec<ExtraFields>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.extra_fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extra_fields.is_empty()
    }
}

/// Batches of one task, in file order.
#[derive(Debug, Clone)]
pub struct TaskLoader {
    pub name: String,
    pub batches: Vec<Batch>,
}

/// Everything a run iterates over. Training batches mix all tasks.
#[derive(Debug, Clone, Default)]
pub struct DataLoaders {
    pub train: Vec<Batch>,
    pub valid: Vec<TaskLoader>,
    pub test: Vec<TaskLoader>,
}

pub fn read_jsonl(path: &Path) -> Result<Vec<Record>, DataError> {
    let file = File::open(path).map_err(|source| DataError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut records = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| DataError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|source| DataError::Json {
            path: path.to_path_buf(),
            line: i + 1,
            source,
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Tokenizes records, truncating to the configured lengths and appending EOS.
pub struct Encoder<'a> {
    pub tokenizer: &'a TokenizerWrapper,
    pub max_source_length: usize,
    pub max_target_length: usize,
    pub eos_token_id: u32,
}

impl Encoder<'_> {
    pub fn encode(&self, record: Record, task_id: u32) -> Result<Example, DataError> {
        let input_ids = self
            .tokenizer
            .encode_with_eos(&record.source, self.max_source_length, self.eos_token_id)
            .map_err(DataError::Tokenize)?;
        let labels = self
            .tokenizer
            .encode_with_eos(&record.target, self.max_target_length, self.eos_token_id)
            .map_err(DataError::Tokenize)?;
        Ok(Example {
            input_ids,
            labels,
            task_id,
            extra: record.extra,
        })
    }
}

/// Right-pad `examples` into one batch.
pub fn collate(examples: &[&Example], pad_token_id: u32, device: &Device) -> candle_core::Result<Batch> {
    let batch = examples.len();
    let src_len = examples.iter().map(|e| e.input_ids.len()).max().unwrap_or(0);
    let tgt_len = examples.iter().map(|e| e.labels.len()).max().unwrap_or(0);

    let mut input_ids = Vec::with_capacity(batch * src_len);
    let mut attention_mask = Vec::with_capacity(batch * src_len);
    let mut labels = Vec::with_capacity(batch * tgt_len);
    for example in examples {
        let pad = src_len - example.input_ids.len();
        input_ids.extend_from_slice(&example.input_ids);
        input_ids.extend(std::iter::repeat(pad_token_id).take(pad));
        attention_mask.extend(std::iter::repeat(1u32).take(example.input_ids.len()));
        attention_mask.extend(std::iter::repeat(0u32).take(pad));

        labels.extend_from_slice(&example.labels);
        labels.extend(std::iter::repeat(pad_token_id).take(tgt_len - example.labels.len()));
    }
    let task_ids: Vec<u32> = examples.iter().map(|e| e.task_id).collect();

    Ok(Batch {
        input_ids: Tensor::from_vec(input_ids, (batch, src_len), device)?,
        attention_mask: Tensor::from_vec(attention_mask, (batch, src_len), device)?,
        labels: Tensor::from_vec(labels, (batch, tgt_len), device)?,
        task_ids: Some(Tensor::from_vec(task_ids, batch, device)?),
        extra_fields: examples.iter().map(|e| e.extra.clone()).collect(),
    })
}

pub fn batches(
    examples: &[Example],
    batch_size: usize,
    pad_token_id: u32,
    device: &Device,
) -> candle_core::Result<Vec<Batch>> {
    examples
        .chunks(batch_size.max(1))
        .map(|chunk| {
            let refs: Vec<&Example> = chunk.iter().collect();
            collate(&refs, pad_token_id, device)
        })
        .collect()
}

pub fn load_split(
    config: &RunConfig,
    encoder: &Encoder<'_>,
    task: &str,
    task_id: u32,
    split: Split,
) -> Result<Vec<Example>, DataError> {
    let path = config
        .data_dir
        .join(task)
        .join(format!("{}.jsonl", split.as_str()));
    let mut records = read_jsonl(&path)?;
    if split == Split::Train {
        if let Some(limit) = config.max_train_samples {
            records.truncate(limit);
        }
    }
    records
        .into_iter()
        .map(|record| encoder.encode(record, task_id))
        .collect()
}

/// Load every configured task. Training examples are shuffled across tasks.
pub fn build_loaders<R: Rng>(
    config: &RunConfig,
    encoder: &Encoder<'_>,
    pad_token_id: u32,
    device: &Device,
    rng: &mut R,
) -> Result<DataLoaders, DataError> {
    let mut train = Vec::new();
    let mut loaders = DataLoaders::default();

    for (task_id, task) in config.datasets.iter().enumerate() {
        let task_id = task_id as u32;
        if config.trains() {
            train.extend(load_split(config, encoder, task, task_id, Split::Train)?);
        }
        for (split, target) in [(Split::Valid, &mut loaders.valid), (Split::Test, &mut loaders.test)] {
            let examples = load_split(config, encoder, task, task_id, split)?;
            target.push(TaskLoader {
                name: task.clone(),
                batches: batches(&examples, config.batch_size, pad_token_id, device)?,
            });
        }
    }

    train.shuffle(rng);
    loaders.train = batches(&train, config.batch_size, pad_token_id, device)?;
    info!(
        train_batches = loaders.train.len(),
        tasks = config.datasets.len(),
        "built data loaders"
    );
    Ok(loaders)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example(input: &[u32], labels: &[u32], task_id: u32) -> Example {
        Example {
            input_ids: input.to_vec(),
            labels: labels.to_vec(),
            task_id,
            extra: ExtraFields::new(),
        }
    }

    #[test]
    fn collate_right_pads() {
        let a = example(&[5, 6, 1], &[7, 1], 0);
        let b = example(&[8, 1], &[9, 10, 1], 1);
        let batch = collate(&[&a, &b], 0, &Device::Cpu).unwrap();

        let ids: Vec<Vec<u32>> = batch.input_ids.to_vec2().unwrap();
        assert_eq!(ids, vec![vec![5, 6, 1], vec![8, 1, 0]]);
        let mask: Vec<Vec<u32>> = batch.attention_mask.to_vec2().unwrap();
        assert_eq!(mask, vec![vec![1, 1, 1], vec![1, 1, 0]]);
        let labels: Vec<Vec<u32>> = batch.labels.to_vec2().unwrap();
        assert_eq!(labels, vec![vec![7, 1, 0], vec![9, 10, 1]]);
        let task_ids: Vec<u32> = batch.task_ids.unwrap().to_vec1().unwrap();
        assert_eq!(task_ids, vec![0, 1]);
    }

    #[test]
    fn batches_chunk_examples() {
        let examples: Vec<Example> = (0..5).map(|i| example(&[i + 2, 1], &[1], 0)).collect();
        let batches = batches(&examples, 2, 0, &Device::Cpu).unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].len(), 1);
    }

    #[test]
    fn read_jsonl_keeps_extra_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("valid.jsonl");
        std::fs::write(
            &path,
            "{\"source\": \"a b\", \"target\": \"c\", \"idx\": 3}\n\n{\"source\": \"d\", \"target\": \"e\"}\n",
        )
        .unwrap();

        let records = read_jsonl(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].extra["idx"], 3);
        assert!(records[1].extra.is_empty());
    }

    #[test]
    fn read_jsonl_reports_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.jsonl");
        std::fs::write(&path, "{\"source\": \"a\", \"target\": \"b\"}\nnot json\n").unwrap();

        match read_jsonl(&path) {
            Err(DataError::Json { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected Json error, got {other:?}"),
        }
    }
}
