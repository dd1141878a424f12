//! Epoch loop, evaluation and best-checkpoint selection.

use std::collections::BTreeMap;
use std::path::PathBuf;

use candle_core::{DType, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use cpeft_core::models::{GenerationConfig, Seq2SeqModel};
use cpeft_core::peft::{PeftError, PeftModel, DEFAULT_ADAPTER_NAME};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::RunConfig;
use crate::data::{Batch, DataError, DataLoaders, TaskLoader};
use crate::metrics::{get_avg, EvalPrediction, Metrics, MetricsError, MetricsProvider};
use crate::scheduler::{LRScheduler, LinearWarmupSchedule};
use crate::tracker::ExperimentTracker;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Peft(#[from] PeftError),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Metrics(#[from] MetricsError),
    #[error("model returned no loss although labels were given")]
    MissingLoss,
}

pub type Result<T> = std::result::Result<T, TrainError>;

/// Metric providers keyed by task name.
pub type TaskMetrics = BTreeMap<String, Box<dyn MetricsProvider>>;

pub struct Trainer<'a, M: Seq2SeqModel> {
    model: PeftModel<M>,
    config: &'a RunConfig,
    loaders: DataLoaders,
    optimizer: AdamW,
    scheduler: Option<LinearWarmupSchedule>,
    metrics_fn: TaskMetrics,
    tracker: Box<dyn ExperimentTracker>,
    metrics: Metrics,
    min_eval_loss: f64,
    best_model_path: Option<PathBuf>,
}

impl<'a, M: Seq2SeqModel> Trainer<'a, M> {
    pub fn new(
        model: PeftModel<M>,
        config: &'a RunConfig,
        loaders: DataLoaders,
        metrics_fn: TaskMetrics,
        mut tracker: Box<dyn ExperimentTracker>,
    ) -> Result<Self> {
        let params = ParamsAdamW {
            lr: config.learning_rate,
            weight_decay: config.weight_decay,
            ..Default::default()
        };
        let mut optimizer = AdamW::new(model.trainable_vars()?, params)?;

        let scheduler = if config.trains() {
            let total = loaders.train.len() * config.num_epochs;
            let schedule = LinearWarmupSchedule::new(config.learning_rate, config.warmup_steps, total);
            optimizer.set_learning_rate(schedule.get_lr());
            Some(schedule)
        } else {
            None
        };

        match serde_json::to_value(config) {
            Ok(value) => {
                if let Err(e) = tracker.init(&config.project, &value, &config.run_name()) {
                    warn!(error = %e, "tracker init failed");
                }
            }
            Err(e) => warn!(error = %e, "could not serialize run config for the tracker"),
        }

        let trainable_params = model.num_trainable_parameters()?;
        info!(
            run = %config.run_name(),
            trainable_params,
            train_batches = loaders.train.len(),
            "trainer ready"
        );

        Ok(Self {
            model,
            config,
            loaders,
            optimizer,
            scheduler,
            metrics_fn,
            tracker,
            metrics: Metrics::new(),
            min_eval_loss: f64::INFINITY,
            best_model_path: config.best_model_path.clone(),
        })
    }

    pub fn model(&self) -> &PeftModel<M> {
        &self.model
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn best_model_path(&self) -> Option<&PathBuf> {
        self.best_model_path.as_ref()
    }

    fn generation_config(&self) -> GenerationConfig {
        GenerationConfig {
            max_new_tokens: self.config.max_target_length,
            num_beams: self.config.num_beams,
            ..Default::default()
        }
    }

    /// One pass over the training batches: `train_loss` and `train_ppl`.
    pub fn train(&mut self) -> Result<Metrics> {
        let mut metrics = Metrics::new();
        if self.scheduler.is_none() || self.loaders.train.is_empty() {
            return Ok(metrics);
        }

        let mut total_loss = 0f64;
        for batch in &self.loaders.train {
            let loss = batch_loss(&self.model, batch)?;
            total_loss += scalar(&loss)?;

            self.optimizer.backward_step(&loss)?;
            if let Some(scheduler) = self.scheduler.as_mut() {
                scheduler.step();
                self.optimizer.set_learning_rate(scheduler.get_lr());
            }
        }

        let loss = total_loss / self.loaders.train.len() as f64;
        metrics.insert("train_loss".to_string(), loss);
        metrics.insert("train_ppl".to_string(), loss.exp());
        Ok(metrics)
    }

    pub fn valid(&mut self) -> Result<Metrics> {
        let generation = self.generation_config();
        evaluate(
            &self.model,
            &self.loaders.valid,
            &mut self.metrics_fn,
            "valid",
            &generation,
        )
    }

    /// Evaluate on the test split, optionally on the best checkpoint.
    pub fn test(&mut self, load_model: bool) -> Result<Metrics> {
        let generation = self.generation_config();
        let reloaded = match (load_model, &self.best_model_path) {
            (true, Some(path)) => Some(PeftModel::from_pretrained(
                self.model.base_model().clone(),
                path,
                DEFAULT_ADAPTER_NAME,
            )?),
            (true, None) => {
                warn!("no checkpoint was saved; testing the current adapter");
                None
            }
            (false, _) => None,
        };
        let model = reloaded.as_ref().unwrap_or(&self.model);
        evaluate(
            model,
            &self.loaders.test,
            &mut self.metrics_fn,
            "test",
            &generation,
        )
    }

    /// Train for `num_epochs`, checkpointing on improved `avg_valid_loss`,
    /// then test. Returns the accumulated metrics.
    pub fn run(&mut self) -> Result<Metrics> {
        for epoch in 0..self.config.num_epochs {
            if let Err(e) = self.run_epoch(epoch) {
                error!(epoch, error = %e, metrics = ?self.metrics, "epoch failed");
                self.finish_tracker();
                return Err(e);
            }
        }

        let test_metrics = match self.test(self.config.load_model) {
            Ok(metrics) => metrics,
            Err(e) => {
                error!(error = %e, metrics = ?self.metrics, "test failed");
                self.finish_tracker();
                return Err(e);
            }
        };
        self.metrics.extend(test_metrics.clone());
        if let Some((key, value)) = get_avg(&self.metrics, "test_loss") {
            self.metrics.insert(key, value);
        }

        if let Err(e) = self.tracker.log(&test_metrics) {
            warn!(error = %e, "tracker log failed");
        }
        info!(metrics = ?test_metrics, "test");
        info!(metrics = ?self.metrics, "run metrics");
        self.finish_tracker();
        Ok(self.metrics.clone())
    }

    fn run_epoch(&mut self, epoch: usize) -> Result<()> {
        let train_metrics = self.train()?;
        self.metrics.extend(train_metrics);
        let valid_metrics = self.valid()?;
        self.metrics.extend(valid_metrics);

        match get_avg(&self.metrics, "valid_loss") {
            Some((key, avg)) => {
                self.metrics.insert(key, avg);
                if avg < self.min_eval_loss {
                    self.min_eval_loss = avg;
                    self.save_checkpoint()?;
                }
            }
            None => warn!(epoch, "no validation loss; skipping checkpoint selection"),
        }

        if let Err(e) = self.tracker.log(&self.metrics) {
            warn!(error = %e, "tracker log failed");
        }
        info!(epoch, metrics = ?self.metrics, "epoch finished");
        Ok(())
    }

    fn save_checkpoint(&mut self) -> Result<()> {
        let dir = self.config.checkpoint_dir();
        self.model.save_pretrained(&dir)?;
        info!(dir = %dir.display(), loss = self.min_eval_loss, "saved best checkpoint");

        if let Err(e) = self.tracker.log_artifact(&dir, &self.config.artifact_name()) {
            warn!(error = %e, "tracker artifact upload failed");
        }
        self.best_model_path = Some(dir);
        Ok(())
    }

    fn finish_tracker(&mut self) {
        if let Err(e) = self.tracker.finish() {
            warn!(error = %e, "tracker finish failed");
        }
    }
}

fn scalar(t: &Tensor) -> candle_core::Result<f64> {
    t.to_dtype(DType::F64)?.to_scalar::<f64>()
}

fn batch_loss<M: Seq2SeqModel>(model: &PeftModel<M>, batch: &Batch) -> Result<Tensor> {
    let device = model.base_model().device();
    let input_ids = batch.input_ids.to_device(device)?;
    let attention_mask = batch.attention_mask.to_device(device)?;
    let labels = batch.labels.to_device(device)?;
    model
        .forward(&input_ids, &attention_mask, Some(&labels))?
        .loss
        .ok_or(TrainError::MissingLoss)
}

/// Loss, generation and task metrics over every task of one split.
///
/// Keys are prefixed `{task}_{split}`: `{task}_{split}_loss`,
/// `{task}_{split}_ppl`, plus whatever the task's metrics provider reports.
pub fn evaluate<M: Seq2SeqModel>(
    model: &PeftModel<M>,
    loaders: &[TaskLoader],
    metrics_fn: &mut TaskMetrics,
    split: &str,
    generation: &GenerationConfig,
) -> Result<Metrics> {
    let device = model.base_model().device().clone();
    let mut metrics = Metrics::new();

    for loader in loaders {
        let prefix = format!("{}_{split}", loader.name);
        if loader.batches.is_empty() {
            warn!(task = %loader.name, split, "no batches");
            continue;
        }
        let mut provider = metrics_fn.get_mut(&loader.name);

        let mut total_loss = 0f64;
        for batch in &loader.batches {
            let loss = batch_loss(model, batch)?;
            total_loss += scalar(&loss)?;

            let input_ids = batch.input_ids.to_device(&device)?;
            let attention_mask = batch.attention_mask.to_device(&device)?;
            let predictions = model.generate(&input_ids, &attention_mask, generation)?;

            if let Some(provider) = provider.as_mut() {
                let eval = EvalPrediction {
                    predictions: &predictions,
                    label_ids: &batch.labels,
                    extra_fields: &batch.extra_fields,
                };
                metrics.extend(provider.compute_metrics(&eval, &prefix)?);
            }
        }

        if let Some(provider) = provider.as_mut() {
            metrics.extend(provider.compute_metrics_all(&prefix)?);
            provider.reset_metrics();
        }
        let loss = total_loss / loader.batches.len() as f64;
        metrics.insert(format!("{prefix}_loss"), loss);
        metrics.insert(format!("{prefix}_ppl"), loss.exp());
    }
    Ok(metrics)
}
