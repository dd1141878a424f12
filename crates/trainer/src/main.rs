use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use candle_core::{DType, Device};
use clap::{Parser, Subcommand};
use cpeft_core::{
    device::parse_device,
    loader::{self, ModelFiles},
    models::{GenerationConfig, Seq2SeqModel, T5ForConditionalGeneration},
    peft::{load_artifact, AdapterConfig, PeftModel, CONFIG_NAME, DEFAULT_ADAPTER_NAME},
    tokenizer::TokenizerWrapper,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

use cpeft_trainer::data::{build_loaders, DataLoaders, Encoder};
use cpeft_trainer::logging;
use cpeft_trainer::metrics::{ExactMatch, MetricsProvider};
use cpeft_trainer::tracker::{ExperimentTracker, LocalTracker, NoopTracker};
use cpeft_trainer::{evaluate, RunConfig, RunOverrides, TaskMetrics, TrackerKind, Trainer};

#[derive(Parser)]
#[command(name = "cpeft-train", about = "Prompt tuning and ATTEMPT adapters for seq2seq models")]
struct Cli {
    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train an adapter, checkpoint the best epoch and run the test split
    Train {
        /// Run file (TOML)
        #[arg(long)]
        config: PathBuf,

        /// Base model (hub id or local directory)
        #[arg(long)]
        model: Option<String>,

        /// Comma-separated task names
        #[arg(long, value_delimiter = ',')]
        datasets: Option<Vec<String>>,

        #[arg(long)]
        data_dir: Option<PathBuf>,

        #[arg(long)]
        output_dir: Option<PathBuf>,

        #[arg(long)]
        num_epochs: Option<usize>,

        #[arg(long)]
        learning_rate: Option<f64>,

        #[arg(long)]
        batch_size: Option<usize>,

        /// Cap on training examples per task; 0 skips training
        #[arg(long)]
        max_train_samples: Option<usize>,

        /// auto, cpu, cuda[:N] or metal[:N]
        #[arg(long)]
        device: Option<String>,

        #[arg(long)]
        timestamp: Option<String>,

        #[arg(long)]
        run: Option<usize>,

        /// Test the final adapter instead of reloading the best checkpoint
        #[arg(long)]
        no_load_model: bool,

        /// Disable the local experiment tracker
        #[arg(long)]
        no_tracker: bool,
    },
    /// Evaluate a saved adapter on the validation and test splits
    Evaluate {
        /// Run file (TOML)
        #[arg(long)]
        config: PathBuf,

        /// Adapter directory; defaults to best_model_path from the run file
        #[arg(long)]
        adapter: Option<PathBuf>,

        #[arg(long)]
        device: Option<String>,
    },
    /// List the tensors and config of a saved adapter
    Inspect {
        /// Adapter directory
        dir: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_with_level(&cli.log_level);

    match cli.command {
        Command::Train {
            config,
            model,
            datasets,
            data_dir,
            output_dir,
            num_epochs,
            learning_rate,
            batch_size,
            max_train_samples,
            device,
            timestamp,
            run,
            no_load_model,
            no_tracker,
        } => {
            let overrides = RunOverrides {
                model_name_or_path: model,
                datasets,
                data_dir,
                output_dir,
                num_epochs,
                learning_rate,
                batch_size,
                max_train_samples,
                device,
                timestamp,
                run,
                load_model: no_load_model.then_some(false),
                tracker: no_tracker.then_some(TrackerKind::None),
            };
            let config = load_run_config(&config, &overrides)?;
            train(&config)
        }
        Command::Evaluate {
            config,
            adapter,
            device,
        } => {
            let overrides = RunOverrides {
                device,
                ..Default::default()
            };
            let config = load_run_config(&config, &overrides)?;
            let adapter = adapter
                .or_else(|| config.best_model_path.clone())
                .context("no --adapter given and the run file has no best_model_path")?;
            evaluate_adapter(&config, &adapter)
        }
        Command::Inspect { dir } => inspect(&dir),
    }
}

fn load_run_config(path: &Path, overrides: &RunOverrides) -> anyhow::Result<RunConfig> {
    let mut config = RunConfig::load_from(path)
        .with_context(|| format!("failed to load run config {}", path.display()))?;
    config.merge(overrides);
    config.validate()?;
    Ok(config)
}

struct Session {
    device: Device,
    base: Arc<T5ForConditionalGeneration>,
    tokenizer: TokenizerWrapper,
}

fn open_session(config: &RunConfig) -> anyhow::Result<Session> {
    let device = parse_device(&config.device)?;
    let files: ModelFiles = loader::fetch_model(&config.model_name_or_path)?;
    let tokenizer_path = files
        .tokenizer
        .clone()
        .with_context(|| format!("{} has no tokenizer.json", files.name_or_path))?;
    let tokenizer = TokenizerWrapper::from_file(&tokenizer_path)?;
    let base = loader::load_t5(&files, DType::F32, &device)?;
    info!(model = %files.name_or_path, device = ?device, "loaded base model");
    Ok(Session {
        device,
        base: Arc::new(base),
        tokenizer,
    })
}

fn data_loaders(config: &RunConfig, session: &Session) -> anyhow::Result<DataLoaders> {
    let model_config = session.base.config();
    let encoder = Encoder {
        tokenizer: &session.tokenizer,
        max_source_length: config.max_source_length,
        max_target_length: config.max_target_length,
        eos_token_id: model_config.eos_token_id,
    };
    let mut rng = StdRng::seed_from_u64(config.seed);
    Ok(build_loaders(
        config,
        &encoder,
        model_config.pad_token_id,
        &session.device,
        &mut rng,
    )?)
}

fn exact_match_per_task(config: &RunConfig, session: &Session) -> TaskMetrics {
    let model_config = session.base.config();
    config
        .datasets
        .iter()
        .map(|task| {
            let provider: Box<dyn MetricsProvider> = Box::new(ExactMatch::new(
                model_config.pad_token_id,
                model_config.eos_token_id,
            ));
            (task.clone(), provider)
        })
        .collect()
}

fn tracker_for(config: &RunConfig) -> Box<dyn ExperimentTracker> {
    match config.tracker {
        TrackerKind::Local => Box::new(LocalTracker::new(&config.tracker_dir)),
        TrackerKind::None => Box::new(NoopTracker),
    }
}

fn train(config: &RunConfig) -> anyhow::Result<()> {
    let session = open_session(config)?;
    let loaders = data_loaders(config, &session)?;

    let mut adapter: AdapterConfig = config.adapter.clone();
    if adapter.seed.is_none() {
        adapter.seed = Some(config.seed);
    }
    let model = PeftModel::new(session.base.clone(), adapter, DEFAULT_ADAPTER_NAME)?;

    let mut trainer = Trainer::new(
        model,
        config,
        loaders,
        exact_match_per_task(config, &session),
        tracker_for(config),
    )?;
    let metrics = trainer.run()?;

    if let Some(best) = trainer.best_model_path() {
        println!("best adapter: {}", best.display());
    }
    for (name, value) in &metrics {
        println!("{name:<40} {value:.4}");
    }
    Ok(())
}

fn evaluate_adapter(config: &RunConfig, adapter: &Path) -> anyhow::Result<()> {
    let session = open_session(config)?;
    let loaders = data_loaders(config, &session)?;
    let model = PeftModel::from_pretrained(session.base.clone(), adapter, DEFAULT_ADAPTER_NAME)?;

    let generation = GenerationConfig {
        max_new_tokens: config.max_target_length,
        num_beams: config.num_beams,
        ..Default::default()
    };
    let mut metrics_fn = exact_match_per_task(config, &session);
    let mut metrics = evaluate(&model, &loaders.valid, &mut metrics_fn, "valid", &generation)?;
    metrics.extend(evaluate(&model, &loaders.test, &mut metrics_fn, "test", &generation)?);

    for (name, value) in &metrics {
        println!("{name:<40} {value:.4}");
    }
    Ok(())
}

fn inspect(dir: &Path) -> anyhow::Result<()> {
    let config = AdapterConfig::from_pretrained(dir)?;
    println!("{CONFIG_NAME}:");
    println!("{}", serde_json::to_string_pretty(&config)?);

    let tensors = load_artifact(dir, Some(&Device::Cpu))?;
    let mut names: Vec<&String> = tensors.keys().collect();
    names.sort();
    println!("tensors:");
    for name in names {
        let tensor = &tensors[name];
        println!("  {name:<48} {:?} {:?}", tensor.dims(), tensor.dtype());
    }
    Ok(())
}
