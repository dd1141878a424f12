//! End-to-end runs of the trainer on a randomly initialised tiny T5.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use candle_core::Device;
use cpeft_core::models::T5ForConditionalGeneration;
use cpeft_core::peft::{
    extract_state, AdapterConfig, PeftModel, CONFIG_NAME, DEFAULT_ADAPTER_NAME, WEIGHTS_NAME,
};
use cpeft_core::testing::{random_frozen_t5, tiny_t5_config};
use cpeft_trainer::data::{batches, DataLoaders, Example, TaskLoader};
use cpeft_trainer::metrics::{ExactMatch, MetricsProvider};
use cpeft_trainer::tracker::{LocalTracker, NoopTracker};
use cpeft_trainer::{RunConfig, TaskMetrics, Trainer};

const TASK: &str = "rte";

fn example(source: &[u32], target: &[u32]) -> Example {
    Example {
        input_ids: source.to_vec(),
        labels: target.to_vec(),
        task_id: 0,
        extra: Default::default(),
    }
}

fn examples() -> Vec<Example> {
    vec![
        example(&[10, 11, 12, 1], &[30, 1]),
        example(&[13, 14, 1], &[31, 1]),
        example(&[15, 16, 17, 18, 1], &[30, 1]),
        example(&[19, 1], &[31, 1]),
    ]
}

fn loaders() -> DataLoaders {
    let examples = examples();
    let device = Device::Cpu;
    let split = |batch_size| TaskLoader {
        name: TASK.to_string(),
        batches: batches(&examples, batch_size, 0, &device).unwrap(),
    };
    DataLoaders {
        train: batches(&examples, 2, 0, &device).unwrap(),
        valid: vec![split(2)],
        test: vec![split(4)],
    }
}

fn peft_model() -> PeftModel<T5ForConditionalGeneration> {
    let base = Arc::new(random_frozen_t5(&tiny_t5_config(), &Device::Cpu).unwrap());
    let mut adapter = AdapterConfig::prompt_tuning(4);
    adapter.seed = Some(7);
    PeftModel::new(base, adapter, DEFAULT_ADAPTER_NAME).unwrap()
}

fn run_config(root: &Path) -> RunConfig {
    let mut config = RunConfig::new("tiny-t5", vec![TASK.to_string()], AdapterConfig::prompt_tuning(4));
    config.output_dir = root.join("checkpoints");
    config.tracker_dir = root.join("runs");
    config.num_epochs = 2;
    config.batch_size = 2;
    config.max_target_length = 4;
    config.timestamp = "t0".to_string();
    config
}

fn task_metrics() -> TaskMetrics {
    let mut metrics = TaskMetrics::new();
    let provider: Box<dyn MetricsProvider> = Box::new(ExactMatch::new(0, 1));
    metrics.insert(TASK.to_string(), provider);
    metrics
}

fn prompt_table(model: &PeftModel<T5ForConditionalGeneration>) -> Vec<Vec<f32>> {
    extract_state(model, DEFAULT_ADAPTER_NAME)
        .unwrap()
        .prompt_embeddings
        .to_single()
        .unwrap()
        .to_vec2::<f32>()
        .unwrap()
}

#[test]
fn run_trains_checkpoints_and_tests() {
    let root = tempfile::tempdir().unwrap();
    let config = run_config(root.path());
    let model = peft_model();
    let before = prompt_table(&model);

    let tracker = Box::new(LocalTracker::new(&config.tracker_dir));
    let mut trainer = Trainer::new(model, &config, loaders(), task_metrics(), tracker).unwrap();
    let metrics = trainer.run().unwrap();

    for key in [
        "train_loss",
        "train_ppl",
        "rte_valid_loss",
        "rte_valid_ppl",
        "rte_valid_exact_match",
        "avg_valid_loss",
        "rte_test_loss",
        "rte_test_exact_match",
        "avg_test_loss",
    ] {
        assert!(metrics.contains_key(key), "missing {key} in {metrics:?}");
    }
    let em = metrics["rte_test_exact_match"];
    assert!((0.0..=1.0).contains(&em));

    let checkpoint = config.checkpoint_dir();
    assert_eq!(trainer.best_model_path(), Some(&checkpoint));
    assert!(checkpoint.join(CONFIG_NAME).is_file());
    assert!(checkpoint.join(WEIGHTS_NAME).is_file());

    assert_ne!(before, prompt_table(trainer.model()));

    let run_dir = config.tracker_dir.join("cpeft").join(config.run_name());
    assert!(run_dir.join("config.json").is_file());
    let lines = fs::read_to_string(run_dir.join("metrics.jsonl")).unwrap();
    // one record per epoch plus the test record
    assert_eq!(lines.lines().count(), 3);
    assert!(run_dir
        .join("artifacts")
        .join(config.artifact_name())
        .join(WEIGHTS_NAME)
        .is_file());
}

#[test]
fn zero_train_samples_only_evaluates() {
    let root = tempfile::tempdir().unwrap();
    let mut config = run_config(root.path());
    config.max_train_samples = Some(0);
    config.num_epochs = 1;
    config.load_model = false;
    let model = peft_model();
    let before = prompt_table(&model);

    let mut trainer =
        Trainer::new(model, &config, loaders(), task_metrics(), Box::new(NoopTracker)).unwrap();
    let metrics = trainer.run().unwrap();

    assert!(!metrics.contains_key("train_loss"));
    assert!(metrics.contains_key("rte_valid_loss"));
    assert!(metrics.contains_key("avg_test_loss"));
    assert_eq!(before, prompt_table(trainer.model()));
}

#[test]
fn test_without_checkpoint_uses_current_adapter() {
    let root = tempfile::tempdir().unwrap();
    let config = run_config(root.path());
    let mut trainer =
        Trainer::new(peft_model(), &config, loaders(), task_metrics(), Box::new(NoopTracker)).unwrap();

    assert!(trainer.best_model_path().is_none());
    let metrics = trainer.test(true).unwrap();
    assert!(metrics.contains_key("rte_test_loss"));
    assert!(!config.checkpoint_dir().exists());
}
