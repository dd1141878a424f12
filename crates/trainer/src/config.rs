//! Run configuration for the training orchestrator.
//!
//! Configuration is resolved with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Run file (`run.toml`)
//! 3. Default values (lowest priority)

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use cpeft_core::peft::AdapterConfig;
use serde::{Deserialize, Serialize};

/// Where run metrics and artifacts are recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerKind {
    #[default]
    Local,
    None,
}

/// Immutable settings of one training run, stored as TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Hub id or local directory of the frozen base model.
    pub model_name_or_path: String,
    /// Task names, in evaluation order. Each is a directory under `data_dir`.
    pub datasets: Vec<String>,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default = "default_num_epochs")]
    pub num_epochs: usize,
    #[serde(default)]
    pub warmup_steps: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_max_source_length")]
    pub max_source_length: usize,
    /// Also the generation budget during evaluation.
    #[serde(default = "default_max_target_length")]
    pub max_target_length: usize,
    /// Cap on training examples per task. `0` skips training entirely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_train_samples: Option<usize>,
    #[serde(default = "default_num_beams")]
    pub num_beams: usize,

    /// `auto`, `cpu`, `cuda[:N]` or `metal[:N]`.
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Distinguishes runs; part of the run and checkpoint names.
    #[serde(default = "default_timestamp")]
    pub timestamp: String,
    #[serde(default)]
    pub run: usize,

    /// Reload the best checkpoint before the test pass.
    #[serde(default = "default_true")]
    pub load_model: bool,
    /// Adapter evaluated by `cpeft-train evaluate` when none is given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_model_path: Option<PathBuf>,

    #[serde(default)]
    pub tracker: TrackerKind,
    #[serde(default = "default_project")]
    pub project: String,
    #[serde(default = "default_tracker_dir")]
    pub tracker_dir: PathBuf,

    pub adapter: AdapterConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

fn default_num_epochs() -> usize {
    10
}

fn default_learning_rate() -> f64 {
    0.3
}

fn default_batch_size() -> usize {
    8
}

fn default_max_source_length() -> usize {
    256
}

fn default_max_target_length() -> usize {
    128
}

fn default_num_beams() -> usize {
    1
}

fn default_device() -> String {
    "auto".to_string()
}

fn default_seed() -> u64 {
    42
}

fn default_timestamp() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
        .to_string()
}

fn default_true() -> bool {
    true
}

fn default_project() -> String {
    "cpeft".to_string()
}

fn default_tracker_dir() -> PathBuf {
    PathBuf::from("runs")
}

impl RunConfig {
    pub fn new(model_name_or_path: impl Into<String>, datasets: Vec<String>, adapter: AdapterConfig) -> Self {
        Self {
            model_name_or_path: model_name_or_path.into(),
            datasets,
            data_dir: default_data_dir(),
            output_dir: default_output_dir(),
            num_epochs: default_num_epochs(),
            warmup_steps: 0,
            learning_rate: default_learning_rate(),
            weight_decay: 0.0,
            batch_size: default_batch_size(),
            max_source_length: default_max_source_length(),
            max_target_length: default_max_target_length(),
            max_train_samples: None,
            num_beams: default_num_beams(),
            device: default_device(),
            seed: default_seed(),
            timestamp: default_timestamp(),
            run: 0,
            load_model: true,
            best_model_path: None,
            tracker: TrackerKind::default(),
            project: default_project(),
            tracker_dir: default_tracker_dir(),
            adapter,
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        fs::write(path, content).map_err(ConfigError::Io)?;
        Ok(())
    }

    /// Apply CLI overrides; set fields win.
    pub fn merge(&mut self, overrides: &RunOverrides) {
        if let Some(model) = &overrides.model_name_or_path {
            self.model_name_or_path = model.clone();
        }
        if let Some(datasets) = &overrides.datasets {
            self.datasets = datasets.clone();
        }
        if let Some(dir) = &overrides.data_dir {
            self.data_dir = dir.clone();
        }
        if let Some(dir) = &overrides.output_dir {
            self.output_dir = dir.clone();
        }
        if let Some(v) = overrides.num_epochs {
            self.num_epochs = v;
        }
        if let Some(v) = overrides.learning_rate {
            self.learning_rate = v;
        }
        if let Some(v) = overrides.batch_size {
            self.batch_size = v;
        }
        if overrides.max_train_samples.is_some() {
            self.max_train_samples = overrides.max_train_samples;
        }
        if let Some(device) = &overrides.device {
            self.device = device.clone();
        }
        if let Some(timestamp) = &overrides.timestamp {
            self.timestamp = timestamp.clone();
        }
        if let Some(v) = overrides.run {
            self.run = v;
        }
        if let Some(v) = overrides.load_model {
            self.load_model = v;
        }
        if let Some(v) = overrides.tracker {
            self.tracker = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model_name_or_path.is_empty() {
            return Err(ConfigError::Invalid("model_name_or_path is empty".into()));
        }
        if self.datasets.is_empty() {
            return Err(ConfigError::Invalid("datasets must name at least one task".into()));
        }
        if self.num_epochs == 0 {
            return Err(ConfigError::Invalid("num_epochs must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be positive".into()));
        }
        if self.max_source_length == 0 || self.max_target_length == 0 {
            return Err(ConfigError::Invalid("sequence lengths must be positive".into()));
        }
        if self.num_beams == 0 {
            return Err(ConfigError::Invalid("num_beams must be positive".into()));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }

    /// Training runs unless `max_train_samples` is explicitly 0.
    pub fn trains(&self) -> bool {
        self.max_train_samples != Some(0)
    }

    /// `{model}_{datasets}_{timestamp}_{run}[_{max_train_samples}]`
    pub fn run_name(&self) -> String {
        let mut name = format!(
            "{}_{}_{}_{}",
            self.model_name_or_path,
            self.datasets.join("_"),
            self.timestamp,
            self.run
        );
        if let Some(n) = self.max_train_samples {
            name.push_str(&format!("_{n}"));
        }
        name
    }

    /// `{datasets}_{timestamp}_{run}`; also the checkpoint directory name.
    pub fn artifact_name(&self) -> String {
        format!("{}_{}_{}", self.datasets.join("_"), self.timestamp, self.run)
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.output_dir.join(self.artifact_name())
    }
}

/// CLI overrides for [`RunConfig`]. Unset fields leave the file value alone.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub model_name_or_path: Option<String>,
    pub datasets: Option<Vec<String>>,
    pub data_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub num_epochs: Option<usize>,
    pub learning_rate: Option<f64>,
    pub batch_size: Option<usize>,
    pub max_train_samples: Option<usize>,
    pub device: Option<String>,
    pub timestamp: Option<String>,
    pub run: Option<usize>,
    pub load_model: Option<bool>,
    pub tracker: Option<TrackerKind>,
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading/writing the run file.
    Io(std::io::Error),
    /// Error parsing TOML.
    Parse(toml::de::Error),
    /// Error serializing to TOML.
    Serialize(toml::ser::Error),
    /// Values that parse but cannot drive a run.
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialize error: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
