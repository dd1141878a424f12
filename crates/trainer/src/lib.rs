pub mod config;
pub mod data;
pub mod logging;
pub mod metrics;
pub mod scheduler;
pub mod tracker;
pub mod trainer;

pub use config::{ConfigError, RunConfig, RunOverrides, TrackerKind};
pub use trainer::{evaluate, TaskMetrics, TrainError, Trainer};
