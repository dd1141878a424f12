//! Experiment tracking.
//!
//! Tracker calls are fire-and-forget from the trainer's side: failures are
//! logged and never abort a run.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use crate::metrics::Metrics;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker used before init")]
    NotInitialised,
    #[error("IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> TrackerError + '_ {
    move |source| TrackerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub trait ExperimentTracker {
    fn init(&mut self, project: &str, config: &serde_json::Value, run_name: &str) -> Result<(), TrackerError>;

    fn log(&mut self, metrics: &Metrics) -> Result<(), TrackerError>;

    /// Record the contents of `dir` under `name`.
    fn log_artifact(&mut self, dir: &Path, name: &str) -> Result<(), TrackerError>;

    fn finish(&mut self) -> Result<(), TrackerError>;
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NoopTracker;

impl ExperimentTracker for NoopTracker {
    fn init(&mut self, _project: &str, _config: &serde_json::Value, _run_name: &str) -> Result<(), TrackerError> {
        Ok(())
    }

    fn log(&mut self, _metrics: &Metrics) -> Result<(), TrackerError> {
        Ok(())
    }

    fn log_artifact(&mut self, _dir: &Path, _name: &str) -> Result<(), TrackerError> {
        Ok(())
    }

    fn finish(&mut self) -> Result<(), TrackerError> {
        Ok(())
    }
}

/// Writes runs to disk:
///
/// ```text
/// {root}/{project}/{run_name}/
///   config.json
///   metrics.jsonl          one {"step": n, ...metrics} object per log call
///   artifacts/{name}/      copies of logged directories
/// ```
#[derive(Debug)]
pub struct LocalTracker {
    root: PathBuf,
    run_dir: Option<PathBuf>,
    step: usize,
}

impl LocalTracker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            run_dir: None,
            step: 0,
        }
    }

    pub fn run_dir(&self) -> Option<&Path> {
        self.run_dir.as_deref()
    }

    fn require_run_dir(&self) -> Result<&Path, TrackerError> {
        self.run_dir.as_deref().ok_or(TrackerError::NotInitialised)
    }
}

/// Run names may contain hub ids like `google/flan-t5-base`.
fn path_component(name: &str) -> String {
    name.replace(['/', '\\'], "-")
}

fn copy_dir(src: &Path, dst: &Path) -> Result<(), TrackerError> {
    fs::create_dir_all(dst).map_err(io_err(dst))?;
    for entry in fs::read_dir(src).map_err(io_err(src))? {
        let entry = entry.map_err(io_err(src))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if from.is_dir() {
            copy_dir(&from, &to)?;
        } else {
            fs::copy(&from, &to).map_err(io_err(&from))?;
        }
    }
    Ok(())
}

impl ExperimentTracker for LocalTracker {
    fn init(&mut self, project: &str, config: &serde_json::Value, run_name: &str) -> Result<(), TrackerError> {
        let run_dir = self
            .root
            .join(path_component(project))
            .join(path_component(run_name));
        fs::create_dir_all(&run_dir).map_err(io_err(&run_dir))?;

        let config_path = run_dir.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(config)?).map_err(io_err(&config_path))?;

        info!(run = run_name, dir = %run_dir.display(), "tracking run locally");
        self.run_dir = Some(run_dir);
        self.step = 0;
        Ok(())
    }

    fn log(&mut self, metrics: &Metrics) -> Result<(), TrackerError> {
        let path = self.require_run_dir()?.join("metrics.jsonl");
        let mut record = json!({ "step": self.step });
        if let Some(object) = record.as_object_mut() {
            for (name, value) in metrics {
                object.insert(name.clone(), json!(value));
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err(&path))?;
        writeln!(file, "{}", serde_json::to_string(&record)?).map_err(io_err(&path))?;
        self.step += 1;
        Ok(())
    }

    fn log_artifact(&mut self, dir: &Path, name: &str) -> Result<(), TrackerError> {
        let target = self
            .require_run_dir()?
            .join("artifacts")
            .join(path_component(name));
        if target.exists() {
            fs::remove_dir_all(&target).map_err(io_err(&target))?;
        }
        copy_dir(dir, &target)?;
        debug!(artifact = name, dir = %target.display(), "logged artifact");
        Ok(())
    }

    fn finish(&mut self) -> Result<(), TrackerError> {
        if let Some(dir) = self.run_dir.take() {
            info!(dir = %dir.display(), steps = self.step, "finished run");
        }
        Ok(())
    }
}
