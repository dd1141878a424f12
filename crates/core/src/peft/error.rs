use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by adapter construction, the registry and persistence.
#[derive(Debug, Error)]
pub enum PeftError {
    /// Missing or contradictory adapter configuration.
    #[error("config error: {0}")]
    Config(String),
    #[error("unknown adapter: {0}")]
    UnknownAdapter(String),
    #[error("adapter name already in use: {0}")]
    DuplicateAdapter(String),
    #[error("state mismatch for '{key}': {reason}")]
    StateMismatch { key: String, reason: String },
    #[error("IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

impl PeftError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub(crate) fn mismatch(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StateMismatch {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// `NotFound` for a path that does not exist.
    pub(crate) fn not_found(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        Self::Io { path, source }
    }
}

pub type Result<T> = std::result::Result<T, PeftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_mismatch_display() {
        let err = PeftError::mismatch("prompt_embeddings", "expected [20, 768], got [10, 768]");
        let msg = err.to_string();
        assert!(msg.contains("prompt_embeddings"));
        assert!(msg.contains("expected [20, 768]"));
    }

    #[test]
    fn not_found_display_names_path() {
        let err = PeftError::not_found("/tmp/missing/adapter_model.bin");
        assert!(err.to_string().contains("/tmp/missing/adapter_model.bin"));
        assert!(matches!(err, PeftError::Io { ref source, .. } if source.kind() == std::io::ErrorKind::NotFound));
    }
}
