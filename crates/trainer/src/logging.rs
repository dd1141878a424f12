//! Logging setup for the training binary.
//!
//! Two output modes:
//! - Pretty-printed human-readable logs (default)
//! - JSON logs for aggregation, with `CPEFT_LOG_FORMAT=json`
//!
//! `RUST_LOG` controls levels (default: info).

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

pub const LOG_FORMAT_ENV: &str = "CPEFT_LOG_FORMAT";

/// Log format mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }

    /// Detect log format from `CPEFT_LOG_FORMAT`.
    pub fn from_env() -> Self {
        Self::parse(&std::env::var(LOG_FORMAT_ENV).unwrap_or_default())
    }
}

pub fn init() -> bool {
    init_with_level_and_format(None, LogFormat::from_env())
}

/// `level` is used when `RUST_LOG` is unset.
pub fn init_with_level(level: &str) -> bool {
    init_with_level_and_format(Some(level), LogFormat::from_env())
}

/// Install the global subscriber.
///
/// Returns `false` when one was already installed, which leaves the
/// existing subscriber in place.
pub fn init_with_level_and_format(level: Option<&str>, format: LogFormat) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info")));

    let installed = match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init(),
    };
    installed.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_format() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse(""), LogFormat::Pretty);
    }

    #[test]
    fn second_init_is_harmless() {
        init_with_level_and_format(Some("warn"), LogFormat::Pretty);
        assert!(!init_with_level_and_format(Some("warn"), LogFormat::Json));
    }
}
