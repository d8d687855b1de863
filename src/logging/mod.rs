// Logging initialisation
//
// One global tracing subscriber, installed by `fazai daemon` after the config
// is loaded. `RUST_LOG` wins over the configured level when it is set.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install the global subscriber.
pub fn init(config: &LoggingConfig) -> Result<()> {
    init_with(&config.level, config.file.as_deref())
}

/// Install the global subscriber with an explicit level and optional
/// append-mode log file (stderr otherwise).
pub fn init_with(level: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| anyhow!("invalid log level '{}': {}", level, e))?;

    let writer = match log_file {
        Some(path) => {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir).ok();
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            BoxMakeWriter::new(file)
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("failed to set tracing subscriber: {}", e))
}

/// Check a configured level string before the daemon starts.
pub fn parse_level(level: &str) -> Result<LevelFilter> {
    if level.is_empty() {
        return Err(anyhow!("log level must not be empty"));
    }
    level
        .parse::<LevelFilter>()
        .map_err(|_| anyhow!("unrecognised log level: '{}'", level))
}
