use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

pub const LOG_FILE: &str = "orchestrator.log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `"info"` or `"orchestrator=debug"`.
    pub log_level: String,
    /// Daily rotated text log under this directory, when set.
    pub log_dir: Option<PathBuf>,
    /// Emit stdout events as JSON lines instead of text.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { log_level: "info".into(), log_dir: None, json: false }
    }
}

/// Installs the global subscriber: stdout plus an optional rolling file.
///
/// `RUST_LOG` wins over `log_level` when set.
pub fn init_tracing(config: &LogConfig) -> Result<()> {
    // 1) Build an EnvFilter
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level)
            .with_context(|| format!("invalid log level `{}`", config.log_level))?,
    };

    // 2) stdout, text or json
    let stdout_layer = if config.json {
        fmt::layer().json().with_target(false).boxed()
    } else {
        fmt::layer().with_target(false).boxed()
    };

    // 3) optional rolling file
    let file_layer = match &config.log_dir {
        Some(dir) => {
            fs::create_dir_all(dir).with_context(|| format!("could not create log dir {}", dir.display()))?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE);
            Some(fmt::layer().with_ansi(false).with_writer(appender))
        }
        None => None,
    };

    Registry::default()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .context("tracing subscriber already installed")?;
    Ok(())
}
