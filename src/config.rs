use std::path::{Path, PathBuf};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ConfigError;

pub const DEFAULT_ENV_PREFIX: &str = "ORCHESTRATOR";
pub const DEFAULT_ADDRESS: &str = "127.0.0.1";

/// What the orchestrator needs: where to listen, which ports plugins may
/// take and which executables to launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CoordinatorConfig {
    /// Interface for the orchestrator listener; plugins bind on it too.
    #[serde(default = "default_address")]
    pub address: String,
    pub min_port: u16,
    pub max_port: u16,
    #[serde(default)]
    pub plugins: Vec<PathBuf>,
}

fn default_address() -> String {
    DEFAULT_ADDRESS.to_string()
}

impl CoordinatorConfig {
    pub fn new<I, P>(plugins: I, min_port: u16, max_port: u16) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            address: default_address(),
            min_port,
            max_port,
            plugins: plugins.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Both ports must be set and ordered.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_port == 0 || self.max_port == 0 {
            return Err(ConfigError::Invalid(format!(
                "min port {} and max port {} must both be set",
                self.min_port, self.max_port
            )));
        }
        if self.min_port > self.max_port {
            return Err(ConfigError::Invalid(format!(
                "min port {} is above max port {}",
                self.min_port, self.max_port
            )));
        }
        if self.address.trim().is_empty() {
            return Err(ConfigError::Invalid("address is empty".into()));
        }
        Ok(())
    }

    /// Reads `<PREFIX>_PLUGINS`, `<PREFIX>_PLUGIN_MINPORT`,
    /// `<PREFIX>_PLUGIN_MAXPORT` and `<PREFIX>_PLUGIN_ADDRESS` from the
    /// process environment.
    pub fn from_env(prefix: &str) -> Self {
        Self::from_lookup(prefix, |key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) over any key lookup. Missing or
    /// unparsable ports come back as 0 and fail [`validate`](Self::validate).
    pub fn from_lookup<F>(prefix: &str, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let key = |suffix: &str| format!("{prefix}_{suffix}");
        let port = |suffix: &str| -> u16 {
            let name = key(suffix);
            match lookup(&name) {
                Some(raw) => raw.trim().parse().unwrap_or_else(|e| {
                    warn!("{name}={raw} is not a port: {e}");
                    0
                }),
                None => 0,
            }
        };

        let plugins = lookup(&key("PLUGINS"))
            .map(|raw| split_plugins(&raw))
            .unwrap_or_default();
        let address = lookup(&key("PLUGIN_ADDRESS"))
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .unwrap_or_else(default_address);

        Self {
            address,
            min_port: port("PLUGIN_MINPORT"),
            max_port: port("PLUGIN_MAXPORT"),
            plugins,
        }
    }
}

/// Comma separated list; blanks are skipped.
pub fn split_plugins(raw: &str) -> Vec<PathBuf> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Loads `env_file` into the process environment when it exists. Variables
/// already set win over the file.
pub fn load_env_file(env_file: &Path) -> bool {
    if !env_file.exists() {
        return false;
    }
    match dotenvy::from_path(env_file) {
        Ok(()) => {
            info!("Loaded .env from {}", env_file.display());
            true
        }
        Err(e) => {
            warn!("could not load .env from {}: {e}", env_file.display());
            false
        }
    }
}
