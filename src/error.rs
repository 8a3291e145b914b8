use plugin_api::{net::BindError, RpcError};
use thiserror::Error;

use crate::broker::State;

/// Invalid or missing coordinator configuration. Aborts construction.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Insufficient orchestrator configuration: {0}")]
    Invalid(String),
}

/// A plugin path could not be registered. Never fatal for the other paths.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Plugin '{name}' is already registered, '{path}' not registered.")]
    Duplicate { name: String, path: String },

    #[error("could not derive a plugin name from '{0}'")]
    NoName(String),
}

/// Failures of one plugin's lifecycle or of a call routed through its broker.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BrokerError {
    #[error("plugin executable {path} not found: {message}")]
    MissingExecutable { path: String, message: String },

    #[error("could not start {path}: {message}")]
    Spawn { path: String, message: String },

    #[error("Plugin ended")]
    PluginEnded,

    #[error("Plugin not yet connected")]
    NotConnected,

    #[error("plugin {0} is already launched")]
    AlreadyLaunched(String),

    #[error("unexpected handshake for plugin {name} in state {state}")]
    UnexpectedHandshake { name: String, state: State },

    #[error("Plugin could not be pinged: {0}")]
    PingFailed(String),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Bind(#[from] BindError),

    /// Aggregated registration conflicts.
    #[error("{0}")]
    Registration(String),

    #[error("Plugin broker not found for {0}")]
    BrokerNotFound(String),

    #[error("plugin {name}: {source}")]
    Plugin {
        name: String,
        #[source]
        source: BrokerError,
    },
}

impl OrchestratorError {
    pub fn plugin(name: impl Into<String>, source: BrokerError) -> Self {
        OrchestratorError::Plugin { name: name.into(), source }
    }
}
