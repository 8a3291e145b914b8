//! Client-side runtime linked into every plugin executable.
//!
//! A plugin binary only has to implement [`Exposer`] and hand it to
//! [`PluginRuntime::run`]:
//!
//! ```ignore
//! use plugin_api::plugin_runtime::PluginRuntime;
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     PluginRuntime::new()?.run(MyPlugin::default()).await?;
//!     Ok(())
//! }
//! ```
//!
//! The runtime reads its connection parameters from the environment the
//! orchestrator prepared, binds its own listener in the shared port range,
//! serves `describe` / `run` / `ping`, calls `handshake` on the orchestrator
//! and then pings it periodically. As soon as a ping fails the runtime returns,
//! so a plugin never outlives its orchestrator.

use std::{path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    client::RpcClient,
    jsonrpc::{Method, RpcError},
    message::{Description, Fingerprint, InvocationRequest, InvocationResponse},
    net::{bind_in_range, host_of, BindError},
    server::{parse_params, serve, RpcService, ServiceError},
};

pub const ENV_CONN_STRING: &str = "ORCHESTRATOR_CONN_STRING";
pub const ENV_MIN_PORT: &str = "PLUGIN_MIN_PORT";
pub const ENV_MAX_PORT: &str = "PLUGIN_MAX_PORT";

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);

// -----------------------------------------------------------------------------
// Exposer trait – implement this in your plugin code
// -----------------------------------------------------------------------------

/// The business logic a plugin exposes to the orchestrator.
#[async_trait]
pub trait Exposer: Send + Sync + 'static {
    /// Static metadata about the plugin and the arguments it accepts.
    async fn describe(&self) -> Description;
    /// Handle one invocation. Failures go into `InvocationResponse::error`.
    async fn run(&self, request: InvocationRequest) -> InvocationResponse;
}

/// Plugin-side RPC service: answers `ping` itself and forwards `describe` and
/// `run` to the [`Exposer`].
pub struct PluginService<E: Exposer> {
    exposer: E,
}

impl<E: Exposer> PluginService<E> {
    pub fn new(exposer: E) -> Self {
        Self { exposer }
    }
}

#[async_trait]
impl<E: Exposer> RpcService for PluginService<E> {
    async fn dispatch(&self, method: Method, params: Option<Value>) -> Result<Value, ServiceError> {
        match method {
            Method::Ping => Ok(json!(true)),
            Method::Describe => Ok(json!(self.exposer.describe().await)),
            Method::Run => {
                let request: InvocationRequest = parse_params(params)?;
                Ok(json!(self.exposer.run(request).await))
            }
            Method::Handshake => Err(ServiceError::Unsupported(method)),
        }
    }
}

// -----------------------------------------------------------------------------
// Configuration
// -----------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Not enough data to build plugin: {0}. Do not start plugin from command line.")]
    MissingEnv(String),

    #[error("could not name plugin from program path `{0}`")]
    NoName(String),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("could not reach orchestrator: {0}")]
    Connect(RpcError),

    #[error("handshake failed: {0}")]
    Handshake(RpcError),

    #[error("handshake rejected by orchestrator")]
    HandshakeRejected,
}

/// Everything the orchestrator hands a plugin at launch time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub name: String,
    pub conn_string: String,
    /// Interface the plugin listener binds on, taken from `conn_string`.
    pub host: String,
    pub min_port: u16,
    pub max_port: u16,
    pub ping_interval: Duration,
}

impl RuntimeConfig {
    /// Read the process environment; the plugin name is the base filename of
    /// `argv[0]`, so a copied or symlinked binary runs as a separate plugin.
    pub fn from_env() -> Result<Self, RuntimeError> {
        let program = std::env::args().next().unwrap_or_default();
        Self::from_lookup(&program, |key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(program: &str, lookup: F) -> Result<Self, RuntimeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let name = Path::new(program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| RuntimeError::NoName(program.to_string()))?;

        let port = |key: &str| -> Result<u16, RuntimeError> {
            lookup(key)
                .and_then(|v| v.trim().parse::<u16>().ok())
                .filter(|p| *p != 0)
                .ok_or_else(|| RuntimeError::MissingEnv(format!("{key} is missing or not a port")))
        };
        let min_port = port(ENV_MIN_PORT)?;
        let max_port = port(ENV_MAX_PORT)?;

        let conn_string = lookup(ENV_CONN_STRING)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| RuntimeError::MissingEnv(format!("{ENV_CONN_STRING} is missing")))?;
        let host = host_of(&conn_string)
            .ok_or_else(|| RuntimeError::MissingEnv(format!("{ENV_CONN_STRING} `{conn_string}` is not host:port")))?
            .to_string();

        Ok(Self { name, conn_string, host, min_port, max_port, ping_interval: DEFAULT_PING_INTERVAL })
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }
}

// -----------------------------------------------------------------------------
// Runtime
// -----------------------------------------------------------------------------

pub struct PluginRuntime {
    config: RuntimeConfig,
}

impl PluginRuntime {
    /// Build from the environment; fails when the orchestrator did not launch us.
    pub fn new() -> Result<Self, RuntimeError> {
        Ok(Self { config: RuntimeConfig::from_env()? })
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Serve `exposer` until the orchestrator can no longer be pinged.
    pub async fn run<E: Exposer>(self, exposer: E) -> Result<(), RuntimeError> {
        let cfg = &self.config;

        // 1) own listener + service
        let (listener, port) = bind_in_range(&cfg.host, cfg.min_port, cfg.max_port).await?;
        info!(plugin = %cfg.name, port, "plugin listening");
        let server = tokio::spawn(serve(listener, Arc::new(PluginService::new(exposer))));

        // 2) handshake
        let client = match handshake(cfg, port).await {
            Ok(client) => client,
            Err(e) => {
                server.abort();
                return Err(e);
            }
        };
        info!(plugin = %cfg.name, "handshake with orchestrator at {} done", cfg.conn_string);

        // 3) liveness loop
        let mut ticker = tokio::time::interval(cfg.ping_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match client.call::<bool>(Method::Ping, None).await {
                Ok(true) => debug!(plugin = %cfg.name, "orchestrator alive"),
                Ok(false) => {
                    warn!(plugin = %cfg.name, "orchestrator refused ping, shutting down");
                    break;
                }
                Err(e) => {
                    warn!(plugin = %cfg.name, "orchestrator unreachable ({e}), shutting down");
                    break;
                }
            }
        }

        server.abort();
        Ok(())
    }
}

async fn handshake(cfg: &RuntimeConfig, port: u16) -> Result<RpcClient, RuntimeError> {
    let client = RpcClient::connect(&cfg.conn_string).await.map_err(RuntimeError::Connect)?;
    let fingerprint = Fingerprint { name: cfg.name.clone(), port };
    let params = serde_json::to_value(&fingerprint).map_err(|e| RuntimeError::Handshake(e.into()))?;
    let accepted: bool = client
        .call(Method::Handshake, Some(params))
        .await
        .map_err(RuntimeError::Handshake)?;
    if !accepted {
        return Err(RuntimeError::HandshakeRejected);
    }
    Ok(client)
}

/// Logging for plugin processes: stderr only, filtered by `RUST_LOG`.
pub fn init_plugin_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
