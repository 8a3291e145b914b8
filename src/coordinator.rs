use std::sync::Arc;

use plugin_api::{
    message::{Description, InvocationRequest, Series},
    net::{bind_in_range, join_host_port},
    server::serve,
};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{error, info, warn};

use crate::{
    broker::{BrokerStatus, LaunchEnv},
    config::CoordinatorConfig,
    connector::Connector,
    error::{ConfigError, OrchestratorError, RegistryError},
    registry::BrokerRegistry,
};

/// Outcome of [`Coordinator::start`]: one human readable line per step and
/// the first error, if any step failed.
#[derive(Debug, Default)]
pub struct StartReport {
    pub messages: Vec<String>,
    pub error: Option<OrchestratorError>,
}

impl StartReport {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

struct Listening {
    port: u16,
    server: JoinHandle<()>,
}

/// Launches the registered plugins and routes calls to them.
pub struct Coordinator {
    config: CoordinatorConfig,
    registry: Arc<BrokerRegistry>,
    registration_errors: Vec<RegistryError>,
    listening: Mutex<Option<Listening>>,
}

impl Coordinator {
    /// Validates `config` and registers every plugin path. Duplicate names
    /// are collected, not fatal; see [`registration_error`](Self::registration_error).
    pub fn new(config: CoordinatorConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut registry = BrokerRegistry::new();
        let mut registration_errors = Vec::new();
        for path in &config.plugins {
            if let Err(e) = registry.register(path) {
                warn!("{e}");
                registration_errors.push(e);
            }
        }

        Ok(Self {
            config,
            registry: Arc::new(registry),
            registration_errors,
            listening: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<BrokerRegistry> {
        &self.registry
    }

    pub fn registration_errors(&self) -> &[RegistryError] {
        &self.registration_errors
    }

    /// All registration conflicts folded into one error.
    pub fn registration_error(&self) -> Option<OrchestratorError> {
        if self.registration_errors.is_empty() {
            return None;
        }
        let joined = self
            .registration_errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        Some(OrchestratorError::Registration(joined))
    }

    /// Port of the orchestrator listener once started.
    pub async fn port(&self) -> Option<u16> {
        self.listening.lock().await.as_ref().map(|l| l.port)
    }

    /// Binds the orchestrator listener, then launches every plugin in
    /// registration order, each one waiting for its handshake.
    pub async fn start(&self) -> StartReport {
        let mut report = StartReport::default();

        // 1) orchestrator listener
        let port = match self.listen().await {
            Ok(port) => port,
            Err(e) => {
                error!("could not launch orchestrator: {e}");
                report.messages.push("Could not launch orchestrator".into());
                report.error = Some(e);
                return report;
            }
        };
        report.messages.push(format!("Orchestrator started on port {port}."));

        // 2) plugins, sequentially
        let env = self.launch_env(port);
        for broker in self.registry.iter() {
            match broker.spinup(&env).await {
                Ok(()) => {
                    info!(plugin = %broker.name(), "plugin loaded");
                    report.messages.push(format!("Plugin {} successfully loaded.", broker.name()));
                }
                Err(e) => {
                    warn!(plugin = %broker.name(), "plugin could not be loaded: {e}");
                    report.messages.push(format!("Plugin {} could not be loaded: {e}.", broker.name()));
                    if report.error.is_none() {
                        report.error = Some(OrchestratorError::plugin(broker.name(), e));
                    }
                }
            }
        }
        report.messages.push("All plugins loaded".into());
        report
    }

    /// Launches one plugin again, typically after it crashed.
    pub async fn respawn(&self, name: &str) -> Result<(), OrchestratorError> {
        let port = self
            .port()
            .await
            .ok_or_else(|| OrchestratorError::Config(ConfigError::Invalid("orchestrator not started".into())))?;
        let broker = self
            .registry
            .get(name)
            .ok_or_else(|| OrchestratorError::BrokerNotFound(name.to_string()))?;
        broker
            .spinup(&self.launch_env(port))
            .await
            .map_err(|e| OrchestratorError::plugin(name, e))
    }

    async fn listen(&self) -> Result<u16, OrchestratorError> {
        let mut listening = self.listening.lock().await;
        if let Some(l) = listening.as_ref() {
            return Ok(l.port);
        }
        let cfg = &self.config;
        let (listener, port) = bind_in_range(&cfg.address, cfg.min_port, cfg.max_port).await?;
        info!(address = %cfg.address, port, "orchestrator listening");

        let connector = Arc::new(Connector::new(Arc::clone(&self.registry), cfg.address.clone()));
        let server = tokio::spawn(serve(listener, connector));
        *listening = Some(Listening { port, server });
        Ok(port)
    }

    fn launch_env(&self, port: u16) -> LaunchEnv {
        LaunchEnv {
            conn_string: join_host_port(&self.config.address, port),
            min_port: self.config.min_port,
            max_port: self.config.max_port,
        }
    }

    // ---- invocation interface ----

    pub async fn describe(&self, name: &str) -> Result<Description, OrchestratorError> {
        let broker = self
            .registry
            .get(name)
            .ok_or_else(|| OrchestratorError::BrokerNotFound(name.to_string()))?;
        broker.describe().await.map_err(|e| OrchestratorError::plugin(name, e))
    }

    /// Runs `name` and flattens every failure, transport or business, into
    /// its message.
    pub async fn invoke(&self, name: &str, request: &InvocationRequest) -> Result<Vec<Series>, String> {
        let broker = self.registry.get(name).ok_or_else(|| format!("{name} does not exist"))?;
        let response = broker.run(request).await.map_err(|e| e.to_string())?;
        response.into_result()
    }

    pub async fn brokers(&self) -> Vec<BrokerStatus> {
        self.registry.snapshot().await
    }

    /// Stops the listener and every plugin process.
    pub async fn shutdown(&self) {
        if let Some(l) = self.listening.lock().await.take() {
            l.server.abort();
        }
        for broker in self.registry.iter() {
            broker.stop().await;
        }
        info!("orchestrator shut down");
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if let Some(l) = self.listening.get_mut().take() {
            l.server.abort();
        }
    }
}
