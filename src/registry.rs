use std::{fmt::Write as _, path::Path, sync::Arc};

use tracing::debug;

use crate::{
    broker::{BrokerStatus, PluginBroker},
    error::RegistryError,
    telemetry::Telemetry,
};

/// Plugin name derived from an executable path: its base filename.
pub fn plugin_name(path: &Path) -> Option<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
}

/// Brokers by plugin name, in registration order. Names are unique.
#[derive(Debug, Default)]
pub struct BrokerRegistry {
    brokers: Vec<Arc<PluginBroker>>,
    telemetry: Telemetry,
}

impl BrokerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a broker for the executable at `path`.
    pub fn register(&mut self, path: impl AsRef<Path>) -> Result<Arc<PluginBroker>, RegistryError> {
        let path = path.as_ref();
        let name = plugin_name(path).ok_or_else(|| RegistryError::NoName(path.display().to_string()))?;
        if self.get(&name).is_some() {
            return Err(RegistryError::Duplicate { name, path: path.display().to_string() });
        }
        debug!(plugin = %name, path = %path.display(), "plugin registered");
        let broker = Arc::new(PluginBroker::new(name, path, self.telemetry.clone()));
        self.brokers.push(Arc::clone(&broker));
        Ok(broker)
    }

    pub fn get(&self, name: &str) -> Option<Arc<PluginBroker>> {
        self.brokers.iter().find(|b| b.name() == name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<PluginBroker>> {
        self.brokers.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.brokers.iter().map(|b| b.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.brokers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.brokers.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<BrokerStatus> {
        let mut out = Vec::with_capacity(self.brokers.len());
        for broker in &self.brokers {
            out.push(broker.status().await);
        }
        out
    }

    /// Every broker's status, one block per plugin.
    pub async fn render(&self) -> String {
        let mut out = String::new();
        for status in self.snapshot().await {
            let _ = writeln!(out, "{status}");
        }
        out
    }
}
