use std::sync::Arc;

use async_trait::async_trait;
use plugin_api::{
    message::Fingerprint,
    server::{parse_params, RpcService, ServiceError},
    Method,
};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::{error::OrchestratorError, registry::BrokerRegistry};

/// The orchestrator's own RPC service: plugins call `handshake` once and
/// `ping` periodically.
pub struct Connector {
    registry: Arc<BrokerRegistry>,
    /// Host the plugins listen on; used to dial back.
    host: String,
}

impl Connector {
    pub fn new(registry: Arc<BrokerRegistry>, host: impl Into<String>) -> Self {
        Self { registry, host: host.into() }
    }

    pub async fn handshake(&self, fingerprint: Fingerprint) -> Result<bool, OrchestratorError> {
        info!(plugin = %fingerprint.name, port = fingerprint.port, "handshake");
        let broker = self
            .registry
            .get(&fingerprint.name)
            .ok_or_else(|| OrchestratorError::BrokerNotFound(fingerprint.name.clone()))?;
        broker
            .handshake(fingerprint.port, &self.host)
            .await
            .map_err(|e| OrchestratorError::plugin(&fingerprint.name, e))
    }

    pub fn ping(&self) -> bool {
        true
    }
}

#[async_trait]
impl RpcService for Connector {
    async fn dispatch(&self, method: Method, params: Option<Value>) -> Result<Value, ServiceError> {
        match method {
            Method::Handshake => {
                let fingerprint: Fingerprint = parse_params(params)?;
                match self.handshake(fingerprint).await {
                    Ok(accepted) => Ok(json!(accepted)),
                    Err(e) => {
                        warn!("handshake refused: {e}");
                        Err(ServiceError::Failed(e.to_string()))
                    }
                }
            }
            Method::Ping => Ok(json!(self.ping())),
            other => Err(ServiceError::Unsupported(other)),
        }
    }
}
