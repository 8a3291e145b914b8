pub mod broker;
pub mod config;
pub mod connector;
pub mod coordinator;
pub mod error;
pub mod logger;
pub mod registry;
pub mod schema;
pub mod telemetry;

pub use broker::{BrokerStatus, PluginBroker, State};
pub use config::CoordinatorConfig;
pub use coordinator::{Coordinator, StartReport};
pub use error::{BrokerError, ConfigError, OrchestratorError, RegistryError};
