pub mod jsonrpc;
pub mod message;
pub mod net;
pub mod client;
pub mod server;
pub mod plugin_runtime;

pub use client::RpcClient;
pub use jsonrpc::{Method, RpcError};
pub use plugin_runtime::{Exposer, PluginRuntime, RuntimeConfig, RuntimeError};
