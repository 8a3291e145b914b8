use async_trait::async_trait;
use plugin_api::{
    message::{Argument, Description, InvocationRequest, InvocationResponse, Series},
    plugin_runtime::{init_plugin_logging, Exposer, PluginRuntime},
};
use serde_json::json;
use tracing::{error, info};

/// Hands every request body back as a single point.
#[derive(Default, Clone)]
pub struct EchoPlugin;

#[async_trait]
impl Exposer for EchoPlugin {
    async fn describe(&self) -> Description {
        Description {
            description: "Echoes the request body back as a single point".into(),
            author: "greentic".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            arguments: vec![
                Argument::optional("series", "Name of the returned series", "echo"),
                Argument::optional("repeat", "How many points to return", "1"),
            ],
        }
    }

    async fn run(&self, request: InvocationRequest) -> InvocationResponse {
        if request.body.is_empty() {
            return InvocationResponse::fail("nothing to echo, body is empty");
        }
        let repeat = match request.query_value("repeat").unwrap_or("1").parse::<usize>() {
            Ok(n) if n > 0 => n,
            _ => return InvocationResponse::fail("`repeat` must be a positive number"),
        };
        info!("[echo] {} byte(s) x{}", request.body.len(), repeat);

        let name = request.query_value("series").unwrap_or("echo").to_string();
        let points = (0..repeat).map(|i| vec![json!(i), json!(request.body)]).collect();
        InvocationResponse::ok(vec![Series {
            name,
            columns: vec!["sequence_number".into(), "body".into()],
            points,
        }])
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_plugin_logging();
    let runtime = PluginRuntime::new()?;
    if let Err(e) = runtime.run(EchoPlugin).await {
        error!("[echo] stopped: {e}");
        return Err(e.into());
    }
    Ok(())
}
