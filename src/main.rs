use clap::{Args, Parser, Subcommand};
use orchestrator::{
    config::{load_env_file, CoordinatorConfig, DEFAULT_ENV_PREFIX},
    logger::{init_tracing, LogConfig},
    schema::write_schema,
    Coordinator,
};
use plugin_api::message::InvocationRequest;
use std::path::PathBuf;
use tracing::{error, info};
use anyhow::{anyhow, bail};

#[derive(Parser, Debug)]
#[command(
    name = "orchestrator",
    about = "Launches plugin executables and routes calls to them",
    version
)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start every plugin and keep them running until Ctrl-C
    Run,

    /// Start, invoke one plugin and print its result records
    Call(CallArgs),

    /// Start and print one plugin's description
    Describe { plugin: String },

    /// Start and print the status of every plugin
    Status,

    /// Emit JSON-Schema for the wire records
    Schema {
        #[arg(long, default_value = "schemas")]
        out: PathBuf,
    },
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// Plugin executables, comma separated. Overrides `<PREFIX>_PLUGINS`
    #[arg(long, value_delimiter = ',', global = true)]
    plugins: Vec<PathBuf>,

    #[arg(long, global = true)]
    min_port: Option<u16>,

    #[arg(long, global = true)]
    max_port: Option<u16>,

    /// Interface to listen on, shared with the plugins
    #[arg(long, global = true)]
    address: Option<String>,

    /// Prefix of the configuration environment variables
    #[arg(long, default_value = DEFAULT_ENV_PREFIX, global = true)]
    env_prefix: String,

    #[arg(long, default_value = ".env", global = true)]
    env_file: PathBuf,

    /// Optional log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Also write daily rotated logs into this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Log JSON lines instead of text
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Args, Debug)]
struct CallArgs {
    plugin: String,

    #[arg(long, default_value = "")]
    body: String,

    /// Query argument as key=value; repeatable
    #[arg(long = "query", value_parser = parse_query)]
    query: Vec<(String, String)>,
}

fn parse_query(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("`{raw}` is not key=value"))
}

impl ConfigArgs {
    /// `.env`, then the environment, then flags.
    fn resolve(&self) -> CoordinatorConfig {
        load_env_file(&self.env_file);
        let mut cfg = CoordinatorConfig::from_env(&self.env_prefix);
        if !self.plugins.is_empty() {
            cfg.plugins = self.plugins.clone();
        }
        if let Some(port) = self.min_port {
            cfg.min_port = port;
        }
        if let Some(port) = self.max_port {
            cfg.max_port = port;
        }
        if let Some(address) = &self.address {
            cfg.address = address.clone();
        }
        cfg
    }

    fn log_config(&self) -> LogConfig {
        LogConfig {
            log_level: self.log_level.clone(),
            log_dir: self.log_dir.clone(),
            json: self.log_json,
        }
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Schema { out }) = &cli.command {
        let written = write_schema(out)?;
        println!("{} schemas written to {}", written.len(), out.display());
        return Ok(());
    }

    init_tracing(&cli.config.log_config())?;
    let coordinator = start(&cli.config).await?;

    let outcome = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&coordinator).await,
        Commands::Call(args) => {
            let mut request = InvocationRequest::new(args.body);
            for (key, value) in args.query {
                request = request.with_query(key, value);
            }
            match coordinator.invoke(&args.plugin, &request).await {
                Ok(series) => {
                    println!("{}", serde_json::to_string_pretty(&series)?);
                    Ok(())
                }
                Err(e) => Err(anyhow!(e)),
            }
        }
        Commands::Describe { plugin } => {
            let description = coordinator.describe(&plugin).await?;
            println!("{}", serde_json::to_string_pretty(&description)?);
            Ok(())
        }
        Commands::Status => {
            println!("{}", coordinator.registry().render().await);
            Ok(())
        }
        Commands::Schema { .. } => Ok(()),
    };

    coordinator.shutdown().await;
    outcome
}

/// Builds the coordinator and launches the plugins. Plugin failures are
/// reported, not fatal; configuration and listener failures are.
async fn start(args: &ConfigArgs) -> anyhow::Result<Coordinator> {
    let coordinator = Coordinator::new(args.resolve())?;
    if let Some(e) = coordinator.registration_error() {
        error!("{e}");
        eprintln!("{e}");
    }

    let report = coordinator.start().await;
    for line in &report.messages {
        println!("{line}");
    }
    if coordinator.port().await.is_none() {
        match report.error {
            Some(e) => bail!(e),
            None => bail!("orchestrator did not start"),
        }
    }
    Ok(coordinator)
}

async fn run(coordinator: &Coordinator) -> anyhow::Result<()> {
    println!("{}", coordinator.registry().render().await);
    info!("orchestrator running; press Ctrl-C to exit");
    println!("Orchestrator running; press Ctrl-C to exit");

    tokio::signal::ctrl_c().await?;

    println!("\nShutting down…");
    info!("orchestrator shutting down");
    Ok(())
}
