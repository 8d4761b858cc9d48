use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use ringmesh_node::backend::EchoBackend;
use ringmesh_node::{NodeConfig, NodeOrchestrator};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "ringmesh", version, about = "A ring-forwarding peer node for distributed transformer inference")]
struct Cli {
    /// Path to an explicit YAML config file, layered on top of the
    /// standard search paths.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node: discovery, inbound RPC server, orchestrator.
    Start,
    /// Print the effective configuration (after layering and defaults) as YAML.
    ShowConfig,
    /// Connect briefly, collect cluster topology, and print it as JSON.
    Topology {
        #[arg(long, default_value_t = 2)]
        max_depth: i32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = ringmesh_node::config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Start => run_start(config).await,
        Commands::ShowConfig => {
            println!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
        Commands::Topology { max_depth } => run_topology(config, max_depth).await,
    }
}

async fn run_start(config: NodeConfig) -> anyhow::Result<()> {
    let backend = Arc::new(EchoBackend::new("echo-dev"));
    let orchestrator = NodeOrchestrator::new(config, backend)?;
    let addr = orchestrator.start().await?;
    tracing::info!(%addr, "ringmesh node listening");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    orchestrator.stop().await;
    Ok(())
}

async fn run_topology(config: NodeConfig, max_depth: i32) -> anyhow::Result<()> {
    use ringmesh_node::server::RequestHandler;

    let backend = Arc::new(EchoBackend::new("echo-dev"));
    let orchestrator = NodeOrchestrator::new(config, backend)?;
    orchestrator.start().await?;
    // Give discovery a moment to find peers before collecting.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    let topology = orchestrator
        .handle_collect_topology(Vec::new(), max_depth)
        .await?;
    println!("{}", serde_json::to_string_pretty(&topology)?);
    orchestrator.stop().await;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}
