use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "edgeward",
    version,
    about = "Edgeward - panel-driven proxy edge node agent"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path
    #[arg(short, long, global = true, default_value = "/etc/edgeward/config.yaml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the agent (default when no subcommand given)
    Run,

    /// Validate config file syntax and semantics
    Check,

    /// Generate a sample config file
    Generate {
        /// Output file path (default: stdout)
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Check) => cmd_check(&cli.config),
        Some(Commands::Generate { output }) => cmd_generate(output.as_deref()),
        Some(Commands::Run) | None => cmd_run(&cli.config).await,
    }
}

async fn cmd_run(config_path: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("edgeward starting");

    let config = edgeward::config::load_config(config_path)?;
    info!(nodes = config.nodes.len(), cores = config.cores.len(), "config loaded");

    let cores = edgeward::core::build_cores(&config.cores)?;
    let selector: Arc<dyn edgeward::core::Core> = Arc::new(edgeward::core::Selector::new(cores));
    selector.start().await?;

    let cert = Arc::new(edgeward::cert::CertService::new(None));
    let mut node = edgeward::node::Node::new();
    if let Err(e) = node.start(&config.nodes, selector.clone(), cert).await {
        selector.close().await.ok();
        return Err(e);
    }

    tokio::signal::ctrl_c().await?;
    info!("received ctrl-c, shutting down");
    node.close().await;
    selector.close().await?;
    info!("edgeward stopped");
    Ok(())
}

fn cmd_check(config_path: &str) -> Result<()> {
    match edgeward::config::load_config(config_path) {
        Ok(config) => {
            println!(
                "config ok: {} core(s), {} node(s)",
                config.cores.len(),
                config.nodes.len()
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("config invalid: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn cmd_generate(output: Option<&str>) -> Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, edgeward::config::SAMPLE_CONFIG)?;
            println!("sample config written to {}", path);
        }
        None => print!("{}", edgeward::config::SAMPLE_CONFIG),
    }
    Ok(())
}
