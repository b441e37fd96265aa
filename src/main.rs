use clap::Parser;
use registry_cluster::config::NodeConfig;
use registry_cluster::node::context::ServerNode;
use registry_cluster::node::status::NodeStatus;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Registry cluster node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the node's TOML config
    #[arg(long, short)]
    config: PathBuf,

    /// Log filter, e.g. `info` or `registry_cluster=debug`. Falls back to RUST_LOG.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match &cli.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match NodeConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::from(2);
        }
    };

    let node = match ServerNode::bind(config).await {
        Ok(node) => node,
        Err(e) => {
            tracing::error!("Node failed to start: {:#}", e);
            return ExitCode::from(1);
        }
    };

    tracing::info!("Press Ctrl+C to shutdown");

    let status = tokio::select! {
        status = node.wait_for_termination() => status,
        _ = tokio::signal::ctrl_c() => NodeStatus::ShuttingDown,
    };

    node.shutdown();

    match status {
        NodeStatus::Fatal => ExitCode::from(1),
        _ => ExitCode::SUCCESS,
    }
}
