use clap::Parser;
use tracing_subscriber::EnvFilter;

use cronfleet::agent::Agent;
use cronfleet::config::AgentConfig;

#[derive(Parser, Debug)]
#[command(name = "cronfleet")]
#[command(about = "Distributed cron execution agent coordinated through etcd")]
struct Args {
    /// etcd endpoints (comma-separated, host:port)
    #[arg(long, default_value = "127.0.0.1:2379")]
    endpoints: String,

    /// Node identity; defaults to the local IP address
    #[arg(long)]
    node_id: Option<String>,

    /// Lease TTL and keep-alive period, in seconds
    #[arg(long, default_value = "10")]
    ttl: i64,

    /// Key prefix in the store
    #[arg(long, default_value = "/cronfleet")]
    prefix: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let endpoints: Vec<String> = args
        .endpoints
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let mut config = AgentConfig::new(endpoints)?
        .with_ttl(args.ttl)
        .with_prefix(args.prefix);
    if let Some(node_id) = args.node_id {
        config = config.with_node_id(node_id);
    }

    tracing::info!(
        node_id = %config.node_id,
        endpoints = ?config.endpoints,
        ttl = config.ttl,
        prefix = %config.prefix,
        "starting cronfleet agent"
    );

    let mut agent = Agent::new(config).await?;
    agent.register().await?;
    agent.run().await?;

    cronfleet::shutdown::wait_for_signal().await;
    agent.stop().await;

    Ok(())
}
