//! DGI Broker -- single binary grid agent.
//!
//! Usage:
//!   dgi-broker                      # Run with ./dgi.toml (or defaults)
//!   dgi-broker --config path.toml   # Run with custom config
//!   dgi-broker identity             # Show agent identity
//!   dgi-broker peers                # Show configured peers

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use dgi_broker::config::NodeConfig;
use dgi_broker::device::{register_desd_handler, Desd};
use dgi_broker::profile::schedule_profile_reload;
use dgi_broker::{expand_tilde, Broker, ConnectionManager, Dispatcher};

#[derive(Parser)]
#[command(name = "dgi-broker", about = "DGI peer agent broker")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "dgi.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent (default)
    Run,
    /// Show this agent's identity
    Identity,
    /// List configured peers
    Peers,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dgi_broker=info,dgi_protocol=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let cfg = NodeConfig::load_or_default(&config_path)?;
    cfg.validate()?;

    match cli.command {
        Some(Commands::Run) | None => run_agent(cfg).await?,
        Some(Commands::Identity) => {
            println!("Identity: {}", cfg.identity()?);
            println!("Listen:   {}", cfg.listen_addr()?);
            if let Some(addr) = cfg.advertise_addr()? {
                println!("Advertise: {addr}");
            }
        }
        Some(Commands::Peers) => {
            let peers = cfg.peers()?;
            if peers.is_empty() {
                println!("No peers configured");
            }
            for peer in peers {
                let reliability = peer
                    .reliability
                    .map(i64::from)
                    .unwrap_or(cfg.network.default_reliability);
                println!("{}  {}  reliability={}", peer.identity, peer.addr, reliability);
            }
        }
    }

    Ok(())
}

async fn run_agent(cfg: NodeConfig) -> anyhow::Result<()> {
    let broker_config = cfg.broker_config()?;
    tracing::info!(
        identity = %broker_config.identity,
        version = env!("CARGO_PKG_VERSION"),
        listen = %broker_config.listen_addr,
        simulate_loss = cfg.network.simulate_loss,
        peers = cfg.peers.len(),
        "starting dgi-broker"
    );

    let manager = ConnectionManager::with_limits(
        cfg.loss_policy(),
        cfg.network.default_reliability,
        cfg.network.max_peers,
    )?;
    for peer in cfg.peers()? {
        manager.put_host(peer.identity.clone(), peer.addr).await;
        if let Some(reliability) = peer.reliability {
            manager
                .apply_reliability(&peer.identity, i64::from(reliability))
                .await?;
        }
    }

    let dispatcher = Dispatcher::new();
    let desd = Arc::new(Desd::new(format!("{}-desd", broker_config.identity)));
    register_desd_handler(&dispatcher, desd.clone());

    let broker = Broker::bind(broker_config, manager, dispatcher).await?;

    if let Some(profile) = &cfg.network.profile {
        let path = expand_tilde(profile);
        tracing::info!(
            path = %path.display(),
            every_secs = cfg.network.profile_reload_secs,
            "reliability profile enabled"
        );
        schedule_profile_reload(
            &broker,
            path,
            Duration::from_secs(cfg.network.profile_reload_secs),
        );
    }

    let stopper = broker.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("ctrl-c handler failed: {e}");
            return;
        }
        tracing::info!("interrupt received, shutting down");
        stopper.stop();
    });

    broker.run().await?;
    tracing::info!(storage = desd.storage(), "dgi-broker stopped");
    Ok(())
}
