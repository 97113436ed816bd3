//! Oracle Node
//!
//! Runs one member of an oracle network over WebSocket, or generates the
//! key and config files for a local network.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use oracle_consensus::{
    KeyFile, KeyStore, NodeIndex, NodeOutput, OracleNodeBuilder, RandomWalk, WsTransport,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use config::NodeConfig;

/// Interval between stats log lines
const STATS_INTERVAL: Duration = Duration::from_secs(30);

/// Leader-driven oracle consensus node
#[derive(Parser, Debug)]
#[command(name = "oracle-node")]
#[command(about = "Oracle report consensus node", long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a node
    Run {
        /// This node's index in the key and peer tables
        #[arg(long)]
        index: NodeIndex,

        /// Network config file
        #[arg(long, default_value = "oracle.json")]
        config: PathBuf,

        /// Key file
        #[arg(long, default_value = "keys.json")]
        keys: PathBuf,

        /// Override the configured epoch
        #[arg(long)]
        epoch: Option<u64>,

        /// Override the configured leader
        #[arg(long)]
        leader: Option<NodeIndex>,
    },

    /// Generate keys and a localhost config for a new network
    Keygen {
        /// Number of nodes
        #[arg(long, default_value = "5")]
        nodes: usize,

        /// Key file to write
        #[arg(long, default_value = "keys.json")]
        out: PathBuf,

        /// Config file to write
        #[arg(long, default_value = "oracle.json")]
        config_out: PathBuf,

        /// First WebSocket port; node i listens on base_port + i
        #[arg(long, default_value = "9000")]
        base_port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match args.command {
        Command::Run {
            index,
            config,
            keys,
            epoch,
            leader,
        } => {
            let mut config = NodeConfig::load(&config)?;
            if let Some(epoch) = epoch {
                config.epoch = epoch;
            }
            if let Some(leader) = leader {
                config.leader = leader;
            }
            let keys = KeyStore::from_key_file(&keys, index)
                .with_context(|| format!("loading keys for node {}", index))?;
            run_node(config, keys).await
        }
        Command::Keygen {
            nodes,
            out,
            config_out,
            base_port,
        } => keygen(nodes, out, config_out, base_port),
    }
}

async fn run_node(config: NodeConfig, keys: KeyStore) -> Result<()> {
    let index = keys.index();
    tracing::info!("Starting oracle node {}", index);
    tracing::info!("  Epoch: {}", config.epoch);
    tracing::info!("  Leader: {}", config.leader);
    tracing::info!("  Peers: {}", config.peers.join(", "));
    tracing::info!(
        "  Round timeout: {}ms, grace: {}ms, max round: {}",
        config.params.round_timeout_ms,
        config.params.grace_period_ms,
        config.params.max_round
    );

    let transport = WsTransport::start(index, &config.peers).await?;
    let source = RandomWalk::new(config.initial_value, config.max_step);
    let node = OracleNodeBuilder::new(Arc::new(keys))
        .epoch(config.epoch)
        .leader(config.leader)
        .params(config.params.clone())
        .build(transport, source)?;

    let mut handle = node.spawn();
    let mut stats_tick = tokio::time::interval(STATS_INTERVAL);
    stats_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down...");
                break;
            }
            output = handle.next_output() => match output {
                Some(NodeOutput::Finalized(attested)) => {
                    tracing::info!(
                        "Round {} report: median {:?} from {} observations, {} signers",
                        attested.round(),
                        attested.report().median(),
                        attested.report().len(),
                        attested.signers().len()
                    );
                }
                Some(NodeOutput::LeaderChange { epoch, last_round }) => {
                    tracing::warn!(
                        "Leader change requested for epoch {} after round {}; \
                         restart with a new --leader",
                        epoch,
                        last_round
                    );
                }
                None => {
                    tracing::error!("Node stopped unexpectedly");
                    break;
                }
            },
            _ = stats_tick.tick() => {
                let stats = handle.stats();
                tracing::info!(
                    "Round {}: {} completed, {} echoes sent, {} rejected",
                    stats.follower.current_round,
                    stats.follower.rounds_completed,
                    stats.follower.echoes_sent,
                    stats.follower.messages_rejected
                );
                if let Some(leader) = stats.leader {
                    tracing::info!(
                        "Leader: {} started, {} finalized, {} abandoned",
                        leader.rounds_started,
                        leader.rounds_finalized,
                        leader.rounds_abandoned
                    );
                }
            }
        }
    }

    handle.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

fn keygen(nodes: usize, out: PathBuf, config_out: PathBuf, base_port: u16) -> Result<()> {
    let keys = KeyFile::generate(nodes);
    keys.save(&out)
        .with_context(|| format!("writing key file {:?}", out))?;

    let config = NodeConfig::local(nodes, base_port);
    config.validate()?;
    config.save(&config_out)?;

    tracing::info!("Generated {} keys in {:?}", nodes, out);
    for (i, key) in keys.public_keys.iter().enumerate() {
        tracing::info!("  Node {}: {} ({})", i, key, config.peers[i]);
    }
    tracing::info!("Wrote config to {:?}", config_out);
    Ok(())
}
