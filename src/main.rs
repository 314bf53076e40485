//! Gossip node daemon
//!
//! Runs a standalone gossip node over an in-memory chain, and manages its
//! configuration file and identity key.

use clap::{Parser, Subcommand};
use mini_gossip::chain::MemoryChain;
use mini_gossip::config::GossipConfig;
use mini_gossip::network::{AddrBook, Node};
use mini_gossip::storage::KvStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "gossipd")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "Gossip transport and broadcast node", long_about = None)]
struct Cli {
    /// Data directory for the node store (overrides the config file)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node
    Start {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Seed peers (comma-separated host:port)
        #[arg(long)]
        peers: Option<String>,

        /// Network channel
        #[arg(long)]
        channel: Option<u32>,

        /// Do not accept inbound connections
        #[arg(long)]
        no_listen: bool,
    },

    /// Write a configuration file with defaults
    InitConfig {
        /// Output file path
        #[arg(short, long, default_value = "gossip.json")]
        output: PathBuf,
    },

    /// Show or reset the node identity
    Identity {
        /// Generate a new identity key
        #[arg(long)]
        reset: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => GossipConfig::load(path)?,
        None => GossipConfig::default(),
    };
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    match cli.command {
        Commands::Start {
            port,
            peers,
            channel,
            no_listen,
        } => {
            if let Some(port) = port {
                config.listen_port = port;
            }
            if let Some(peers) = peers {
                config.seeds.extend(
                    peers
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty()),
                );
            }
            if let Some(channel) = channel {
                config.channel = channel;
            }
            if no_listen {
                config.server_start = false;
            }
            if let Err(e) = config.validate() {
                log::error!("Invalid configuration: {}", e);
                return Err(e.into());
            }
            run_node(config)
        }

        Commands::InitConfig { output } => {
            config.save(&output)?;
            println!("Wrote configuration to {}", output.display());
            Ok(())
        }

        Commands::Identity { reset } => {
            let store = Arc::new(KvStore::open(&config.data_dir)?);
            let book = AddrBook::new(store)?;
            if reset {
                let name = book.reset_key()?;
                println!("New identity: {}", name);
            } else {
                println!("Identity: {}", book.public_key_hex());
            }
            Ok(())
        }
    }
}

fn run_node(config: GossipConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let chain = Arc::new(MemoryChain::new());
        let node = Node::new(config, chain)?;
        if let Some(addr) = node.start().await? {
            println!("Gossip node {} listening on {}", node.name(), addr);
        }

        let mut status = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = status.tick() => {
                    let info = node.net_info().await;
                    log::info!(
                        "Peers: {} outbound, {} inbound, {} known addresses, {} banned",
                        info.outbound,
                        info.inbound,
                        info.known_addresses,
                        info.banned
                    );
                }
            }
        }

        node.shutdown().await;
        Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
    })
}
