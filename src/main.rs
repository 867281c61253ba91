//! Peer Mesh CLI Application
//!
//! A command-line interface for running a P2P node.

use clap::{Parser, Subcommand};
use peer_mesh::cli;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "peer-mesh")]
#[command(version = "0.1.0")]
#[command(about = "A small peer-to-peer chat and file sharing node", long_about = None)]
struct Cli {
    /// Path to the JSON config file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file
    Init {
        /// Overwrite an existing config
        #[arg(short, long)]
        force: bool,
    },

    /// Start the P2P node
    Start {
        /// Port to listen on (overrides the config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Seed peer to dial (host:port), repeatable
        #[arg(short, long = "seed")]
        seeds: Vec<String>,

        /// Local file to share, repeatable
        #[arg(long = "share")]
        shares: Vec<PathBuf>,
    },

    /// Download a file from a peer and exit
    Fetch {
        /// Peer address (host:port)
        #[arg(long)]
        peer: String,

        /// File name or id to request
        #[arg(short, long)]
        file: String,

        /// Port to listen on while fetching (0 picks a free port)
        #[arg(long, default_value = "0")]
        port: u16,

        /// Seconds to wait for the transfer
        #[arg(short, long, default_value = "60")]
        timeout: u64,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Init doesn't need a runtime
    if let Commands::Init { force } = cli.command {
        return cli::cmd_init(&cli.config, force);
    }

    let mut config = cli::load_config(&cli.config)?;
    let rt = tokio::runtime::Runtime::new()?;

    match cli.command {
        Commands::Init { .. } => unreachable!(),

        Commands::Start {
            port,
            seeds,
            shares,
        } => {
            if let Some(port) = port {
                config.port = port;
            }
            config.seed_nodes.extend(seeds);
            config.validate()?;

            rt.block_on(cli::cmd_start(config, &shares))?;
        }

        Commands::Fetch {
            peer,
            file,
            port,
            timeout,
        } => {
            config.port = port;
            rt.block_on(cli::cmd_fetch(
                config,
                &peer,
                &file,
                Duration::from_secs(timeout),
            ))?;
        }
    }

    Ok(())
}
