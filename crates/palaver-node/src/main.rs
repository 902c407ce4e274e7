//! Palaver node daemon.
//!
//! One process per replica. The replica table comes from `palaver.toml`
//! (or the built-in three-node development topology), and the replica to
//! assume is picked by name.
//!
//! # Quick Start
//!
//! ```bash
//! # Three terminals, one replica each:
//! palaver-node start --name A
//! palaver-node start --name B
//! palaver-node start --name C
//!
//! # Inspect the resolved replica table:
//! palaver-node topology
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use palaver_config::{ConfigLoader, PalaverConfig};
use palaver_replica::Shutdown;

/// Palaver - a small replicated chat service.
#[derive(Parser)]
#[command(name = "palaver-node")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start one replica of the cluster.
    Start {
        /// Name of the replica to assume (a row of the replica table).
        #[arg(short, long)]
        name: String,

        /// Directory containing palaver.toml (default: current dir).
        #[arg(short, long)]
        config_dir: Option<PathBuf>,

        /// Override the data directory for the durable log.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Print the resolved replica table.
    Topology {
        /// Directory containing palaver.toml (default: current dir).
        #[arg(short, long)]
        config_dir: Option<PathBuf>,
    },
}

fn load_config(config_dir: Option<PathBuf>) -> Result<PalaverConfig> {
    let mut loader = ConfigLoader::new();
    if let Some(dir) = config_dir {
        loader = loader.with_project_dir(dir);
    }
    loader.load().context("failed to load configuration")
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Start {
            name,
            config_dir,
            data_dir,
        } => {
            let mut cfg = load_config(config_dir)?;
            if let Some(data_dir) = data_dir {
                cfg.data_dir = data_dir;
            }
            info!(replica = %name, "starting replica");
            palaver_server::run(&cfg, &name, Shutdown::new())
                .with_context(|| format!("replica {name} failed"))
        }

        Commands::Topology { config_dir } => {
            let cfg = load_config(config_dir)?;
            print!(
                "{}",
                toml::to_string_pretty(&cfg).context("failed to render topology")?
            );
            Ok(())
        }
    }
}
