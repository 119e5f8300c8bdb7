//! # cardsync
//!
//! Command-line tool for exercising the cardsync engine without a network.
//!
//! ## Commands
//!
//! - `simulate`: Pair a desk and a phone in-process and sync cards
//! - `config`: Print the effective node configuration
//! - `decode`: Decode a wire message from a file
//!
//! ## Example
//!
//! ```bash
//! # Sync 20 offline cards from a phone to a desk
//! cardsync simulate --cards 20
//!
//! # Write a starting configuration
//! cardsync config > cardsync.toml
//!
//! # Inspect a captured payload
//! cardsync decode message.json
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{config, decode, simulate};

/// Command-line tool for exercising the cardsync engine.
#[derive(Parser, Debug)]
#[command(name = "cardsync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Node configuration file (TOML)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Log engine activity (overridden by RUST_LOG)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Pair two in-process devices and sync cards between them
    Simulate {
        /// Cards the phone creates before connecting
        #[arg(long, default_value = "5")]
        cards: usize,

        /// Seconds to wait for the sync to settle
        #[arg(long, default_value = "10")]
        timeout: u64,
    },

    /// Print the effective configuration as TOML
    Config,

    /// Decode a wire message and print a summary
    Decode {
        /// File holding one encoded message
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Simulate { cards, timeout } => {
            simulate::run(cli.config.as_deref(), cards, timeout).await?;
        }
        Commands::Config => {
            config::run(cli.config.as_deref())?;
        }
        Commands::Decode { file } => {
            decode::run(&file).await?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "cardsync=debug,info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
