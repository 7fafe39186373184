//! Thin Wallet CLI
//!
//! Unlock a stored ledger account and follow its balance.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::CliContext;

#[derive(Parser)]
#[command(name = "thin-wallet")]
#[command(about = "Thin wallet - keep your ledger key encrypted and your balance in sync")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Custom config file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Custom credential file path
    #[arg(long, global = true)]
    credential: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or import the account credential
    Init {
        /// Import an existing base58 private key
        #[arg(long)]
        import: bool,
    },

    /// Show the account address
    Address,

    /// Fetch the balance and token holdings
    Balance,

    /// Follow balance changes until interrupted
    Watch,

    /// Re-encrypt the credential under a new password
    ChangePassword,

    /// Show the effective configuration
    Config {
        /// Write it to the config path
        #[arg(long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let ctx = CliContext::load(cli.config, cli.credential)?;

    match cli.command {
        Commands::Init { import } => commands::init::run(&ctx, import).await,
        Commands::Address => commands::address::run(&ctx).await,
        Commands::Balance => commands::balance::run(&ctx).await,
        Commands::Watch => commands::watch::run(&ctx).await,
        Commands::ChangePassword => commands::change_password::run(&ctx).await,
        Commands::Config { write } => commands::config::run(&ctx, write).await,
    }
}
