//! AirShare agent entry point.

mod app;
mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "airshare-agent")]
#[command(version, about = "Discover LAN peers and receive shared files", long_about = None)]
struct Cli {
    /// Configuration file path (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Advertise this peer and track others until interrupted (default)
    Run,

    /// Copy a file into the storage directory through the verified chunk pipeline
    Import {
        /// File to import
        file: PathBuf,
    },

    /// Discover peers for a while and print them as JSON
    Devices {
        /// Seconds to listen before printing
        #[arg(short, long, default_value_t = 15)]
        wait: u64,
    },

    /// List stored files as JSON
    Files,
}

fn main() -> anyhow::Result<()> {
    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting AirShare agent"
    );

    let config = config::Config::load(cli.config.as_deref())?;
    tracing::info!(name = %config.name, port = config.port, "configuration loaded");

    let rt = tokio::runtime::Runtime::new()?;
    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            rt.block_on(app::run(config))?;
            tracing::info!("agent shut down cleanly");
        }
        Command::Import { file } => rt.block_on(app::import(config, file))?,
        Command::Devices { wait } => {
            rt.block_on(app::devices(config, std::time::Duration::from_secs(wait)))?
        }
        Command::Files => app::files(&config)?,
    }

    Ok(())
}
