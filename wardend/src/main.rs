//! wardend: agent supervising out-of-process controller plugins
//!
//! `wardend start` runs the agent until SIGINT/SIGTERM; `wardend version`
//! prints build metadata and exits.

use anyhow::Result;
use clap::Parser;

mod agent;
mod api;
mod config;
mod http;

/// The complete release version number.
const RELEASE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "wardend")]
#[command(about = "wardend manages the lifecycle of controller plugins")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the agent
    Start,
    /// Print the version number of wardend
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Commands::Version => {
            println!(
                "wardend version: {}, commit: {}",
                RELEASE_VERSION,
                option_env!("BUILD_COMMIT").unwrap_or("unknown")
            );
            Ok(())
        }
        Commands::Start => agent::run().await,
    }
}
