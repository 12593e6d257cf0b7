//! clawboot — container bootstrap for the OpenClaw gateway.
//!
//! `start` is the container's default command: resolve secrets, validate
//! credentials, materialize the gateway configuration and MCP registry,
//! render and start the nginx front proxy, then exec the gateway so it
//! receives container signals directly. `check-redeploy` is the separately
//! scheduled task that redeploys via the PaaS API when a newer upstream
//! release exists.

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod error;
mod launcher;
mod redeploy;
mod startup;

#[derive(Parser)]
#[command(name = "clawboot")]
#[command(about = "Container bootstrap for the OpenClaw gateway")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full startup sequence and exec the gateway (container default command)
    Start,

    /// Compare running vs latest release and trigger a redeploy if behind
    ///
    /// Reads its configuration entirely from environment variables:
    /// COOLIFY_RESOURCE_UUID (required), COOLIFY_API_BASE, COOLIFY_FORCE,
    /// and the vault variables shared with `start`.
    CheckRedeploy,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("clawboot=info".parse()?))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Start => startup::run().await,
        Commands::CheckRedeploy => redeploy::run().await,
    };

    match result {
        Ok(()) => Ok(()),
        Err(fatal) => {
            error!(error = %fatal.source, "aborted");
            std::process::exit(fatal.exit_code);
        }
    }
}
