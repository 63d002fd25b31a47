//! claimdns: authoritative DNS for claimed IPv6 addresses.
//!
//! Connect to the intake port from an IPv6 address and the service serves
//! an AAAA record pointing back at you under the configured parent zone,
//! DNSSEC-signed on the fly.

use std::path::PathBuf;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use claimdns::config::Config;
use claimdns::supervisor;

/// claimdns server
#[derive(Parser, Debug)]
#[command(name = "claimdns")]
#[command(version)]
#[command(about = "Authoritative DNS service for claimed IPv6 addresses", long_about = None)]
struct Args {
    /// Path to the YAML configuration file
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("starting claimdns v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(&args.config)?;
    let supervisor = supervisor::start(config).await?;
    supervisor.run().await
}
