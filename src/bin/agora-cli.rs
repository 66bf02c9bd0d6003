//! Agora CLI - run pattern areas and poke running ones
//!
//! Every subcommand reads the same JSON area configuration (name, address
//! book, timeout, subscriptions, context values).

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use agora::patterns::{Clock, Director};
use agora::runtime::area::TRIGGER_KEY;
use agora::runtime::{Area, History, Interface, Params, RuntimeConfig, RuntimeError, transport};
use serde_json::Value;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "agora")]
#[command(about = "Quiescence-driven actor runtime with harmonic coordination", long_about = None)]
struct Cli {
    /// Area configuration file (JSON)
    #[arg(short, long, default_value = "agora.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a harmonic clock
    Clock,

    /// Run a barrier director
    Director,

    /// Follow the configured subscriptions and log what arrives each round
    Listen,

    /// Send one trigger to a running area
    Trigger {
        /// Target area name
        target: String,

        /// Trigger name
        name: String,

        /// Keyword parameters (JSON object)
        #[arg(long, default_value = "{}")]
        params: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = RuntimeConfig::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {:?}", cli.config))?;

    match cli.command {
        Commands::Clock => {
            let mut area = Clock::build(&config)?;
            area.setup()?;
            area.run().await?;
        }

        Commands::Director => {
            let mut area = Director::build(&config)?;
            area.setup()?;
            area.run().await?;
        }

        Commands::Listen => {
            let mut area = Area::new(&config, ())?;
            for source in config.subscriptions.keys() {
                let followed = source.clone();
                area.alteration(Some(source.as_str()), None, move |area, _| {
                    log_latest(area, &followed);
                    Ok(())
                });
            }
            area.setup()?;
            area.run().await?;
        }

        Commands::Trigger {
            target,
            name,
            params,
        } => {
            let mut params: Params =
                serde_json::from_str(&params).context("--params must be a JSON object")?;
            params.insert(TRIGGER_KEY.to_string(), Value::String(name.clone()));

            let address = config
                .addresses
                .get(&target, Interface::Rcv)
                .ok_or_else(|| RuntimeError::UnknownAddress(Interface::Rcv.key(&target)))?;
            transport::deliver_command(address, &serde_json::to_vec(&params)?).await?;
            println!("Sent '{}' to {} at {}", name, target, address);
        }
    }

    Ok(())
}

fn log_latest(area: &Area, source: &str) {
    match area.context().history(source) {
        Some(History::Single(ring)) => {
            if let Some(entry) = ring.latest() {
                tracing::info!("round {} {}: {}", area.time(), source, entry);
            }
        }
        Some(History::Slotted(rings)) => {
            for (slot, ring) in rings {
                if let Some(entry) = ring.latest() {
                    tracing::info!("round {} {}/{}: {}", area.time(), source, slot, entry);
                }
            }
        }
        None => {}
    }
}
