// Metergate - Main Entry Point
//
// Runs the metering gate as an HTTP sidecar and provides a few operator
// commands:
// - serve: start the sidecar
// - tiers: print the rate limit tier table
// - check-config: load and validate a configuration file

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use metergate::config::{Config, LoggingConfig};
use metergate::rate_limit::RateLimitTier;
use metergate::{logging, server};
use std::path::PathBuf;
use tracing::info;

/// Metergate: rate limiting and credit metering for AI requests
#[derive(Parser, Debug)]
#[command(name = "metergate")]
#[command(author = "Metergate Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Rate limiting and credit metering gate for AI requests", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP sidecar
    Serve {
        /// Port to listen on (overrides the configuration)
        #[arg(short, long)]
        port: Option<u16>,

        /// Path to a TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print the rate limit tiers
    Tiers,
    /// Validate a configuration file
    CheckConfig {
        /// Path to a TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Some(Commands::Serve { port, config }) => {
            let mut config = Config::load_or_default(config.as_deref())?;
            if let Some(port) = port {
                config.server.port = port;
            }
            config.validate()?;

            logging::init(&config.logging, args.verbose)?;
            info!(
                version = env!("CARGO_PKG_VERSION"),
                tier = %config.rate_limit.default_tier,
                failure_policy = ?config.rate_limit.failure_policy,
                store = ?config.rate_limit.store,
                "metergate starting"
            );
            server::start_server(config).await?;
        }
        Some(Commands::Tiers) => {
            print_tiers();
        }
        Some(Commands::CheckConfig { config }) => {
            logging::init(&LoggingConfig::default(), args.verbose)?;
            check_config(config)?;
        }
        None => {
            println!("No command specified. Use \"metergate --help\" for usage.");
        }
    }

    Ok(())
}

fn print_tiers() {
    println!("{:<12} {:>6} {:>10}", "TIER", "LIMIT", "WINDOW");
    for tier in RateLimitTier::ALL {
        let spec = tier.spec();
        println!(
            "{:<12} {:>6} {:>9}s",
            tier.as_str(),
            spec.limit,
            spec.window.as_secs()
        );
    }
}

fn check_config(path: Option<PathBuf>) -> Result<()> {
    let shown = path.clone().unwrap_or_else(Config::config_path);
    let config = Config::load_or_default(path.as_deref())
        .with_context(|| format!("Invalid configuration at {}", shown.display()))?;

    println!("Configuration OK: {}", shown.display());
    println!("  listen:          {}", config.server.bind_address());
    println!("  default tier:    {}", config.rate_limit.default_tier);
    println!("  failure policy:  {:?}", config.rate_limit.failure_policy);
    println!("  store:           {:?}", config.rate_limit.store);
    println!(
        "  default estimate: {} tokens",
        config.credits.default_estimated_tokens
    );
    println!(
        "  seeded balances: {}",
        config.credits.initial_balances.len()
    );
    Ok(())
}
