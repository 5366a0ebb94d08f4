//! Kiosync CLI
//!
//! Command-line tools for kiosk replication and failover.
//!
//! # Commands
//!
//! - `config` - Resolve, validate and print the engine settings
//! - `simulate` - Run the failover coordinator against scripted endpoints

mod commands;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Kiosk replication and failover tools.
#[derive(Parser)]
#[command(name = "kiosync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Endpoint addresses, from flags or the environment.
#[derive(Args, Debug, Clone, Default)]
pub struct EndpointArgs {
    /// Primary base address
    #[arg(long, env = "KIOSYNC_PRIMARY_URL")]
    pub primary_url: Option<String>,

    /// Primary streaming address (derived from the base address if unset)
    #[arg(long, env = "KIOSYNC_PRIMARY_STREAM_URL")]
    pub primary_stream_url: Option<String>,

    /// Secondary base address
    #[arg(long, env = "KIOSYNC_SECONDARY_URL")]
    pub secondary_url: Option<String>,

    /// Secondary streaming address (derived from the base address if unset)
    #[arg(long, env = "KIOSYNC_SECONDARY_STREAM_URL")]
    pub secondary_stream_url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve, validate and print the engine settings
    Config {
        #[command(flatten)]
        endpoints: EndpointArgs,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run the failover coordinator against scripted in-memory endpoints
    Simulate {
        /// Number of health-check ticks to run
        #[arg(short, long, default_value = "12")]
        ticks: u32,

        /// Tick at which the primary stops answering
        #[arg(long)]
        primary_down: Option<u32>,

        /// Tick at which the primary answers again
        #[arg(long)]
        primary_up: Option<u32>,

        /// Tick at which the secondary stops answering
        #[arg(long)]
        secondary_down: Option<u32>,

        /// Comma-separated collection names
        #[arg(short, long, default_value = "orders,visits", value_delimiter = ',')]
        collections: Vec<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Config { endpoints, format } => {
            commands::config::run(&endpoints, &format)?;
        }
        Commands::Simulate {
            ticks,
            primary_down,
            primary_up,
            secondary_down,
            collections,
            format,
        } => {
            let script = commands::simulate::Script {
                ticks,
                primary_down,
                primary_up,
                secondary_down,
            };
            commands::simulate::run(&script, &collections, &format)?;
        }
        Commands::Version => {
            println!("kiosync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
