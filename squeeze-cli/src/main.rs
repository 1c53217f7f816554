//! Squeeze CLI

mod demo;

use anyhow::Result;
use clap::{Parser, Subcommand};
use squeeze_compression::{AdaptiveCompression, AdaptiveConfig, CompressionMonitor};
use squeeze_runtime::{ServerBuilder, ShutdownSignal, SignalHandler};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "squeeze")]
#[command(about = "Adaptive gzip compression server", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the demo API behind adaptive compression
    Serve {
        /// Address to listen on
        #[arg(short = 'a', long, env = "SQUEEZE_LISTEN", default_value = "127.0.0.1:8080")]
        listen: SocketAddr,

        /// Log level (trace, debug, info, warn, error)
        #[arg(short, long, default_value = "info")]
        log_level: String,

        /// Seconds to wait for connections and the monitor on shutdown
        #[arg(long, default_value_t = 30)]
        shutdown_timeout: u64,
    },

    /// Validate the COMPRESSION_* environment configuration
    Validate,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            listen,
            log_level,
            shutdown_timeout,
        } => {
            init_tracing(&log_level)?;

            tracing::info!("Starting Squeeze");

            let config = AdaptiveConfig::load()?;
            tracing::info!(
                min_size = config.min_size,
                level = config.level,
                adaptive = config.adaptive,
                "Configuration loaded"
            );

            let signal = ShutdownSignal::new();
            let monitor = Arc::new(CompressionMonitor::new(signal.token()));
            let compression = AdaptiveCompression::with_config(Arc::clone(&monitor), config)?;

            let server = ServerBuilder::new()
                .listen(listen)
                .shutdown_timeout(Duration::from_secs(shutdown_timeout))
                .shutdown_signal(signal.clone())
                .monitor(Arc::clone(&monitor))
                .middleware(Arc::new(compression))
                .handler(demo::handler(monitor))
                .build()?;

            tokio::spawn(SignalHandler::new(signal).run());

            server.run().await?;
            Ok(())
        }

        Commands::Validate => {
            tracing_subscriber::fmt().with_target(false).init();

            match AdaptiveConfig::load() {
                Ok(config) => {
                    tracing::info!("✓ Configuration is valid");
                    println!("{}", serde_json::to_string_pretty(&config)?);
                    Ok(())
                }
                Err(e) => {
                    tracing::error!("✗ Configuration validation failed: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Version => {
            println!("Squeeze");
            println!("Version: {}", env!("CARGO_PKG_VERSION"));
            println!("Rust version: {}", env!("CARGO_PKG_RUST_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_level(true),
        )
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(filter.into())
                .add_directive("hyper=warn".parse()?),
        )
        .init();

    Ok(())
}
