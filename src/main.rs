// src/main.rs - Host process for the onboard peripherals
use std::time::Duration;

use clap::Parser;
use moto_hal::{Hal, load_config};

#[derive(Debug, Parser)]
#[command(name = "moto-hal", version, about = "Onboard GPS and tag scanner host")]
struct Args {
    /// Configuration file
    #[arg(default_value = "moto-hal.toml")]
    config: String,

    /// Maximum log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,

    /// Seconds between status log lines
    #[arg(long, default_value_t = 30)]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .init();

    tracing::info!("Starting moto-hal {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Loading configuration from: {}", args.config);

    let config = load_config(&args.config).map_err(|e| {
        tracing::error!("Failed to load config from '{}': {}", args.config, e);
        Box::new(e) as Box<dyn std::error::Error + Send + Sync + 'static>
    })?;

    if config.gps.enabled {
        tracing::info!("GPS: {} @ {} baud", config.gps.serial, config.gps.baud);
    }
    if config.rfid.enabled {
        tracing::info!(
            "Tag reader: {} {} ({:?})",
            config.rfid.client,
            config.rfid.port,
            config.rfid.strategy
        );
    }

    let hal = Hal::new(&config);
    let failures = hal.init_all().await;
    if !failures.is_empty() {
        tracing::warn!("{} device(s) failed to start", failures.len());
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(args.status_interval.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for (name, status) in hal.status().await {
                    tracing::info!("{}: {}", name, status);
                }
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::error!("Failed to listen for shutdown signal: {}", e);
                }
                break;
            }
        }
    }

    tracing::info!("Shutting down");
    hal.close_all().await;
    Ok(())
}
