//! Modbus register scanner.
//!
//! Connects to one device and scans a holding-register range at a fixed
//! interval, printing each result as a JSON line.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use modscan::config::ScannerConfig;
use modscan::sim::{PointBehavior, SimulatedDevice};
use modscan::{LoopExit, ProtocolClient, ScanLoop, ScanResult};

/// Modbus TCP register scanner.
#[derive(Parser, Debug)]
#[command(name = "modscan")]
#[command(about = "Scans Modbus holding registers and prints decoded values")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "modscan.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Run a single scan and exit.
    #[arg(long)]
    once: bool,

    /// Scan an in-process simulated device instead of connecting.
    #[arg(long)]
    simulate: bool,
}

#[derive(Serialize)]
struct ScanReport<'a> {
    timestamp: i64,
    #[serde(flatten)]
    result: &'a ScanResult,
}

fn print_report(result: &ScanResult) {
    let report = ScanReport {
        timestamp: chrono::Utc::now().timestamp_millis(),
        result,
    };
    match serde_json::to_string(&report) {
        Ok(line) => println!("{}", line),
        Err(e) => error!("Failed to serialize scan result: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = ScannerConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    // Initialize logging
    let log_config = config
        .logging
        .with_level_override(args.log_level.as_deref());
    modscan_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting modscan");
    info!("Loaded configuration from {:?}", args.config);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            signal.cancel();
        }
    });

    let iterations = if args.once { Some(1) } else { config.scan.iterations };
    let mut scan_loop =
        ScanLoop::new(config.clone(), shutdown.clone()).with_iterations(iterations);
    let endpoint = config.device.endpoint();

    if args.simulate {
        info!("Scanning simulated device");
        let device = SimulatedDevice::new()
            .with_default(PointBehavior::Float(23.5))
            .with_holding(config.scan.end, PointBehavior::Float(f32::INFINITY));
        let client = ProtocolClient::with_transport(endpoint, device);
        if let LoopExit::ConnectionLost(e) = scan_loop.run(client, print_report).await {
            return Err(e).context("Simulated device stopped responding");
        }
    } else {
        info!("Connecting to {}...", endpoint);
        let mut client = ProtocolClient::connect(endpoint.clone())
            .await
            .context("Failed to connect to device")?;

        while let LoopExit::ConnectionLost(e) = scan_loop.run(client, print_report).await {
            warn!(error = %e, "Connection to device lost, reconnecting");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(config.scan.interval()) => {}
            }
            client = ProtocolClient::connect(endpoint.clone())
                .await
                .context("Failed to reconnect to device")?;
        }
    }

    info!(completed = scan_loop.completed(), "modscan stopped");

    Ok(())
}
