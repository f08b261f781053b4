//! framecast - camera streaming server
//!
//! Captures JPEG frames from the configured sensor and serves them as an MJPEG stream
//! on `/mjpeg/1`, with single-frame capture and remote sensor settings alongside.
//!
//! A fatal pipeline error or a `/restart` request tears the whole pipeline down and
//! builds it again from the configuration, the way the device reboots.

use anyhow::Context;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

use framecast::config::{SensorSource, StreamConfig};
use framecast::sensor::SensorDriver;
use framecast::sensors::{DirectorySensor, SyntheticSensor};
use framecast::server::StreamServer;

/// Pause between a pipeline failure and the rebuild.
const RESTART_DELAY: Duration = Duration::from_millis(500);

struct Args {
    config_path: Option<PathBuf>,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut result = Args { config_path: None };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    result.config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other if !other.starts_with('-') && result.config_path.is_none() => {
                result.config_path = Some(PathBuf::from(other));
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    result
}

fn print_help() {
    println!("framecast - MJPEG camera streaming server");
    println!();
    println!("USAGE:");
    println!("    framecast [OPTIONS] [CONFIG]");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config <FILE>     Configuration file (YAML)");
    println!("    -h, --help              Print this help");
    println!();
    println!("ENVIRONMENT:");
    println!("    FRAMECAST_CONFIG        Configuration file when none is given");
    println!("    RUST_LOG                Log filter (default: info)");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = parse_args();
    let config = StreamConfig::resolve(args.config_path.as_deref()).context("loading configuration")?;
    info!("framecast v{}", env!("CARGO_PKG_VERSION"));

    loop {
        let outcome = match &config.sensor {
            SensorSource::Synthetic { scale } => serve(&config, SyntheticSensor::new().with_scale(*scale)).await,
            SensorSource::Directory { path } => {
                let sensor = DirectorySensor::open(path).context("opening frame directory")?;
                serve(&config, sensor).await
            }
        };

        match outcome {
            Ok(()) => {
                info!("Stopped");
                return Ok(());
            }
            Err(e) if e.is_fatal() => {
                warn!("Rebuilding pipeline: {}", e);
                for suggestion in e.recovery_suggestions() {
                    info!("  - {}", suggestion);
                }
                tokio::time::sleep(RESTART_DELAY).await;
            }
            Err(e) => {
                error!("Server failed: {}", e);
                return Err(e.into());
            }
        }
    }
}

/// Run one pipeline until it stops, or until Ctrl-C.
async fn serve<S: SensorDriver>(config: &StreamConfig, sensor: S) -> framecast::Result<()> {
    let server = StreamServer::bind(config, sensor).await?;
    let handle = server.handle();
    let running = tokio::spawn(server.run());

    tokio::select! {
        joined = running => joined.unwrap_or_else(|e| {
            Err(framecast::StreamError::restart_requested(format!("server task failed: {e}")))
        }),
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            handle.shutdown();
            Ok(())
        }
    }
}
