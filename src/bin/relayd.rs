//! relayd - detection relay daemon
//!
//! This daemon:
//! 1. Captures frames from the configured camera
//! 2. Runs object detection and post-processing on every frame
//! 3. Restreams the annotated frames to live viewers
//! 4. Publishes detection batches to the HTTP collector at a fixed cadence
//!
//! Stops cleanly on Ctrl-C / SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use detection_relay::{Pipeline, RelayConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Detection relay daemon")]
struct Args {
    /// Configuration file (JSON, or TOML by extension).
    /// A default file is written there if it does not exist.
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Camera URL (stub://, rtsp://, v4l2://).
    #[arg(long)]
    camera_url: Option<String>,

    /// Live stream listen port.
    #[arg(long)]
    stream_port: Option<u16>,

    /// Event collector as host:port.
    #[arg(long)]
    collector: Option<String>,

    /// Stream frames without detection overlays.
    #[arg(long)]
    no_annotate: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = RelayConfig::load_from(args.config.as_deref())?;
    if let Some(url) = args.camera_url {
        cfg.camera.url = url;
    }
    if let Some(port) = args.stream_port {
        cfg.stream.port = port;
    }
    if let Some(collector) = args.collector.as_deref() {
        cfg.set_collector(collector)?;
    }
    if args.no_annotate {
        cfg.detection.draw_detections = false;
    }
    cfg.validate()?;

    log::info!("relayd {} starting", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &cfg.source {
        log::info!("configuration from {}", path.display());
    }
    for line in cfg.summary().lines() {
        log::info!("{}", line);
    }

    let mut pipeline = Pipeline::from_config(&cfg).context("build pipeline")?;
    pipeline.initialize()?;
    if let Some(url) = pipeline.stream_url() {
        log::info!("live stream available at {}", url);
    }

    let stop = pipeline.stop_handle();
    ctrlc::set_handler(move || {
        log::info!("shutdown signal received, stopping pipeline...");
        stop.request_stop();
    })
    .expect("error setting Ctrl-C handler");

    pipeline.run()?;
    log::info!("relayd stopped");
    Ok(())
}
