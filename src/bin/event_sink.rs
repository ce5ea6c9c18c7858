//! event_sink - local collector for detection events
//!
//! Listens for the relay's JSON batches, logs them and answers with a fixed
//! status. Useful when running relayd without a real backend.

use anyhow::Result;
use clap::Parser;
use std::sync::mpsc;

use detection_relay::{CollectorConfig, CollectorServer};

#[derive(Parser, Debug)]
#[command(author, version, about = "Receive detection relay events")]
struct Args {
    /// Listen address.
    #[arg(long, env = "EVENT_SINK_ADDR", default_value = "127.0.0.1:8080")]
    addr: String,

    /// Path batches are POSTed to.
    #[arg(long, env = "EVENT_SINK_PATH", default_value = "/metadata")]
    path: String,

    /// HTTP status returned for every batch.
    #[arg(long, default_value_t = 200)]
    status: u16,

    /// Do not log received bodies.
    #[arg(long)]
    quiet: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let handle = CollectorServer::new(CollectorConfig {
        addr: args.addr,
        path: args.path.clone(),
        status: args.status,
        echo: !args.quiet,
    })
    .spawn()?;
    log::info!(
        "event_sink listening on http://{}{} (answering {})",
        handle.addr,
        args.path,
        args.status
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("event_sink waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!(
        "shutdown signal received after {} event(s), stopping...",
        handle.received_count()
    );
    handle.stop()?;
    Ok(())
}
