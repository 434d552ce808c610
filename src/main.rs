// SPDX-License-Identifier: Apache-2.0 OR MIT
//! framepiped: run a pipeline from a JSON5 configuration file.
//!
//! Stands the pipeline up against a loopback device with the bundled grid
//! decoder, runs for the requested duration and prints the final status
//! report as JSON. Intended for soak testing and as a wiring example for
//! embedders, which supply their own device and decoder.

use anyhow::{Context, Result};
use clap::Parser;
use framepipe::config::{default_geometry, PipelineConfig};
use framepipe::frame::FrameCallback;
use framepipe::logging::{self, Facility, Severity};
use framepipe::{CoreManager, GridDecoder, PacketPool, RingDevice};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the JSON5 pipeline configuration.
    #[arg(long)]
    config: PathBuf,

    /// How long to run before shutting down, in seconds.
    #[arg(long, default_value_t = 10)]
    duration_secs: u64,

    /// Status report interval while running, in seconds.
    #[arg(long, default_value_t = 5)]
    status_interval_secs: u64,

    /// Minimum log severity (emergency..debug).
    #[arg(long, default_value = "info")]
    loglevel: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let severity = Severity::parse(&args.loglevel).unwrap_or(Severity::Info);
    let (logger, mut log_consumer) = logging::stderr_logging(severity);

    let config =
        PipelineConfig::load_from_file(&args.config).context("loading configuration")?;

    let geometry = config.geometry.clone().unwrap_or_else(default_geometry);
    let decoder = Arc::new(GridDecoder::new(geometry).map_err(anyhow::Error::msg)?);

    // Loopback device: the pool plays the role of the per-socket NIC
    // mempool.
    let pool = PacketPool::new("mbuf_pool_00", 4096, framepipe::packet::DEFAULT_PACKET_BUF_SIZE);
    let device = RingDevice::new(0, 0, [0x02, 0x00, 0x00, 0x00, 0x00, 0x01], pool, 8192, 1024);

    let frames_delivered = Arc::new(AtomicU64::new(0));
    let callback_count = Arc::clone(&frames_delivered);
    let frame_callback: FrameCallback = Arc::new(move |_frame| {
        callback_count.fetch_add(1, Ordering::Relaxed);
    });

    let mut manager = CoreManager::new(
        "framepipe",
        config,
        vec![device as Arc<dyn framepipe::NetDevice>],
        decoder as Arc<dyn framepipe::ProtocolDecoder>,
        frame_callback,
        logger.clone(),
    )
    .context("building core manager")?;

    manager.start().context("starting pipeline")?;
    logger.notice(Facility::Manager, "pipeline running");

    let mut remaining = args.duration_secs;
    while remaining > 0 {
        let step = remaining.min(args.status_interval_secs.max(1));
        std::thread::sleep(Duration::from_secs(step));
        remaining -= step;
        logger.info(
            Facility::Manager,
            &format!(
                "frames delivered so far: {}",
                frames_delivered.load(Ordering::Relaxed)
            ),
        );
    }

    let report = manager.status();
    manager.stop();
    println!("{}", report.to_json());
    log_consumer.stop();
    Ok(())
}
