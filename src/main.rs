//! Drone Sniffer - passive Remote ID capture and tracking
//!
//! Spawns capture workers for the configured interfaces, optionally
//! replays a capture file first, and keeps a live track registry until
//! interrupted. The network API and persistence layers attach to the
//! manager from outside this binary.

use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{bounded, RecvTimeoutError};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use drone_sniffer::{Config, JobStatus, SniffManager};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("===========================================");
    info!("   Drone Sniffer - Remote ID capture");
    info!("===========================================");

    let config = Config::from_env();
    info!("Configuration:");
    info!("  Interfaces: {:?}", config.interfaces);
    info!("  Capture binary: {}", config.tcpdump_path.display());
    info!("  Track TTL: {}s", config.track_ttl_secs);
    info!("  Max tracks: {}", config.max_tracks);

    let manager = SniffManager::new(config.sniff_config());

    // Replay a capture file first when one is configured
    if let Some(file) = &config.pcap_file {
        info!("Replaying capture file {}", file.display());
        match manager.parse_file(file) {
            Ok(job) => match job.status {
                JobStatus::Failed(reason) => {
                    warn!("Replay failed after {} frames: {}", job.frames_processed, reason)
                }
                _ => info!(
                    "Replay done: {} frames, {} decoded",
                    job.frames_processed, job.frames_decoded
                ),
            },
            Err(e) => error!("Replay rejected: {e}"),
        }
    }

    if let Err(e) = manager.set_sniffing_interfaces(&config.interfaces) {
        error!("Could not start sniffing: {e}");
    }
    for state in manager.interface_states() {
        info!("  {}: {}", state.name, state.status);
    }

    // Termination hook: the manager must shut down before the process
    // exits or capture processes and file handles leak
    let (stop_tx, stop_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })?;

    info!("Sniffing. Press Ctrl+C to stop.");
    loop {
        match stop_rx.recv_timeout(Duration::from_secs(10)) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                info!("[Tracker] {}", manager.store_stats());
            }
        }
    }

    info!("Interrupt received, shutting down...");
    let report = manager.shutdown();
    if !report.timed_out.is_empty() {
        warn!("Workers still running at exit: {:?}", report.timed_out);
    }
    info!("Shutdown complete. Final state: {}", manager.store_stats());
    Ok(())
}
