//! Configuration loaded from environment variables

use std::path::PathBuf;
use std::time::Duration;

use crate::manager::SniffConfig;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Interfaces to sniff on at startup, comma separated
    pub interfaces: Vec<String>,

    /// Capture file to replay before live sniffing starts
    pub pcap_file: Option<PathBuf>,

    /// Path to the capture executable
    pub tcpdump_path: PathBuf,

    /// Seconds since last observation before a track is evicted
    pub track_ttl_secs: u64,

    /// Seconds between expiry sweeps
    pub sweep_interval_secs: u64,

    /// Upper bound on simultaneously tracked drones
    pub max_tracks: usize,

    /// Seconds to wait for workers when stopping
    pub stop_timeout_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            interfaces: std::env::var("SNIFF_INTERFACES")
                .map(|s| {
                    s.split(',')
                        .map(str::trim)
                        .filter(|name| !name.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),

            pcap_file: std::env::var("PCAP_FILE").ok().map(PathBuf::from),

            tcpdump_path: std::env::var("TCPDUMP_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("tcpdump")),

            track_ttl_secs: std::env::var("TRACK_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60),

            sweep_interval_secs: std::env::var("SWEEP_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30),

            max_tracks: std::env::var("MAX_TRACKS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(256),

            stop_timeout_secs: std::env::var("STOP_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
        }
    }

    /// The subset the sniff manager needs.
    pub fn sniff_config(&self) -> SniffConfig {
        SniffConfig {
            tcpdump_path: self.tcpdump_path.clone(),
            track_ttl: Duration::from_secs(self.track_ttl_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            max_tracks: self.max_tracks,
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
        }
    }
}
