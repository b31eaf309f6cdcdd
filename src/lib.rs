//! Drone Remote ID sniffer core
//!
//! This crate captures 802.11 broadcasts on monitor-mode interfaces (or
//! replays capture files), decodes drone remote-identification beacons,
//! and maintains a live registry of observed drones. The API/serving
//! layer, persistence, and configuration loading live outside this crate
//! and consume the [`SniffManager`] contract: snapshots for reads,
//! interface reconciliation and file replay for control, and a bounded
//! `shutdown()` the host must run before exiting.

pub mod capture;
pub mod config;
pub mod manager;
pub mod rid;
pub mod tracker;

pub use capture::{RawFrame, SourceError, WorkerHealthSnapshot, WorkerStatus};
pub use config::Config;
pub use manager::{
    BackgroundJob, CaptureJob, InterfaceState, InterfaceStatus, JobStatus, ManagerError,
    ShutdownReport, SniffConfig, SniffManager,
};
pub use rid::{DroneObservation, UaType};
pub use tracker::{DroneTrack, StoreStats, TrackStore};
