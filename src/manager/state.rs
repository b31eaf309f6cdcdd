//! Coordinator-owned state: interface lifecycle and replay jobs

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Lifecycle of one configured interface, derived by the coordinator from
/// the requested set and its worker's reported health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum InterfaceStatus {
    Stopped,
    Starting,
    Running,
    Failed(String),
}

impl InterfaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Failed(_) => "failed",
        }
    }
}

impl std::fmt::Display for InterfaceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InterfaceState {
    pub name: String,
    pub status: InterfaceStatus,
}

/// Lifecycle of a one-shot file replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed(String),
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }
}

/// Progress report of a file replay.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureJob {
    pub file_path: PathBuf,
    pub status: JobStatus,
    pub frames_processed: u64,
    pub frames_decoded: u64,
}

/// What `shutdown()` achieved within its bounded wait.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub stopped: Vec<String>,
    /// Workers still running when the wait expired. They hold their
    /// resources; the host should treat this as a hard diagnostic.
    pub timed_out: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ManagerError {
    #[error("sniff manager is terminated")]
    Terminated,
}
