//! Sniff manager: owns capture workers and the shared track store
//!
//! The coordinator reconciles the running interface workers against a
//! requested set, runs file replays, and shuts everything down with a
//! bounded wait. Reconciliations are serialized against each other and
//! against shutdown, so the set of live workers is always well-defined.

mod state;

pub use state::{
    CaptureJob, InterfaceState, InterfaceStatus, JobStatus, ManagerError, ShutdownReport,
};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::capture::worker::run_loop;
use crate::capture::{
    CancelToken, CaptureWorker, FileSource, FrameSource, LiveSource, SourceError, WorkerHealth,
    WorkerHealthSnapshot, WorkerStatus,
};
use crate::tracker::{DroneTrack, StoreStats, TrackStore};

/// Runtime settings for the manager, supplied by the host's configuration
/// layer.
#[derive(Debug, Clone)]
pub struct SniffConfig {
    /// Capture binary spawned per live interface.
    pub tcpdump_path: PathBuf,
    /// Track staleness threshold for the expiry sweep.
    pub track_ttl: Duration,
    /// How often the sweeper wakes up.
    pub sweep_interval: Duration,
    /// Upper bound on simultaneously tracked drones.
    pub max_tracks: usize,
    /// Bounded wait applied when stopping workers.
    pub stop_timeout: Duration,
}

impl Default for SniffConfig {
    fn default() -> Self {
        Self {
            tcpdump_path: PathBuf::from("tcpdump"),
            track_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            max_tracks: 256,
            stop_timeout: Duration::from_secs(5),
        }
    }
}

enum InterfaceSlot {
    Active(CaptureWorker),
    Failed(String),
}

struct Inner {
    slots: HashMap<String, InterfaceSlot>,
    sweeper: Option<(CancelToken, JoinHandle<()>)>,
    terminated: bool,
}

/// Coordinator for all capture work. Explicitly constructed and owned by
/// the hosting process; `shutdown()` must run before the process exits.
pub struct SniffManager {
    config: SniffConfig,
    store: Arc<TrackStore>,
    inner: Mutex<Inner>,
}

impl SniffManager {
    pub fn new(config: SniffConfig) -> Self {
        let store = Arc::new(TrackStore::new(config.max_tracks));

        let sweeper_cancel = CancelToken::new();
        let sweeper = {
            let store = Arc::clone(&store);
            let cancel = sweeper_cancel.clone();
            let ttl = config.track_ttl;
            let interval = config.sweep_interval;
            thread::Builder::new()
                .name("track-sweeper".to_string())
                .spawn(move || run_sweeper(store, ttl, interval, cancel))
        };
        let sweeper = match sweeper {
            Ok(handle) => Some((sweeper_cancel, handle)),
            Err(e) => {
                warn!("could not start track sweeper: {e}");
                None
            }
        };

        Self {
            config,
            store,
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                sweeper,
                terminated: false,
            }),
        }
    }

    /// Reconcile running interface workers against the requested set.
    ///
    /// Newly listed interfaces are started, no-longer-listed ones are
    /// stopped, unchanged ones stay untouched. An interface that fails to
    /// open is recorded as `Failed` without aborting the rest. Calls are
    /// serialized relative to each other and to `shutdown`.
    pub fn set_sniffing_interfaces<S: AsRef<str>>(
        &self,
        names: &[S],
    ) -> Result<Vec<InterfaceState>, ManagerError> {
        let mut inner = self.lock_inner();
        if inner.terminated {
            return Err(ManagerError::Terminated);
        }

        let mut requested: Vec<String> = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            if !requested.iter().any(|existing| existing == name) {
                requested.push(name.to_string());
            }
        }

        // stop workers for interfaces no longer listed
        let current: Vec<String> = inner.slots.keys().cloned().collect();
        for name in current {
            if requested.iter().any(|wanted| *wanted == name) {
                continue;
            }
            if let Some(InterfaceSlot::Active(mut worker)) = inner.slots.remove(&name) {
                info!("stopping capture on {name}");
                worker.request_stop();
                if !worker.join_deadline(Instant::now() + self.config.stop_timeout) {
                    warn!(
                        "capture worker on {name} did not stop within {:?}",
                        self.config.stop_timeout
                    );
                }
            }
        }

        // start workers for newly listed interfaces
        for name in &requested {
            if inner.slots.contains_key(name) {
                continue;
            }
            info!("starting capture on {name}");
            match self.start_worker(name) {
                Ok(worker) => {
                    inner.slots.insert(name.clone(), InterfaceSlot::Active(worker));
                }
                Err(e) => {
                    warn!("failed to start capture on {name}: {e}");
                    inner
                        .slots
                        .insert(name.clone(), InterfaceSlot::Failed(e.to_string()));
                }
            }
        }

        Ok(requested
            .iter()
            .map(|name| interface_state(name, &inner.slots))
            .collect())
    }

    fn start_worker(&self, interface: &str) -> Result<CaptureWorker, SourceError> {
        let cancel = CancelToken::new();
        let source = LiveSource::open(interface, &self.config.tcpdump_path, cancel.clone())?;
        CaptureWorker::spawn(
            interface,
            FrameSource::Live(source),
            Arc::clone(&self.store),
            cancel,
        )
        .map_err(|e| SourceError::Unreadable(format!("failed to spawn worker thread: {e}")))
    }

    /// Replay a capture file to completion on the caller's thread.
    ///
    /// Potentially long-running; callers on a latency-sensitive path
    /// should use [`SniffManager::parse_file_background`] instead.
    pub fn parse_file<P: AsRef<Path>>(&self, path: P) -> Result<CaptureJob, ManagerError> {
        self.ensure_active()?;
        let path = path.as_ref().to_path_buf();
        info!("replaying capture file {}", path.display());

        let health = WorkerHealth::new();
        match FileSource::open(&path) {
            Ok(source) => {
                run_loop(
                    FrameSource::Replay(source),
                    &self.store,
                    &health,
                    &CancelToken::new(),
                );
            }
            Err(e) => {
                warn!("replay of {} failed: {e}", path.display());
                health.set_failed(e.to_string());
            }
        }
        Ok(job_from_health(path, &health))
    }

    /// Replay a capture file on its own worker thread.
    pub fn parse_file_background<P: AsRef<Path>>(
        &self,
        path: P,
    ) -> Result<BackgroundJob, ManagerError> {
        self.ensure_active()?;
        let path = path.as_ref().to_path_buf();
        info!("replaying capture file {} in the background", path.display());

        let health = WorkerHealth::new();
        let cancel = CancelToken::new();
        let handle = {
            let path = path.clone();
            let store = Arc::clone(&self.store);
            let health = Arc::clone(&health);
            let cancel = cancel.clone();
            thread::Builder::new()
                .name("replay".to_string())
                .spawn(move || match FileSource::open(&path) {
                    Ok(source) => run_loop(FrameSource::Replay(source), &store, &health, &cancel),
                    Err(e) => health.set_failed(e.to_string()),
                })
        };
        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                health.set_failed(format!("failed to spawn replay thread: {e}"));
                None
            }
        };

        Ok(BackgroundJob {
            file_path: path,
            health,
            cancel,
            handle,
        })
    }

    /// Read-only copy of the current tracks, for the API collaborator.
    pub fn track_snapshot(&self) -> Vec<DroneTrack> {
        self.store.snapshot()
    }

    pub fn store_stats(&self) -> StoreStats {
        self.store.stats()
    }

    /// Interface lifecycle as currently known to the coordinator.
    pub fn interface_states(&self) -> Vec<InterfaceState> {
        let inner = self.lock_inner();
        let mut names: Vec<&String> = inner.slots.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| interface_state(name, &inner.slots))
            .collect()
    }

    /// Per-worker health counters, keyed by interface name.
    pub fn worker_health(&self) -> Vec<(String, WorkerHealthSnapshot)> {
        let inner = self.lock_inner();
        let mut health: Vec<(String, WorkerHealthSnapshot)> = inner
            .slots
            .iter()
            .filter_map(|(name, slot)| match slot {
                InterfaceSlot::Active(worker) => {
                    Some((name.clone(), worker.health().snapshot()))
                }
                InterfaceSlot::Failed(_) => None,
            })
            .collect();
        health.sort_by(|a, b| a.0.cmp(&b.0));
        health
    }

    /// Stop every worker and the sweeper, waiting up to the configured
    /// stop timeout. Idempotent; later calls return an empty report.
    pub fn shutdown(&self) -> ShutdownReport {
        let mut inner = self.lock_inner();
        if inner.terminated {
            debug!("shutdown already completed");
            return ShutdownReport::default();
        }
        inner.terminated = true;
        info!("shutting down sniff manager");

        if let Some((cancel, handle)) = inner.sweeper.take() {
            cancel.cancel();
            let _ = handle.join();
        }

        let mut workers: Vec<(String, CaptureWorker)> = Vec::new();
        for (name, slot) in inner.slots.drain() {
            if let InterfaceSlot::Active(worker) = slot {
                worker.request_stop();
                workers.push((name, worker));
            }
        }

        let deadline = Instant::now() + self.config.stop_timeout;
        let mut report = ShutdownReport::default();
        for (name, mut worker) in workers {
            if worker.join_deadline(deadline) {
                report.stopped.push(name);
            } else {
                warn!("worker on {name} did not stop within the shutdown timeout");
                report.timed_out.push(name);
            }
        }

        info!(
            "shutdown complete: {} workers stopped, {} timed out",
            report.stopped.len(),
            report.timed_out.len()
        );
        report
    }

    fn ensure_active(&self) -> Result<(), ManagerError> {
        if self.lock_inner().terminated {
            return Err(ManagerError::Terminated);
        }
        Ok(())
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for SniffManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One-shot file replay running on its own thread.
pub struct BackgroundJob {
    file_path: PathBuf,
    health: Arc<WorkerHealth>,
    cancel: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundJob {
    /// Current progress; status stays `Running` until the file is
    /// exhausted or fails.
    pub fn job(&self) -> CaptureJob {
        job_from_health(self.file_path.clone(), &self.health)
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Block until the replay finishes and return the final job record.
    pub fn wait(mut self) -> CaptureJob {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.job()
    }
}

fn job_from_health(file_path: PathBuf, health: &WorkerHealth) -> CaptureJob {
    let status = match health.status() {
        WorkerStatus::Idle => JobStatus::Pending,
        WorkerStatus::Running | WorkerStatus::Stopping => JobStatus::Running,
        WorkerStatus::Stopped => JobStatus::Completed,
        WorkerStatus::Failed(reason) => JobStatus::Failed(reason),
    };
    CaptureJob {
        file_path,
        status,
        frames_processed: health.frames_processed(),
        frames_decoded: health.frames_decoded(),
    }
}

fn interface_state(name: &str, slots: &HashMap<String, InterfaceSlot>) -> InterfaceState {
    let status = match slots.get(name) {
        Some(InterfaceSlot::Active(worker)) => match worker.health().status() {
            WorkerStatus::Idle => InterfaceStatus::Starting,
            WorkerStatus::Running => InterfaceStatus::Running,
            WorkerStatus::Stopping | WorkerStatus::Stopped => InterfaceStatus::Stopped,
            WorkerStatus::Failed(reason) => InterfaceStatus::Failed(reason),
        },
        Some(InterfaceSlot::Failed(reason)) => InterfaceStatus::Failed(reason.clone()),
        None => InterfaceStatus::Stopped,
    };
    InterfaceState {
        name: name.to_string(),
        status,
    }
}

fn run_sweeper(store: Arc<TrackStore>, ttl: Duration, interval: Duration, cancel: CancelToken) {
    let step = Duration::from_millis(200);
    loop {
        let mut waited = Duration::ZERO;
        while waited < interval {
            if cancel.is_cancelled() {
                return;
            }
            let nap = step.min(interval - waited);
            thread::sleep(nap);
            waited += nap;
        }
        if cancel.is_cancelled() {
            return;
        }
        let removed = store.sweep_expired(Utc::now(), ttl);
        if !removed.is_empty() {
            info!("expired {} stale tracks: {:?}", removed.len(), removed);
        }
    }
}
