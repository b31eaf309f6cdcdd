//! Capture worker: pull, decode, merge
//!
//! One worker per active interface plus one per in-flight replay. The loop
//! pulls frames from its source, decodes them, and merges observations
//! into the shared track store. Decode failures are counted and skipped;
//! only a source failure ends the loop early.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::rid;
use crate::tracker::TrackStore;

use super::source::{CancelToken, FrameSource};

/// Granularity of the bounded join wait.
const JOIN_POLL: Duration = Duration::from_millis(10);

/// Worker lifecycle: `Idle → Running → (Stopping → Stopped) | Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum WorkerStatus {
    Idle,
    Running,
    Stopping,
    Stopped,
    Failed(String),
}

impl WorkerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed(_))
    }
}

/// Facts a worker reports about itself. Counters are atomic; the status
/// and last error sit behind a mutex since they carry strings.
#[derive(Debug, Default)]
pub struct WorkerHealth {
    status: Mutex<Option<WorkerStatus>>,
    frames_processed: AtomicU64,
    frames_decoded: AtomicU64,
    decode_errors: AtomicU64,
    merge_drops: AtomicU64,
    last_error: Mutex<Option<String>>,
}

/// Read-only copy of a worker's health, for the API collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerHealthSnapshot {
    pub status: WorkerStatus,
    pub frames_processed: u64,
    pub frames_decoded: u64,
    pub decode_errors: u64,
    pub merge_drops: u64,
    pub last_error: Option<String>,
}

impl WorkerHealth {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn status(&self) -> WorkerStatus {
        self.lock_status().clone().unwrap_or(WorkerStatus::Idle)
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::Relaxed)
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> WorkerHealthSnapshot {
        WorkerHealthSnapshot {
            status: self.status(),
            frames_processed: self.frames_processed(),
            frames_decoded: self.frames_decoded(),
            decode_errors: self.decode_errors(),
            merge_drops: self.merge_drops.load(Ordering::Relaxed),
            last_error: self
                .last_error
                .lock()
                .map(|g| g.clone())
                .unwrap_or_default(),
        }
    }

    fn set_status(&self, status: WorkerStatus) {
        *self.lock_status() = Some(status);
    }

    pub(crate) fn set_failed(&self, reason: String) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(reason.clone());
        }
        self.set_status(WorkerStatus::Failed(reason));
    }

    fn record_decode_error(&self, reason: &str) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(reason.to_string());
        }
    }

    fn lock_status(&self) -> MutexGuard<'_, Option<WorkerStatus>> {
        match self.status.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Handle to a running capture thread.
pub struct CaptureWorker {
    name: String,
    health: Arc<WorkerHealth>,
    cancel: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl CaptureWorker {
    /// Spawn a worker thread over the given source. The cancel token must
    /// be the one the source polls, so stop requests reach both.
    pub fn spawn(
        name: &str,
        source: FrameSource,
        store: Arc<TrackStore>,
        cancel: CancelToken,
    ) -> std::io::Result<Self> {
        let health = WorkerHealth::new();
        let thread_health = Arc::clone(&health);
        let thread_cancel = cancel.clone();
        let handle = thread::Builder::new()
            .name(format!("sniff-{name}"))
            .spawn(move || run_loop(source, &store, &thread_health, &thread_cancel))?;
        Ok(Self {
            name: name.to_string(),
            health,
            cancel,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn health(&self) -> &Arc<WorkerHealth> {
        &self.health
    }

    /// Ask the worker to stop after its in-flight frame.
    pub fn request_stop(&self) {
        {
            let mut guard = self.health.lock_status();
            if matches!(guard.as_ref(), Some(WorkerStatus::Running) | None) {
                *guard = Some(WorkerStatus::Stopping);
            }
        }
        self.cancel.cancel();
    }

    /// Wait until the worker thread finishes or the deadline passes.
    /// Returns false for a worker that would not stop in time.
    pub fn join_deadline(&mut self, deadline: Instant) -> bool {
        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => return true,
        };
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                self.handle = Some(handle);
                return false;
            }
            thread::sleep(JOIN_POLL);
        }
        let _ = handle.join();
        true
    }
}

/// The capture loop itself, shared by interface threads and synchronous
/// file replay.
pub(crate) fn run_loop(
    mut source: FrameSource,
    store: &TrackStore,
    health: &WorkerHealth,
    cancel: &CancelToken,
) {
    let source_id = source.source_id().to_string();
    health.set_status(WorkerStatus::Running);
    debug!("capture worker for {} running", source_id);

    let outcome = loop {
        if cancel.is_cancelled() {
            break Ok(());
        }
        match source.next() {
            Ok(Some(frame)) => {
                health.frames_processed.fetch_add(1, Ordering::Relaxed);
                match rid::decode(&frame) {
                    Ok(observation) => {
                        health.frames_decoded.fetch_add(1, Ordering::Relaxed);
                        if let Err(e) = store.merge(observation) {
                            health.merge_drops.fetch_add(1, Ordering::Relaxed);
                            debug!("merge dropped on {}: {}", source_id, e);
                        }
                    }
                    Err(e) => {
                        health.record_decode_error(&e.to_string());
                        debug!("undecodable frame on {}: {}", source_id, e);
                    }
                }
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    match outcome {
        Ok(()) => {
            info!(
                "capture worker for {} stopped: {} frames, {} decoded, {} decode errors",
                source_id,
                health.frames_processed(),
                health.frames_decoded(),
                health.decode_errors()
            );
            health.set_status(WorkerStatus::Stopped);
        }
        Err(e) => {
            warn!("capture worker for {} failed: {}", source_id, e);
            health.set_failed(e.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::pcap::testutil::{pcap_bytes, DLT_IEEE80211};
    use crate::capture::source::FileSource;
    use crate::rid::parser::testutil::{basic_id_msg, beacon_frame, location_msg, message_pack};
    use std::io::Write;

    fn replay_source(name: &str, records: &[(i64, Vec<u8>)]) -> FrameSource {
        let path =
            std::env::temp_dir().join(format!("drone-sniffer-wrk-{}-{}", std::process::id(), name));
        let borrowed: Vec<(i64, &[u8])> = records
            .iter()
            .map(|(ts, payload)| (*ts, payload.as_slice()))
            .collect();
        let bytes = pcap_bytes(DLT_IEEE80211, &borrowed);
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&bytes)
            .unwrap();
        FrameSource::Replay(FileSource::open(&path).unwrap())
    }

    fn drone_beacon(serial: &str, mac_tail: u8) -> Vec<u8> {
        beacon_frame(
            [0x02, 0, 0, 0, 0, mac_tail],
            &message_pack(&[
                basic_id_msg(serial, 2),
                location_msg(47.0, 8.0, 100.0, 5.0, 90.0),
            ]),
        )
    }

    #[test]
    fn worker_counts_decodes_and_skips_garbage() {
        let store = Arc::new(TrackStore::new(64));
        let source = replay_source(
            "mixed",
            &[
                (100, drone_beacon("AAA111", 1)),
                (101, vec![0xFF; 30]),
                (102, drone_beacon("BBB222", 2)),
            ],
        );
        let health = WorkerHealth::new();
        let cancel = CancelToken::new();
        run_loop(source, &store, &health, &cancel);

        assert_eq!(health.status(), WorkerStatus::Stopped);
        assert_eq!(health.frames_processed(), 3);
        assert_eq!(health.frames_decoded(), 2);
        assert_eq!(health.decode_errors(), 1);
        assert_eq!(store.snapshot().len(), 2);
    }

    #[test]
    fn spawned_worker_reaches_stopped() {
        let store = Arc::new(TrackStore::new(64));
        let source = replay_source("spawned", &[(100, drone_beacon("CCC333", 3))]);
        let cancel = CancelToken::new();
        let mut worker =
            CaptureWorker::spawn("replay", source, Arc::clone(&store), cancel).unwrap();

        assert!(worker.join_deadline(Instant::now() + Duration::from_secs(5)));
        assert_eq!(worker.health().status(), WorkerStatus::Stopped);
        assert_eq!(store.snapshot().len(), 1);
    }

    #[test]
    fn source_failure_marks_worker_failed() {
        // a pcap with a record header promising more bytes than exist
        let path = std::env::temp_dir().join(format!(
            "drone-sniffer-wrk-{}-failed.pcap",
            std::process::id()
        ));
        let mut bytes = pcap_bytes(DLT_IEEE80211, &[]);
        crate::capture::pcap::testutil::push_record(&mut bytes, 100, &[1; 40]);
        bytes.truncate(bytes.len() - 10);
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&bytes)
            .unwrap();

        let store = Arc::new(TrackStore::new(64));
        let health = WorkerHealth::new();
        run_loop(
            FrameSource::Replay(FileSource::open(&path).unwrap()),
            &store,
            &health,
            &CancelToken::new(),
        );

        match health.status() {
            WorkerStatus::Failed(reason) => assert!(reason.contains("truncated")),
            other => panic!("expected failed worker, got {other:?}"),
        }
        let _ = std::fs::remove_file(&path);
    }
}
