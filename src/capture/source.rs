//! Frame sources: live interface capture and file replay
//!
//! A live source spawns an external capture process in monitor mode and
//! parses the pcap stream from its stdout on a dedicated reader thread; a
//! replay source reads a capture file directly. Both hand out frames
//! through the same `next()` contract, and a pending `next()` on a live
//! source returns promptly once its cancel token is set.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use super::pcap::{PcapReader, RawFrame, SourceError};

/// How often a blocked live `next()` re-checks its cancel token.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// How long to wait for the capture process to produce its pcap header
/// before assuming it started fine and is just quiet.
const OPEN_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

const LIVE_CHANNEL_CAPACITY: usize = 1024;

/// Cooperative cancellation flag shared between a source, its worker, and
/// the coordinator.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Where raw frames come from. Selected at worker construction time.
pub enum FrameSource {
    Live(LiveSource),
    Replay(FileSource),
}

impl FrameSource {
    /// Pull the next frame. `Ok(None)` means the source is finished:
    /// exhausted for a replay, stopped for a live interface.
    pub fn next(&mut self) -> Result<Option<RawFrame>, SourceError> {
        match self {
            Self::Live(live) => live.next(),
            Self::Replay(file) => file.next(),
        }
    }

    pub fn source_id(&self) -> &str {
        match self {
            Self::Live(live) => &live.interface,
            Self::Replay(file) => &file.source_id,
        }
    }
}

/// Finite, restartable replay of a capture file.
pub struct FileSource {
    source_id: String,
    reader: PcapReader<BufReader<File>>,
    done: bool,
}

impl FileSource {
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        let source_id = path.display().to_string();
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => {
                SourceError::PermissionDenied(source_id.clone())
            }
            _ => SourceError::Unreadable(format!("{source_id}: {e}")),
        })?;
        let reader = PcapReader::new(BufReader::new(file), source_id.clone())?;
        Ok(Self {
            source_id,
            reader,
            done: false,
        })
    }

    fn next(&mut self) -> Result<Option<RawFrame>, SourceError> {
        if self.done {
            return Ok(None);
        }
        match self.reader.next_frame() {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => {
                self.done = true;
                Ok(None)
            }
            Err(e) => {
                self.done = true;
                Err(e)
            }
        }
    }
}

enum LiveEvent {
    Frame(RawFrame),
    /// Stream ended; `Some` carries the error, `None` is a plain EOF.
    Ended(Option<SourceError>),
}

/// Live capture on one monitor-mode interface via a spawned capture
/// process writing a pcap stream to stdout.
pub struct LiveSource {
    interface: String,
    child: Child,
    events: Receiver<LiveEvent>,
    cancel: CancelToken,
    finished: bool,
}

impl LiveSource {
    /// Spawn the capture process and wait briefly for its pcap header so
    /// an interface that cannot be opened fails here, not mid-capture.
    pub fn open(
        interface: &str,
        tcpdump_path: &Path,
        cancel: CancelToken,
    ) -> Result<Self, SourceError> {
        let mut child = Command::new(tcpdump_path)
            .args(["-i", interface, "-I", "-U", "-w", "-", "type", "mgt"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::PermissionDenied => {
                    SourceError::PermissionDenied(tcpdump_path.display().to_string())
                }
                _ => SourceError::Unreadable(format!(
                    "failed to spawn {}: {e}",
                    tcpdump_path.display()
                )),
            })?;

        let last_stderr = Arc::new(Mutex::new(None::<String>));

        // Log the capture process's stderr and keep its last line for
        // diagnostics when the stream fails to start.
        let stderr_logger = child.stderr.take().map(|stderr| {
            let iface = interface.to_string();
            let last = Arc::clone(&last_stderr);
            thread::spawn(move || {
                use std::io::BufRead;
                let reader = std::io::BufReader::new(stderr);
                for line in reader.lines().map_while(Result::ok) {
                    let line = line.trim().to_string();
                    if !line.is_empty() {
                        debug!("[capture {}] {}", iface, line);
                        if let Ok(mut guard) = last.lock() {
                            *guard = Some(line);
                        }
                    }
                }
            })
        });

        let stdout = child.stdout.take().ok_or_else(|| {
            SourceError::Unreadable("capture process has no stdout".to_string())
        })?;

        let (event_tx, event_rx) = bounded::<LiveEvent>(LIVE_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = bounded::<Result<(), SourceError>>(1);

        let iface = interface.to_string();
        let spawn_result = thread::Builder::new()
            .name(format!("capture-{interface}"))
            .spawn(move || pump_stream(stdout, iface, ready_tx, event_tx));
        if let Err(e) = spawn_result {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SourceError::Unreadable(format!(
                "failed to spawn reader thread: {e}"
            )));
        }

        // Bounded handshake: a dead interface makes the process exit
        // before writing any pcap header.
        match ready_rx.recv_timeout(OPEN_HANDSHAKE_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(_)) | Err(RecvTimeoutError::Disconnected) => {
                let _ = child.kill();
                let _ = child.wait();
                // the dead child closes its stderr pipe, so the logger
                // thread finishes promptly and the last line is final
                if let Some(handle) = stderr_logger {
                    let _ = handle.join();
                }
                let detail = last_stderr
                    .lock()
                    .ok()
                    .and_then(|g| g.clone())
                    .unwrap_or_else(|| "capture process produced no pcap stream".to_string());
                if detail.to_lowercase().contains("permission") {
                    return Err(SourceError::PermissionDenied(detail));
                }
                return Err(SourceError::InterfaceUnavailable(detail));
            }
            Err(RecvTimeoutError::Timeout) => {
                // header not seen yet; treat as started and let `next()`
                // surface any later failure
            }
        }

        Ok(Self {
            interface: interface.to_string(),
            child,
            events: event_rx,
            cancel,
            finished: false,
        })
    }

    fn next(&mut self) -> Result<Option<RawFrame>, SourceError> {
        if self.finished {
            return Ok(None);
        }
        loop {
            if self.cancel.is_cancelled() {
                self.terminate();
                return Ok(None);
            }
            match self.events.recv_timeout(POLL_INTERVAL) {
                Ok(LiveEvent::Frame(frame)) => return Ok(Some(frame)),
                Ok(LiveEvent::Ended(None)) | Err(RecvTimeoutError::Disconnected) => {
                    self.finished = true;
                    if self.cancel.is_cancelled() {
                        return Ok(None);
                    }
                    return Err(SourceError::InterfaceUnavailable(format!(
                        "capture process on {} ended unexpectedly",
                        self.interface
                    )));
                }
                Ok(LiveEvent::Ended(Some(e))) => {
                    self.finished = true;
                    return Err(e);
                }
                Err(RecvTimeoutError::Timeout) => continue,
            }
        }
    }

    fn terminate(&mut self) {
        self.finished = true;
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for LiveSource {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Reader-thread loop: parse the pcap stream and forward frames until the
/// stream ends or the receiving side goes away.
fn pump_stream(
    stdout: std::process::ChildStdout,
    interface: String,
    ready_tx: Sender<Result<(), SourceError>>,
    event_tx: Sender<LiveEvent>,
) {
    let mut reader = match PcapReader::new(BufReader::new(stdout), interface.clone()) {
        Ok(reader) => {
            let _ = ready_tx.send(Ok(()));
            reader
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e.clone()));
            let _ = event_tx.send(LiveEvent::Ended(Some(e)));
            return;
        }
    };

    loop {
        match reader.next_frame() {
            Ok(Some(frame)) => match event_tx.try_send(LiveEvent::Frame(frame)) {
                Ok(()) => {}
                Err(crossbeam_channel::TrySendError::Full(_)) => {
                    // a full channel drops the frame rather than stalling
                    // the capture process
                    debug!("frame channel full on {}, dropping frame", interface);
                }
                Err(crossbeam_channel::TrySendError::Disconnected(_)) => return,
            },
            Ok(None) => {
                let _ = event_tx.send(LiveEvent::Ended(None));
                return;
            }
            Err(e) => {
                warn!("capture stream on {} failed: {}", interface, e);
                let _ = event_tx.send(LiveEvent::Ended(Some(e)));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::pcap::testutil::{pcap_bytes, push_record, DLT_IEEE80211};
    use std::io::Write;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("drone-sniffer-src-{}-{}", std::process::id(), name))
    }

    #[test]
    fn replay_is_finite_and_restartable() {
        let path = temp_path("finite.pcap");
        let bytes = pcap_bytes(DLT_IEEE80211, &[(10, &[1]), (11, &[2])]);
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&bytes)
            .unwrap();

        for _ in 0..2 {
            let mut source = FileSource::open(&path).unwrap();
            let mut frames = 0;
            while let Some(_frame) = source.next().unwrap() {
                frames += 1;
            }
            assert_eq!(frames, 2);
            // stays exhausted
            assert!(source.next().unwrap().is_none());
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn replay_delivers_frames_before_truncation() {
        let path = temp_path("truncated.pcap");
        let mut bytes = pcap_bytes(DLT_IEEE80211, &[(10, &[1, 2, 3])]);
        push_record(&mut bytes, 11, &[9; 30]);
        bytes.truncate(bytes.len() - 20);
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&bytes)
            .unwrap();

        let mut source = FileSource::open(&path).unwrap();
        assert!(source.next().unwrap().is_some());
        assert!(matches!(source.next(), Err(SourceError::Truncated(_))));
        // a failed source is finished
        assert!(source.next().unwrap().is_none());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_file_is_unreadable() {
        match FileSource::open(Path::new("/nonexistent/no.pcap")) {
            Err(SourceError::Unreadable(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("expected open to fail"),
        }
    }

    #[test]
    fn cancel_token_round_trip() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
