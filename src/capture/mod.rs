//! Frame acquisition
//!
//! Everything between the radio and the decoder: the pcap container both
//! sources speak, the live/replay frame sources, and the capture worker
//! that drives frames through decode and merge.

pub(crate) mod pcap;
mod source;
pub mod worker;

pub use pcap::{LinkType, PcapReader, RawFrame, SourceError};
pub use source::{CancelToken, FileSource, FrameSource, LiveSource};
pub use worker::{CaptureWorker, WorkerHealth, WorkerHealthSnapshot, WorkerStatus};
