//! Classic pcap container parsing
//!
//! Both frame sources speak this format: the replay source reads it from a
//! file, the live source reads it from the capture process's stdout. The
//! reader validates the global header once, then yields length-prefixed,
//! timestamped records until the stream ends or desynchronizes.

use std::io::Read;

use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;

/// Little-endian magics; the byte-swapped pair covers big-endian writers.
const MAGIC_MICROS: u32 = 0xA1B2_C3D4;
const MAGIC_MICROS_SWAPPED: u32 = 0xD4C3_B2A1;
const MAGIC_NANOS: u32 = 0xA1B2_3C4D;
const MAGIC_NANOS_SWAPPED: u32 = 0x4D3C_B2A1;

const GLOBAL_HEADER_LEN: usize = 24;
const RECORD_HEADER_LEN: usize = 16;

/// Upper bound for a single captured frame; anything larger means the
/// stream has desynchronized.
const MAX_FRAME_LEN: u32 = 256 * 1024;

/// pcap datalink of the capture, as far as the decoder cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// DLT 127: Radiotap header + 802.11
    Radiotap,
    /// DLT 105: raw 802.11
    Ieee80211,
    Other(u32),
}

impl From<u32> for LinkType {
    fn from(dlt: u32) -> Self {
        match dlt {
            127 => Self::Radiotap,
            105 => Self::Ieee80211,
            other => Self::Other(other),
        }
    }
}

/// One captured frame, created by a frame source and consumed exactly once
/// by the decoder.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Interface or file that produced the frame.
    pub source_id: String,
    pub captured_at: DateTime<Utc>,
    /// Link-layer bytes as captured (Radiotap and/or 802.11).
    pub payload: Vec<u8>,
    pub link: LinkType,
}

/// Failure of a frame source. Recorded against the owning interface or
/// replay job; never crashes the coordinator.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("capture source unreadable: {0}")]
    Unreadable(String),

    #[error("capture stream truncated: {0}")]
    Truncated(String),

    #[error("interface unavailable: {0}")]
    InterfaceUnavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

/// Streaming reader for a classic pcap container.
pub struct PcapReader<R> {
    inner: R,
    source_id: String,
    swapped: bool,
    nanos: bool,
    link: LinkType,
}

impl<R: Read> PcapReader<R> {
    /// Read and validate the global header.
    pub fn new(mut inner: R, source_id: String) -> Result<Self, SourceError> {
        let mut header = [0u8; GLOBAL_HEADER_LEN];
        let got = fill(&mut inner, &mut header)
            .map_err(|e| SourceError::Unreadable(format!("pcap header: {e}")))?;
        if got < GLOBAL_HEADER_LEN {
            return Err(SourceError::Unreadable("missing pcap global header".into()));
        }

        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let (swapped, nanos) = match magic {
            MAGIC_MICROS => (false, false),
            MAGIC_MICROS_SWAPPED => (true, false),
            MAGIC_NANOS => (false, true),
            MAGIC_NANOS_SWAPPED => (true, true),
            _ => return Err(SourceError::Unreadable("bad pcap magic".into())),
        };

        let link_raw = read_u32(&header[20..24], swapped);
        Ok(Self {
            inner,
            source_id,
            swapped,
            nanos,
            link: LinkType::from(link_raw),
        })
    }

    pub fn link(&self) -> LinkType {
        self.link
    }

    /// Next record, `None` at a clean end of stream.
    pub fn next_frame(&mut self) -> Result<Option<RawFrame>, SourceError> {
        let mut header = [0u8; RECORD_HEADER_LEN];
        let got = fill(&mut self.inner, &mut header)
            .map_err(|e| SourceError::Truncated(format!("record header: {e}")))?;
        if got == 0 {
            return Ok(None);
        }
        if got < RECORD_HEADER_LEN {
            return Err(SourceError::Truncated("record header cut short".into()));
        }

        let ts_sec = read_u32(&header[0..4], self.swapped);
        let ts_frac = read_u32(&header[4..8], self.swapped);
        let incl_len = read_u32(&header[8..12], self.swapped);

        if incl_len > MAX_FRAME_LEN {
            return Err(SourceError::Truncated(format!(
                "implausible frame length {incl_len}"
            )));
        }

        let mut payload = vec![0u8; incl_len as usize];
        let got = fill(&mut self.inner, &mut payload)
            .map_err(|e| SourceError::Truncated(format!("frame payload: {e}")))?;
        if got < payload.len() {
            return Err(SourceError::Truncated("frame payload cut short".into()));
        }

        let nsec = if self.nanos { ts_frac } else { ts_frac.saturating_mul(1000) };
        let captured_at = Utc
            .timestamp_opt(ts_sec as i64, nsec)
            .single()
            .unwrap_or(DateTime::UNIX_EPOCH);

        Ok(Some(RawFrame {
            source_id: self.source_id.clone(),
            captured_at,
            payload,
            link: self.link,
        }))
    }
}

fn read_u32(bytes: &[u8], swapped: bool) -> u32 {
    let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
    if swapped {
        u32::from_be_bytes(raw)
    } else {
        u32::from_le_bytes(raw)
    }
}

/// Read until `buf` is full or the stream ends; returns the filled length.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Test-only pcap writer mirroring the reader's expectations.
#[cfg(test)]
pub(crate) mod testutil {
    /// DLT 105, see [`super::LinkType`].
    pub const DLT_IEEE80211: u32 = 105;

    pub fn pcap_bytes(linktype: u32, records: &[(i64, &[u8])]) -> Vec<u8> {
        let mut out = global_header(linktype);
        for (ts_sec, payload) in records {
            push_record(&mut out, *ts_sec, payload);
        }
        out
    }

    pub fn global_header(linktype: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(24);
        out.extend_from_slice(&0xA1B2_C3D4u32.to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes()); // major
        out.extend_from_slice(&4u16.to_le_bytes()); // minor
        out.extend_from_slice(&0i32.to_le_bytes()); // thiszone
        out.extend_from_slice(&0u32.to_le_bytes()); // sigfigs
        out.extend_from_slice(&65535u32.to_le_bytes()); // snaplen
        out.extend_from_slice(&linktype.to_le_bytes());
        out
    }

    pub fn push_record(out: &mut Vec<u8>, ts_sec: i64, payload: &[u8]) {
        out.extend_from_slice(&(ts_sec as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use std::io::Cursor;

    #[test]
    fn reads_records_in_order() {
        let bytes = pcap_bytes(DLT_IEEE80211, &[(100, &[1, 2, 3]), (101, &[4, 5])]);
        let mut reader = PcapReader::new(Cursor::new(bytes), "test".into()).unwrap();
        assert_eq!(reader.link(), LinkType::Ieee80211);

        let first = reader.next_frame().unwrap().unwrap();
        assert_eq!(first.payload, vec![1, 2, 3]);
        assert_eq!(first.captured_at.timestamp(), 100);

        let second = reader.next_frame().unwrap().unwrap();
        assert_eq!(second.payload, vec![4, 5]);

        assert!(reader.next_frame().unwrap().is_none());
        // clean end stays at None
        assert!(reader.next_frame().unwrap().is_none());
    }

    #[test]
    fn radiotap_linktype_is_recognized() {
        let bytes = pcap_bytes(127, &[]);
        let reader = PcapReader::new(Cursor::new(bytes), "test".into()).unwrap();
        assert_eq!(reader.link(), LinkType::Radiotap);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = pcap_bytes(DLT_IEEE80211, &[]);
        bytes[0] = 0x00;
        assert!(matches!(
            PcapReader::new(Cursor::new(bytes), "test".into()),
            Err(SourceError::Unreadable(_))
        ));
    }

    #[test]
    fn truncated_payload_is_reported_after_prior_frames() {
        let mut bytes = pcap_bytes(DLT_IEEE80211, &[(100, &[1, 2, 3])]);
        push_record(&mut bytes, 101, &[9; 40]);
        bytes.truncate(bytes.len() - 25); // cut the final frame mid-payload

        let mut reader = PcapReader::new(Cursor::new(bytes), "test".into()).unwrap();
        assert!(reader.next_frame().unwrap().is_some());
        assert!(matches!(
            reader.next_frame(),
            Err(SourceError::Truncated(_))
        ));
    }

    #[test]
    fn truncated_record_header_is_reported() {
        let mut bytes = pcap_bytes(DLT_IEEE80211, &[]);
        bytes.extend_from_slice(&[0u8; 7]); // partial record header

        let mut reader = PcapReader::new(Cursor::new(bytes), "test".into()).unwrap();
        assert!(matches!(
            reader.next_frame(),
            Err(SourceError::Truncated(_))
        ));
    }

    #[test]
    fn implausible_length_means_desync() {
        let mut bytes = pcap_bytes(DLT_IEEE80211, &[]);
        bytes.extend_from_slice(&[0u8; 8]); // ts
        bytes.extend_from_slice(&(10_000_000u32).to_le_bytes());
        bytes.extend_from_slice(&(10_000_000u32).to_le_bytes());

        let mut reader = PcapReader::new(Cursor::new(bytes), "test".into()).unwrap();
        assert!(matches!(
            reader.next_frame(),
            Err(SourceError::Truncated(_))
        ));
    }

    #[test]
    fn byte_swapped_header_is_accepted() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0xA1B2_C3D4u32.to_be_bytes());
        bytes.extend_from_slice(&2u16.to_be_bytes());
        bytes.extend_from_slice(&4u16.to_be_bytes());
        bytes.extend_from_slice(&0i32.to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.extend_from_slice(&65535u32.to_be_bytes());
        bytes.extend_from_slice(&105u32.to_be_bytes());
        // one record, big-endian headers
        bytes.extend_from_slice(&77u32.to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.extend_from_slice(&2u32.to_be_bytes());
        bytes.extend_from_slice(&2u32.to_be_bytes());
        bytes.extend_from_slice(&[0xAB, 0xCD]);

        let mut reader = PcapReader::new(Cursor::new(bytes), "test".into()).unwrap();
        assert_eq!(reader.link(), LinkType::Ieee80211);
        let frame = reader.next_frame().unwrap().unwrap();
        assert_eq!(frame.captured_at.timestamp(), 77);
        assert_eq!(frame.payload, vec![0xAB, 0xCD]);
    }
}
