//! Drone track registry
//!
//! Aggregates observations into per-drone tracks. The map is sharded, so
//! merges for different drone ids never contend; `snapshot()` clones a
//! consistent view for the API and persistence consumers.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::rid::DroneObservation;

/// Current best-known state of a single drone.
#[derive(Debug, Clone, Serialize)]
pub struct DroneTrack {
    pub drone_id: String,
    /// Most recent observation (never replaced by an older one).
    pub latest: DroneObservation,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub observation_count: u64,
}

/// Merge rejection. Dropped and counted by the caller, never retried.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("track limit of {0} reached")]
    TrackLimit(usize),
}

/// Aggregate counters for the periodic summary log.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub tracks: usize,
    pub with_position: usize,
    pub total_observations: u64,
    pub merges_rejected: u64,
}

impl std::fmt::Display for StoreStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} tracks, {} with position, {} observations, {} rejected",
            self.tracks, self.with_position, self.total_observations, self.merges_rejected
        )
    }
}

/// Concurrent map from drone id to track. The only state shared between
/// capture workers.
pub struct TrackStore {
    tracks: DashMap<String, DroneTrack>,
    max_tracks: usize,
    // kept separately: DashMap::len() walks every shard
    active: AtomicUsize,
    merges_rejected: AtomicU64,
}

impl TrackStore {
    pub fn new(max_tracks: usize) -> Self {
        Self {
            tracks: DashMap::new(),
            max_tracks,
            active: AtomicUsize::new(0),
            merges_rejected: AtomicU64::new(0),
        }
    }

    /// Upsert the track for an observation's drone id.
    ///
    /// `last_seen` never decreases; for a given timestamp the last writer
    /// wins. Callers on unrelated keys are not blocked.
    pub fn merge(&self, observation: DroneObservation) -> Result<(), StoreError> {
        match self.tracks.entry(observation.drone_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let track = occupied.get_mut();
                track.observation_count += 1;
                if observation.observed_at >= track.last_seen {
                    track.last_seen = observation.observed_at;
                }
                if observation.observed_at >= track.latest.observed_at {
                    track.latest = observation;
                }
            }
            Entry::Vacant(vacant) => {
                if self.active.load(Ordering::Relaxed) >= self.max_tracks {
                    self.merges_rejected.fetch_add(1, Ordering::Relaxed);
                    return Err(StoreError::TrackLimit(self.max_tracks));
                }
                self.active.fetch_add(1, Ordering::Relaxed);
                debug!("new drone track: {}", observation.drone_id);
                vacant.insert(DroneTrack {
                    drone_id: observation.drone_id.clone(),
                    first_seen: observation.observed_at,
                    last_seen: observation.observed_at,
                    observation_count: 1,
                    latest: observation,
                });
            }
        }
        Ok(())
    }

    /// Read-only copy of every track, ordered by drone id for stable
    /// consumer output.
    pub fn snapshot(&self) -> Vec<DroneTrack> {
        let mut tracks: Vec<DroneTrack> =
            self.tracks.iter().map(|entry| entry.value().clone()).collect();
        tracks.sort_by(|a, b| a.drone_id.cmp(&b.drone_id));
        tracks
    }

    /// Remove tracks whose `last_seen` is older than `now - ttl` and
    /// return their ids.
    pub fn sweep_expired(&self, now: DateTime<Utc>, ttl: Duration) -> Vec<String> {
        let cutoff = match chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_sub_signed(ttl))
        {
            Some(cutoff) => cutoff,
            // a ttl too large to represent expires nothing
            None => return Vec::new(),
        };

        let candidates: Vec<String> = self
            .tracks
            .iter()
            .filter(|entry| entry.value().last_seen < cutoff)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = Vec::with_capacity(candidates.len());
        for id in candidates {
            // re-check under the shard lock: the track may have been
            // refreshed since the scan
            if self
                .tracks
                .remove_if(&id, |_, track| track.last_seen < cutoff)
                .is_some()
            {
                self.active.fetch_sub(1, Ordering::Relaxed);
                removed.push(id);
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StoreStats {
        let mut with_position = 0;
        let mut total_observations = 0;
        for entry in self.tracks.iter() {
            if entry.value().latest.has_position() {
                with_position += 1;
            }
            total_observations += entry.value().observation_count;
        }
        StoreStats {
            tracks: self.len(),
            with_position,
            total_observations,
            merges_rejected: self.merges_rejected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn observation(drone_id: &str, secs: i64) -> DroneObservation {
        DroneObservation {
            drone_id: drone_id.to_string(),
            latitude: Some(47.0),
            longitude: Some(8.0),
            altitude_m: Some(100.0 + secs as f64),
            speed_mps: None,
            heading_deg: None,
            operator_id: None,
            ua_type: None,
            rssi_dbm: None,
            observed_at: at(secs),
            source_id: "wlan0".to_string(),
        }
    }

    #[test]
    fn ordered_merges_accumulate() {
        let store = TrackStore::new(16);
        for secs in 1..=5 {
            store.merge(observation("drone-a", secs)).unwrap();
        }
        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].observation_count, 5);
        assert_eq!(snapshot[0].first_seen, at(1));
        assert_eq!(snapshot[0].last_seen, at(5));
        assert_eq!(snapshot[0].latest.altitude_m, Some(105.0));
    }

    #[test]
    fn out_of_order_merge_never_regresses_last_seen() {
        let store = TrackStore::new(16);
        store.merge(observation("drone-a", 50)).unwrap();
        store.merge(observation("drone-a", 20)).unwrap();

        let snapshot = store.snapshot();
        assert_eq!(snapshot[0].last_seen, at(50));
        assert_eq!(snapshot[0].observation_count, 2);
        // latest also keeps the newer observation
        assert_eq!(snapshot[0].latest.observed_at, at(50));
    }

    #[test]
    fn equal_timestamp_last_writer_wins() {
        let store = TrackStore::new(16);
        let mut first = observation("drone-a", 30);
        first.altitude_m = Some(1.0);
        let mut second = observation("drone-a", 30);
        second.altitude_m = Some(2.0);
        store.merge(first).unwrap();
        store.merge(second).unwrap();
        assert_eq!(store.snapshot()[0].latest.altitude_m, Some(2.0));
    }

    #[test]
    fn sweep_removes_exactly_the_stale() {
        let store = TrackStore::new(16);
        store.merge(observation("old", 10)).unwrap();
        store.merge(observation("edge", 40)).unwrap();
        store.merge(observation("fresh", 90)).unwrap();

        // ttl 60s at t=100: cutoff is 40; "edge" is exactly at the cutoff
        // and stays
        let removed = store.sweep_expired(at(100), Duration::from_secs(60));
        assert_eq!(removed, vec!["old".to_string()]);

        let ids: Vec<String> = store.snapshot().iter().map(|t| t.drone_id.clone()).collect();
        assert_eq!(ids, vec!["edge".to_string(), "fresh".to_string()]);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn track_limit_rejects_new_keys_only() {
        let store = TrackStore::new(2);
        store.merge(observation("a", 1)).unwrap();
        store.merge(observation("b", 2)).unwrap();
        assert!(matches!(
            store.merge(observation("c", 3)),
            Err(StoreError::TrackLimit(2))
        ));
        // existing keys still merge
        store.merge(observation("a", 4)).unwrap();
        assert_eq!(store.stats().merges_rejected, 1);
    }

    #[test]
    fn concurrent_disjoint_merges_lose_nothing() {
        let store = Arc::new(TrackStore::new(1024));
        let mut handles = Vec::new();
        for worker in 0..4 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    let id = format!("w{worker}-d{i}");
                    for secs in 1..=3 {
                        store.merge(observation(&id, secs)).unwrap();
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 400);
        assert!(snapshot.iter().all(|t| t.observation_count == 3));
        assert_eq!(store.len(), 400);
    }
}
