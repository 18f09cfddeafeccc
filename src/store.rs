//! Latest-known state per device.
//!
//! Advertisements arrive unordered from many devices and a broadcast-only
//! device never says goodbye, so liveness is inferred from how recently a
//! reading was stored. Staleness is evaluated on every read against the
//! caller's clock and is never stored.

use crate::mac_address::MacAddress;
use crate::reading::Reading;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Devices silent for longer than this are hidden from snapshots.
///
/// One 60 second scan cycle plus margin.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(60);

/// A copy of one device's latest state.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub device: MacAddress,
    pub reading: Reading,
    pub last_seen_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    reading: Reading,
    last_seen_at: Instant,
}

/// Concurrency-safe map from device address to its most recent reading.
///
/// Shared between the ingestion path and the metrics endpoint behind an
/// `Arc`. The lock is only held while inserting or copying entries.
#[derive(Debug, Default)]
pub struct DeviceStateStore {
    devices: Mutex<HashMap<MacAddress, Entry>>,
}

impl DeviceStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Every critical section leaves the map consistent, so a panic elsewhere
    // while holding the lock does not invalidate it.
    fn devices(&self) -> MutexGuard<'_, HashMap<MacAddress, Entry>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `reading` as the latest state of `device`, seen at `now`.
    ///
    /// Replaces any previous record for the device as a whole; last writer wins.
    pub fn upsert(&self, device: MacAddress, reading: Reading, now: Instant) {
        let entry = Entry {
            reading,
            last_seen_at: now,
        };
        self.devices().insert(device, entry);
    }

    /// Copy every record seen within `stale_after` of `now`.
    ///
    /// Stale records are skipped but kept, so a device shows up again as soon
    /// as it is updated. Order is unspecified.
    pub fn snapshot(&self, now: Instant, stale_after: Duration) -> Vec<DeviceRecord> {
        self.devices()
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_seen_at) <= stale_after)
            .map(|(device, entry)| DeviceRecord {
                device: *device,
                reading: entry.reading,
                last_seen_at: entry.last_seen_at,
            })
            .collect()
    }

    /// Number of stored records, stale ones included.
    pub fn len(&self) -> usize {
        self.devices().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
