//! Concurrent device registry and eviction policy.
//!
//! The registry owns its storage; callers only go through `upsert`, `get`,
//! `snapshot` and `evict`. Storage is a sharded concurrent map so a report
//! pass can iterate while background workers read records of other
//! addresses.

use crate::device::DeviceRecord;
use crate::mac_address::MacAddress;
use dashmap::DashMap;
use std::time::Duration;

/// Default silence window for records that are not important.
pub const DEFAULT_EPHEMERAL_WINDOW: Duration = Duration::from_secs(15 * 60 + 10);

/// Default silence window for important records.
pub const DEFAULT_IMPORTANT_WINDOW: Duration = Duration::from_secs(48 * 60 * 60);

/// How long a record may stay silent before it is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
    pub ephemeral_window: Duration,
    pub important_window: Duration,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            ephemeral_window: DEFAULT_EPHEMERAL_WINDOW,
            important_window: DEFAULT_IMPORTANT_WINDOW,
        }
    }
}

impl EvictionPolicy {
    /// Whether `record` has been silent longer than its window at `now`.
    pub fn is_expired(&self, record: &DeviceRecord, now: i64) -> bool {
        let window = if record.is_important() {
            self.important_window
        } else {
            self.ephemeral_window
        };
        let window = i64::try_from(window.as_secs()).unwrap_or(i64::MAX);
        record.last_seen < now.saturating_sub(window)
    }
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: DashMap<MacAddress, DeviceRecord>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or update the record for `address` and hand it to `update`.
    ///
    /// A new record starts with `rssi = min = max = rssi`, one observation
    /// and both timestamps at `now`. An existing record has the sample
    /// folded in. `update` receives the current record and whether it was
    /// just created.
    pub fn upsert<R>(
        &self,
        address: MacAddress,
        rssi: i16,
        now: i64,
        update: impl FnOnce(&mut DeviceRecord, bool) -> R,
    ) -> R {
        let mut created = false;
        let mut entry = self
            .devices
            .entry(address)
            .and_modify(|record| record.observe(rssi, now))
            .or_insert_with(|| {
                created = true;
                DeviceRecord::new(address, rssi, now)
            });
        update(entry.value_mut(), created)
    }

    pub fn get(&self, address: &MacAddress) -> Option<DeviceRecord> {
        self.devices.get(address).map(|r| r.value().clone())
    }

    pub fn contains(&self, address: &MacAddress) -> bool {
        self.devices.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Cloned view of every record, ordered by address.
    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        let mut records: Vec<DeviceRecord> =
            self.devices.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| r.address);
        records
    }

    /// Remove every record the policy considers expired at `now`.
    ///
    /// Returns the removed addresses.
    pub fn evict(&self, now: i64, policy: &EvictionPolicy) -> Vec<MacAddress> {
        let mut removed = Vec::new();
        self.devices.retain(|address, record| {
            if policy.is_expired(record, now) {
                removed.push(*address);
                false
            } else {
                true
            }
        });
        removed.sort();
        removed
    }
}
