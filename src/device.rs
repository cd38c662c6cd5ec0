//! Per-address device state.

use crate::mac_address::{AddressType, MacAddress};

/// Everything known about one observed address.
///
/// Records are owned by [`crate::registry::DeviceRegistry`] and only mutated
/// while an advertisement for the same address is being folded in.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub address: MacAddress,
    /// Classified once on first contact.
    pub address_type: Option<AddressType>,
    /// Last non-empty advertised name.
    pub name: String,
    /// Semicolon separated discoverability flag names.
    pub flags_info: String,
    pub rssi: i16,
    pub min_rssi: i16,
    pub max_rssi: i16,
    pub observations: u64,
    /// Last non-zero company code.
    pub manufacturer_code: u16,
    /// Last payload recognized as a decodable sensor frame.
    pub env_payload: Vec<u8>,
    /// Discriminator for sibling formats sharing one company code.
    pub payload_subtype: Option<u8>,
    /// Unix seconds.
    pub first_seen: i64,
    /// Unix seconds, never decreases.
    pub last_seen: i64,
}

impl DeviceRecord {
    pub fn new(address: MacAddress, rssi: i16, now: i64) -> Self {
        Self {
            address,
            address_type: None,
            name: String::new(),
            flags_info: String::new(),
            rssi,
            min_rssi: rssi,
            max_rssi: rssi,
            observations: 1,
            manufacturer_code: 0,
            env_payload: Vec::new(),
            payload_subtype: None,
            first_seen: now,
            last_seen: now,
        }
    }

    /// Fold a new RSSI sample into the record.
    pub fn observe(&mut self, rssi: i16, now: i64) {
        self.rssi = rssi;
        self.min_rssi = self.min_rssi.min(rssi);
        self.max_rssi = self.max_rssi.max(rssi);
        self.observations += 1;
        self.last_seen = self.last_seen.max(now);
    }

    pub fn is_fixed_address(&self) -> bool {
        self.address_type.is_some_and(|t| t.is_fixed())
    }

    /// Important records are kept much longer by the eviction policy.
    pub fn is_important(&self) -> bool {
        !self.name.is_empty() || self.is_fixed_address() || !self.env_payload.is_empty()
    }
}
