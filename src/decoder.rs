//! Folding one advertisement into its device record.
//!
//! Elements are walked once, in order. Name, flags and company code are
//! collected into locals and only committed when non-empty, so a later
//! element of the same kind wins inside one advertisement while a missing
//! kind never erases what the record already holds. Sensor payloads are
//! stored raw and decoded at report time; motion frames are the exception
//! and go straight to the [`MotionSensorTracker`].

use crate::advertisement::{AdElement, Advertisement};
use crate::device::DeviceRecord;
use crate::mac_address::{AddressType, MacAddress};
use crate::motion::{MotionEvent, MotionSensorTracker};
use crate::sensors::DecodeError;
use crate::sensors::omron::{OMRON_COMPANY_CODE, OMRON_MIN_STORED_LEN};
use crate::sensors::switchbot::{
    self, DEVICE_TYPE_SIGNATURE, METER_FRAME_LEN, METER_SIGNATURE, MOTION_SIGNATURE,
    SWITCHBOT_COMPANY_CODE, SWITCHBOT_MIN_STORED_LEN, SWITCHBOT_PAYLOAD_OFFSET,
};
use dashmap::DashSet;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

pub const APPLE_COMPANY_CODE: u16 = 0x004C;
pub const MICROSOFT_COMPANY_CODE: u16 = 0x0006;

/// Discoverability flag bits and their report names, in report order.
const FLAG_NAMES: &[(u8, &str)] = &[
    (0x01, "LE Limited"),
    (0x02, "LE General"),
    (0x04, "No BR/EDR"),
    (0x08, "LE & BR/EDR (controller)"),
    (0x10, "LE & BR/EDR (host)"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManufacturerAction {
    /// Store `payload[offset..]` once the payload reaches `min_len`.
    StorePayload { min_len: usize, offset: usize },
    Ignore,
}

struct ManufacturerRule {
    company: u16,
    action: ManufacturerAction,
}

const MANUFACTURER_RULES: &[ManufacturerRule] = &[
    ManufacturerRule {
        company: OMRON_COMPANY_CODE,
        action: ManufacturerAction::StorePayload {
            min_len: OMRON_MIN_STORED_LEN,
            offset: 0,
        },
    },
    ManufacturerRule {
        company: SWITCHBOT_COMPANY_CODE,
        action: ManufacturerAction::StorePayload {
            min_len: SWITCHBOT_MIN_STORED_LEN,
            offset: SWITCHBOT_PAYLOAD_OFFSET,
        },
    },
    ManufacturerRule {
        company: APPLE_COMPANY_CODE,
        action: ManufacturerAction::Ignore,
    },
    ManufacturerRule {
        company: MICROSOFT_COMPANY_CODE,
        action: ManufacturerAction::Ignore,
    },
];

fn manufacturer_action(company: u16) -> Option<ManufacturerAction> {
    MANUFACTURER_RULES
        .iter()
        .find(|rule| rule.company == company)
        .map(|rule| rule.action)
}

/// Names of the flag bits set in `flags`, semicolon separated.
pub fn flag_names(flags: u8) -> String {
    FLAG_NAMES
        .iter()
        .filter(|(bit, _)| flags & bit == *bit)
        .map(|(_, name)| *name)
        .collect::<Vec<_>>()
        .join(";")
}

/// Parse a 128-bit service UUID list (little-endian on air).
pub fn parse_uuid128_list(data: &[u8]) -> Result<Vec<Uuid>, DecodeError> {
    if data.is_empty() || data.len() % 16 != 0 {
        return Err(DecodeError::InvalidData(format!(
            "128-bit service UUID list of {} bytes",
            data.len()
        )));
    }
    data.chunks_exact(16)
        .map(|chunk| {
            let mut bytes = chunk.to_vec();
            bytes.reverse();
            Uuid::from_slice(&bytes).map_err(|e| DecodeError::InvalidData(e.to_string()))
        })
        .collect()
}

/// Classifies advertisement elements and updates device records.
#[derive(Debug)]
pub struct AdvertisementDecoder {
    tracker: Arc<MotionSensorTracker>,
    seen_uuids: DashSet<(MacAddress, Uuid)>,
}

impl AdvertisementDecoder {
    pub fn new(tracker: Arc<MotionSensorTracker>) -> Self {
        Self {
            tracker,
            seen_uuids: DashSet::new(),
        }
    }

    /// Fold `adv` into `record`.
    ///
    /// Returns the motion tracker event when the advertisement carried a
    /// motion sensor frame.
    pub fn decode(&self, adv: &Advertisement, record: &mut DeviceRecord) -> Option<MotionEvent> {
        if record.address_type.is_none() {
            record.address_type = Some(AddressType::classify(&adv.address, adv.kind));
        }

        let mut name = String::new();
        let mut info = String::new();
        let mut code = 0u16;
        let mut motion = None;

        for element in &adv.elements {
            match element {
                AdElement::Flags(flags) => {
                    let names = flag_names(*flags);
                    if !names.is_empty() {
                        if !info.is_empty() {
                            info.push(';');
                        }
                        info.push_str(&names);
                    }
                }
                AdElement::LocalName(local) => name = local.clone(),
                AdElement::ManufacturerData { company, payload } => {
                    code = *company;
                    self.manufacturer_data(record, *company, payload);
                }
                AdElement::ServiceUuids128(data) => self.service_uuids(record.address, data),
                AdElement::ServiceData(data) => {
                    if let Some(event) = self.service_data(record, code, data) {
                        motion = Some(event);
                    }
                }
                AdElement::ServiceUuids16(_) | AdElement::TxPower(_) => {}
                AdElement::Malformed { ad_type, data } => {
                    debug!(address = %record.address, ad_type, ?data, "skipping malformed element");
                }
                AdElement::Other { ad_type, data } => {
                    debug!(address = %record.address, ad_type, ?data, "unknown element");
                }
            }
        }

        if !name.is_empty() {
            record.name = name;
        }
        if !info.is_empty() {
            record.flags_info = info;
        }
        if code != 0 {
            record.manufacturer_code = code;
        }
        motion
    }

    fn manufacturer_data(&self, record: &mut DeviceRecord, company: u16, payload: &[u8]) {
        match manufacturer_action(company) {
            Some(ManufacturerAction::StorePayload { min_len, offset }) => {
                if payload.len() >= min_len {
                    record.env_payload = payload[offset..].to_vec();
                    debug!(address = %record.address, company, payload = ?record.env_payload, "sensor payload");
                } else {
                    debug!(address = %record.address, company, len = payload.len(), "sensor payload too short");
                }
            }
            Some(ManufacturerAction::Ignore) => {}
            None => {
                debug!(address = %record.address, "manufacturer data code={:04x} data={:02x?}", company, payload);
            }
        }
    }

    fn service_uuids(&self, address: MacAddress, data: &[u8]) {
        match parse_uuid128_list(data) {
            Ok(uuids) => {
                for uuid in uuids {
                    if self.seen_uuids.insert((address, uuid)) {
                        debug!(%address, %uuid, "new service uuid");
                    }
                }
            }
            Err(e) => warn!(%address, "invalid service uuid: {}", e),
        }
    }

    fn service_data(
        &self,
        record: &mut DeviceRecord,
        code: u16,
        data: &[u8],
    ) -> Option<MotionEvent> {
        if data.len() == METER_FRAME_LEN && data.starts_with(&METER_SIGNATURE) {
            record.env_payload = data.to_vec();
            return None;
        }
        if data.starts_with(&MOTION_SIGNATURE) {
            return match switchbot::decode_motion(data) {
                Ok(frame) => Some(self.tracker.observe(record.address, frame)),
                Err(e) => {
                    debug!(address = %record.address, "motion frame skipped: {}", e);
                    None
                }
            };
        }
        let switchbot = code == SWITCHBOT_COMPANY_CODE
            || record.manufacturer_code == SWITCHBOT_COMPANY_CODE;
        if switchbot
            && data.starts_with(&DEVICE_TYPE_SIGNATURE)
            && let Some(subtype) = data.get(DEVICE_TYPE_SIGNATURE.len())
        {
            record.payload_subtype = Some(*subtype);
            return None;
        }
        debug!(address = %record.address, ?data, "service data");
        None
    }

    /// Drop per-address diagnostic state for an evicted device.
    pub fn forget(&self, address: &MacAddress) {
        self.seen_uuids.retain(|(a, _)| a != address);
    }

    pub fn tracker(&self) -> &Arc<MotionSensorTracker> {
        &self.tracker
    }
}
