//! Vendor sensor payload decoders and the report-time dispatch table.
//!
//! Decoding is deferred until a report is built, so only the current
//! payload of a record is ever decoded and a record whose payload changes
//! shape is decoded by whichever rule matches it now. Rules are tried in
//! table order, most specific first; adding a format is one table entry.

pub mod omron;
pub mod switchbot;

use crate::device::DeviceRecord;
use omron::OmronEnv;
use switchbot::{MeterReading, PlugReading};
use thiserror::Error;

/// Error types for decoding sensor payloads.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Payload shorter than the format requires
    #[error("Payload too short: need {need} bytes, got {got}")]
    TooShort { need: usize, got: usize },
    /// Leading signature does not belong to the format
    #[error("Signature mismatch")]
    Signature,
    /// Invalid or corrupted data that cannot be decoded
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Sensor family selected for a record at report time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    OmronEnv,
    SwitchBotMeter,
    SwitchBotCo2Meter,
    SwitchBotOutdoorMeter,
    SwitchBotPlugMini,
}

/// A decoded sensor payload.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorReading {
    OmronEnv(OmronEnv),
    SwitchBotEnv(MeterReading),
    SwitchBotPlugMini(PlugReading),
}

struct SensorRule {
    kind: SensorKind,
    matches: fn(&DeviceRecord) -> bool,
}

fn is_omron(d: &DeviceRecord) -> bool {
    d.name.starts_with(omron::OMRON_NAME_PREFIX)
        && d.env_payload.len() >= omron::OMRON_FRAME_LEN
        && d.env_payload[0] == omron::OMRON_DATA_TYPE
}

fn is_meter(d: &DeviceRecord) -> bool {
    d.env_payload.len() == switchbot::METER_FRAME_LEN
        && d.env_payload.starts_with(&switchbot::METER_SIGNATURE)
}

fn is_switchbot_subtype(d: &DeviceRecord, subtype: u8) -> bool {
    d.manufacturer_code == switchbot::SWITCHBOT_COMPANY_CODE && d.payload_subtype == Some(subtype)
}

fn is_co2_meter(d: &DeviceRecord) -> bool {
    is_switchbot_subtype(d, switchbot::SUBTYPE_CO2_METER)
}

fn is_outdoor_meter(d: &DeviceRecord) -> bool {
    is_switchbot_subtype(d, switchbot::SUBTYPE_OUTDOOR_METER)
}

fn is_plug(d: &DeviceRecord) -> bool {
    d.manufacturer_code == switchbot::SWITCHBOT_COMPANY_CODE
}

const SENSOR_RULES: &[SensorRule] = &[
    SensorRule {
        kind: SensorKind::OmronEnv,
        matches: is_omron,
    },
    SensorRule {
        kind: SensorKind::SwitchBotMeter,
        matches: is_meter,
    },
    SensorRule {
        kind: SensorKind::SwitchBotCo2Meter,
        matches: is_co2_meter,
    },
    SensorRule {
        kind: SensorKind::SwitchBotOutdoorMeter,
        matches: is_outdoor_meter,
    },
    SensorRule {
        kind: SensorKind::SwitchBotPlugMini,
        matches: is_plug,
    },
];

/// Pick the decoder for a record's current payload.
pub fn classify(record: &DeviceRecord) -> Option<SensorKind> {
    if record.env_payload.is_empty() {
        return None;
    }
    SENSOR_RULES
        .iter()
        .find(|rule| (rule.matches)(record))
        .map(|rule| rule.kind)
}

/// Decode `payload` with the decoder for `kind`.
pub fn decode(kind: SensorKind, payload: &[u8]) -> Result<SensorReading, DecodeError> {
    match kind {
        SensorKind::OmronEnv => omron::decode(payload).map(SensorReading::OmronEnv),
        SensorKind::SwitchBotMeter => {
            switchbot::decode_meter(payload).map(SensorReading::SwitchBotEnv)
        }
        SensorKind::SwitchBotCo2Meter => {
            switchbot::decode_co2_meter(payload).map(SensorReading::SwitchBotEnv)
        }
        SensorKind::SwitchBotOutdoorMeter => {
            switchbot::decode_outdoor_meter(payload).map(SensorReading::SwitchBotEnv)
        }
        SensorKind::SwitchBotPlugMini => {
            switchbot::decode_plug(payload).map(SensorReading::SwitchBotPlugMini)
        }
    }
}

/// Classify and decode a record's payload.
///
/// `None` when the record carries no recognizable payload.
pub fn decode_record(record: &DeviceRecord) -> Option<Result<SensorReading, DecodeError>> {
    classify(record).map(|kind| decode(kind, &record.env_payload))
}
