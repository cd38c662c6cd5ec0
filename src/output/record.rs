//! Flat `type=<Type>,key=value,...` report records.

use crate::device::DeviceRecord;
use crate::motion::MotionState;
use crate::sensors::SensorReading;
use std::fmt;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Field values of a report record
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    /// Printed with two decimals.
    Float(f64),
    Bool(bool),
    String(String),
    /// Unix seconds, printed as RFC 3339.
    Time(i64),
}

fn fmt_time(secs: i64, f: &mut fmt::Formatter) -> fmt::Result {
    let formatted = OffsetDateTime::from_unix_timestamp(secs)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_default();
    f.write_str(&formatted)
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FieldValue::Int(n) => write!(f, "{n}"),
            FieldValue::Float(n) => write!(f, "{n:.2}"),
            FieldValue::Bool(b) => write!(f, "{b}"),
            FieldValue::String(s) => f.write_str(s),
            FieldValue::Time(secs) => fmt_time(*secs, f),
        }
    }
}

macro_rules! int_field {
    ($($t:ty),*) => {
        $(impl From<$t> for FieldValue {
            fn from(v: $t) -> Self {
                FieldValue::Int(i64::from(v))
            }
        })*
    };
}

int_field!(i8, i16, i32, i64, u8, u16, u32);

impl From<usize> for FieldValue {
    fn from(v: usize) -> Self {
        FieldValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

/// One report line: a `type` tag followed by fields in insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub kind: &'static str,
    pub fields: Vec<(&'static str, FieldValue)>,
}

impl Record {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, key: &'static str, value: impl Into<FieldValue>) -> Self {
        self.fields.push((key, value.into()));
        self
    }

    /// Record prefixed with the `address,name,rssi` fields every per-device type carries.
    pub fn for_device(kind: &'static str, device: &DeviceRecord) -> Self {
        Record::new(kind)
            .field("address", device.address.to_string())
            .field("name", device.name.as_str())
            .field("rssi", device.rssi)
    }

    /// Generic `Device` summary line.
    pub fn device(device: &DeviceRecord, vendor: &str) -> Self {
        let addr_type = device
            .address_type
            .map(|t| t.to_string())
            .unwrap_or_default();
        Record::for_device("Device", device)
            .field("min", device.min_rssi)
            .field("max", device.max_rssi)
            .field("addrType", addr_type)
            .field("vendor", vendor)
            .field("info", device.flags_info.as_str())
            .field("ft", FieldValue::Time(device.first_seen))
            .field("lt", FieldValue::Time(device.last_seen))
    }

    /// Typed sensor line for a decoded payload.
    pub fn sensor(device: &DeviceRecord, reading: &SensorReading) -> Self {
        match reading {
            SensorReading::OmronEnv(env) => Record::for_device("OMRONEnv", device)
                .field("seq", env.sequence)
                .field("temp", env.temperature)
                .field("hum", env.humidity)
                .field("lx", env.illuminance)
                .field("press", env.pressure)
                .field("sound", env.sound)
                .field("eTVOC", env.etvoc)
                .field("eCO2", env.eco2),
            SensorReading::SwitchBotEnv(meter) => {
                let mut record = Record::for_device("SwitchBotEnv", device)
                    .field("temp", meter.temperature)
                    .field("hum", meter.humidity);
                if let Some(battery) = meter.battery {
                    record = record.field("bat", battery);
                }
                if let Some(co2) = meter.co2 {
                    record = record.field("co2", co2);
                }
                record
            }
            SensorReading::SwitchBotPlugMini(plug) => Record::for_device("SwitchBotPlugMini", device)
                .field("sw", plug.switched_on)
                .field("over", plug.overload)
                .field("load", plug.load),
        }
    }

    /// Motion sensor line; `event` is `new`, `change` or `report`.
    pub fn motion(device: &DeviceRecord, state: &MotionState, event: &str) -> Self {
        Record::for_device("SwitchBotMotionSensor", device)
            .field("event", event)
            .field("moving", state.moving)
            .field("lastMove", state.last_move_elapsed)
            .field("bat", state.battery)
            .field("light", state.light_detected)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "type={}", self.kind)?;
        for (key, value) in &self.fields {
            write!(f, ",{key}={value}")?;
        }
        Ok(())
    }
}
