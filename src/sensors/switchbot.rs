//! SwitchBot broadcast formats.
//!
//! Several products share company code 0x0969. The manufacturer payload tail
//! (after the 6-byte MAC and the sequence byte) is stored as the sensor
//! payload and the service data device-type byte tells the siblings apart.
//!
//! Temperature is always encoded as a decimal nibble plus a 7-bit integer
//! part whose high bit set means "above zero".

use super::DecodeError;

/// Woan Technology (SwitchBot) company code.
pub const SWITCHBOT_COMPANY_CODE: u16 = 0x0969;

/// Offset of the telemetry tail inside the manufacturer payload.
pub const SWITCHBOT_PAYLOAD_OFFSET: usize = 7;

/// Manufacturer payload length required before the tail is stored.
pub const SWITCHBOT_MIN_STORED_LEN: usize = 12;

/// Legacy service UUID 0x0D00 followed by device type 'T' (Meter).
pub const METER_SIGNATURE: [u8; 3] = [0x00, 0x0D, 0x54];

/// Legacy service UUID 0x0D00 followed by device type 's' (Motion Sensor).
pub const MOTION_SIGNATURE: [u8; 3] = [0x00, 0x0D, 0x73];

/// Service UUID 0xFD3D; the next byte is the device type.
pub const DEVICE_TYPE_SIGNATURE: [u8; 2] = [0x3D, 0xFD];

/// Meter Pro CO2 device type.
pub const SUBTYPE_CO2_METER: u8 = 0x35;

/// Indoor/Outdoor (IP65) meter device type ('w').
pub const SUBTYPE_OUTDOOR_METER: u8 = 0x77;

/// Plug Mini "switch on" marker.
pub const PLUG_ON: u8 = 0x80;

pub const METER_FRAME_LEN: usize = 8;
pub const CO2_METER_MIN_LEN: usize = 8;
pub const OUTDOOR_METER_MIN_LEN: usize = 5;
pub const PLUG_MIN_LEN: usize = 5;
pub const MOTION_FRAME_MIN_LEN: usize = 8;

/// Temperature and humidity from one of the meter family formats.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterReading {
    /// degC
    pub temperature: f64,
    /// %RH
    pub humidity: f64,
    /// Percent, only carried by the service data frame.
    pub battery: Option<u8>,
    /// ppm, Meter Pro CO2 only.
    pub co2: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlugReading {
    pub switched_on: bool,
    pub overload: bool,
    pub load: u16,
}

/// Decoded motion sensor broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionFrame {
    pub moving: bool,
    /// Seconds since the last detected motion.
    pub elapsed_secs: u32,
    /// Percent.
    pub battery: u8,
    pub light_detected: bool,
}

fn require(data: &[u8], need: usize) -> Result<(), DecodeError> {
    if data.len() < need {
        return Err(DecodeError::TooShort {
            need,
            got: data.len(),
        });
    }
    Ok(())
}

fn temperature(decimal: u8, integer: u8) -> f64 {
    let t = f64::from(decimal & 0x0f) / 10.0 + f64::from(integer & 0x7f);
    if integer & 0x80 == 0x80 { t } else { -t }
}

/// Meter service data frame: `00 0d 54 <x> <bat> <dec> <int> <hum>`.
pub fn decode_meter(data: &[u8]) -> Result<MeterReading, DecodeError> {
    require(data, METER_FRAME_LEN)?;
    if !data.starts_with(&METER_SIGNATURE) {
        return Err(DecodeError::Signature);
    }
    Ok(MeterReading {
        temperature: temperature(data[5], data[6]),
        humidity: f64::from(data[7] & 0x7f),
        battery: Some(data[4] & 0x7f),
        co2: None,
    })
}

/// Meter Pro CO2 manufacturer tail: meter layout four bytes earlier, CO2 big-endian at 6..8.
pub fn decode_co2_meter(data: &[u8]) -> Result<MeterReading, DecodeError> {
    require(data, CO2_METER_MIN_LEN)?;
    Ok(MeterReading {
        temperature: temperature(data[1], data[2]),
        humidity: f64::from(data[3] & 0x7f),
        battery: None,
        co2: Some(u16::from_be_bytes([data[6], data[7]])),
    })
}

/// Outdoor meter manufacturer tail.
pub fn decode_outdoor_meter(data: &[u8]) -> Result<MeterReading, DecodeError> {
    require(data, OUTDOOR_METER_MIN_LEN)?;
    Ok(MeterReading {
        temperature: temperature(data[1], data[2]),
        humidity: f64::from(data[3] & 0x7f),
        battery: None,
        co2: None,
    })
}

/// Plug Mini manufacturer tail: `<on/off> <time> <wifi rssi> <load hi> <load lo>`.
pub fn decode_plug(data: &[u8]) -> Result<PlugReading, DecodeError> {
    require(data, PLUG_MIN_LEN)?;
    Ok(PlugReading {
        switched_on: data[0] == PLUG_ON,
        overload: data[3] & 0x80 == 0x80,
        load: u16::from(data[3] & 0x7f) * 256 + u16::from(data[4] & 0x7f),
    })
}

/// Motion sensor service data frame: `00 0d 73 <flags> <bat> <elapsed hi> <elapsed lo> <flags2>`.
pub fn decode_motion(data: &[u8]) -> Result<MotionFrame, DecodeError> {
    require(data, MOTION_FRAME_MIN_LEN)?;
    if !data.starts_with(&MOTION_SIGNATURE) {
        return Err(DecodeError::Signature);
    }
    let mut elapsed = u32::from(u16::from_be_bytes([data[5], data[6]]));
    if data[7] & 0x80 == 0x80 {
        elapsed += 0x10000;
    }
    Ok(MotionFrame {
        moving: data[3] & 0x40 == 0x40,
        elapsed_secs: elapsed,
        battery: data[4] & 0x7f,
        light_detected: data[7] & 0x02 == 0x02,
    })
}
