//! OMRON environment sensor (2JCIE-BU) broadcast frame.
//!
//! ```text
//! 01          data type
//! c5          sequence number
//! a9 09       temperature    0.01 degC
//! cd 1a       humidity       0.01 %RH
//! 0d 00       illuminance    1 lx
//! 26 6c 0f 00 pressure       0.001 hPa
//! 3d 13       sound level    0.01 dB
//! 07 00       eTVOC          1 ppb
//! c3 01       eCO2           1 ppm
//! ```
//! All multi-byte values are little-endian.

use super::DecodeError;

/// Bluetooth company identifier of OMRON Corporation.
pub const OMRON_COMPANY_CODE: u16 = 0x02D5;

/// Data type byte of the sensing-data frame.
pub const OMRON_DATA_TYPE: u8 = 0x01;

/// Length of a complete frame.
pub const OMRON_FRAME_LEN: usize = 18;

/// Manufacturer payload length required before a frame is stored.
pub const OMRON_MIN_STORED_LEN: usize = 16;

/// Name prefix of the USB/BAG type sensors.
pub const OMRON_NAME_PREFIX: &str = "Rbt";

#[derive(Debug, Clone, PartialEq)]
pub struct OmronEnv {
    pub sequence: u8,
    /// degC
    pub temperature: f64,
    /// %RH
    pub humidity: f64,
    /// lx
    pub illuminance: u16,
    /// hPa
    pub pressure: f64,
    /// dB
    pub sound: f64,
    /// ppb
    pub etvoc: u16,
    /// ppm
    pub eco2: u16,
}

fn le16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

/// Decode an 18-byte OMRON sensing frame.
pub fn decode(data: &[u8]) -> Result<OmronEnv, DecodeError> {
    if data.len() < OMRON_FRAME_LEN {
        return Err(DecodeError::TooShort {
            need: OMRON_FRAME_LEN,
            got: data.len(),
        });
    }
    if data[0] != OMRON_DATA_TYPE {
        return Err(DecodeError::Signature);
    }

    let pressure = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);

    Ok(OmronEnv {
        sequence: data[1],
        temperature: f64::from(le16(data, 2) as i16) / 100.0,
        humidity: f64::from(le16(data, 4)) / 100.0,
        illuminance: le16(data, 6),
        pressure: f64::from(pressure) / 1000.0,
        sound: f64::from(le16(data, 12)) / 100.0,
        etvoc: le16(data, 14),
        eco2: le16(data, 16),
    })
}
