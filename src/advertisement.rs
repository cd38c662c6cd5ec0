//! Advertisement observations and their typed data elements.
//!
//! An advertisement payload is a sequence of AD structures
//! (`length`, `type`, `data...`). Each structure is turned into one
//! [`AdElement`] variant; structures that are too short for their type
//! become [`AdElement::Malformed`] and are skipped by the decoder.

use crate::mac_address::{AddressKind, MacAddress};

// AD types
pub const AD_TYPE_FLAGS: u8 = 0x01;
pub const AD_TYPE_INCOMPLETE_16BIT_SERVICE: u8 = 0x02;
pub const AD_TYPE_COMPLETE_16BIT_SERVICE: u8 = 0x03;
pub const AD_TYPE_INCOMPLETE_128BIT_SERVICE: u8 = 0x06;
pub const AD_TYPE_COMPLETE_128BIT_SERVICE: u8 = 0x07;
pub const AD_TYPE_SHORTENED_LOCAL_NAME: u8 = 0x08;
pub const AD_TYPE_COMPLETE_LOCAL_NAME: u8 = 0x09;
pub const AD_TYPE_TX_POWER: u8 = 0x0A;
pub const AD_TYPE_SERVICE_DATA_16BIT: u8 = 0x16;
pub const AD_TYPE_MANUFACTURER_DATA: u8 = 0xFF;

/// One typed element of an advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdElement {
    /// Discoverability flags (exactly one byte).
    Flags(u8),
    /// Complete or shortened local name.
    LocalName(String),
    /// Manufacturer specific data split into company code and payload.
    ManufacturerData { company: u16, payload: Vec<u8> },
    /// List of 16-bit service UUIDs.
    ServiceUuids16(Vec<u16>),
    /// Raw 128-bit service UUID list, parsed lazily by the decoder.
    ServiceUuids128(Vec<u8>),
    /// 16-bit service data, including the little-endian UUID prefix.
    ServiceData(Vec<u8>),
    TxPower(i8),
    /// A known type whose payload is too short or too long for it.
    Malformed { ad_type: u8, data: Vec<u8> },
    /// Any other AD type.
    Other { ad_type: u8, data: Vec<u8> },
}

impl AdElement {
    /// Build a typed element from a raw AD type and its payload.
    pub fn from_raw(ad_type: u8, data: &[u8]) -> Self {
        let malformed = || AdElement::Malformed {
            ad_type,
            data: data.to_vec(),
        };

        match ad_type {
            AD_TYPE_FLAGS => match data {
                [flags] => AdElement::Flags(*flags),
                _ => malformed(),
            },
            AD_TYPE_COMPLETE_LOCAL_NAME | AD_TYPE_SHORTENED_LOCAL_NAME => {
                AdElement::LocalName(String::from_utf8_lossy(data).into_owned())
            }
            AD_TYPE_MANUFACTURER_DATA => match data {
                [lo, hi, payload @ ..] => AdElement::ManufacturerData {
                    company: u16::from_le_bytes([*lo, *hi]),
                    payload: payload.to_vec(),
                },
                _ => malformed(),
            },
            AD_TYPE_INCOMPLETE_16BIT_SERVICE | AD_TYPE_COMPLETE_16BIT_SERVICE => {
                if data.len() % 2 != 0 {
                    return malformed();
                }
                AdElement::ServiceUuids16(
                    data.chunks_exact(2)
                        .map(|c| u16::from_le_bytes([c[0], c[1]]))
                        .collect(),
                )
            }
            AD_TYPE_INCOMPLETE_128BIT_SERVICE | AD_TYPE_COMPLETE_128BIT_SERVICE => {
                AdElement::ServiceUuids128(data.to_vec())
            }
            AD_TYPE_SERVICE_DATA_16BIT => match data {
                [_, _, ..] => AdElement::ServiceData(data.to_vec()),
                _ => malformed(),
            },
            AD_TYPE_TX_POWER => match data {
                [power] => AdElement::TxPower(*power as i8),
                _ => malformed(),
            },
            _ => AdElement::Other {
                ad_type,
                data: data.to_vec(),
            },
        }
    }
}

/// Split an advertising data blob into typed elements.
///
/// Parsing stops at a zero-length structure or at one that runs past the
/// end of the buffer; elements before it are kept.
pub fn parse_ad_structures(ad_data: &[u8]) -> Vec<AdElement> {
    let mut elements = Vec::new();
    let mut offset = 0;
    while offset + 2 <= ad_data.len() {
        let len = ad_data[offset] as usize;
        if len == 0 || offset + 1 + len > ad_data.len() {
            break;
        }

        let ad_type = ad_data[offset + 1];
        let data = &ad_data[offset + 2..offset + 1 + len];
        elements.push(AdElement::from_raw(ad_type, data));

        offset += 1 + len;
    }
    elements
}

/// One advertisement observation handed over by a transport backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub address: MacAddress,
    pub kind: AddressKind,
    /// Signal strength in dBm. Zero means "no reading".
    pub rssi: i16,
    pub elements: Vec<AdElement>,
}

impl Advertisement {
    pub fn new(address: MacAddress, kind: AddressKind, rssi: i16) -> Self {
        Self {
            address,
            kind,
            rssi,
            elements: Vec::new(),
        }
    }

    /// Append an element, builder style.
    pub fn with(mut self, element: AdElement) -> Self {
        self.elements.push(element);
        self
    }
}
