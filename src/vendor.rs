//! Vendor labels for the `Device` report line.
//!
//! Only a handful of company identifiers and OUI prefixes commonly seen
//! around sensor deployments are built in.

use crate::device::DeviceRecord;

/// Label used when neither the company code nor the address prefix is known.
pub const UNKNOWN_VENDOR: &str = "unknown";

const COMPANY_CODES: &[(u16, &str)] = &[
    (0x0006, "Microsoft"),
    (0x004C, "Apple, Inc."),
    (0x0075, "Samsung Electronics Co. Ltd."),
    (0x0087, "Garmin International, Inc."),
    (0x009E, "Bose Corporation"),
    (0x00E0, "Google"),
    (0x0157, "Anhui Huami Information Technology Co., Ltd."),
    (0x02D5, "OMRON Corporation"),
    (0x038F, "Xiaomi Inc."),
    (0x0499, "Ruuvi Innovations Ltd."),
    (0x0969, "Woan Technology (Shenzhen) Co., Ltd."),
];

const OUI_PREFIXES: &[([u8; 3], &str)] = &[
    ([0x00, 0x1A, 0x7D], "cyber-blue(HK)Ltd"),
    ([0x28, 0x6D, 0xCD], "Beijing Winner Microelectronics"),
    ([0x3C, 0x71, 0xBF], "Espressif Inc."),
    ([0x58, 0x2D, 0x34], "Qingping Electronics (Suzhou) Co., Ltd"),
    ([0xA4, 0xC1, 0x38], "Telink Semiconductor (Taipei) Co. Ltd."),
    ([0xB8, 0x27, 0xEB], "Raspberry Pi Foundation"),
    ([0xDC, 0xA6, 0x32], "Raspberry Pi Trading Ltd"),
];

pub fn company_name(code: u16) -> Option<&'static str> {
    COMPANY_CODES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| *name)
}

pub fn oui_vendor(prefix: [u8; 3]) -> Option<&'static str> {
    OUI_PREFIXES
        .iter()
        .find(|(p, _)| *p == prefix)
        .map(|(_, name)| *name)
}

/// `Name(0xcccc)` for a known company code, else the OUI vendor, else `unknown`.
pub fn vendor_label(device: &DeviceRecord) -> String {
    if device.manufacturer_code != 0
        && let Some(name) = company_name(device.manufacturer_code)
    {
        return format!("{}(0x{:04x})", name, device.manufacturer_code);
    }
    oui_vendor(device.address.oui())
        .unwrap_or(UNKNOWN_VENDOR)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac_address::MacAddress;

    fn device(address: [u8; 6], code: u16) -> DeviceRecord {
        let mut d = DeviceRecord::new(MacAddress(address), -60, 0);
        d.manufacturer_code = code;
        d
    }

    #[test]
    fn test_company_code_label() {
        let d = device([0xAA, 0, 0, 0, 0, 1], 0x02D5);
        assert_eq!(vendor_label(&d), "OMRON Corporation(0x02d5)");
    }

    #[test]
    fn test_falls_back_to_oui() {
        let d = device([0xB8, 0x27, 0xEB, 0, 0, 1], 0x1234);
        assert_eq!(vendor_label(&d), "Raspberry Pi Foundation");
    }

    #[test]
    fn test_unknown() {
        let d = device([0xAA, 0, 0, 0, 0, 1], 0);
        assert_eq!(vendor_label(&d), UNKNOWN_VENDOR);
    }
}
