//! Bluetooth device addresses and LE address-type classification.
//!
//! The address is stored as a compact 6-byte array in display order (most
//! significant byte first), decoupled from any specific Bluetooth library.

use std::fmt;

/// A Bluetooth device address stored as a compact 6-byte array.
///
/// Used as the registry key, so it is `Copy` and cheap to hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// The three-byte organizationally unique prefix.
    pub fn oui(&self) -> [u8; 3] {
        [self.0[0], self.0[1], self.0[2]]
    }

    /// Sub-type bits of a random address (two most significant bits).
    fn random_subtype_bits(&self) -> u8 {
        self.0[0] >> 6
    }

    pub fn is_static(&self) -> bool {
        self.random_subtype_bits() == 0b11
    }

    pub fn is_resolvable(&self) -> bool {
        self.random_subtype_bits() == 0b01
    }

    pub fn is_non_resolvable(&self) -> bool {
        self.random_subtype_bits() == 0b00
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

#[cfg(feature = "bluer")]
impl From<bluer::Address> for MacAddress {
    fn from(addr: bluer::Address) -> Self {
        Self(addr.0)
    }
}

/// Address kind as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressKind {
    Public,
    Random,
    #[default]
    Unknown,
}

/// Classified LE address type, cached on the device record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    Public,
    RandomStatic,
    RandomResolvable,
    RandomNonResolvable,
    /// Random address with the reserved sub-type bits, or an unknown kind.
    Unknown,
}

impl AddressType {
    /// Classify an address using the LE static/resolvable/non-resolvable bit rules.
    pub fn classify(address: &MacAddress, kind: AddressKind) -> Self {
        match kind {
            AddressKind::Public => AddressType::Public,
            AddressKind::Random if address.is_non_resolvable() => {
                AddressType::RandomNonResolvable
            }
            AddressKind::Random if address.is_resolvable() => AddressType::RandomResolvable,
            AddressKind::Random if address.is_static() => AddressType::RandomStatic,
            AddressKind::Random | AddressKind::Unknown => AddressType::Unknown,
        }
    }

    /// Public and random-static addresses survive power cycles.
    pub fn is_fixed(&self) -> bool {
        matches!(self, AddressType::Public | AddressType::RandomStatic)
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AddressType::Public => "public",
            AddressType::RandomStatic => "random(static)",
            AddressType::RandomResolvable => "random(resolvable)",
            AddressType::RandomNonResolvable => "random(non-resolvable)",
            AddressType::Unknown => "unknown",
        };
        f.write_str(s)
    }
}
