//! `bluescan` library.
//!
//! The binary (`src/main.rs`) is responsible for logging setup, signals and
//! process exit codes. The ingest and report loop lives in [`crate::app`]
//! where it can be tested deterministically with an injected scanner and
//! an in-memory line sink.

pub mod advertisement;
pub mod app;
pub mod beacon;
pub mod decoder;
pub mod device;
pub mod mac_address;
pub mod motion;
pub mod output;
pub mod registry;
pub mod report;
pub mod scanner;
pub mod sensors;
pub mod vendor;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use advertisement::{AdElement, Advertisement, parse_ad_structures};
pub use app::{Monitor, Options, RunError, parse_duration};
pub use decoder::AdvertisementDecoder;
pub use device::DeviceRecord;
pub use mac_address::{AddressKind, AddressType, MacAddress};
pub use output::{LineSink, Record, WriterSink};
pub use registry::{DeviceRegistry, EvictionPolicy};
pub use scanner::{Backend, ScanConfig, ScanError, ScanSession};
pub use sensors::{DecodeError, SensorReading};
