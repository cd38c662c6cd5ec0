//! iBeacon / Eddystone classification and the per-address worker set.
//!
//! Classification is a pure function over advertisement elements. The
//! [`BeaconWorkers`] set runs it in background tasks for newly seen
//! devices so the ingest loop never waits on it.

use crate::advertisement::{AdElement, Advertisement};
use crate::device::DeviceRecord;
use crate::mac_address::MacAddress;
use crate::output::{LineSink, Record};
use crate::registry::DeviceRegistry;
use dashmap::DashSet;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const IBEACON_COMPANY_CODE: u16 = 0x004C;
/// iBeacon type (0x02) and remaining length (0x15).
pub const IBEACON_PREFIX: [u8; 2] = [0x02, 0x15];
const IBEACON_LEN: usize = 23;

pub const EDDYSTONE_SERVICE_UUID: u16 = 0xFEAA;
pub const EDDYSTONE_UID_FRAME: u8 = 0x00;
pub const EDDYSTONE_URL_FRAME: u8 = 0x10;
pub const EDDYSTONE_TLM_FRAME: u8 = 0x20;

const UID_LEN: usize = 17;
const URL_MIN_LEN: usize = 2;
const TLM_LEN: usize = 13;

const URL_SCHEMES: &[&str] = &["http://www.", "https://www.", "http://", "https://"];

const URL_EXPANSIONS: &[&str] = &[
    ".com/", ".org/", ".edu/", ".net/", ".info/", ".biz/", ".gov/", ".com", ".org", ".edu",
    ".net", ".info", ".biz", ".gov",
];

/// A classified beacon frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Beacon {
    IBeacon {
        uuid: Uuid,
        major: u16,
        minor: u16,
        /// Calibrated power at 1 m, dBm.
        tx_power: i8,
    },
    EddystoneUid {
        /// Calibrated power at 0 m, dBm.
        tx_power: i8,
        namespace: [u8; 10],
        instance: [u8; 6],
    },
    EddystoneUrl {
        tx_power: i8,
        url: String,
    },
    EddystoneTlm {
        version: u8,
        /// Battery voltage, mV.
        battery_mv: u16,
        /// degC
        temperature: f64,
        adv_count: u32,
        /// Uptime in 0.1 s units.
        sec_count: u32,
    },
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

fn ibeacon(payload: &[u8]) -> Option<Beacon> {
    if payload.len() < IBEACON_LEN || !payload.starts_with(&IBEACON_PREFIX) {
        return None;
    }
    let uuid = Uuid::from_slice(&payload[2..18]).ok()?;
    Some(Beacon::IBeacon {
        uuid,
        major: u16::from_be_bytes([payload[18], payload[19]]),
        minor: u16::from_be_bytes([payload[20], payload[21]]),
        tx_power: payload[22] as i8,
    })
}

/// Expand an Eddystone-URL body (scheme byte followed by encoded bytes).
fn decode_url(data: &[u8]) -> Option<String> {
    let (scheme, body) = data.split_first()?;
    let mut url = URL_SCHEMES.get(usize::from(*scheme))?.to_string();
    for b in body {
        match URL_EXPANSIONS.get(usize::from(*b)) {
            Some(expansion) => url.push_str(expansion),
            None if b.is_ascii_graphic() => url.push(char::from(*b)),
            None => return None,
        }
    }
    Some(url)
}

fn eddystone(frame: u8, data: &[u8]) -> Option<Beacon> {
    match frame {
        EDDYSTONE_UID_FRAME if data.len() >= UID_LEN => {
            let namespace = data[1..11].try_into().ok()?;
            let instance = data[11..17].try_into().ok()?;
            Some(Beacon::EddystoneUid {
                tx_power: data[0] as i8,
                namespace,
                instance,
            })
        }
        EDDYSTONE_URL_FRAME if data.len() >= URL_MIN_LEN => Some(Beacon::EddystoneUrl {
            tx_power: data[0] as i8,
            url: decode_url(&data[1..])?,
        }),
        EDDYSTONE_TLM_FRAME if data.len() >= TLM_LEN => Some(Beacon::EddystoneTlm {
            version: data[0],
            battery_mv: u16::from_be_bytes([data[1], data[2]]),
            temperature: f64::from(i16::from_be_bytes([data[3], data[4]])) / 256.0,
            adv_count: u32::from_be_bytes([data[5], data[6], data[7], data[8]]),
            sec_count: u32::from_be_bytes([data[9], data[10], data[11], data[12]]),
        }),
        _ => None,
    }
}

/// First beacon frame found among `elements`.
pub fn classify(elements: &[AdElement]) -> Option<Beacon> {
    elements.iter().find_map(|element| match element {
        AdElement::ManufacturerData { company, payload } if *company == IBEACON_COMPANY_CODE => {
            ibeacon(payload)
        }
        AdElement::ServiceData(data) => match data.as_slice() {
            [lo, hi, frame, rest @ ..]
                if u16::from_le_bytes([*lo, *hi]) == EDDYSTONE_SERVICE_UUID =>
            {
                eddystone(*frame, rest)
            }
            _ => None,
        },
        _ => None,
    })
}

impl Beacon {
    pub fn record(&self, device: &DeviceRecord) -> Record {
        match self {
            Beacon::IBeacon {
                uuid,
                major,
                minor,
                tx_power,
            } => Record::for_device("IBeacon", device)
                .field("uuid", uuid.to_string())
                .field("major", *major)
                .field("minor", *minor)
                .field("txPower", *tx_power),
            Beacon::EddystoneUid {
                tx_power,
                namespace,
                instance,
            } => Record::for_device("EddystoneUID", device)
                .field("namespace", hex(namespace))
                .field("instance", hex(instance))
                .field("txPower", *tx_power),
            Beacon::EddystoneUrl { tx_power, url } => Record::for_device("EddystoneURL", device)
                .field("url", url.as_str())
                .field("txPower", *tx_power),
            Beacon::EddystoneTlm {
                version,
                battery_mv,
                temperature,
                adv_count,
                sec_count,
            } => Record::for_device("EddystoneTLM", device)
                .field("version", *version)
                .field("vbatt", *battery_mv)
                .field("temp", *temperature)
                .field("advCount", *adv_count)
                .field("secCount", *sec_count),
        }
    }
}

/// Removes the address from the in-flight set when the worker ends,
/// including when the task is aborted.
struct InFlight {
    address: MacAddress,
    set: Arc<DashSet<MacAddress>>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set.remove(&self.address);
    }
}

/// Bounded set of background classification tasks, one per address.
pub struct BeaconWorkers {
    tasks: JoinSet<()>,
    in_flight: Arc<DashSet<MacAddress>>,
    permits: Arc<Semaphore>,
    registry: Arc<DeviceRegistry>,
    sink: Arc<dyn LineSink>,
}

impl BeaconWorkers {
    pub fn new(registry: Arc<DeviceRegistry>, sink: Arc<dyn LineSink>, max_workers: usize) -> Self {
        Self {
            tasks: JoinSet::new(),
            in_flight: Arc::new(DashSet::new()),
            permits: Arc::new(Semaphore::new(max_workers.max(1))),
            registry,
            sink,
        }
    }

    /// Queue classification of `adv`.
    ///
    /// Returns `false` when a worker for the same address is still running.
    pub fn spawn(&mut self, adv: Advertisement) -> bool {
        self.reap();

        let address = adv.address;
        if !self.in_flight.insert(address) {
            debug!(%address, "beacon worker already in flight");
            return false;
        }
        let guard = InFlight {
            address,
            set: Arc::clone(&self.in_flight),
        };
        let permits = Arc::clone(&self.permits);
        let registry = Arc::clone(&self.registry);
        let sink = Arc::clone(&self.sink);

        self.tasks.spawn(async move {
            let _guard = guard;
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let Some(beacon) = classify(&adv.elements) else {
                return;
            };
            let device = registry
                .get(&address)
                .unwrap_or_else(|| DeviceRecord::new(address, adv.rssi, 0));
            let line = beacon.record(&device).to_string();
            if let Err(e) = sink.send(&line) {
                warn!(%address, "failed to send beacon line: {}", e);
            }
        });
        true
    }

    fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                warn!("beacon worker failed: {}", e);
            }
        }
    }

    /// Workers spawned and not yet reaped.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait up to `grace` for running workers, then detach the rest.
    ///
    /// Returns the number of detached workers.
    pub async fn drain(mut self, grace: Duration) -> usize {
        let tasks = &mut self.tasks;
        let finished = tokio::time::timeout(grace, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    warn!("beacon worker failed: {}", e);
                }
            }
        })
        .await;

        if finished.is_ok() {
            info!("beacon workers drained");
            return 0;
        }
        let left = self.tasks.len();
        self.tasks.detach_all();
        warn!(left, "detached unfinished beacon workers");
        left
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac_address::AddressKind;
    use crate::test_utils::{MemorySink, TEST_MAC};

    fn ibeacon_payload() -> Vec<u8> {
        let mut p = vec![0x02, 0x15];
        p.extend_from_slice(&[
            0xE2, 0xC5, 0x6D, 0xB5, 0xDF, 0xFB, 0x48, 0xD2, 0xB0, 0x60, 0xD0, 0xF5, 0xA7, 0x10,
            0x96, 0xE0,
        ]);
        p.extend_from_slice(&[0x00, 0x01, 0x00, 0x2A, 0xC5]);
        p
    }

    fn eddystone(frame: u8, body: &[u8]) -> AdElement {
        let mut data = vec![0xAA, 0xFE, frame];
        data.extend_from_slice(body);
        AdElement::ServiceData(data)
    }

    #[test]
    fn test_ibeacon() {
        let beacon = classify(&[AdElement::ManufacturerData {
            company: IBEACON_COMPANY_CODE,
            payload: ibeacon_payload(),
        }]);
        assert_eq!(
            beacon,
            Some(Beacon::IBeacon {
                uuid: Uuid::parse_str("e2c56db5-dffb-48d2-b060-d0f5a71096e0").unwrap(),
                major: 1,
                minor: 42,
                tx_power: -59,
            })
        );
    }

    #[test]
    fn test_short_ibeacon_is_not_a_beacon() {
        let mut payload = ibeacon_payload();
        payload.truncate(20);
        assert_eq!(
            classify(&[AdElement::ManufacturerData {
                company: IBEACON_COMPANY_CODE,
                payload
            }]),
            None
        );
    }

    #[test]
    fn test_eddystone_uid() {
        let body = [
            0xEE, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0xA1, 0xA2, 0xA3,
            0xA4, 0xA5, 0xA6, 0x00, 0x00,
        ];
        let beacon = classify(&[eddystone(EDDYSTONE_UID_FRAME, &body)]).unwrap();
        let line = beacon.record(&DeviceRecord::new(TEST_MAC, -70, 0)).to_string();
        assert_eq!(
            line,
            "type=EddystoneUID,address=AA:BB:CC:DD:EE:FF,name=,rssi=-70,\
             namespace=0102030405060708090a,instance=a1a2a3a4a5a6,txPower=-18"
        );
    }

    #[test]
    fn test_eddystone_url_expansion() {
        let body = [0xEB, 0x03, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 0x00, b'x'];
        assert_eq!(
            classify(&[eddystone(EDDYSTONE_URL_FRAME, &body)]),
            Some(Beacon::EddystoneUrl {
                tx_power: -21,
                url: "https://example.com/x".to_string(),
            })
        );
        assert_eq!(classify(&[eddystone(EDDYSTONE_URL_FRAME, &[0xEB, 0x09])]), None);
    }

    #[test]
    fn test_eddystone_tlm() {
        let body = [
            0x00, 0x0B, 0xB8, 0x17, 0x80, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x27, 0x10,
        ];
        assert_eq!(
            classify(&[eddystone(EDDYSTONE_TLM_FRAME, &body)]),
            Some(Beacon::EddystoneTlm {
                version: 0,
                battery_mv: 3000,
                temperature: 23.5,
                adv_count: 256,
                sec_count: 10_000,
            })
        );
    }

    #[test]
    fn test_other_service_data_is_not_a_beacon() {
        assert_eq!(
            classify(&[AdElement::ServiceData(vec![0x3D, 0xFD, 0x35])]),
            None
        );
        assert_eq!(classify(&[eddystone(0x30, &[0x00; 16])]), None);
    }

    #[tokio::test]
    async fn test_workers_emit_beacon_line() {
        let registry = Arc::new(DeviceRegistry::new());
        let sink = Arc::new(MemorySink::default());
        registry.upsert(TEST_MAC, -65, 0, |d, _| d.name = "tag".to_string());

        let mut workers = BeaconWorkers::new(Arc::clone(&registry), sink.clone(), 2);
        let adv = Advertisement::new(TEST_MAC, AddressKind::Random, -65).with(
            AdElement::ManufacturerData {
                company: IBEACON_COMPANY_CODE,
                payload: ibeacon_payload(),
            },
        );
        assert!(workers.spawn(adv));
        assert_eq!(workers.drain(Duration::from_secs(1)).await, 0);

        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("type=IBeacon,address=AA:BB:CC:DD:EE:FF,name=tag,rssi=-65,"));
        assert!(lines[0].ends_with("major=1,minor=42,txPower=-59"));
    }

    #[tokio::test]
    async fn test_duplicate_worker_refused_while_in_flight() {
        let registry = Arc::new(DeviceRegistry::new());
        let sink = Arc::new(MemorySink::default());
        let mut workers = BeaconWorkers::new(registry, sink.clone(), 1);

        // Hold the only permit so the first worker cannot finish.
        let permit = Arc::clone(&workers.permits).acquire_owned().await.unwrap();
        let adv = Advertisement::new(TEST_MAC, AddressKind::Random, -65);
        assert!(workers.spawn(adv.clone()));
        assert!(!workers.spawn(adv.clone()));
        assert_eq!(workers.len(), 1);

        drop(permit);
        while !workers.in_flight.is_empty() {
            tokio::task::yield_now().await;
        }
        assert!(workers.spawn(adv));
        assert_eq!(workers.drain(Duration::from_secs(1)).await, 0);
        assert!(sink.lines().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_detaches_stuck_workers() {
        let registry = Arc::new(DeviceRegistry::new());
        let sink = Arc::new(MemorySink::default());
        let mut workers = BeaconWorkers::new(registry, sink, 1);

        let _permit = Arc::clone(&workers.permits).acquire_owned().await.unwrap();
        workers.spawn(Advertisement::new(TEST_MAC, AddressKind::Random, -65));
        assert_eq!(workers.drain(Duration::from_secs(5)).await, 1);
    }
}
