//! BlueZ D-Bus backend.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running.
//!
//! BlueZ does not hand out raw advertisements. Every device add or property
//! change is turned into a property snapshot, and the snapshot into an
//! [`Advertisement`] with synthesized elements.

use super::{ADVERTISEMENT_CHANNEL_BUFFER_SIZE, ScanConfig, ScanError, ScanSession};
use crate::advertisement::{AdElement, Advertisement};
use crate::mac_address::{AddressKind, MacAddress};
use bluer::{Adapter, AdapterEvent, Address, DiscoveryFilter, DiscoveryTransport, Session};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        ScanError::Bluetooth(err.to_string())
    }
}

/// Bluetooth base UUID `00000000-0000-1000-8000-00805f9b34fb`.
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// The 16-bit alias of a UUID derived from the Bluetooth base UUID.
fn short_uuid(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    (value & !(0xFFFF_u128 << 96) == BASE_UUID).then_some((value >> 96) as u16)
}

/// Device properties as seen through BlueZ.
#[derive(Debug, Default, Clone)]
struct DeviceSnapshot {
    address: MacAddress,
    kind: AddressKind,
    name: Option<String>,
    rssi: Option<i16>,
    tx_power: Option<i16>,
    manufacturer_data: HashMap<u16, Vec<u8>>,
    service_data: HashMap<Uuid, Vec<u8>>,
    uuids: HashSet<Uuid>,
}

impl DeviceSnapshot {
    async fn read(adapter: &Adapter, address: Address) -> Result<Self, ScanError> {
        let device = adapter.device(address)?;
        let kind = match device.address_type().await? {
            bluer::AddressType::LePublic => AddressKind::Public,
            bluer::AddressType::LeRandom => AddressKind::Random,
            _ => AddressKind::Unknown,
        };
        Ok(Self {
            address: address.into(),
            kind,
            name: device.name().await?,
            rssi: device.rssi().await?,
            tx_power: device.tx_power().await?,
            manufacturer_data: device.manufacturer_data().await?.unwrap_or_default(),
            service_data: device.service_data().await?.unwrap_or_default(),
            uuids: device.uuids().await?.unwrap_or_default(),
        })
    }

    /// Synthesize an advertisement; a missing RSSI becomes the zero sentinel.
    fn into_advertisement(self) -> Advertisement {
        let mut adv = Advertisement::new(self.address, self.kind, self.rssi.unwrap_or(0));

        if let Some(name) = self.name {
            adv.elements.push(AdElement::LocalName(name));
        }

        let mut codes: Vec<_> = self.manufacturer_data.into_iter().collect();
        codes.sort_by_key(|(code, _)| *code);
        for (company, payload) in codes {
            adv.elements.push(AdElement::ManufacturerData { company, payload });
        }

        let mut uuids: Vec<_> = self.uuids.into_iter().collect();
        uuids.sort();
        let (short, long): (Vec<_>, Vec<_>) = uuids.into_iter().partition(|u| short_uuid(u).is_some());
        if !short.is_empty() {
            adv.elements.push(AdElement::ServiceUuids16(
                short.iter().filter_map(short_uuid).collect(),
            ));
        }
        if !long.is_empty() {
            let mut raw = Vec::with_capacity(long.len() * 16);
            for uuid in long {
                let mut bytes = *uuid.as_bytes();
                bytes.reverse();
                raw.extend_from_slice(&bytes);
            }
            adv.elements.push(AdElement::ServiceUuids128(raw));
        }

        let mut service_data: Vec<_> = self.service_data.into_iter().collect();
        service_data.sort_by_key(|(uuid, _)| *uuid);
        for (uuid, data) in service_data {
            let Some(short) = short_uuid(&uuid) else {
                debug!(address = %self.address, %uuid, "skipping 128-bit service data");
                continue;
            };
            let mut element = short.to_le_bytes().to_vec();
            element.extend_from_slice(&data);
            adv.elements.push(AdElement::ServiceData(element));
        }

        if let Some(power) = self.tx_power.and_then(|p| i8::try_from(p).ok()) {
            adv.elements.push(AdElement::TxPower(power));
        }
        adv
    }
}

/// Start LE discovery on `config.adapter` through BlueZ.
///
/// BlueZ discovery always scans actively; `config.active` is ignored.
pub async fn start_scan(config: &ScanConfig) -> Result<ScanSession, ScanError> {
    let session = Session::new().await?;
    let adapter = session.adapter(&config.adapter)?;
    adapter.set_powered(true).await?;

    let filter = DiscoveryFilter {
        transport: DiscoveryTransport::Le,
        duplicate_data: true,
        ..Default::default()
    };
    if let Err(e) = adapter.set_discovery_filter(filter).await {
        warn!("Failed to set discovery filter: {}", e);
    }
    if !config.active {
        debug!("bluer discovery is always active");
    }

    let mut events = adapter.discover_devices_with_changes().await?;
    info!(adapter = %config.adapter, "bluer discovery started");

    let (tx, rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_BUFFER_SIZE);

    // The task owns the session; aborting it ends discovery.
    let task = tokio::spawn(async move {
        let _session = session;

        while let Some(event) = events.next().await {
            let AdapterEvent::DeviceAdded(address) = event else {
                continue;
            };
            match DeviceSnapshot::read(&adapter, address).await {
                Ok(snapshot) => {
                    if tx.send(snapshot.into_advertisement()).await.is_err() {
                        break;
                    }
                }
                Err(e) => debug!(%address, "device lookup failed: {}", e),
            }
        }
    });

    let adapter = config.adapter.clone();
    Ok(ScanSession::new(rx).on_stop(move || {
        task.abort();
        info!(%adapter, "bluer discovery stopped");
    }))
}
