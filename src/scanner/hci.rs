//! Raw HCI socket backend.
//!
//! This backend uses raw Linux HCI sockets to scan for BLE advertisements
//! without requiring the BlueZ daemon. It requires CAP_NET_RAW and
//! CAP_NET_ADMIN capabilities or root privileges.

use super::{ADVERTISEMENT_CHANNEL_BUFFER_SIZE, ScanConfig, ScanError, ScanSession, adapter_index};
use crate::advertisement::{Advertisement, parse_ad_structures};
use crate::mac_address::{AddressKind, MacAddress};
use crate::sensors::DecodeError;
use libc::{AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_RAW, c_int, c_void, sockaddr, socklen_t};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

// HCI protocol constants
const BTPROTO_HCI: c_int = 1;
const HCI_FILTER: c_int = 2;

// HCI packet types
const HCI_COMMAND_PKT: u8 = 0x01;
const HCI_EVENT_PKT: u8 = 0x04;

// HCI events
const EVT_LE_META_EVENT: u8 = 0x3E;

// LE Meta event sub-events
const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;

// HCI commands
const OGF_LE_CTL: u16 = 0x08;
const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;

// Scan types
const LE_SCAN_PASSIVE: u8 = 0x00;
const LE_SCAN_ACTIVE: u8 = 0x01;

// Own address type
const LE_PUBLIC_ADDRESS: u8 = 0x00;

// Filter policy
const FILTER_POLICY_ACCEPT_ALL: u8 = 0x00;

// Advertiser address types in reports
const ADDR_PUBLIC: u8 = 0x00;
const ADDR_RANDOM: u8 = 0x01;
const ADDR_PUBLIC_IDENTITY: u8 = 0x02;
const ADDR_RANDOM_IDENTITY: u8 = 0x03;

/// Controller value for "RSSI not available".
const RSSI_UNAVAILABLE: i8 = 127;

/// event type, address type, address, data length
const REPORT_HEADER_LEN: usize = 9;

/// HCI socket address structure
#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

/// HCI filter structure for raw sockets
#[repr(C)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciFilter {
    fn new() -> Self {
        Self {
            type_mask: 0,
            event_mask: [0, 0],
            opcode: 0,
        }
    }

    fn set_ptype(&mut self, ptype: u8) {
        self.type_mask |= 1 << (ptype as u32);
    }

    fn set_event(&mut self, event: u8) {
        let bit = event as usize;
        self.event_mask[bit / 32] |= 1 << (bit % 32);
    }
}

/// Create an HCI command packet
fn hci_command_packet(ogf: u16, ocf: u16, params: &[u8]) -> Vec<u8> {
    let opcode = (ogf << 10) | ocf;
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.push(HCI_COMMAND_PKT);
    packet.extend_from_slice(&opcode.to_le_bytes());
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    packet
}

/// LE Set Scan Parameters: type, interval, window (0.625 ms units), own address type, policy.
fn scan_parameters(active: bool) -> Vec<u8> {
    let scan_type = if active { LE_SCAN_ACTIVE } else { LE_SCAN_PASSIVE };
    let interval: u16 = 0x0010; // 10ms
    let window: u16 = 0x0010;
    let mut params = vec![scan_type];
    params.extend_from_slice(&interval.to_le_bytes());
    params.extend_from_slice(&window.to_le_bytes());
    params.push(LE_PUBLIC_ADDRESS);
    params.push(FILTER_POLICY_ACCEPT_ALL);
    hci_command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_PARAMETERS, &params)
}

/// LE Set Scan Enable, never filtering duplicates.
fn scan_enable(enable: bool) -> Vec<u8> {
    hci_command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_ENABLE, &[u8::from(enable), 0x00])
}

/// Open a raw HCI socket
fn open_hci_socket() -> Result<OwnedFd, ScanError> {
    // SOCK_NONBLOCK is required for AsyncFd to work properly
    let fd = unsafe {
        libc::socket(
            AF_BLUETOOTH,
            SOCK_RAW | SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            BTPROTO_HCI,
        )
    };

    if fd < 0 {
        return Err(ScanError::Bluetooth(format!(
            "Failed to create HCI socket: {}",
            io::Error::last_os_error()
        )));
    }

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Bind HCI socket to a device
fn bind_hci_socket(fd: &OwnedFd, dev_id: u16) -> Result<(), ScanError> {
    let addr = SockaddrHci {
        hci_family: AF_BLUETOOTH as u16,
        hci_dev: dev_id,
        hci_channel: 0, // HCI_CHANNEL_RAW
    };

    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const SockaddrHci as *const sockaddr,
            mem::size_of::<SockaddrHci>() as socklen_t,
        )
    };

    if ret < 0 {
        return Err(ScanError::Bluetooth(format!(
            "Failed to bind HCI socket to hci{}: {}",
            dev_id,
            io::Error::last_os_error()
        )));
    }

    Ok(())
}

/// Only LE meta events reach the socket.
fn set_hci_filter(fd: &OwnedFd) -> Result<(), ScanError> {
    let mut filter = HciFilter::new();
    filter.set_ptype(HCI_EVENT_PKT);
    filter.set_event(EVT_LE_META_EVENT);

    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            0, // SOL_HCI
            HCI_FILTER,
            &filter as *const HciFilter as *const c_void,
            mem::size_of::<HciFilter>() as socklen_t,
        )
    };

    if ret < 0 {
        return Err(ScanError::Bluetooth(format!(
            "Failed to set HCI filter: {}",
            io::Error::last_os_error()
        )));
    }

    Ok(())
}

fn send_hci_command(fd: &OwnedFd, packet: &[u8]) -> Result<(), ScanError> {
    let ret = unsafe {
        libc::write(
            fd.as_raw_fd(),
            packet.as_ptr() as *const c_void,
            packet.len(),
        )
    };

    if ret < 0 {
        return Err(ScanError::Bluetooth(format!(
            "Failed to send HCI command: {}",
            io::Error::last_os_error()
        )));
    }

    Ok(())
}

fn address_kind(addr_type: u8) -> AddressKind {
    match addr_type {
        ADDR_PUBLIC | ADDR_PUBLIC_IDENTITY => AddressKind::Public,
        ADDR_RANDOM | ADDR_RANDOM_IDENTITY => AddressKind::Random,
        _ => AddressKind::Unknown,
    }
}

/// Parse the reports of an LE Advertising Report event.
///
/// `params` starts at the report count, right after the sub-event code.
/// Each report is laid out as event type, address type, address
/// (little-endian), data length, data and RSSI.
fn parse_advertising_reports(params: &[u8]) -> Result<Vec<Advertisement>, DecodeError> {
    let (&count, mut rest) = params.split_first().ok_or(DecodeError::TooShort { need: 1, got: 0 })?;

    let mut advertisements = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        if rest.len() < REPORT_HEADER_LEN {
            return Err(DecodeError::TooShort {
                need: REPORT_HEADER_LEN,
                got: rest.len(),
            });
        }
        let addr_type = rest[1];
        let mut addr = [0u8; 6];
        addr.copy_from_slice(&rest[2..8]);
        addr.reverse();
        let data_len = usize::from(rest[8]);

        let need = REPORT_HEADER_LEN + data_len + 1;
        if rest.len() < need {
            return Err(DecodeError::TooShort {
                need,
                got: rest.len(),
            });
        }
        let data = &rest[REPORT_HEADER_LEN..REPORT_HEADER_LEN + data_len];
        let rssi = rest[need - 1] as i8;
        let rssi = if rssi == RSSI_UNAVAILABLE { 0 } else { i16::from(rssi) };

        let mut adv = Advertisement::new(MacAddress(addr), address_kind(addr_type), rssi);
        adv.elements = parse_ad_structures(data);
        advertisements.push(adv);

        rest = &rest[need..];
    }
    Ok(advertisements)
}

/// Advertisements carried by one raw HCI packet, if it is an advertising report.
fn parse_packet(packet: &[u8]) -> Result<Vec<Advertisement>, DecodeError> {
    match packet {
        [HCI_EVENT_PKT, EVT_LE_META_EVENT, _len, EVT_LE_ADVERTISING_REPORT, params @ ..] => {
            parse_advertising_reports(params)
        }
        _ => Ok(Vec::new()),
    }
}

/// Start scanning on `config.adapter` using raw HCI sockets.
///
/// Advertisements are sent through the session channel until the session
/// is stopped, which also disables scanning on the controller.
///
/// # Requirements
/// - CAP_NET_RAW and CAP_NET_ADMIN capabilities or root privileges
/// - The adapter must not be claimed by bluetoothd
pub async fn start_scan(config: &ScanConfig) -> Result<ScanSession, ScanError> {
    let dev_id = adapter_index(&config.adapter)?;

    let fd = open_hci_socket()?;
    bind_hci_socket(&fd, dev_id)?;
    set_hci_filter(&fd)?;

    // Separate socket for commands so the filter does not apply to it
    let cmd_fd = open_hci_socket()?;
    bind_hci_socket(&cmd_fd, dev_id)?;
    send_hci_command(&cmd_fd, &scan_enable(false))?;
    send_hci_command(&cmd_fd, &scan_parameters(config.active))?;
    send_hci_command(&cmd_fd, &scan_enable(true))?;
    info!(adapter = %config.adapter, active = config.active, "hci scan started");

    let (tx, rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_BUFFER_SIZE);

    let async_fd = AsyncFd::new(fd)
        .map_err(|e| ScanError::Bluetooth(format!("Failed to create async fd: {}", e)))?;

    let reader = tokio::spawn(async move {
        let mut buf = [0u8; 258]; // Max HCI event size

        loop {
            let mut guard = match async_fd.readable().await {
                Ok(guard) => guard,
                Err(e) => {
                    warn!("hci socket failed: {}", e);
                    break;
                }
            };

            // Drain all available packets before waiting again
            loop {
                let n = match guard.try_io(|inner| {
                    let ret = unsafe {
                        libc::read(
                            inner.as_raw_fd(),
                            buf.as_mut_ptr() as *mut c_void,
                            buf.len(),
                        )
                    };
                    if ret < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(ret as usize)
                    }
                }) {
                    Ok(Ok(n)) if n > 0 => n,
                    Ok(Ok(_)) => break,
                    Ok(Err(e)) => {
                        debug!("hci read failed: {}", e);
                        break;
                    }
                    Err(_would_block) => break,
                };

                match parse_packet(&buf[..n]) {
                    Ok(advertisements) => {
                        for adv in advertisements {
                            if tx.send(adv).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => debug!("advertising report skipped: {}", e),
                }
            }
        }
    });

    let adapter = config.adapter.clone();
    Ok(ScanSession::new(rx).on_stop(move || {
        reader.abort();
        if let Err(e) = send_hci_command(&cmd_fd, &scan_enable(false)) {
            warn!(%adapter, "failed to disable scan: {}", e);
        }
        info!(%adapter, "hci scan stopped");
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advertisement::AdElement;

    fn report(addr_type: u8, addr: [u8; 6], data: &[u8], rssi: i8) -> Vec<u8> {
        let mut r = vec![0x00, addr_type];
        r.extend_from_slice(&addr);
        r.push(data.len() as u8);
        r.extend_from_slice(data);
        r.push(rssi as u8);
        r
    }

    #[test]
    fn test_hci_filter_setup() {
        let mut filter = HciFilter::new();
        filter.set_ptype(HCI_EVENT_PKT);
        filter.set_event(EVT_LE_META_EVENT);

        // HCI_EVENT_PKT (0x04) sets bit 4 in type_mask
        assert_eq!(filter.type_mask, 1 << HCI_EVENT_PKT);
        // EVT_LE_META_EVENT (0x3E = 62) sets bit 30 in event_mask[1]
        assert_eq!(filter.event_mask[1], 1 << (EVT_LE_META_EVENT % 32));
    }

    #[test]
    fn test_hci_command_packet() {
        let packet = scan_enable(true);
        assert_eq!(packet, vec![0x01, 0x0C, 0x20, 0x02, 0x01, 0x00]);
    }

    #[test]
    fn test_scan_parameters_active_flag() {
        let passive = scan_parameters(false);
        let active = scan_parameters(true);
        assert_eq!(&passive[..4], &[0x01, 0x0B, 0x20, 0x07]);
        assert_eq!(passive[4], LE_SCAN_PASSIVE);
        assert_eq!(active[4], LE_SCAN_ACTIVE);
        assert_eq!(active.len(), 4 + 7);
    }

    #[test]
    fn test_parse_two_reports() {
        let mut params = vec![0x02];
        params.extend(report(
            ADDR_RANDOM,
            [0x06, 0x05, 0x04, 0x03, 0x02, 0xC1],
            &[0x02, 0x01, 0x06],
            -70,
        ));
        params.extend(report(ADDR_PUBLIC, [0x0A, 0x00, 0x00, 0xEB, 0x27, 0xB8], &[], -45));

        let advs = parse_advertising_reports(&params).unwrap();
        assert_eq!(advs.len(), 2);
        assert_eq!(advs[0].address.to_string(), "C1:02:03:04:05:06");
        assert_eq!(advs[0].kind, AddressKind::Random);
        assert_eq!(advs[0].rssi, -70);
        assert_eq!(advs[0].elements, vec![AdElement::Flags(0x06)]);
        assert_eq!(advs[1].address.to_string(), "B8:27:EB:00:00:0A");
        assert_eq!(advs[1].kind, AddressKind::Public);
        assert!(advs[1].elements.is_empty());
    }

    #[test]
    fn test_unavailable_rssi_becomes_zero() {
        let mut params = vec![0x01];
        params.extend(report(ADDR_RANDOM, [1, 2, 3, 4, 5, 6], &[], RSSI_UNAVAILABLE));
        assert_eq!(parse_advertising_reports(&params).unwrap()[0].rssi, 0);
    }

    #[test]
    fn test_truncated_report_is_an_error() {
        let mut params = vec![0x01];
        let mut r = report(ADDR_RANDOM, [1, 2, 3, 4, 5, 6], &[0x02, 0x01, 0x06], -60);
        r.truncate(r.len() - 2);
        params.extend(r);
        assert!(matches!(
            parse_advertising_reports(&params),
            Err(DecodeError::TooShort { need: 13, got: 11 })
        ));
    }

    #[test]
    fn test_non_report_packets_are_ignored() {
        assert!(parse_packet(&[HCI_EVENT_PKT, 0x0E, 0x04, 0x01]).unwrap().is_empty());
        assert!(parse_packet(&[HCI_EVENT_PKT, EVT_LE_META_EVENT, 0x02, 0x01]).unwrap().is_empty());
    }
}
