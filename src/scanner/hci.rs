//! Raw HCI socket backend for SwitchBot scanning.
//!
//! This backend uses raw Linux HCI sockets to scan for BLE advertisements
//! without requiring the BlueZ daemon. It requires CAP_NET_RAW and
//! CAP_NET_ADMIN capabilities or root privileges.
//!
//! SwitchBot devices put their 128-bit service UUID in the scan response and
//! the service data in the advertising packet, so scanning is active and the
//! two halves are merged per address before being forwarded.

use super::{
    ADVERTISEMENT_CHANNEL_BUFFER_SIZE, Advertisement, ScanError, ScanSchedule, uuid_from_u16,
};
use crate::decoder::ServiceData;
use crate::mac_address::MacAddress;
use libc::{AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_RAW, c_int, c_void, sockaddr, socklen_t};
use std::collections::{HashMap, HashSet};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

// HCI protocol constants
const BTPROTO_HCI: c_int = 1;
const HCI_FILTER: c_int = 2;

// HCI packet types
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
const LE_SCAN_ACTIVE: u8 = 0x01;

// Own address type
const LE_RANDOM_ADDRESS: u8 = 0x01;

// Filter policy
const FILTER_POLICY_ACCEPT_ALL: u8 = 0x00;

// Scan timing in 0.625ms units
const SCAN_INTERVAL: u16 = 0x0040; // 40ms
const SCAN_WINDOW: u16 = 0x0030; // 30ms

// AD types
const AD_TYPE_UUID16_INCOMPLETE: u8 = 0x02;
const AD_TYPE_UUID16_COMPLETE: u8 = 0x03;
const AD_TYPE_UUID128_INCOMPLETE: u8 = 0x06;
const AD_TYPE_UUID128_COMPLETE: u8 = 0x07;
const AD_TYPE_SERVICE_DATA_UUID16: u8 = 0x16;

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
        self.type_mask |= 1 << u32::from(ptype);
    }

    fn set_event(&mut self, event: u8) {
        let bit = usize::from(event);
        self.event_mask[bit / 32] |= 1 << (bit % 32);
    }
}

/// Create an HCI command packet
fn hci_command_packet(ogf: u16, ocf: u16, params: &[u8]) -> Vec<u8> {
    let opcode = (ogf << 10) | ocf;
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.push(0x01); // HCI command packet type
    packet.extend_from_slice(&opcode.to_le_bytes());
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    packet
}

/// LE Set Scan Parameters command parameters, little-endian on the wire.
fn scan_parameters() -> [u8; 7] {
    let [interval_lo, interval_hi] = SCAN_INTERVAL.to_le_bytes();
    let [window_lo, window_hi] = SCAN_WINDOW.to_le_bytes();
    [
        LE_SCAN_ACTIVE,
        interval_lo,
        interval_hi,
        window_lo,
        window_hi,
        LE_RANDOM_ADDRESS,
        FILTER_POLICY_ACCEPT_ALL,
    ]
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
            "Failed to bind HCI socket: {}",
            io::Error::last_os_error()
        )));
    }

    Ok(())
}

/// Only deliver LE meta events to the reading socket
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

/// Send an HCI command
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

fn set_scan_enable(fd: &OwnedFd, enable: bool) -> Result<(), ScanError> {
    // Duplicate filtering off: every advertisement carries fresh readings.
    let params = [u8::from(enable), 0x00];
    let packet = hci_command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_ENABLE, &params);
    send_hci_command(fd, &packet)
}

/// Configure active LE scanning. Scanning is left disabled.
fn configure_le_scan(fd: &OwnedFd) -> Result<(), ScanError> {
    // Parameters cannot be changed while a scan is running.
    set_scan_enable(fd, false)?;
    let packet = hci_command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_PARAMETERS, &scan_parameters());
    send_hci_command(fd, &packet)
}

/// One entry of an LE advertising report event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct Report {
    address: MacAddress,
    services: HashSet<Uuid>,
    service_data: Vec<ServiceData>,
}

/// Parse the AD structures of one advertising or scan-response payload.
fn parse_ad_structures(ad_data: &[u8], report: &mut Report) {
    let mut offset = 0;
    while offset + 2 <= ad_data.len() {
        let len = usize::from(ad_data[offset]);
        if len == 0 || offset + 1 + len > ad_data.len() {
            break;
        }

        let ad_type = ad_data[offset + 1];
        let value = &ad_data[offset + 2..offset + 1 + len];

        match ad_type {
            AD_TYPE_UUID16_INCOMPLETE | AD_TYPE_UUID16_COMPLETE => {
                report.services.extend(
                    value
                        .chunks_exact(2)
                        .map(|c| uuid_from_u16(u16::from_le_bytes([c[0], c[1]]))),
                );
            }
            AD_TYPE_UUID128_INCOMPLETE | AD_TYPE_UUID128_COMPLETE => {
                report.services.extend(value.chunks_exact(16).map(|c| {
                    let mut bytes = [0u8; 16];
                    bytes.copy_from_slice(c);
                    bytes.reverse();
                    Uuid::from_bytes(bytes)
                }));
            }
            AD_TYPE_SERVICE_DATA_UUID16 if value.len() >= 2 => {
                let uuid = uuid_from_u16(u16::from_le_bytes([value[0], value[1]]));
                report
                    .service_data
                    .push(ServiceData::new(uuid, &value[2..]));
            }
            _ => {}
        }

        offset += 1 + len;
    }
}

/// Parse an HCI LE advertising report event into its reports.
///
/// Layout after the 4 byte header (packet type, event code, parameter
/// length, sub-event): report count, then per report event type, address
/// type, 6 byte address, data length, data and RSSI.
fn parse_advertising_reports(event: &[u8]) -> Vec<Report> {
    if event.len() < 5
        || event[0] != HCI_EVENT_PKT
        || event[1] != EVT_LE_META_EVENT
        || event[3] != EVT_LE_ADVERTISING_REPORT
    {
        return Vec::new();
    }

    let count = usize::from(event[4]);
    let mut reports = Vec::with_capacity(count);
    let mut rest = &event[5..];

    for _ in 0..count {
        // event type(1) + address type(1) + address(6) + data length(1)
        if rest.len() < 9 {
            break;
        }
        let mut addr = [0u8; 6];
        addr.copy_from_slice(&rest[2..8]);
        let data_len = usize::from(rest[8]);
        // data + RSSI(1)
        if rest.len() < 9 + data_len + 1 {
            break;
        }

        let mut report = Report {
            address: MacAddress::from_le_bytes(addr),
            ..Report::default()
        };
        parse_ad_structures(&rest[9..9 + data_len], &mut report);
        reports.push(report);

        rest = &rest[9 + data_len + 1..];
    }

    reports
}

/// Joins scan responses and advertising packets from the same address.
///
/// The service list seen most recently for an address is attached to every
/// later packet from it that carries service data.
#[derive(Debug, Default)]
struct ReportMerger {
    services: HashMap<MacAddress, HashSet<Uuid>>,
}

impl ReportMerger {
    fn merge(&mut self, report: Report) -> Option<Advertisement> {
        let Report {
            address,
            mut services,
            service_data,
        } = report;

        if services.is_empty() {
            if let Some(known) = self.services.get(&address) {
                services.clone_from(known);
            }
        } else {
            self.services.insert(address, services.clone());
        }

        if service_data.is_empty() {
            return None;
        }

        Some(Advertisement {
            address,
            services,
            service_data,
        })
    }

    /// Forget every address; called between scan windows to bound memory.
    fn clear(&mut self) {
        self.services.clear();
    }
}

/// What to do after one completed read on the HCI socket.
#[derive(Debug, PartialEq, Eq)]
enum ReadOutcome {
    Packet(usize),
    Retry,
    Failed,
}

fn read_outcome(result: &io::Result<usize>) -> ReadOutcome {
    match result {
        Ok(0) => ReadOutcome::Failed,
        Ok(n) => ReadOutcome::Packet(*n),
        Err(error) if error.kind() == io::ErrorKind::Interrupted => ReadOutcome::Retry,
        Err(_) => ReadOutcome::Failed,
    }
}

/// Read advertising reports until `deadline`.
///
/// Returns `false` when scanning should stop for good: the receiver was
/// dropped or the socket failed.
async fn read_window(
    async_fd: &AsyncFd<OwnedFd>,
    deadline: Instant,
    merger: &mut ReportMerger,
    tx: &mpsc::Sender<Advertisement>,
) -> bool {
    let mut buf = [0u8; 258]; // Max HCI event size

    loop {
        let mut guard = match tokio::time::timeout_at(deadline, async_fd.readable()).await {
            Err(_elapsed) => return true,
            Ok(Ok(guard)) => guard,
            Ok(Err(error)) => {
                tracing::error!(%error, "HCI socket failed");
                return false;
            }
        };

        // Drain all available packets before waiting again
        loop {
            let result = match guard.try_io(|inner| {
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
                Ok(result) => result,
                Err(_would_block) => break,
            };

            let n = match read_outcome(&result) {
                ReadOutcome::Packet(n) => n,
                ReadOutcome::Retry => continue,
                ReadOutcome::Failed => {
                    // Readiness stays set on a broken socket; waiting again would spin.
                    guard.clear_ready();
                    match result {
                        Err(error) => tracing::error!(%error, "HCI read failed, stopping scan"),
                        Ok(_) => tracing::error!("HCI socket closed, stopping scan"),
                    }
                    return false;
                }
            };

            for report in parse_advertising_reports(&buf[..n]) {
                if let Some(advertisement) = merger.merge(report)
                    && tx.send(advertisement).await.is_err()
                {
                    return false;
                }
            }
        }
    }
}

/// Start scanning using raw HCI sockets.
///
/// Opens and configures the HCI sockets before returning, then alternates
/// scan windows and idle periods in a background task until the receiver is
/// dropped.
///
/// # Requirements
/// - CAP_NET_RAW and CAP_NET_ADMIN capabilities or root privileges
/// - An available HCI device (typically hci0)
pub async fn start_scan(schedule: ScanSchedule) -> Result<mpsc::Receiver<Advertisement>, ScanError> {
    // Socket receiving advertising events
    let fd = open_hci_socket()?;
    bind_hci_socket(&fd, 0)?;
    set_hci_filter(&fd)?;

    // Separate socket for sending commands
    let cmd_fd = open_hci_socket()?;
    bind_hci_socket(&cmd_fd, 0)?;
    configure_le_scan(&cmd_fd)?;

    let async_fd = AsyncFd::new(fd)
        .map_err(|e| ScanError::Bluetooth(format!("Failed to create async fd: {e}")))?;

    let (tx, rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_BUFFER_SIZE);

    tokio::spawn(async move {
        let mut merger = ReportMerger::default();

        loop {
            if let Err(error) = set_scan_enable(&cmd_fd, true) {
                tracing::warn!(%error, "cannot enable LE scan");
            }
            let deadline = Instant::now() + schedule.window;
            let keep_scanning = read_window(&async_fd, deadline, &mut merger, &tx).await;
            if let Err(error) = set_scan_enable(&cmd_fd, false) {
                tracing::warn!(%error, "cannot disable LE scan");
            }
            merger.clear();

            if !keep_scanning {
                break;
            }
            if !schedule.is_continuous() {
                tokio::time::sleep(schedule.idle).await;
            }
        }
        tracing::debug!("stopping HCI scan");
    });

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::SWITCHBOT_SERVICE_UUID;
    use crate::test_utils::{SERVICE_DATA_UUID, meter_payload};

    const ADDR_LE: [u8; 6] = [0x0F, 0x01, 0x6A, 0x8D, 0x7C, 0xC4];

    fn address() -> MacAddress {
        MacAddress([0xC4, 0x7C, 0x8D, 0x6A, 0x01, 0x0F])
    }

    /// AD structure: 128-bit complete service UUID list with the SwitchBot UUID.
    fn uuid128_ad() -> Vec<u8> {
        let mut bytes = *SWITCHBOT_SERVICE_UUID.as_bytes();
        bytes.reverse();
        let mut ad = vec![17, AD_TYPE_UUID128_COMPLETE];
        ad.extend_from_slice(&bytes);
        ad
    }

    /// AD structure: service data for UUID 0x0D00.
    fn service_data_ad(payload: &[u8]) -> Vec<u8> {
        let mut ad = vec![(payload.len() + 3) as u8, AD_TYPE_SERVICE_DATA_UUID16, 0x00, 0x0D];
        ad.extend_from_slice(payload);
        ad
    }

    fn report_event(reports: &[&[u8]]) -> Vec<u8> {
        let mut body = vec![EVT_LE_ADVERTISING_REPORT, reports.len() as u8];
        for data in reports {
            body.extend_from_slice(&[0x00, 0x01]); // event type, address type
            body.extend_from_slice(&ADDR_LE);
            body.push(data.len() as u8);
            body.extend_from_slice(data);
            body.push(0xC5); // RSSI
        }
        let mut event = vec![HCI_EVENT_PKT, EVT_LE_META_EVENT, body.len() as u8];
        event.extend_from_slice(&body);
        event
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
        let packet = hci_command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_ENABLE, &[0x01, 0x00]);
        assert_eq!(packet, [0x01, 0x0C, 0x20, 0x02, 0x01, 0x00]);
    }

    #[test]
    fn test_scan_parameters_are_active_and_little_endian() {
        assert_eq!(
            scan_parameters(),
            [0x01, 0x40, 0x00, 0x30, 0x00, 0x01, 0x00]
        );
    }

    #[test]
    fn test_parse_ad_structures() {
        let mut data = uuid128_ad();
        data.extend_from_slice(&[0x03, AD_TYPE_UUID16_COMPLETE, 0x3D, 0xFD]);
        data.extend_from_slice(&service_data_ad(&meter_payload()));

        let mut report = Report::default();
        parse_ad_structures(&data, &mut report);

        assert!(report.services.contains(&SWITCHBOT_SERVICE_UUID));
        assert!(report.services.contains(&uuid_from_u16(0xFD3D)));
        assert_eq!(
            report.service_data,
            vec![ServiceData::new(SERVICE_DATA_UUID, meter_payload())]
        );
    }

    #[test]
    fn test_parse_ad_structures_stops_at_overrun() {
        // Declares 10 bytes but only 3 follow.
        let mut report = Report::default();
        parse_ad_structures(&[10, AD_TYPE_SERVICE_DATA_UUID16, 0x00, 0x0D, 0x54], &mut report);
        assert_eq!(report, Report::default());
    }

    #[test]
    fn test_parse_advertising_reports() {
        let adv = service_data_ad(&meter_payload());
        let scan_rsp = uuid128_ad();
        let event = report_event(&[&adv, &scan_rsp]);

        let reports = parse_advertising_reports(&event);
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].address, address());
        assert_eq!(reports[0].service_data.len(), 1);
        assert!(reports[1].services.contains(&SWITCHBOT_SERVICE_UUID));
    }

    #[test]
    fn test_parse_advertising_reports_rejects_other_events() {
        let mut event = report_event(&[&service_data_ad(&meter_payload())]);
        event[3] = 0x01; // connection complete
        assert!(parse_advertising_reports(&event).is_empty());
        assert!(parse_advertising_reports(&[HCI_EVENT_PKT]).is_empty());
    }

    #[test]
    fn test_parse_advertising_reports_truncated() {
        let event = report_event(&[&service_data_ad(&meter_payload())]);
        assert!(parse_advertising_reports(&event[..event.len() - 1]).is_empty());
    }

    #[test]
    fn test_merger_joins_scan_response_and_advertisement() {
        let mut merger = ReportMerger::default();
        let mut scan_rsp = Report {
            address: address(),
            ..Report::default()
        };
        parse_ad_structures(&uuid128_ad(), &mut scan_rsp);
        let mut adv = Report {
            address: address(),
            ..Report::default()
        };
        parse_ad_structures(&service_data_ad(&meter_payload()), &mut adv);

        // Service list alone is remembered but not forwarded.
        assert_eq!(merger.merge(scan_rsp), None);

        let merged = merger.merge(adv.clone()).unwrap();
        assert_eq!(merged.address, address());
        assert!(merged.services.contains(&SWITCHBOT_SERVICE_UUID));
        assert_eq!(merged.service_data, adv.service_data);

        merger.clear();
        let unmerged = merger.merge(adv).unwrap();
        assert!(unmerged.services.is_empty());
    }

    #[test]
    fn test_read_outcome() {
        assert_eq!(read_outcome(&Ok(42)), ReadOutcome::Packet(42));
        assert_eq!(
            read_outcome(&Err(io::Error::from(io::ErrorKind::Interrupted))),
            ReadOutcome::Retry
        );
    }

    #[test]
    fn test_read_outcome_stops_on_broken_socket() {
        // Adapter unplugged mid-window.
        assert_eq!(
            read_outcome(&Err(io::Error::from_raw_os_error(libc::ENODEV))),
            ReadOutcome::Failed
        );
        assert_eq!(read_outcome(&Ok(0)), ReadOutcome::Failed);
    }
}
