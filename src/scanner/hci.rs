//! Raw HCI socket backend.
//!
//! Talks to the kernel Bluetooth stack directly, so bluetoothd does not need to be
//! running. Opening the sockets needs root or the CAP_NET_RAW and CAP_NET_ADMIN
//! capabilities.

use super::{ADVERTISEMENT_CHANNEL_BUFFER_SIZE, AdvertisementResult, ScanError};
use crate::advertisement::{Advertisement, SourceId};
use libc::{
    AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_NONBLOCK, SOCK_RAW, c_int, c_void, sockaddr, socklen_t,
};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Instant;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tracing::debug;

const BTPROTO_HCI: c_int = 1;
const SOL_HCI: c_int = 0;
const HCI_FILTER: c_int = 2;
const HCI_CHANNEL_RAW: u16 = 0;
const HCI_DEV_ID: u16 = 0;

// _IOR('H', 211, int)
const HCIGETDEVINFO: libc::c_ulong = 0x8004_48d3;
const HCI_UP_FLAG: u32 = 1 << 0;

const HCI_COMMAND_PKT: u8 = 0x01;
const HCI_EVENT_PKT: u8 = 0x04;

const EVT_LE_META_EVENT: u8 = 0x3E;
const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;

const OGF_LE_CTL: u16 = 0x08;
const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;

// Active scanning so scan responses (which usually carry the name) are reported
const LE_SCAN_ACTIVE: u8 = 0x01;
const LE_PUBLIC_ADDRESS: u8 = 0x00;
const FILTER_POLICY_ACCEPT_ALL: u8 = 0x00;

/// Scan interval and window, in 0.625 ms units (10 ms each: scan continuously)
const SCAN_INTERVAL: u16 = 0x0010;
const SCAN_WINDOW: u16 = 0x0010;

/// Largest HCI event: 3 header bytes plus 255 parameter bytes
const MAX_EVENT_SIZE: usize = 258;

const AD_TYPE_SHORT_LOCAL_NAME: u8 = 0x08;
const AD_TYPE_COMPLETE_LOCAL_NAME: u8 = 0x09;
const AD_TYPE_MANUFACTURER_DATA: u8 = 0xFF;

/// `struct sockaddr_hci`
#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

/// `struct hci_filter`: which packet types and events reach a raw socket
#[repr(C)]
#[derive(Debug, Default)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciFilter {
    /// Pass LE meta events only.
    fn le_meta_events() -> Self {
        let mut filter = Self::default();
        filter.type_mask |= 1 << HCI_EVENT_PKT;
        filter.event_mask[usize::from(EVT_LE_META_EVENT / 32)] |= 1 << (EVT_LE_META_EVENT % 32);
        filter
    }
}

/// `struct hci_dev_info` as filled in by HCIGETDEVINFO
#[allow(dead_code)]
#[repr(C)]
struct HciDevInfo {
    dev_id: u16,
    name: [u8; 8],
    bdaddr: [u8; 6],
    flags: u32,
    dev_type: u8,
    features: [u8; 8],
    pkt_type: u32,
    link_policy: u32,
    link_mode: u32,
    acl_mtu: u16,
    acl_pkts: u16,
    sco_mtu: u16,
    sco_pkts: u16,
    stat: [u32; 10],
}

/// Turn a negative libc return value into the pending OS error.
fn cvt<T: PartialOrd + Default>(ret: T) -> io::Result<T> {
    if ret < T::default() {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn bluetooth_error(context: &'static str) -> impl Fn(io::Error) -> ScanError {
    move |e| ScanError::Bluetooth(format!("{context}: {e}"))
}

/// Frame an HCI command: packet type, little-endian opcode, parameter length, parameters.
fn hci_command_packet(ogf: u16, ocf: u16, params: &[u8]) -> Vec<u8> {
    let opcode = (ogf << 10) | ocf;
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.push(HCI_COMMAND_PKT);
    packet.extend_from_slice(&opcode.to_le_bytes());
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    packet
}

/// Parameters of LE Set Scan Parameters
fn scan_parameters() -> [u8; 7] {
    let [interval_lo, interval_hi] = SCAN_INTERVAL.to_le_bytes();
    let [window_lo, window_hi] = SCAN_WINDOW.to_le_bytes();
    [
        LE_SCAN_ACTIVE,
        interval_lo,
        interval_hi,
        window_lo,
        window_hi,
        LE_PUBLIC_ADDRESS,
        FILTER_POLICY_ACCEPT_ALL,
    ]
}

/// Non-blocking raw socket bound to one HCI device.
struct HciSocket {
    fd: OwnedFd,
    dev_id: u16,
}

impl HciSocket {
    fn bind(dev_id: u16) -> io::Result<Self> {
        // Non-blocking so the fd can be driven by the tokio reactor
        let raw = cvt(unsafe {
            libc::socket(
                AF_BLUETOOTH,
                SOCK_RAW | SOCK_CLOEXEC | SOCK_NONBLOCK,
                BTPROTO_HCI,
            )
        })?;
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let addr = SockaddrHci {
            hci_family: AF_BLUETOOTH as u16,
            hci_dev: dev_id,
            hci_channel: HCI_CHANNEL_RAW,
        };
        cvt(unsafe {
            libc::bind(
                fd.as_raw_fd(),
                (&raw const addr).cast::<sockaddr>(),
                mem::size_of::<SockaddrHci>() as socklen_t,
            )
        })?;

        Ok(Self { fd, dev_id })
    }

    fn is_up(&self) -> io::Result<bool> {
        let mut info: HciDevInfo = unsafe { mem::zeroed() };
        info.dev_id = self.dev_id;
        cvt(unsafe {
            libc::ioctl(
                self.fd.as_raw_fd(),
                HCIGETDEVINFO as _,
                (&raw mut info).cast::<c_void>(),
            )
        })?;
        Ok(info.flags & HCI_UP_FLAG != 0)
    }

    fn set_filter(&self, filter: &HciFilter) -> io::Result<()> {
        cvt(unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                SOL_HCI,
                HCI_FILTER,
                (filter as *const HciFilter).cast::<c_void>(),
                mem::size_of::<HciFilter>() as socklen_t,
            )
        })?;
        Ok(())
    }

    fn send_le_command(&self, ocf: u16, params: &[u8]) -> io::Result<()> {
        let packet = hci_command_packet(OGF_LE_CTL, ocf, params);
        cvt(unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                packet.as_ptr().cast::<c_void>(),
                packet.len(),
            )
        })?;
        Ok(())
    }

    fn set_scan_parameters(&self) -> io::Result<()> {
        self.send_le_command(OCF_LE_SET_SCAN_PARAMETERS, &scan_parameters())
    }

    fn set_scan_enable(&self, enable: bool) -> io::Result<()> {
        // Duplicate filtering stays off: every broadcast carries a fresh reading
        self.send_le_command(OCF_LE_SET_SCAN_ENABLE, &[u8::from(enable), 0x00])
    }
}

fn read_packet(fd: &OwnedFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = cvt(unsafe {
        libc::read(
            fd.as_raw_fd(),
            buf.as_mut_ptr().cast::<c_void>(),
            buf.len(),
        )
    })?;
    Ok(n as usize)
}

/// Fields of one LE advertising report relevant to the pipeline
#[derive(Debug, PartialEq)]
struct AdvertisingReport {
    address: [u8; 6],
    name: Option<String>,
    manufacturer_data: BTreeMap<u16, Vec<u8>>,
}

/// Parse an LE Advertising Report event. Other packets yield `None`.
fn parse_advertising_report(packet: &[u8]) -> Option<AdvertisingReport> {
    let [
        HCI_EVENT_PKT,
        EVT_LE_META_EVENT,
        _,
        EVT_LE_ADVERTISING_REPORT,
        reports @ ..,
    ] = packet
    else {
        return None;
    };

    // Controllers batch rarely; only the first report is used
    let [num_reports, _event_type, _address_type, report @ ..] = reports else {
        return None;
    };
    if *num_reports == 0 || report.len() < 7 {
        return None;
    }

    let mut address: [u8; 6] = report[..6].try_into().ok()?;
    address.reverse(); // little-endian on the wire

    let data_len = usize::from(report[6]);
    let ad_data = report.get(7..7 + data_len)?;

    let (name, manufacturer_data) = parse_ad_structures(ad_data);
    Some(AdvertisingReport {
        address,
        name,
        manufacturer_data,
    })
}

/// Walk the AD structures of an advertisement, collecting name and vendor payloads
fn parse_ad_structures(mut ad_data: &[u8]) -> (Option<String>, BTreeMap<u16, Vec<u8>>) {
    let mut name = None;
    let mut manufacturer_data = BTreeMap::new();

    while let [len, rest @ ..] = ad_data {
        let len = usize::from(*len);
        if len == 0 || len > rest.len() {
            break;
        }
        let (field, next) = rest.split_at(len);
        ad_data = next;

        match field {
            [AD_TYPE_COMPLETE_LOCAL_NAME, value @ ..] => {
                name = Some(String::from_utf8_lossy(value).into_owned());
            }
            [AD_TYPE_SHORT_LOCAL_NAME, value @ ..] if name.is_none() => {
                name = Some(String::from_utf8_lossy(value).into_owned());
            }
            [AD_TYPE_MANUFACTURER_DATA, lo, hi, payload @ ..] => {
                manufacturer_data.insert(u16::from_le_bytes([*lo, *hi]), payload.to_vec());
            }
            _ => {}
        }
    }

    (name, manufacturer_data)
}

/// Last known name and manufacturer data per device during the session.
///
/// Bands put their name in scan responses and their payload in advertising
/// reports. Every report is merged into the device's cached state, so each
/// resolved advertisement carries both, the way bluetoothd presents devices.
/// Reports are held back until the device has shown some manufacturer data.
#[derive(Debug, Default)]
struct DeviceCache {
    devices: HashMap<SourceId, CachedDevice>,
}

#[derive(Debug, Default)]
struct CachedDevice {
    name: Option<String>,
    manufacturer_data: BTreeMap<u16, Vec<u8>>,
}

impl DeviceCache {
    fn resolve(
        &mut self,
        report: AdvertisingReport,
        observed_at: Instant,
    ) -> Option<Advertisement> {
        let source = SourceId::from(report.address);
        let device = self.devices.entry(source.clone()).or_default();

        if report.name.is_some() {
            device.name = report.name;
        }
        // Newer payloads replace older ones per company identifier
        device.manufacturer_data.extend(report.manufacturer_data);
        if device.manufacturer_data.is_empty() {
            return None;
        }

        Some(Advertisement {
            source,
            name: device.name.clone(),
            manufacturer_data: device.manufacturer_data.clone(),
            observed_at,
        })
    }
}

/// Check that `hci0` exists, is accessible and is up.
pub fn check_available() -> Result<(), ScanError> {
    let socket = HciSocket::bind(HCI_DEV_ID)
        .map_err(|e| ScanError::Unavailable(format!("cannot open hci{HCI_DEV_ID}: {e}")))?;

    match socket.is_up() {
        Ok(true) => Ok(()),
        Ok(false) => Err(ScanError::Unavailable(format!("hci{HCI_DEV_ID} is down"))),
        Err(e) => Err(ScanError::Unavailable(format!("cannot query hci{HCI_DEV_ID}: {e}"))),
    }
}

/// Enable active LE scanning on `hci0` and stream advertising reports.
///
/// Scanning is disabled again once the receiver is closed. A failing socket is
/// reported as a single `Err` item, after which the channel closes.
pub async fn start_scan() -> Result<mpsc::Receiver<AdvertisementResult>, ScanError> {
    let events =
        HciSocket::bind(HCI_DEV_ID).map_err(bluetooth_error("Failed to open HCI socket"))?;
    events
        .set_filter(&HciFilter::le_meta_events())
        .map_err(bluetooth_error("Failed to set HCI filter"))?;

    // Commands go out on a second socket; the filtered one only reads events
    let commands =
        HciSocket::bind(HCI_DEV_ID).map_err(bluetooth_error("Failed to open HCI socket"))?;
    commands
        .set_scan_parameters()
        .map_err(bluetooth_error("Failed to set scan parameters"))?;
    commands
        .set_scan_enable(true)
        .map_err(bluetooth_error("Failed to enable scanning"))?;

    let events = AsyncFd::new(events.fd).map_err(bluetooth_error("Failed to register HCI socket"))?;
    let (tx, rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_BUFFER_SIZE);

    tokio::spawn(async move {
        let mut devices = DeviceCache::default();
        let mut buf = [0u8; MAX_EVENT_SIZE];

        'scan: loop {
            let mut guard = tokio::select! {
                _ = tx.closed() => break,
                ready = events.readable() => match ready {
                    Ok(guard) => guard,
                    Err(e) => {
                        let failure = ScanError::Bluetooth(format!("HCI socket failed: {e}"));
                        let _ = tx.send(Err(failure)).await;
                        break;
                    }
                },
            };

            // Drain the socket before waiting for readiness again
            loop {
                let n = match guard.try_io(|inner| read_packet(inner.get_ref(), &mut buf)) {
                    Ok(Ok(0)) | Err(_) => break,
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) => {
                        let _ = tx
                            .send(Err(ScanError::Bluetooth(format!("HCI read failed: {e}"))))
                            .await;
                        break 'scan;
                    }
                };

                if let Some(report) = parse_advertising_report(&buf[..n])
                    && let Some(advertisement) = devices.resolve(report, Instant::now())
                {
                    if tx.send(Ok(advertisement)).await.is_err() {
                        break 'scan;
                    }
                }
            }
        }

        if let Err(e) = commands.set_scan_enable(false) {
            debug!("Failed to disable HCI scanning: {e}");
        }
        debug!("HCI scan released");
    });

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build an HCI LE advertising report event around `ad_data`.
    fn report_event(address: [u8; 6], ad_data: &[u8]) -> Vec<u8> {
        let mut addr = address;
        addr.reverse();

        let mut event = vec![HCI_EVENT_PKT, EVT_LE_META_EVENT, 0, EVT_LE_ADVERTISING_REPORT];
        event.push(1); // num_reports
        event.push(0x00); // ADV_IND
        event.push(0x00); // public address
        event.extend_from_slice(&addr);
        event.push(ad_data.len() as u8);
        event.extend_from_slice(ad_data);
        event.push(0xC0); // RSSI
        event[2] = (event.len() - 3) as u8;
        event
    }

    const BAND: [u8; 6] = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];

    #[test]
    fn test_le_meta_filter() {
        let filter = HciFilter::le_meta_events();
        assert_eq!(filter.type_mask, 0x0000_0010);
        assert_eq!(filter.event_mask, [0, 0x4000_0000]);
        assert_eq!(filter.opcode, 0);
    }

    #[test]
    fn test_scan_enable_command() {
        let packet = hci_command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_ENABLE, &[0x01, 0x00]);
        assert_eq!(packet, vec![0x01, 0x0C, 0x20, 0x02, 0x01, 0x00]);
    }

    #[test]
    fn test_scan_parameters_command() {
        let packet = hci_command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_PARAMETERS, &scan_parameters());
        assert_eq!(
            packet,
            vec![0x01, 0x0B, 0x20, 0x07, 0x01, 0x10, 0x00, 0x10, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_cvt() {
        assert_eq!(cvt(3i32).unwrap(), 3);
        assert_eq!(cvt(0isize).unwrap(), 0);
        assert!(cvt(-1i32).is_err());
    }

    #[test]
    fn test_dev_info_layout() {
        assert_eq!(mem::size_of::<HciDevInfo>(), 92);
    }

    #[test]
    fn test_parse_name_and_manufacturer_data() {
        let name = b"Xiaomi Smart Band 8";
        let mut ad = vec![name.len() as u8 + 1, AD_TYPE_COMPLETE_LOCAL_NAME];
        ad.extend_from_slice(name);
        ad.extend_from_slice(&[7, AD_TYPE_MANUFACTURER_DATA, 0x57, 0x01, 0x01, 0x02, 0x03, 0x48]);

        let report = parse_advertising_report(&report_event(BAND, &ad)).unwrap();
        assert_eq!(report.address, BAND);
        assert_eq!(report.name.as_deref(), Some("Xiaomi Smart Band 8"));
        assert_eq!(
            report.manufacturer_data.get(&0x0157),
            Some(&vec![0x01, 0x02, 0x03, 0x48])
        );
    }

    #[test]
    fn test_complete_name_wins_over_short_name() {
        let ad = [
            3, AD_TYPE_SHORT_LOCAL_NAME, b'X', b'i', //
            4, AD_TYPE_COMPLETE_LOCAL_NAME, b'X', b'S', b'B',
        ];
        let (name, data) = parse_ad_structures(&ad);
        assert_eq!(name.as_deref(), Some("XSB"));
        assert!(data.is_empty());
    }

    #[test]
    fn test_truncated_ad_structure_stops_parsing() {
        let ad = [5, AD_TYPE_MANUFACTURER_DATA, 0x57, 0x01];
        let (name, data) = parse_ad_structures(&ad);
        assert!(name.is_none());
        assert!(data.is_empty());
    }

    #[test]
    fn test_short_report_ignored() {
        assert!(parse_advertising_report(&[HCI_EVENT_PKT, EVT_LE_META_EVENT]).is_none());
        assert!(
            parse_advertising_report(&[HCI_EVENT_PKT, EVT_LE_META_EVENT, 3, 2, 0]).is_none()
        );
    }

    #[test]
    fn test_other_events_ignored() {
        let mut event = report_event(BAND, &[4, AD_TYPE_MANUFACTURER_DATA, 0x57, 0x01, 0x48]);
        event[3] = 0x01; // LE Connection Complete
        assert!(parse_advertising_report(&event).is_none());
    }

    #[test]
    fn test_device_cache_joins_scan_response() {
        let mut devices = DeviceCache::default();
        let now = Instant::now();

        let name = b"Xiaomi Smart Band 9";
        let mut scan_response = vec![name.len() as u8 + 1, AD_TYPE_COMPLETE_LOCAL_NAME];
        scan_response.extend_from_slice(name);
        let first = parse_advertising_report(&report_event(BAND, &scan_response)).unwrap();
        assert!(devices.resolve(first, now).is_none());

        let payload = [7, AD_TYPE_MANUFACTURER_DATA, 0x57, 0x01, 0, 0, 0, 70];
        let second = parse_advertising_report(&report_event(BAND, &payload)).unwrap();
        let ad = devices.resolve(second, now).unwrap();

        assert_eq!(ad.source, SourceId::from(BAND));
        assert_eq!(ad.name.as_deref(), Some("Xiaomi Smart Band 9"));
        assert_eq!(ad.manufacturer_data[&0x0157], vec![0, 0, 0, 70]);
    }

    #[test]
    fn test_device_cache_is_per_device() {
        let mut devices = DeviceCache::default();
        let now = Instant::now();

        let mut named = vec![5, AD_TYPE_COMPLETE_LOCAL_NAME, b'B', b'a', b'n', b'd'];
        named.extend_from_slice(&[4, AD_TYPE_MANUFACTURER_DATA, 0x57, 0x01, 0x48]);
        devices.resolve(parse_advertising_report(&report_event(BAND, &named)).unwrap(), now);

        let other = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];
        let payload = [4, AD_TYPE_MANUFACTURER_DATA, 0x57, 0x01, 0x48];
        let report = parse_advertising_report(&report_event(other, &payload)).unwrap();
        let ad = devices.resolve(report, now).unwrap();
        assert!(ad.name.is_none());
    }

    #[test]
    fn test_scan_response_carries_cached_payload() {
        use crate::decoder::{DEVICE_NAME_PATTERN, decode_heart_rate};
        use crate::filter::ArrivalFilter;
        use std::time::Duration;

        let name = b"Xiaomi Smart Band 8";
        let mut scan_response = vec![name.len() as u8 + 1, AD_TYPE_COMPLETE_LOCAL_NAME];
        scan_response.extend_from_slice(name);
        let payload = [7, AD_TYPE_MANUFACTURER_DATA, 0x57, 0x01, 0x01, 0x02, 0x03, 0x48];

        let mut devices = DeviceCache::default();
        let mut filter = ArrivalFilter::default();
        let start = Instant::now();
        let mut forwarded = Vec::new();

        // Each window opens with the name-only scan response
        for second in 0..3u64 {
            for (offset_ms, ad_data) in [(0, &scan_response[..]), (2, &payload[..])] {
                let at = start + Duration::from_millis(second * 1000 + offset_ms);
                let report = parse_advertising_report(&report_event(BAND, ad_data)).unwrap();
                let Some(ad) = devices.resolve(report, at) else {
                    continue;
                };
                if filter.accept(&ad.source, ad.observed_at) {
                    for sample in decode_heart_rate(&ad, DEVICE_NAME_PATTERN) {
                        forwarded.push(sample.unwrap().bpm);
                    }
                }
            }
        }

        assert_eq!(forwarded, vec![72, 72, 72]);
    }

    #[test]
    fn test_device_cache_replaces_payload_per_vendor() {
        let mut devices = DeviceCache::default();
        let now = Instant::now();

        let first = [7, AD_TYPE_MANUFACTURER_DATA, 0x57, 0x01, 0, 0, 0, 70];
        devices.resolve(parse_advertising_report(&report_event(BAND, &first)).unwrap(), now);
        let second = [7, AD_TYPE_MANUFACTURER_DATA, 0x57, 0x01, 0, 0, 0, 75];
        let report = parse_advertising_report(&report_event(BAND, &second)).unwrap();
        let ad = devices.resolve(report, now).unwrap();

        assert_eq!(ad.manufacturer_data.len(), 1);
        assert_eq!(ad.manufacturer_data[&0x0157], vec![0, 0, 0, 75]);
    }

    #[test]
    fn test_device_without_payload_held_back() {
        let mut devices = DeviceCache::default();
        let mut named = vec![8, AD_TYPE_COMPLETE_LOCAL_NAME];
        named.extend_from_slice(b"Speaker");
        let report = parse_advertising_report(&report_event(BAND, &named)).unwrap();
        assert!(devices.resolve(report, Instant::now()).is_none());
    }
}
