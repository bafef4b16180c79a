//! Broadcast observations as seen by the scanner backends.
//!
//! This module is decoupled from any specific Bluetooth library so the pipeline
//! can be driven from tests with hand-built advertisements.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

/// Opaque address of the emitting device.
///
/// Stable per physical device for the duration of a scan session. Backends use the
/// conventional `AA:BB:CC:DD:EE:FF` rendering, but nothing in the pipeline relies on
/// that shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

/// Raw 6-byte address in display order (most significant byte first).
impl From<[u8; 6]> for SourceId {
    fn from(bytes: [u8; 6]) -> Self {
        Self(format!(
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]
        ))
    }
}

#[cfg(feature = "bluer")]
impl From<bluer::Address> for SourceId {
    fn from(addr: bluer::Address) -> Self {
        Self::from(addr.0)
    }
}

/// One broadcast observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    /// Address of the emitting device
    pub source: SourceId,
    /// Advertised local name, if the device has announced one
    pub name: Option<String>,
    /// Manufacturer-specific data keyed by company identifier
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    /// When the observation was received
    pub observed_at: Instant,
}

impl Advertisement {
    /// Create an advertisement without a name or vendor payload.
    pub fn new(source: SourceId, observed_at: Instant) -> Self {
        Self {
            source,
            name: None,
            manufacturer_data: BTreeMap::new(),
            observed_at,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_manufacturer_data(mut self, vendor_id: u16, data: impl Into<Vec<u8>>) -> Self {
        self.manufacturer_data.insert(vendor_id, data.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_from_bytes() {
        let source = SourceId::from([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        assert_eq!(source.as_str(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_source_from_bytes_with_zeros() {
        let source = SourceId::from([0x00, 0x01, 0x02, 0x03, 0x04, 0x05]);
        assert_eq!(format!("{}", source), "00:01:02:03:04:05");
    }

    #[test]
    fn test_source_is_opaque() {
        let source = SourceId::from("not-a-mac");
        assert_eq!(source.to_string(), "not-a-mac");
        assert_ne!(source, SourceId::from("NOT-A-MAC"));
    }

    #[test]
    fn test_builder_collects_payloads() {
        let now = Instant::now();
        let ad = Advertisement::new(SourceId::from("a"), now)
            .with_name("Xiaomi Smart Band 8")
            .with_manufacturer_data(0x0157, [1, 2, 3, 4])
            .with_manufacturer_data(0x0001, vec![9]);

        assert_eq!(ad.name.as_deref(), Some("Xiaomi Smart Band 8"));
        assert_eq!(ad.manufacturer_data.len(), 2);
        assert_eq!(ad.manufacturer_data[&0x0157], vec![1, 2, 3, 4]);
        assert_eq!(ad.observed_at, now);
    }

    #[cfg(feature = "bluer")]
    #[test]
    fn test_source_from_bluer_address() {
        let addr = bluer::Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let source: SourceId = addr.into();
        assert_eq!(source.as_str(), "AA:BB:CC:DD:EE:FF");
    }
}
