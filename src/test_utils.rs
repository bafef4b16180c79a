use crate::advertisement::{Advertisement, SourceId};
use std::time::Instant;

/// A stable source address for unit tests.
pub const TEST_SOURCE: &str = "AA:BB:CC:DD:EE:FF";

/// Build an advertisement from a Xiaomi Smart Band carrying one vendor payload.
///
/// Tests can add further payloads or override the timestamp as needed.
pub fn band_advertisement(source: &str, vendor_id: u16, data: &[u8]) -> Advertisement {
    Advertisement::new(SourceId::from(source), Instant::now())
        .with_name("Xiaomi Smart Band 8")
        .with_manufacturer_data(vendor_id, data)
}
