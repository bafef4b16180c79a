//! Heart rate extraction from Xiaomi Smart Band advertisements.
//!
//! The band broadcasts its current heart rate in the manufacturer-specific data of
//! its advertisements. The value lives at a fixed offset of the vendor payload, so
//! decoding is a name check followed by a single byte read per payload.

use crate::advertisement::{Advertisement, SourceId};
use thiserror::Error;

/// Substring of the advertised name that identifies a supported band.
pub const DEVICE_NAME_PATTERN: &str = "Xiaomi Smart Band";

/// Offset of the heart rate byte within a manufacturer payload.
pub const HEART_RATE_OFFSET: usize = 3;

/// Minimum payload length that carries a heart rate byte.
pub const MIN_PAYLOAD_LEN: usize = HEART_RATE_OFFSET + 1;

/// Heart rate value decoded from one manufacturer payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartRateSample {
    /// Device the sample came from
    pub source: SourceId,
    /// Company identifier of the payload that carried the sample
    pub vendor_id: u16,
    /// Beats per minute
    pub bpm: u8,
}

/// Anomalies found while decoding a matching advertisement.
///
/// None of these abort the pipeline; they are reported and the event is dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Payload is too short to contain the heart rate byte
    #[error("[{device}] Manufacturer data too short: {data:02X?}")]
    PayloadTooShort {
        device: SourceId,
        vendor_id: u16,
        data: Vec<u8>,
    },
    /// Matching device advertised without any manufacturer data
    #[error("[{0}] No manufacturer data in advertisement")]
    MissingPayload(SourceId),
}

/// Convenience alias for decoded samples or decode anomalies.
pub type SampleResult = Result<HeartRateSample, DecodeError>;

/// Read the heart rate byte from a single manufacturer payload.
///
/// Returns `None` if the payload is shorter than [`MIN_PAYLOAD_LEN`].
pub fn heart_rate_from_payload(data: &[u8]) -> Option<u8> {
    data.get(HEART_RATE_OFFSET).copied()
}

/// Decode every heart rate sample carried by an advertisement.
///
/// Advertisements whose name does not contain `name_pattern` yield nothing. For a
/// matching device, each manufacturer payload is examined independently, so one
/// advertisement can produce several samples and anomalies in vendor id order.
pub fn decode_heart_rate(advertisement: &Advertisement, name_pattern: &str) -> Vec<SampleResult> {
    let matches = advertisement
        .name
        .as_deref()
        .is_some_and(|name| name.contains(name_pattern));
    if !matches {
        return Vec::new();
    }

    if advertisement.manufacturer_data.is_empty() {
        return vec![Err(DecodeError::MissingPayload(
            advertisement.source.clone(),
        ))];
    }

    advertisement
        .manufacturer_data
        .iter()
        .map(|(&vendor_id, data)| match heart_rate_from_payload(data) {
            Some(bpm) => Ok(HeartRateSample {
                source: advertisement.source.clone(),
                vendor_id,
                bpm,
            }),
            None => Err(DecodeError::PayloadTooShort {
                device: advertisement.source.clone(),
                vendor_id,
                data: data.clone(),
            }),
        })
        .collect()
}
