//! BLE advertisement scanning backends.
//!
//! Every backend offers the same three operations: check that the radio is
//! usable, start delivering [`Advertisement`]s through a channel, and stop when
//! the receiving side of that channel is closed.

#[cfg(feature = "bluer")]
pub mod bluer;

#[cfg(feature = "hci")]
pub mod hci;

use crate::advertisement::Advertisement;
use thiserror::Error;
use tokio::sync::mpsc;

/// Error type for scanner operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScanError {
    /// Radio missing, powered off or not accessible
    #[error("Bluetooth is not available or disabled: {0}")]
    Unavailable(String),
    /// The receiving subsystem failed while scanning
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
}

/// Convenience alias for observed advertisements or a fatal subsystem failure.
pub type AdvertisementResult = Result<Advertisement, ScanError>;

/// Channel buffer size for advertisements.
pub const ADVERTISEMENT_CHANNEL_BUFFER_SIZE: usize = 100;

#[cfg(not(any(feature = "bluer", feature = "hci")))]
compile_error!("enable at least one scanner backend feature: `bluer` or `hci`");

/// Radio backend used to receive advertisements.
///
/// The default is BlueZ when it is compiled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Backend {
    /// Talk to bluetoothd over D-Bus
    #[cfg(feature = "bluer")]
    #[default]
    #[value(alias = "bluez")]
    Bluer,
    /// Read advertising reports from a raw HCI socket, no daemon needed
    #[cfg(feature = "hci")]
    #[cfg_attr(not(feature = "bluer"), default)]
    #[value(alias = "raw")]
    Hci,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use clap::ValueEnum;

        match self.to_possible_value() {
            Some(value) => f.write_str(value.get_name()),
            None => Ok(()),
        }
    }
}

/// Check that the radio behind `backend` is present and enabled.
pub async fn check_available(backend: Backend) -> Result<(), ScanError> {
    match backend {
        #[cfg(feature = "bluer")]
        Backend::Bluer => bluer::check_available().await,
        #[cfg(feature = "hci")]
        Backend::Hci => hci::check_available(),
    }
}

/// Start receiving advertisements using the specified backend.
///
/// Advertisements arrive on the returned channel until it is closed by the
/// receiver, which stops the scan and releases the backend's resources. An `Err`
/// item means the backend failed and no further advertisements will follow.
pub async fn start_scan(backend: Backend) -> Result<mpsc::Receiver<AdvertisementResult>, ScanError> {
    match backend {
        #[cfg(feature = "bluer")]
        Backend::Bluer => bluer::start_scan().await,
        #[cfg(feature = "hci")]
        Backend::Hci => hci::start_scan().await,
    }
}
