//! BlueZ D-Bus backend for advertisement scanning.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running.

use super::{ADVERTISEMENT_CHANNEL_BUFFER_SIZE, AdvertisementResult, ScanError};
use crate::advertisement::Advertisement;
use bluer::{Adapter, AdapterEvent, Address, DiscoveryFilter, DiscoveryTransport, Session};
use futures::StreamExt;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        ScanError::Bluetooth(err.to_string())
    }
}

fn unavailable(err: bluer::Error) -> ScanError {
    ScanError::Unavailable(err.to_string())
}

/// LE discovery that reports every advertisement, not just the first per device.
fn discovery_filter() -> DiscoveryFilter {
    DiscoveryFilter {
        transport: DiscoveryTransport::Le,
        duplicate_data: true,
        ..Default::default()
    }
}

/// Check that BlueZ is reachable and its default adapter is powered.
pub async fn check_available() -> Result<(), ScanError> {
    let session = Session::new().await.map_err(unavailable)?;
    let adapter = session.default_adapter().await.map_err(unavailable)?;

    if adapter.is_powered().await.map_err(unavailable)? {
        Ok(())
    } else {
        Err(ScanError::Unavailable(format!(
            "adapter {} is powered off",
            adapter.name()
        )))
    }
}

/// Start LE discovery on the default adapter.
///
/// The discovery session lives in a spawned task that owns all Bluetooth state.
/// It ends, releasing the session, once the returned receiver is closed or dropped.
pub async fn start_scan() -> Result<mpsc::Receiver<AdvertisementResult>, ScanError> {
    let session = Session::new().await?;
    let adapter = session.default_adapter().await?;
    adapter.set_discovery_filter(discovery_filter()).await?;

    let (tx, rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_BUFFER_SIZE);
    let (ready_tx, ready_rx) = oneshot::channel();

    tokio::spawn(async move {
        // Keep the D-Bus session alive for as long as discovery runs
        let _session = session;

        let events = match adapter.discover_devices_with_changes().await {
            Ok(events) => {
                let _ = ready_tx.send(Ok(()));
                events
            }
            Err(e) => {
                let _ = ready_tx.send(Err(ScanError::from(e)));
                return;
            }
        };
        futures::pin_mut!(events);

        loop {
            let event = tokio::select! {
                _ = tx.closed() => break,
                event = events.next() => event,
            };

            match event {
                Some(AdapterEvent::DeviceAdded(address)) => {
                    match read_advertisement(&adapter, address).await {
                        Ok(advertisement) => {
                            if tx.send(Ok(advertisement)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => debug!("[{address}] Failed to read advertisement: {e}"),
                    }
                }
                Some(_) => {}
                None => {
                    let _ = tx
                        .send(Err(ScanError::Bluetooth("discovery stream ended".into())))
                        .await;
                    break;
                }
            }
        }

        debug!("BlueZ discovery released");
    });

    ready_rx
        .await
        .map_err(|_| ScanError::Bluetooth("discovery task exited before starting".into()))??;

    Ok(rx)
}

/// Snapshot the advertised name and manufacturer data BlueZ holds for a device.
async fn read_advertisement(
    adapter: &Adapter,
    address: Address,
) -> Result<Advertisement, bluer::Error> {
    let observed_at = Instant::now();
    let device = adapter.device(address)?;

    let name = device.name().await?;
    let manufacturer_data = device.manufacturer_data().await?.unwrap_or_default();

    Ok(Advertisement {
        source: address.into(),
        name,
        manufacturer_data: manufacturer_data.into_iter().collect(),
        observed_at,
    })
}
