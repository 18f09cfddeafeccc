//! BlueZ D-Bus backend for SwitchBot scanning.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running. BlueZ merges
//! advertising packets and scan responses per device, so the service UUID
//! list and the service data arrive together.

use super::{ADVERTISEMENT_CHANNEL_BUFFER_SIZE, Advertisement, ScanError, ScanSchedule};
use crate::decoder::{SWITCHBOT_SERVICE_UUID, ServiceData};
use bluer::{Adapter, AdapterEvent, Address, DiscoveryFilter, DiscoveryTransport, Session};
use futures::StreamExt;
use std::collections::HashSet;
use tokio::sync::mpsc;

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        ScanError::Bluetooth(err.to_string())
    }
}

/// Discovery filter limited to LE devices advertising the SwitchBot service.
///
/// Duplicate data is requested so that every fresh advertisement of an
/// already known device is reported as a property change.
fn discovery_filter() -> DiscoveryFilter {
    DiscoveryFilter {
        uuids: HashSet::from([SWITCHBOT_SERVICE_UUID]),
        transport: DiscoveryTransport::Le,
        duplicate_data: true,
        ..Default::default()
    }
}

/// Start scanning using the BlueZ D-Bus backend.
///
/// Initializes the default adapter and returns a channel of advertisements.
/// Discovery runs for `schedule.window`, stops for `schedule.idle`, and
/// starts again, until the receiver is dropped.
pub async fn start_scan(schedule: ScanSchedule) -> Result<mpsc::Receiver<Advertisement>, ScanError> {
    let session = Session::new().await?;
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;
    adapter.set_discovery_filter(discovery_filter()).await?;
    tracing::info!(adapter = adapter.name(), "using BlueZ adapter");

    let (tx, rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_BUFFER_SIZE);

    tokio::spawn(async move {
        // The session must outlive the adapter handle.
        let _session = session;

        loop {
            match scan_window(&adapter, schedule, &tx).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(error) => tracing::warn!(%error, "scan window failed"),
            }
            if !schedule.is_continuous() {
                tokio::time::sleep(schedule.idle).await;
            }
        }
        tracing::debug!("advertisement receiver dropped, stopping scan");
    });

    Ok(rx)
}

/// Separates fresh advertisements from BlueZ's replay of its device cache.
///
/// A discovery stream opens with one `DeviceAdded` per device BlueZ already
/// knows, carrying whatever data it cached, possibly from a device that has
/// since gone silent. The first event for each cached address is skipped;
/// later events for it are property changes caused by new advertisements.
#[derive(Debug, Default)]
struct CacheReplayFilter {
    cached: HashSet<Address>,
}

impl CacheReplayFilter {
    fn new(cached: impl IntoIterator<Item = Address>) -> Self {
        Self {
            cached: cached.into_iter().collect(),
        }
    }

    /// Returns the address whose current data should be forwarded, if any.
    fn accept(&mut self, event: AdapterEvent) -> Option<Address> {
        match event {
            AdapterEvent::DeviceAdded(address) => {
                (!self.cached.remove(&address)).then_some(address)
            }
            AdapterEvent::DeviceRemoved(address) => {
                self.cached.remove(&address);
                None
            }
            AdapterEvent::PropertyChanged(_) => None,
        }
    }
}

/// Run discovery for one window. Returns `false` once the receiver is gone.
async fn scan_window(
    adapter: &Adapter,
    schedule: ScanSchedule,
    tx: &mpsc::Sender<Advertisement>,
) -> Result<bool, ScanError> {
    let mut filter = CacheReplayFilter::new(adapter.device_addresses().await?);
    // Dropping the stream at the end of the window stops discovery.
    let events = adapter.discover_devices_with_changes().await?;
    futures::pin_mut!(events);
    let deadline = tokio::time::sleep(schedule.window);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => return Ok(true),
            event = events.next() => {
                let Some(event) = event else { return Ok(true) };
                let Some(address) = filter.accept(event) else { continue };
                match read_advertisement(adapter, address).await {
                    Ok(Some(advertisement)) => {
                        if tx.send(advertisement).await.is_err() {
                            return Ok(false);
                        }
                    }
                    Ok(None) => {}
                    Err(error) => tracing::debug!(%address, %error, "cannot read device properties"),
                }
            }
        }
    }
}

/// Read the current advertisement data of a discovered device.
///
/// Devices without any service data yield `None`.
async fn read_advertisement(
    adapter: &Adapter,
    address: Address,
) -> Result<Option<Advertisement>, ScanError> {
    let device = adapter.device(address)?;

    let Some(data) = device.service_data().await? else {
        return Ok(None);
    };
    let services = device.uuids().await?.unwrap_or_default();

    let mut service_data: Vec<ServiceData> = data
        .into_iter()
        .map(|(uuid, bytes)| ServiceData::new(uuid, bytes))
        .collect();
    service_data.sort_by_key(|entry| entry.uuid);

    Ok(Some(Advertisement {
        address: address.into(),
        services,
        service_data,
    }))
}
