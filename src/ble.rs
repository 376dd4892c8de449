//! `bluest`-backed transport adapter.
//!
//! Adapts the host BLE stack to the capability set in [`crate::transport`]:
//! scan-by-service for interactive requests, a filtered scan as the
//! advertisement watch, and a spawned pump that turns the borrowed `bluest`
//! notification stream into an owned one.

use std::time::Duration;

use bluest::{Adapter, Uuid};
use futures_util::{pin_mut, StreamExt};
use log::{debug, warn};
use tokio::time::timeout;

use crate::transport::{
    Advertisement, Characteristic, Device, DeviceIdentity, Notifications, Service, Transport,
    TransportError,
};

/// How long an interactive device request scans before giving up.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

impl From<bluest::Error> for TransportError {
    fn from(error: bluest::Error) -> Self {
        TransportError::Backend(error.to_string())
    }
}

/// The default host adapter.
pub struct BleCentral {
    adapter: Adapter,
}

impl BleCentral {
    pub async fn new() -> Result<Self, TransportError> {
        let adapter = Adapter::default()
            .await
            .ok_or(TransportError::AdapterUnavailable)?;
        adapter.wait_available().await?;
        Ok(Self { adapter })
    }
}

impl Transport for BleCentral {
    type Device = BleDevice;

    fn supports_advertisement_watch(&self) -> bool {
        // bluest can always run a filtered scan, which is all the watch needs.
        true
    }

    async fn known_devices(&self, service: Uuid) -> Result<Vec<BleDevice>, TransportError> {
        let devices = self
            .adapter
            .connected_devices_with_services(&[service])
            .await?;
        Ok(devices
            .into_iter()
            .map(|device| BleDevice {
                adapter: self.adapter.clone(),
                device,
            })
            .collect())
    }

    async fn request_device(&self, service: Uuid) -> Result<BleDevice, TransportError> {
        debug!("scanning for devices advertising {service}");
        let services = [service];
        let scan = self.adapter.scan(&services).await?;
        pin_mut!(scan);
        match timeout(REQUEST_TIMEOUT, scan.next()).await {
            Ok(Some(found)) => Ok(BleDevice {
                adapter: self.adapter.clone(),
                device: found.device,
            }),
            Ok(None) | Err(_) => Err(TransportError::NoDevice),
        }
    }

    async fn connect_device(&self, device: &BleDevice) -> Result<(), TransportError> {
        self.adapter.connect_device(&device.device).await?;
        Ok(())
    }

    async fn disconnect_device(&self, device: &BleDevice) -> Result<(), TransportError> {
        self.adapter.disconnect_device(&device.device).await?;
        Ok(())
    }
}

pub struct BleDevice {
    adapter: Adapter,
    device: bluest::Device,
}

impl Device for BleDevice {
    type Service = BleService;

    fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            id: format!("{:?}", self.device.id()),
            name: self.device.name().ok(),
        }
    }

    async fn await_advertisement(
        &self,
        window: Duration,
    ) -> Result<Option<Advertisement>, TransportError> {
        let target = self.device.id();
        let scan = self.adapter.scan(&[]).await?;
        pin_mut!(scan);
        // The scan stream is dropped on every path out of this function,
        // which releases the watch.
        let first = async {
            while let Some(found) = scan.next().await {
                if found.device.id() == target {
                    return Some(Advertisement { rssi: found.rssi });
                }
            }
            None
        };
        match timeout(window, first).await {
            Ok(result) => Ok(result),
            Err(_) => Ok(None),
        }
    }

    async fn primary_service(&self, uuid: Uuid) -> Result<BleService, TransportError> {
        let services = self.device.discover_services_with_uuid(uuid).await?;
        services
            .first()
            .cloned()
            .map(|service| BleService { service })
            .ok_or(TransportError::ServiceNotFound(uuid))
    }
}

pub struct BleService {
    service: bluest::Service,
}

impl Service for BleService {
    type Characteristic = BleCharacteristic;

    async fn characteristic(&self, uuid: Uuid) -> Result<BleCharacteristic, TransportError> {
        let characteristics = self.service.discover_characteristics_with_uuid(uuid).await?;
        characteristics
            .first()
            .cloned()
            .map(|characteristic| BleCharacteristic { characteristic })
            .ok_or(TransportError::CharacteristicNotFound(uuid))
    }
}

pub struct BleCharacteristic {
    characteristic: bluest::Characteristic,
}

impl Characteristic for BleCharacteristic {
    async fn subscribe(&self) -> Result<Notifications, TransportError> {
        let characteristic = self.characteristic.clone();
        let (tx, notifications) = Notifications::channel();
        tokio::spawn(async move {
            let stream = match characteristic.notify().await {
                Ok(stream) => stream,
                Err(error) => {
                    warn!("subscribing to notifications failed: {error}");
                    let _ = tx.send(Err(error.into()));
                    return;
                }
            };
            pin_mut!(stream);
            while let Some(item) = stream.next().await {
                if tx.send(item.map_err(TransportError::from)).is_err() {
                    // Receiver gone; dropping the stream stops notifications.
                    break;
                }
            }
        });
        Ok(notifications)
    }

    async fn unsubscribe(&self) -> Result<(), TransportError> {
        // Notifications stop when the pump drops its stream; nothing else to
        // tear down here.
        Ok(())
    }

    async fn write_with_response(&self, value: &[u8]) -> Result<(), TransportError> {
        self.characteristic.write(value).await?;
        Ok(())
    }

    async fn write_without_response(&self, value: &[u8]) -> Result<(), TransportError> {
        self.characteristic.write_without_response(value).await?;
        Ok(())
    }
}
