//! The capability set the device session needs from a GATT host.
//!
//! The session is generic over these traits; the crate ships two
//! implementations, [`crate::ble`] over real hardware and [`crate::mock`]
//! for tests. None of the traits carry `Send` bounds: the session runs on a
//! single cooperative execution context and all notification handling
//! happens there.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bluest::Uuid;
use futures_util::Stream;
use thiserror::Error;
use tokio::sync::mpsc;

/// Failures surfaced by a transport implementation. The session absorbs or
/// maps these; they never reach consumers raw.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no usable adapter available")]
    AdapterUnavailable,
    #[error("no matching device found")]
    NoDevice,
    #[error("service {0} not found on device")]
    ServiceNotFound(Uuid),
    #[error("characteristic {0} not found on device")]
    CharacteristicNotFound(Uuid),
    #[error("{0}")]
    Backend(String),
}

/// Stable identity of a device, kept across sessions for reconnects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub id: String,
    pub name: Option<String>,
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name} ({})", self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

/// One received advertisement.
#[derive(Clone, Copy, Debug)]
pub struct Advertisement {
    pub rssi: Option<i16>,
}

/// Notification stream handed out by [`Characteristic::subscribe`].
///
/// The stream ends when the remote side drops the connection; the session
/// treats exhaustion as an external disconnect.
pub struct Notifications {
    rx: mpsc::UnboundedReceiver<Result<Vec<u8>, TransportError>>,
}

impl Notifications {
    /// A sender/stream pair; transports push notifications into the sender.
    pub fn channel() -> (
        mpsc::UnboundedSender<Result<Vec<u8>, TransportError>>,
        Self,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }
}

impl Stream for Notifications {
    type Item = Result<Vec<u8>, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// An adapter that can discover and own connections to devices.
pub trait Transport {
    type Device: Device;

    /// Whether the transport can watch advertisements from known devices.
    /// Without the capability, reconnect-to-previous degrades to an
    /// interactive request.
    fn supports_advertisement_watch(&self) -> bool;

    /// Devices already known to the host that expose `service`.
    fn known_devices(
        &self,
        service: Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<Self::Device>, TransportError>>;

    /// Interactive device selection, filtered by `service`.
    fn request_device(
        &self,
        service: Uuid,
    ) -> impl std::future::Future<Output = Result<Self::Device, TransportError>>;

    fn connect_device(
        &self,
        device: &Self::Device,
    ) -> impl std::future::Future<Output = Result<(), TransportError>>;

    fn disconnect_device(
        &self,
        device: &Self::Device,
    ) -> impl std::future::Future<Output = Result<(), TransportError>>;
}

/// A single peripheral.
pub trait Device {
    type Service: Service;

    fn identity(&self) -> DeviceIdentity;

    /// Wait up to `window` for one advertisement from this device. Returns
    /// `None` when the window elapses; the underlying watch is released on
    /// every path.
    fn await_advertisement(
        &self,
        window: Duration,
    ) -> impl std::future::Future<Output = Result<Option<Advertisement>, TransportError>>;

    fn primary_service(
        &self,
        uuid: Uuid,
    ) -> impl std::future::Future<Output = Result<Self::Service, TransportError>>;
}

/// A GATT service on a connected device.
pub trait Service {
    type Characteristic: Characteristic;

    fn characteristic(
        &self,
        uuid: Uuid,
    ) -> impl std::future::Future<Output = Result<Self::Characteristic, TransportError>>;
}

/// A GATT characteristic supporting notifications and writes.
pub trait Characteristic {
    fn subscribe(
        &self,
    ) -> impl std::future::Future<Output = Result<Notifications, TransportError>>;

    /// Best-effort; transports may also stop notifying when the
    /// [`Notifications`] stream is dropped.
    fn unsubscribe(&self) -> impl std::future::Future<Output = Result<(), TransportError>>;

    fn write_with_response(
        &self,
        value: &[u8],
    ) -> impl std::future::Future<Output = Result<(), TransportError>>;

    fn write_without_response(
        &self,
        value: &[u8],
    ) -> impl std::future::Future<Output = Result<(), TransportError>>;
}
