//! A scripted, in-memory transport.
//!
//! Drives the session without hardware: tests (and host-less demos) script
//! which devices exist, whether they advertise, and what notifications they
//! emit, then inspect every write the session performed.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use bluest::Uuid;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::sleep;

use crate::transport::{
    Advertisement, Characteristic, Device, DeviceIdentity, Notifications, Service, Transport,
    TransportError,
};

/// One write the session performed, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MockWrite {
    pub value: Vec<u8>,
    pub with_response: bool,
}

/// Shared per-device endpoint: records writes, feeds notifications.
#[derive(Default)]
pub struct MockLink {
    writes: RefCell<Vec<MockWrite>>,
    notify_tx: RefCell<Option<UnboundedSender<Result<Vec<u8>, TransportError>>>>,
    subscriptions: Cell<u32>,
    unsubscriptions: Cell<u32>,
    /// Number of upcoming writes that should fail.
    fail_writes: Cell<u32>,
}

impl MockLink {
    /// Push one notification fragment to the subscriber. Returns false when
    /// nobody is subscribed.
    pub fn notify(&self, fragment: &[u8]) -> bool {
        match &*self.notify_tx.borrow() {
            Some(tx) => tx.send(Ok(fragment.to_vec())).is_ok(),
            None => false,
        }
    }

    /// End the notification stream, as a dropped connection would.
    pub fn end_notifications(&self) {
        self.notify_tx.borrow_mut().take();
    }

    /// Make the next `count` writes fail.
    pub fn fail_next_writes(&self, count: u32) {
        self.fail_writes.set(count);
    }

    /// Every write attempted so far, failed ones included.
    pub fn writes(&self) -> Vec<MockWrite> {
        self.writes.borrow().clone()
    }

    pub fn subscriptions(&self) -> u32 {
        self.subscriptions.get()
    }

    pub fn unsubscriptions(&self) -> u32 {
        self.unsubscriptions.get()
    }

    fn record_write(&self, value: &[u8], with_response: bool) -> Result<(), TransportError> {
        self.writes.borrow_mut().push(MockWrite {
            value: value.to_vec(),
            with_response,
        });
        let failures = self.fail_writes.get();
        if failures > 0 {
            self.fail_writes.set(failures - 1);
            return Err(TransportError::Backend("scripted write failure".into()));
        }
        Ok(())
    }
}

/// A scripted peripheral.
#[derive(Clone)]
pub struct MockDevice {
    identity: DeviceIdentity,
    advertises: bool,
    missing_service: bool,
    link: Rc<MockLink>,
}

impl MockDevice {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            identity: DeviceIdentity {
                id: id.into(),
                name: Some(name.into()),
            },
            advertises: true,
            missing_service: false,
            link: Rc::new(MockLink::default()),
        }
    }

    /// Paired but not in range: advertisement waits run out their window.
    pub fn silent(mut self) -> Self {
        self.advertises = false;
        self
    }

    /// Device without the protocol's service, to script connect failures.
    pub fn without_service(mut self) -> Self {
        self.missing_service = true;
        self
    }

    /// Handle for injecting notifications and inspecting writes.
    pub fn link(&self) -> Rc<MockLink> {
        Rc::clone(&self.link)
    }
}

#[derive(Default)]
struct MockShared {
    known: RefCell<Vec<MockDevice>>,
    interactive: RefCell<Option<MockDevice>>,
    supports_watch: Cell<bool>,
    connects: Cell<u32>,
    disconnects: Cell<u32>,
}

/// The scripted adapter. Clones share all state.
#[derive(Clone, Default)]
pub struct MockTransport {
    shared: Rc<MockShared>,
}

impl MockTransport {
    pub fn new() -> Self {
        let transport = Self::default();
        transport.shared.supports_watch.set(true);
        transport
    }

    /// Script whether the adapter can watch advertisements.
    pub fn set_advertisement_watch(&self, supported: bool) {
        self.shared.supports_watch.set(supported);
    }

    /// Add a device the host already knows (the reconnect pool).
    pub fn add_known_device(&self, device: MockDevice) {
        self.shared.known.borrow_mut().push(device);
    }

    /// Script the device an interactive request returns.
    pub fn set_interactive_device(&self, device: MockDevice) {
        *self.shared.interactive.borrow_mut() = Some(device);
    }

    pub fn connects(&self) -> u32 {
        self.shared.connects.get()
    }

    pub fn disconnects(&self) -> u32 {
        self.shared.disconnects.get()
    }
}

impl Transport for MockTransport {
    type Device = MockDevice;

    fn supports_advertisement_watch(&self) -> bool {
        self.shared.supports_watch.get()
    }

    async fn known_devices(&self, _service: Uuid) -> Result<Vec<MockDevice>, TransportError> {
        Ok(self.shared.known.borrow().clone())
    }

    async fn request_device(&self, _service: Uuid) -> Result<MockDevice, TransportError> {
        self.shared
            .interactive
            .borrow()
            .clone()
            .ok_or(TransportError::NoDevice)
    }

    async fn connect_device(&self, _device: &MockDevice) -> Result<(), TransportError> {
        self.shared.connects.set(self.shared.connects.get() + 1);
        Ok(())
    }

    async fn disconnect_device(&self, _device: &MockDevice) -> Result<(), TransportError> {
        self.shared.disconnects.set(self.shared.disconnects.get() + 1);
        Ok(())
    }
}

impl Device for MockDevice {
    type Service = MockService;

    fn identity(&self) -> DeviceIdentity {
        self.identity.clone()
    }

    async fn await_advertisement(
        &self,
        window: Duration,
    ) -> Result<Option<Advertisement>, TransportError> {
        if self.advertises {
            Ok(Some(Advertisement { rssi: Some(-60) }))
        } else {
            sleep(window).await;
            Ok(None)
        }
    }

    async fn primary_service(&self, uuid: Uuid) -> Result<MockService, TransportError> {
        if self.missing_service {
            return Err(TransportError::ServiceNotFound(uuid));
        }
        Ok(MockService {
            link: Rc::clone(&self.link),
        })
    }
}

pub struct MockService {
    link: Rc<MockLink>,
}

impl Service for MockService {
    type Characteristic = MockCharacteristic;

    async fn characteristic(&self, _uuid: Uuid) -> Result<MockCharacteristic, TransportError> {
        Ok(MockCharacteristic {
            link: Rc::clone(&self.link),
        })
    }
}

pub struct MockCharacteristic {
    link: Rc<MockLink>,
}

impl Characteristic for MockCharacteristic {
    async fn subscribe(&self) -> Result<Notifications, TransportError> {
        let (tx, notifications) = Notifications::channel();
        *self.link.notify_tx.borrow_mut() = Some(tx);
        self.link.subscriptions.set(self.link.subscriptions.get() + 1);
        Ok(notifications)
    }

    async fn unsubscribe(&self) -> Result<(), TransportError> {
        self.link.notify_tx.borrow_mut().take();
        self.link
            .unsubscriptions
            .set(self.link.unsubscriptions.get() + 1);
        Ok(())
    }

    async fn write_with_response(&self, value: &[u8]) -> Result<(), TransportError> {
        self.link.record_write(value, true)
    }

    async fn write_without_response(&self, value: &[u8]) -> Result<(), TransportError> {
        self.link.record_write(value, false)
    }
}
