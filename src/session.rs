//! The device session: connection lifecycle, command transmission,
//! notification demultiplexing and the inactivity watchdog.
//!
//! A session owns its transport handles for their whole lifetime and runs on
//! one cooperative execution context. Commands never overlap on the wire:
//! every send completes, post-send wait included, before the next begins.
//! Recoverable wire problems (bad checksums, stray fragments, undecodable
//! segments) are absorbed here; consumers only see status transitions and
//! the typed callbacks of [`DeviceEvents`].

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, timeout, Instant};

use crate::decode::{Decoder, Record, Value};
use crate::frame::FrameAssembler;
use crate::protocol::{encode_command, CommandError, CommandName, ProtocolSpec, RecordKind};
use crate::transport::{
    Characteristic, Device, DeviceIdentity, Notifications, Service, Transport, TransportError,
};

/// Settling time around transport teardown operations.
const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Record fields consumed by the session itself and never dispatched.
const INTERNAL_KEYS: [&str; 5] = [
    "header",
    "record_type",
    "frame_counter",
    "reserved",
    "checksum",
];

/// Connection lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Disconnected,
    Scanning,
    Connecting,
    Connected,
}

/// Why a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Consumer asked for it.
    User,
    /// The transport dropped the link underneath us.
    External,
    /// The inactivity watchdog fired.
    Inactivity,
    /// A failure during connection establishment.
    Error,
}

/// Requests a consumer can feed into [`DeviceSession::run`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Control {
    ToggleCharging(bool),
    ToggleDischarging(bool),
    Disconnect,
}

/// Session failures surfaced to the caller.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("command {0:?} timed out")]
    CommandTimeout(CommandName),
    #[error("no device connected")]
    NotConnected,
    #[error("a session is already active")]
    AlreadyActive,
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("teardown failed: {0}")]
    Teardown(TransportError),
}

/// Consumer callbacks. Every method has a no-op default; implement the ones
/// you care about.
pub trait DeviceEvents {
    fn on_status_change(&mut self, _status: Status) {}
    fn on_connected(&mut self, _identity: &DeviceIdentity) {}
    fn on_disconnected(&mut self, _reason: DisconnectReason) {}
    fn on_request_device_error(&mut self, _error: &SessionError) {}
    fn on_previous_unavailable(&mut self, _device: Option<&DeviceIdentity>) {}
    fn on_data(&mut self, _kind: RecordKind, _record: &Record) {}
    fn on_error(&mut self, _error: &SessionError) {}
}

/// The most recent record of one kind.
#[derive(Clone, Debug)]
pub struct CachedRecord {
    /// Epoch milliseconds at which the record was decoded.
    pub timestamp: u64,
    pub record: Record,
}

type ServiceOf<T> = <<T as Transport>::Device as Device>::Service;
type CharacteristicOf<T> = <ServiceOf<T> as Service>::Characteristic;

/// A session over one BMS.
pub struct DeviceSession<T: Transport, E: DeviceEvents> {
    decoder: Decoder,
    transport: T,
    events: E,
    status: Status,
    device: Option<T::Device>,
    characteristic: Option<CharacteristicOf<T>>,
    notifications: Option<Notifications>,
    assembler: FrameAssembler,
    cache: HashMap<RecordKind, CachedRecord>,
    watchdog: Option<Instant>,
}

enum Wake {
    Watchdog,
    Notification(Option<Result<Vec<u8>, TransportError>>),
    Control(Option<Control>),
}

impl<T: Transport, E: DeviceEvents> DeviceSession<T, E> {
    /// A new, disconnected session. The decoder carries the validated
    /// protocol the session speaks.
    pub fn new(decoder: Decoder, transport: T, events: E) -> Self {
        Self {
            decoder,
            transport,
            events,
            status: Status::Disconnected,
            device: None,
            characteristic: None,
            notifications: None,
            assembler: FrameAssembler::new(),
            cache: HashMap::new(),
            watchdog: None,
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn protocol(&self) -> &ProtocolSpec {
        self.decoder.protocol()
    }

    pub fn events(&self) -> &E {
        &self.events
    }

    /// The most recently dispatched record of `kind`, if any.
    pub fn latest(&self, kind: RecordKind) -> Option<&CachedRecord> {
        self.cache.get(&kind)
    }

    /// Establish a session. With a previous identity, tries the silent
    /// reconnect path first (when the transport can watch advertisements);
    /// otherwise asks the transport for an interactive device request.
    ///
    /// Returns `Ok(None)` when the previous device is unavailable; the
    /// matching [`DeviceEvents::on_previous_unavailable`] has already fired.
    pub async fn connect(
        &mut self,
        previous: Option<&DeviceIdentity>,
    ) -> Result<Option<DeviceIdentity>, SessionError> {
        if self.status != Status::Disconnected {
            warn!("connect() while {:?}", self.status);
            return Err(SessionError::AlreadyActive);
        }

        self.set_status(Status::Scanning);
        let device = match self.choose_device(previous).await {
            Ok(Some(device)) => device,
            Ok(None) => {
                self.set_status(Status::Disconnected);
                return Ok(None);
            }
            Err(error) => {
                self.set_status(Status::Disconnected);
                return Err(error);
            }
        };

        let identity = device.identity();
        info!("connecting to {identity}");
        self.set_status(Status::Connecting);
        self.device = Some(device);

        if let Err(error) = self.establish().await {
            self.events.on_request_device_error(&error);
            if let Err(teardown) = self.disconnect(DisconnectReason::Error).await {
                warn!("teardown after failed connect also failed: {teardown}");
            }
            return Err(error);
        }

        self.set_status(Status::Connected);
        self.events.on_connected(&identity);

        // Kick the device into streaming live data.
        self.send_command(CommandName::GetSettings, &[]).await?;
        self.send_command(CommandName::GetDeviceInfo, &[]).await?;

        Ok(Some(identity))
    }

    async fn choose_device(
        &mut self,
        previous: Option<&DeviceIdentity>,
    ) -> Result<Option<T::Device>, SessionError> {
        let service = self.decoder.protocol().service_uuid;

        if let Some(previous) = previous {
            if self.transport.supports_advertisement_watch() {
                return self.find_previous(previous).await;
            }
            debug!("transport cannot watch advertisements, requesting interactively");
        }

        match self.transport.request_device(service).await {
            Ok(device) => Ok(Some(device)),
            Err(error) => {
                let error = SessionError::from(error);
                self.events.on_request_device_error(&error);
                Err(error)
            }
        }
    }

    async fn find_previous(
        &mut self,
        previous: &DeviceIdentity,
    ) -> Result<Option<T::Device>, SessionError> {
        let protocol = self.decoder.protocol();
        let service = protocol.service_uuid;
        let window = protocol.connect_previous_timeout;

        let known = match self.transport.known_devices(service).await {
            Ok(devices) => devices,
            Err(error) => {
                let error = SessionError::from(error);
                self.events.on_request_device_error(&error);
                return Err(error);
            }
        };

        let Some(device) = known.into_iter().find(|d| d.identity().id == previous.id) else {
            warn!("previous device {previous} is not known to the host");
            self.events.on_previous_unavailable(None);
            return Ok(None);
        };

        match device.await_advertisement(window).await? {
            Some(advertisement) => {
                debug!(
                    "previous device {} is advertising (rssi {:?})",
                    previous, advertisement.rssi
                );
                Ok(Some(device))
            }
            None => {
                warn!("previous device {previous} did not advertise within {window:?}");
                let identity = device.identity();
                self.events.on_previous_unavailable(Some(&identity));
                Ok(None)
            }
        }
    }

    /// Connect the chosen device and bring up the notification plumbing.
    async fn establish(&mut self) -> Result<(), SessionError> {
        let protocol = self.decoder.protocol();
        let service_uuid = protocol.service_uuid;
        let characteristic_uuid = protocol.characteristic_uuid;

        let device = self.device.as_ref().ok_or(SessionError::NotConnected)?;
        self.transport.connect_device(device).await?;
        let service = device.primary_service(service_uuid).await?;
        let characteristic = service.characteristic(characteristic_uuid).await?;
        let notifications = characteristic.subscribe().await?;

        self.characteristic = Some(characteristic);
        self.notifications = Some(notifications);
        self.register_activity();
        Ok(())
    }

    /// Tear the session down. Idempotent: calling while disconnected is a
    /// logged no-op. For external disconnects the transport link is already
    /// gone and only local state is cleared.
    pub async fn disconnect(&mut self, reason: DisconnectReason) -> Result<(), SessionError> {
        if self.status == Status::Disconnected {
            warn!("disconnect({reason:?}) while already disconnected");
            return Ok(());
        }
        info!("disconnecting ({reason:?})");

        let mut teardown_failure = None;
        if reason != DisconnectReason::External {
            if let Some(characteristic) = &self.characteristic {
                if let Err(error) = characteristic.unsubscribe().await {
                    warn!("stopping notifications failed: {error}");
                }
            }
            sleep(SETTLE_DELAY).await;
            if let Some(device) = &self.device {
                if let Err(error) = self.transport.disconnect_device(device).await {
                    teardown_failure = Some(error);
                }
            }
            sleep(SETTLE_DELAY).await;
        }

        self.characteristic = None;
        self.notifications = None;
        self.device = None;
        self.watchdog = None;
        self.assembler.flush();
        self.cache.clear();
        self.set_status(Status::Disconnected);
        self.events.on_disconnected(reason);

        if let Some(failure) = teardown_failure {
            error!("transport disconnect failed, handles dropped anyway: {failure}");
            let error = SessionError::Teardown(failure);
            self.events.on_error(&error);
            return Err(error);
        }
        Ok(())
    }

    /// Drive the session until it leaves `Connected`: demultiplex incoming
    /// notifications, execute consumer controls, enforce the inactivity
    /// watchdog. Returns the reason the session ended.
    pub async fn run(
        &mut self,
        controls: &mut mpsc::Receiver<Control>,
    ) -> Result<DisconnectReason, SessionError> {
        if self.status != Status::Connected {
            return Err(SessionError::NotConnected);
        }
        let inactivity = self.decoder.protocol().inactivity_timeout;

        loop {
            let deadline = self
                .watchdog
                .unwrap_or_else(|| Instant::now() + inactivity);

            let wake = {
                let notifications =
                    self.notifications.as_mut().ok_or(SessionError::NotConnected)?;
                tokio::select! {
                    _ = sleep_until(deadline) => Wake::Watchdog,
                    notification = notifications.next() => Wake::Notification(notification),
                    control = controls.recv() => Wake::Control(control),
                }
            };

            match wake {
                Wake::Watchdog => {
                    warn!("no activity for {inactivity:?}, tearing the session down");
                    self.disconnect(DisconnectReason::Inactivity).await?;
                    return Ok(DisconnectReason::Inactivity);
                }
                Wake::Notification(Some(Ok(fragment))) => self.handle_notification(&fragment),
                Wake::Notification(Some(Err(error))) => {
                    warn!("notification error: {error}");
                }
                Wake::Notification(None) => {
                    warn!("transport dropped the connection");
                    self.disconnect(DisconnectReason::External).await?;
                    return Ok(DisconnectReason::External);
                }
                Wake::Control(Some(Control::ToggleCharging(enabled))) => {
                    if let Err(error) = self.toggle_charging(enabled).await {
                        warn!("toggle charging failed: {error}");
                        self.events.on_error(&error);
                    }
                }
                Wake::Control(Some(Control::ToggleDischarging(enabled))) => {
                    if let Err(error) = self.toggle_discharging(enabled).await {
                        warn!("toggle discharging failed: {error}");
                        self.events.on_error(&error);
                    }
                }
                Wake::Control(Some(Control::Disconnect)) | Wake::Control(None) => {
                    self.disconnect(DisconnectReason::User).await?;
                    return Ok(DisconnectReason::User);
                }
            }
        }
    }

    /// Send one command. The write carries a response exactly when a payload
    /// is supplied; the per-command timeout bounds the transport operation
    /// and the declared post-send wait runs before returning.
    pub async fn send_command(
        &mut self,
        name: CommandName,
        payload: &[u8],
    ) -> Result<(), SessionError> {
        let protocol = self.decoder.protocol();
        let command = protocol
            .command(name)
            .ok_or(CommandError::Unknown(name))?
            .clone();
        let frame = encode_command(protocol, &command, payload)?;

        self.register_activity();
        let characteristic = self
            .characteristic
            .as_ref()
            .ok_or(SessionError::NotConnected)?;

        debug!("tx {name:?}: {}", hex::encode(&frame));
        let write = async {
            if payload.is_empty() {
                characteristic.write_without_response(&frame).await
            } else {
                characteristic.write_with_response(&frame).await
            }
        };
        match timeout(command.timeout, write).await {
            Err(_) => {
                warn!("{name:?} did not complete within {:?}", command.timeout);
                return Err(SessionError::CommandTimeout(name));
            }
            Ok(Err(error)) => return Err(error.into()),
            Ok(Ok(())) => {}
        }

        if !command.wait.is_zero() {
            sleep(command.wait).await;
        }
        Ok(())
    }

    /// Switch charging on or off. The settings are re-requested afterwards
    /// whatever the write's outcome, so consumers observe the device's
    /// authoritative state.
    pub async fn toggle_charging(&mut self, enabled: bool) -> Result<(), SessionError> {
        self.toggle(CommandName::ToggleCharging, enabled).await
    }

    /// Switch discharging on or off. Same follow-up contract as
    /// [`Self::toggle_charging`].
    pub async fn toggle_discharging(&mut self, enabled: bool) -> Result<(), SessionError> {
        self.toggle(CommandName::ToggleDischarging, enabled).await
    }

    async fn toggle(&mut self, name: CommandName, enabled: bool) -> Result<(), SessionError> {
        let payload = [u8::from(enabled)];
        let result = self.send_command(name, &payload).await;
        let refresh = self.send_command(CommandName::GetSettings, &[]).await;
        result.and(refresh)
    }

    fn handle_notification(&mut self, fragment: &[u8]) {
        self.register_activity();
        debug!("rx {} bytes", fragment.len());

        let Some(segment) = self.assembler.push(self.decoder.protocol(), fragment) else {
            return;
        };
        match self.decoder.decode(&segment) {
            Ok((kind, record)) => self.dispatch(kind, record),
            // Later segments may still decode; drop this one and move on.
            Err(error) => warn!("decode failed: {error}"),
        }
    }

    fn dispatch(&mut self, kind: RecordKind, mut record: Record) {
        let now = epoch_ms();
        let since_previous = self
            .cache
            .get(&kind)
            .map(|cached| now.saturating_sub(cached.timestamp));

        record.insert("timestamp".into(), Value::Number(now as f64));
        if let Some(elapsed) = since_previous {
            record.insert("since_previous".into(), Value::Number(elapsed as f64));
        }

        let mut public = Record::new();
        let mut internal = Record::new();
        for (key, value) in record {
            if INTERNAL_KEYS.contains(&key.as_str()) {
                internal.insert(key, value);
            } else {
                public.insert(key, value);
            }
        }
        debug!("{kind:?} internal fields: {internal:?}");

        self.cache.insert(
            kind,
            CachedRecord {
                timestamp: now,
                record: public,
            },
        );
        let cached = &self.cache[&kind];
        self.events.on_data(kind, &cached.record);
    }

    /// Rearm the single-shot inactivity watchdog.
    fn register_activity(&mut self) {
        let inactivity = self.decoder.protocol().inactivity_timeout;
        self.watchdog = Some(Instant::now() + inactivity);
    }

    fn set_status(&mut self, status: Status) {
        if self.status != status {
            self.status = status;
            self.events.on_status_change(status);
        }
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
