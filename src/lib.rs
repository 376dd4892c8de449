//! Read and control JK-brand battery management systems over Bluetooth Low
//! Energy.
//!
//! The BMS exposes a vendor serial service with a single characteristic used
//! for both writes and notifications. Commands are fixed 20-byte frames;
//! responses are fixed 300-byte segments delivered as arbitrary notification
//! fragments, reassembled and checksum-verified here before a table-driven
//! decoder turns them into key/value records.
//!
//! The crate is split along that pipeline:
//!
//! - [`protocol`] describes the wire protocol as data, with
//!   [`protocol::jk02`] holding the shipped JK layout tables;
//! - [`frame`] reassembles notification fragments into complete segments;
//! - [`decode`] walks the layout tables to produce [`Record`]s;
//! - [`session`] owns the connection lifecycle, command transmission and the
//!   inactivity watchdog;
//! - [`transport`] is the GATT capability set the session needs, implemented
//!   over real hardware in [`ble`] and scripted in [`mock`].

pub mod binary;
pub mod ble;
pub mod decode;
pub mod frame;
pub mod mock;
pub mod protocol;
pub mod session;
pub mod transport;

pub use decode::{Decoder, Record, Value};
pub use protocol::{jk02, CommandName, RecordKind};
pub use session::{
    Control, DeviceEvents, DeviceSession, DisconnectReason, SessionError, Status,
};
pub use transport::{DeviceIdentity, Transport, TransportError};
