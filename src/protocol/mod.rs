//! In-memory model of a JK BMS wire protocol.
//!
//! A [`ProtocolSpec`] is data, not code: it names the GATT endpoints, the
//! framing constants, the commands the device accepts and the byte-by-byte
//! layout of every response it can send. The decoder and the session walk
//! this description instead of hard-coding offsets.
//!
//! Authors write the compact [`unpack::PackedProtocol`] form (no offsets,
//! defaults elided); [`unpack::unpack`] resolves and validates it.

pub mod jk02;
pub mod unpack;

use std::time::Duration;

use bluest::Uuid;
use thiserror::Error;

use crate::binary::{self, Endian, NumberType};
use crate::decode::Value;

/// The commands a JK BMS accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandName {
    GetSettings,
    GetDeviceInfo,
    ToggleCharging,
    ToggleDischarging,
}

/// The kinds of record a JK BMS streams back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Settings,
    CellInfo,
    DeviceInfo,
}

/// Custom extractor for a raw item: `(item bytes, length, offset, whole segment)`.
pub type RawGetter = fn(&[u8], usize, usize, &[u8]) -> Value;

/// Text encodings an item descriptor can select.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextEncoding {
    /// Space-separated uppercase hex.
    Hex,
    Utf8,
    Ascii,
}

/// How one item's bytes become a [`Value`].
#[derive(Clone, Copy, Debug)]
pub enum ItemParser {
    Raw {
        getter: Option<RawGetter>,
    },
    Text {
        encoding: TextEncoding,
    },
    Numeric {
        ty: NumberType,
        endian: Endian,
        /// Applied before precision rounding.
        multiplier: Option<f64>,
        /// Decimal digits to round to.
        precision: Option<u32>,
    },
    /// True iff any byte in the slice is non-zero.
    Bool,
}

/// One field of a response layout. Offsets are assigned by the unpacker as
/// the running sum of the preceding lengths, never by the author.
#[derive(Clone, Debug)]
pub struct ItemDef {
    pub key: String,
    pub offset: usize,
    pub len: usize,
    /// Repeatable items always decode to an ordered list; a non-repeatable
    /// key may appear only once per response.
    pub repeatable: bool,
    pub parser: ItemParser,
}

/// One response family: signature, total length and field layout.
#[derive(Clone, Debug)]
pub struct ResponseDef {
    pub name: String,
    pub kind: RecordKind,
    /// Leading bytes after the segment header; the first byte is the
    /// discriminator and must be unique across responses.
    pub signature: Vec<u8>,
    /// Total segment length in bytes, checksum included.
    pub length: usize,
    pub items: Vec<ItemDef>,
}

/// One command: code bytes plus its timing contract.
#[derive(Clone, Debug)]
pub struct CommandDef {
    pub name: CommandName,
    pub code: Vec<u8>,
    /// Bound on the whole send operation.
    pub timeout: Duration,
    /// Idle time after a successful send before the next command may go out.
    pub wait: Duration,
}

/// A fully resolved protocol description. Built by [`unpack::unpack`].
#[derive(Clone, Debug)]
pub struct ProtocolSpec {
    pub name: String,
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    /// Byte sequence that starts every response segment.
    pub segment_header: Vec<u8>,
    /// Byte sequence that starts every command frame.
    pub command_header: Vec<u8>,
    /// Fixed size of every command frame, checksum included.
    pub command_length: usize,
    pub inactivity_timeout: Duration,
    pub connect_previous_timeout: Duration,
    pub(crate) commands: Vec<CommandDef>,
    pub(crate) responses: Vec<ResponseDef>,
}

impl ProtocolSpec {
    /// Look up a command by name.
    pub fn command(&self, name: CommandName) -> Option<&CommandDef> {
        self.commands.iter().find(|c| c.name == name)
    }

    /// Look up the response whose signature starts with `signature[0]`.
    pub fn response_by_signature(&self, signature: &[u8]) -> Option<&ResponseDef> {
        let first = *signature.first()?;
        self.responses
            .iter()
            .find(|r| r.signature.first() == Some(&first))
    }

    pub fn responses(&self) -> &[ResponseDef] {
        &self.responses
    }
}

/// Failures raised while constructing a command frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("command {0:?} is not part of the protocol")]
    Unknown(CommandName),
    #[error("command {name:?}: {required} bytes exceed the {limit}-byte frame")]
    Overflow {
        name: CommandName,
        required: usize,
        limit: usize,
    },
}

/// Build the wire frame for `command` with the given payload:
/// `[command header, code, payload, zero padding]` of exactly
/// `command_length` bytes, the last byte replaced by the additive checksum.
pub fn encode_command(
    spec: &ProtocolSpec,
    command: &CommandDef,
    payload: &[u8],
) -> Result<Vec<u8>, CommandError> {
    let required = spec.command_header.len() + command.code.len() + payload.len();
    if required > spec.command_length {
        return Err(CommandError::Overflow {
            name: command.name,
            required,
            limit: spec.command_length,
        });
    }

    let mut frame = vec![0u8; spec.command_length];
    let mut at = 0;
    for part in [&spec.command_header[..], &command.code[..], payload] {
        frame[at..at + part.len()].copy_from_slice(part);
        at += part.len();
    }
    let body = spec.command_length - 1;
    frame[body] = binary::checksum(&frame[..body]);
    Ok(frame)
}
