//! Turns the compact, author-friendly protocol description into a fully
//! resolved [`ProtocolSpec`]: assigns running byte offsets, fills defaults
//! and validates the result.
//!
//! Validation collects every problem before failing; nothing is repaired
//! silently.

use std::collections::HashMap;
use std::time::Duration;

use bluest::Uuid;
use thiserror::Error;

use crate::binary::{Endian, NumberType};
use crate::protocol::{
    CommandDef, CommandName, ItemDef, ItemParser, ProtocolSpec, RawGetter, RecordKind, ResponseDef,
    TextEncoding,
};

/// A single validation failure, naming the offending definition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("response {response:?}: declared length {declared} but items total {actual}")]
    LengthMismatch {
        response: String,
        declared: usize,
        actual: usize,
    },
    #[error("responses {first:?} and {second:?} share signature byte {byte:#04x}")]
    DuplicateSignature {
        first: String,
        second: String,
        byte: u8,
    },
    #[error("response {response:?}: non-repeatable key {key:?} appears more than once")]
    DuplicateKey { response: String, key: String },
    #[error("response {response:?}: item {key:?} is {actual} bytes but its numeric type needs {expected}")]
    NumericWidth {
        response: String,
        key: String,
        expected: usize,
        actual: usize,
    },
    #[error("response {response:?} has an empty signature")]
    EmptySignature { response: String },
    #[error("command {command:?}: header and code alone take {required} of {limit} frame bytes")]
    CommandTooLong {
        command: CommandName,
        required: usize,
        limit: usize,
    },
}

/// The protocol failed validation. Carries every offending definition.
#[derive(Debug, Error)]
#[error("protocol failed validation ({n} problems)", n = .errors.len())]
pub struct InvalidProtocol {
    pub errors: Vec<ValidationError>,
}

/// Compact form of an [`ItemDef`]: no offset, endianness optional.
#[derive(Clone, Debug)]
pub struct PackedItem {
    key: String,
    len: usize,
    repeatable: bool,
    parser: PackedParser,
}

#[derive(Clone, Debug)]
enum PackedParser {
    Raw { getter: Option<RawGetter> },
    Text { encoding: TextEncoding },
    Numeric {
        ty: NumberType,
        endian: Option<Endian>,
        multiplier: Option<f64>,
        precision: Option<u32>,
    },
    Bool,
}

impl PackedItem {
    /// A raw byte-slice item.
    pub fn raw(key: &str, len: usize) -> Self {
        Self {
            key: key.into(),
            len,
            repeatable: false,
            parser: PackedParser::Raw { getter: None },
        }
    }

    /// A raw item decoded through a custom getter.
    pub fn raw_with(key: &str, len: usize, getter: RawGetter) -> Self {
        Self {
            key: key.into(),
            len,
            repeatable: false,
            parser: PackedParser::Raw {
                getter: Some(getter),
            },
        }
    }

    /// A text item in the given encoding.
    pub fn text(key: &str, len: usize, encoding: TextEncoding) -> Self {
        Self {
            key: key.into(),
            len,
            repeatable: false,
            parser: PackedParser::Text { encoding },
        }
    }

    /// A numeric item; its length is the type's wire width.
    pub fn number(key: &str, ty: NumberType) -> Self {
        Self {
            key: key.into(),
            len: ty.width(),
            repeatable: false,
            parser: PackedParser::Numeric {
                ty,
                endian: None,
                multiplier: None,
                precision: None,
            },
        }
    }

    /// A boolean item: true iff any of its bytes is non-zero.
    pub fn boolean(key: &str, len: usize) -> Self {
        Self {
            key: key.into(),
            len,
            repeatable: false,
            parser: PackedParser::Bool,
        }
    }

    /// Scale a numeric item by `multiplier`, then round to `precision`
    /// decimal digits.
    pub fn scaled(mut self, multiplier: f64, precision: u32) -> Self {
        if let PackedParser::Numeric {
            multiplier: m,
            precision: p,
            ..
        } = &mut self.parser
        {
            *m = Some(multiplier);
            *p = Some(precision);
        }
        self
    }

    /// Override the default little-endian byte order.
    pub fn big_endian(mut self) -> Self {
        if let PackedParser::Numeric { endian, .. } = &mut self.parser {
            *endian = Some(Endian::Big);
        }
        self
    }

    fn resolve(self, offset: usize) -> ItemDef {
        let parser = match self.parser {
            PackedParser::Raw { getter } => ItemParser::Raw { getter },
            PackedParser::Text { encoding } => ItemParser::Text { encoding },
            PackedParser::Numeric {
                ty,
                endian,
                multiplier,
                precision,
            } => ItemParser::Numeric {
                ty,
                endian: endian.unwrap_or(Endian::Little),
                multiplier,
                precision,
            },
            PackedParser::Bool => ItemParser::Bool,
        };
        ItemDef {
            key: self.key,
            offset,
            len: self.len,
            repeatable: self.repeatable,
            parser,
        }
    }
}

/// Compact form of a [`ResponseDef`]; items are listed in wire order and
/// their offsets are computed here.
#[derive(Clone, Debug)]
pub struct PackedResponse {
    pub name: String,
    pub kind: RecordKind,
    pub signature: Vec<u8>,
    pub length: usize,
    items: Vec<PackedItem>,
}

impl PackedResponse {
    pub fn new(name: &str, kind: RecordKind, signature: &[u8], length: usize) -> Self {
        Self {
            name: name.into(),
            kind,
            signature: signature.to_vec(),
            length,
            items: Vec::new(),
        }
    }

    /// Append one item.
    pub fn item(mut self, item: PackedItem) -> Self {
        self.items.push(item);
        self
    }

    /// Append `count` consecutive copies of `item` under the same key,
    /// marked repeatable so they decode into one ordered list.
    pub fn repeated(mut self, item: PackedItem, count: usize) -> Self {
        for _ in 0..count {
            let mut copy = item.clone();
            copy.repeatable = true;
            self.items.push(copy);
        }
        self
    }
}

/// Compact form of a [`CommandDef`].
#[derive(Clone, Debug)]
pub struct PackedCommand {
    pub name: CommandName,
    pub code: Vec<u8>,
    pub timeout: Duration,
    pub wait: Duration,
}

impl PackedCommand {
    pub fn new(name: CommandName, code: &[u8], timeout_ms: u64, wait_ms: u64) -> Self {
        Self {
            name,
            code: code.to_vec(),
            timeout: Duration::from_millis(timeout_ms),
            wait: Duration::from_millis(wait_ms),
        }
    }
}

/// Compact form of a [`ProtocolSpec`].
#[derive(Clone, Debug)]
pub struct PackedProtocol {
    pub name: String,
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    pub segment_header: Vec<u8>,
    pub command_header: Vec<u8>,
    pub command_length: usize,
    pub inactivity_timeout: Duration,
    pub connect_previous_timeout: Duration,
    pub commands: Vec<PackedCommand>,
    pub responses: Vec<PackedResponse>,
}

/// Resolve and validate a packed protocol.
pub fn unpack(packed: PackedProtocol) -> Result<ProtocolSpec, InvalidProtocol> {
    let mut errors = Vec::new();
    let mut responses = Vec::with_capacity(packed.responses.len());

    for packed_response in packed.responses {
        let name = packed_response.name.clone();

        if packed_response.signature.is_empty() {
            errors.push(ValidationError::EmptySignature {
                response: name.clone(),
            });
        }

        let mut items = Vec::with_capacity(packed_response.items.len());
        let mut offset = 0usize;
        let mut occurrences: HashMap<String, (usize, bool)> = HashMap::new();

        for packed_item in packed_response.items {
            if let PackedParser::Numeric { ty, .. } = packed_item.parser {
                if packed_item.len != ty.width() {
                    errors.push(ValidationError::NumericWidth {
                        response: name.clone(),
                        key: packed_item.key.clone(),
                        expected: ty.width(),
                        actual: packed_item.len,
                    });
                }
            }
            let entry = occurrences
                .entry(packed_item.key.clone())
                .or_insert((0, true));
            entry.0 += 1;
            entry.1 &= packed_item.repeatable;

            let resolved = packed_item.resolve(offset);
            offset += resolved.len;
            items.push(resolved);
        }

        for (key, (count, all_repeatable)) in occurrences {
            if count > 1 && !all_repeatable {
                errors.push(ValidationError::DuplicateKey {
                    response: name.clone(),
                    key,
                });
            }
        }

        if offset != packed_response.length {
            errors.push(ValidationError::LengthMismatch {
                response: name.clone(),
                declared: packed_response.length,
                actual: offset,
            });
        }

        responses.push(ResponseDef {
            name,
            kind: packed_response.kind,
            signature: packed_response.signature,
            length: packed_response.length,
            items,
        });
    }

    for (i, a) in responses.iter().enumerate() {
        for b in &responses[i + 1..] {
            if let (Some(first), Some(second)) = (a.signature.first(), b.signature.first()) {
                if first == second {
                    errors.push(ValidationError::DuplicateSignature {
                        first: a.name.clone(),
                        second: b.name.clone(),
                        byte: *first,
                    });
                }
            }
        }
    }

    let commands: Vec<CommandDef> = packed
        .commands
        .into_iter()
        .map(|c| CommandDef {
            name: c.name,
            code: c.code,
            timeout: c.timeout,
            wait: c.wait,
        })
        .collect();

    for command in &commands {
        let required = packed.command_header.len() + command.code.len();
        if required > packed.command_length {
            errors.push(ValidationError::CommandTooLong {
                command: command.name,
                required,
                limit: packed.command_length,
            });
        }
    }

    if !errors.is_empty() {
        return Err(InvalidProtocol { errors });
    }

    Ok(ProtocolSpec {
        name: packed.name,
        service_uuid: packed.service_uuid,
        characteristic_uuid: packed.characteristic_uuid,
        segment_header: packed.segment_header,
        command_header: packed.command_header,
        command_length: packed.command_length,
        inactivity_timeout: packed.inactivity_timeout,
        connect_previous_timeout: packed.connect_previous_timeout,
        commands,
        responses,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(responses: Vec<PackedResponse>) -> PackedProtocol {
        PackedProtocol {
            name: "test".into(),
            service_uuid: Uuid::from_u128(0xffe0),
            characteristic_uuid: Uuid::from_u128(0xffe1),
            segment_header: vec![0x55, 0xAA],
            command_header: vec![0xAA, 0x55],
            command_length: 8,
            inactivity_timeout: Duration::from_secs(10),
            connect_previous_timeout: Duration::from_secs(5),
            commands: vec![PackedCommand::new(CommandName::GetSettings, &[0x96], 1000, 0)],
            responses,
        }
    }

    #[test]
    fn test_offsets_are_prefix_sums() {
        let spec = unpack(base(vec![PackedResponse::new(
            "r",
            RecordKind::Settings,
            &[0x01],
            9,
        )
        .item(PackedItem::raw("header", 2))
        .item(PackedItem::number("a", NumberType::Uint16))
        .item(PackedItem::number("b", NumberType::Uint32))
        .item(PackedItem::number("checksum", NumberType::Uint8))]))
        .unwrap();

        let items = &spec.responses()[0].items;
        let offsets: Vec<usize> = items.iter().map(|i| i.offset).collect();
        assert_eq!(offsets, vec![0, 2, 4, 8]);
        let total: usize = items.iter().map(|i| i.len).sum();
        assert_eq!(total, spec.responses()[0].length);
    }

    #[test]
    fn test_endianness_defaults_to_little() {
        let spec = unpack(base(vec![PackedResponse::new(
            "r",
            RecordKind::Settings,
            &[0x01],
            4,
        )
        .item(PackedItem::number("le", NumberType::Uint16))
        .item(PackedItem::number("be", NumberType::Uint16).big_endian())]))
        .unwrap();

        let items = &spec.responses()[0].items;
        match items[0].parser {
            ItemParser::Numeric { endian, .. } => assert_eq!(endian, Endian::Little),
            _ => panic!("expected numeric"),
        }
        match items[1].parser {
            ItemParser::Numeric { endian, .. } => assert_eq!(endian, Endian::Big),
            _ => panic!("expected numeric"),
        }
    }

    #[test]
    fn test_length_mismatch_is_reported() {
        let err = unpack(base(vec![PackedResponse::new(
            "short",
            RecordKind::Settings,
            &[0x01],
            10,
        )
        .item(PackedItem::raw("data", 4))]))
        .unwrap_err();

        assert_eq!(
            err.errors,
            vec![ValidationError::LengthMismatch {
                response: "short".into(),
                declared: 10,
                actual: 4,
            }]
        );
    }

    #[test]
    fn test_duplicate_signature_is_reported() {
        let err = unpack(base(vec![
            PackedResponse::new("one", RecordKind::Settings, &[0x01], 1)
                .item(PackedItem::raw("a", 1)),
            PackedResponse::new("two", RecordKind::CellInfo, &[0x01, 0x02], 1)
                .item(PackedItem::raw("b", 1)),
        ]))
        .unwrap_err();

        assert_eq!(
            err.errors,
            vec![ValidationError::DuplicateSignature {
                first: "one".into(),
                second: "two".into(),
                byte: 0x01,
            }]
        );
    }

    #[test]
    fn test_duplicate_non_repeatable_key_is_reported() {
        let err = unpack(base(vec![PackedResponse::new(
            "r",
            RecordKind::Settings,
            &[0x01],
            2,
        )
        .item(PackedItem::raw("twice", 1))
        .item(PackedItem::raw("twice", 1))]))
        .unwrap_err();

        assert_eq!(
            err.errors,
            vec![ValidationError::DuplicateKey {
                response: "r".into(),
                key: "twice".into(),
            }]
        );
    }

    #[test]
    fn test_repeated_items_are_allowed() {
        let spec = unpack(base(vec![PackedResponse::new(
            "r",
            RecordKind::CellInfo,
            &[0x02],
            6,
        )
        .repeated(PackedItem::number("cell_voltage", NumberType::Uint16), 3)]))
        .unwrap();

        let items = &spec.responses()[0].items;
        assert_eq!(items.len(), 3);
        assert!(items.iter().all(|i| i.repeatable));
        assert_eq!(items[2].offset, 4);
    }

    #[test]
    fn test_validation_collects_every_problem() {
        let err = unpack(base(vec![
            PackedResponse::new("bad_len", RecordKind::Settings, &[0x01], 99)
                .item(PackedItem::raw("a", 1)),
            PackedResponse::new("no_sig", RecordKind::CellInfo, &[], 1)
                .item(PackedItem::raw("b", 1)),
            PackedResponse::new("dup", RecordKind::DeviceInfo, &[0x01], 1)
                .item(PackedItem::raw("c", 1)),
        ]))
        .unwrap_err();

        assert_eq!(err.errors.len(), 3);
    }

    #[test]
    fn test_numeric_width_mismatch_is_reported() {
        let mut item = PackedItem::number("n", NumberType::Uint32);
        item.len = 2;
        let err = unpack(base(vec![PackedResponse::new(
            "r",
            RecordKind::Settings,
            &[0x01],
            2,
        )
        .item(item)]))
        .unwrap_err();

        assert!(matches!(
            err.errors[0],
            ValidationError::NumericWidth { expected: 4, actual: 2, .. }
        ));
    }

    #[test]
    fn test_oversized_command_is_reported() {
        let mut packed = base(vec![PackedResponse::new(
            "r",
            RecordKind::Settings,
            &[0x01],
            1,
        )
        .item(PackedItem::raw("a", 1))]);
        packed
            .commands
            .push(PackedCommand::new(CommandName::ToggleCharging, &[0u8; 7], 1000, 0));

        let err = unpack(packed).unwrap_err();
        assert_eq!(
            err.errors,
            vec![ValidationError::CommandTooLong {
                command: CommandName::ToggleCharging,
                required: 9,
                limit: 8,
            }]
        );
    }
}
