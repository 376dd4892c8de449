//! Table-driven response decoding.
//!
//! A [`Decoder`] owns a validated [`ProtocolSpec`] and turns complete,
//! checksum-verified segments into [`Record`]s by walking the item
//! descriptors of the matching response definition. The decoder has no
//! knowledge of any particular field; its behavior is entirely the
//! protocol table's.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::binary::{self, read_number};
use crate::protocol::unpack::{unpack, InvalidProtocol, PackedProtocol};
use crate::protocol::{ItemDef, ItemParser, ProtocolSpec, RecordKind, TextEncoding};

/// One decoded item value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bytes(Vec<u8>),
    Text(String),
    Number(f64),
    Bool(bool),
    /// Ordered values of a repeatable item, in declaration order.
    List(Vec<Value>),
}

impl Value {
    /// The value as a number, if it is one.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The value as text, if it is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// The value as a bool, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The value as a list, if it is one.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(values) => Some(values),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Bytes(bytes) => write!(f, "{}", binary::hex_string(bytes)),
            Value::Text(text) => f.write_str(text),
            Value::Number(number) => write!(f, "{number}"),
            Value::Bool(flag) => write!(f, "{flag}"),
            Value::List(values) => {
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{value}")?;
                }
                Ok(())
            }
        }
    }
}

/// A decoded segment: item key to value.
pub type Record = BTreeMap<String, Value>;

/// Failures while decoding a single segment. No partial record survives.
#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("no response matches signature {}", binary::hex_string(.signature))]
    UnknownSignature { signature: Vec<u8> },
    #[error(
        "response {response:?}: item {key:?} at {offset}..{end} overruns the {len}-byte buffer"
    )]
    ShortBuffer {
        response: String,
        key: String,
        offset: usize,
        end: usize,
        len: usize,
    },
}

/// Decoder over a validated protocol.
pub struct Decoder {
    protocol: ProtocolSpec,
}

impl Decoder {
    /// Unpack and validate `packed`; fails with the full list of offending
    /// definitions if the protocol is inconsistent.
    pub fn new(packed: PackedProtocol) -> Result<Self, InvalidProtocol> {
        let protocol = unpack(packed)?;
        Ok(Self { protocol })
    }

    pub fn protocol(&self) -> &ProtocolSpec {
        &self.protocol
    }

    /// Decode one complete segment. The response definition is resolved from
    /// the signature byte that follows the segment header inside `buffer`.
    pub fn decode(&self, buffer: &[u8]) -> Result<(RecordKind, Record), DecodeError> {
        let header_len = self.protocol.segment_header.len();
        let signature = buffer.get(header_len..).unwrap_or_default();
        let response = self
            .protocol
            .response_by_signature(signature)
            .ok_or_else(|| DecodeError::UnknownSignature {
                signature: signature.iter().take(1).copied().collect(),
            })?;

        let mut record = Record::new();
        for item in &response.items {
            let end = item.offset + item.len;
            let slice = buffer
                .get(item.offset..end)
                .ok_or_else(|| DecodeError::ShortBuffer {
                    response: response.name.clone(),
                    key: item.key.clone(),
                    offset: item.offset,
                    end,
                    len: buffer.len(),
                })?;

            let value = decode_item(item, slice, buffer);
            if item.repeatable {
                match record
                    .entry(item.key.clone())
                    .or_insert_with(|| Value::List(Vec::new()))
                {
                    Value::List(values) => values.push(value),
                    // or_insert_with keeps this arm unreachable.
                    other => *other = Value::List(vec![value]),
                }
            } else {
                record.insert(item.key.clone(), value);
            }
        }

        Ok((response.kind, record))
    }
}

fn decode_item(item: &ItemDef, slice: &[u8], segment: &[u8]) -> Value {
    match &item.parser {
        ItemParser::Raw { getter: Some(get) } => get(slice, item.len, item.offset, segment),
        ItemParser::Raw { getter: None } => Value::Bytes(slice.to_vec()),
        ItemParser::Text { encoding } => Value::Text(decode_text(slice, *encoding)),
        ItemParser::Numeric {
            ty,
            endian,
            multiplier,
            precision,
        } => {
            // Validation pinned the item length to the type's width.
            let mut value = read_number(slice, *ty, *endian).unwrap_or(0.0);
            if let Some(m) = multiplier {
                value *= m;
            }
            if let Some(p) = precision {
                value = round_digits(value, *p);
            }
            Value::Number(value)
        }
        ItemParser::Bool => Value::Bool(slice.iter().any(|b| *b != 0)),
    }
}

fn decode_text(slice: &[u8], encoding: TextEncoding) -> String {
    match encoding {
        TextEncoding::Hex => binary::hex_string(slice),
        TextEncoding::Utf8 | TextEncoding::Ascii => {
            String::from_utf8_lossy(slice).replace('\0', "")
        }
    }
}

/// Round to `digits` decimal digits, the same result as formatting with a
/// fixed digit count and parsing back.
fn round_digits(value: f64, digits: u32) -> f64 {
    let factor = 10f64.powi(digits as i32);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bluest::Uuid;

    use super::*;
    use crate::binary::NumberType;
    use crate::protocol::unpack::{PackedCommand, PackedItem, PackedResponse};
    use crate::protocol::CommandName;

    fn decoder(responses: Vec<PackedResponse>) -> Decoder {
        Decoder::new(PackedProtocol {
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
        })
        .expect("valid protocol")
    }

    #[test]
    fn test_numeric_multiplier_then_precision() {
        let d = decoder(vec![PackedResponse::new("r", RecordKind::Settings, &[0x01], 6)
            .item(PackedItem::raw("header", 3))
            .item(PackedItem::number("volts", NumberType::Uint16).scaled(0.001, 3))
            .item(PackedItem::number("checksum", NumberType::Uint8))]);

        // 3299 * 0.001 = 3.299
        let buffer = [0x55, 0xAA, 0x01, 0xE3, 0x0C, 0x00];
        let (kind, record) = d.decode(&buffer).unwrap();
        assert_eq!(kind, RecordKind::Settings);
        assert_eq!(record["volts"], Value::Number(3.299));
    }

    #[test]
    fn test_precision_rounds_decimal_digits() {
        assert_eq!(round_digits(1.2345, 2), 1.23);
        assert_eq!(round_digits(1.235, 2), 1.24);
        assert_eq!(round_digits(-27.35, 1), -27.3);
        assert_eq!(round_digits(5.0, 0), 5.0);
    }

    #[test]
    fn test_text_encodings() {
        let d = decoder(vec![PackedResponse::new("r", RecordKind::DeviceInfo, &[0x03], 13)
            .item(PackedItem::raw("header", 3))
            .item(PackedItem::text("as_hex", 2, TextEncoding::Hex))
            .item(PackedItem::text("name", 8, TextEncoding::Utf8))]);

        let mut buffer = vec![0x55, 0xAA, 0x03, 0xBE, 0xEF];
        buffer.extend_from_slice(b"JK-B2A\0\0");
        let (_, record) = d.decode(&buffer).unwrap();
        assert_eq!(record["as_hex"], Value::Text("BE EF".into()));
        // NUL padding is stripped.
        assert_eq!(record["name"], Value::Text("JK-B2A".into()));
    }

    #[test]
    fn test_bool_any_nonzero_byte() {
        let d = decoder(vec![PackedResponse::new("r", RecordKind::Settings, &[0x01], 11)
            .item(PackedItem::raw("header", 3))
            .item(PackedItem::boolean("off", 4))
            .item(PackedItem::boolean("on", 4))]);

        let buffer = [0x55, 0xAA, 0x01, 0, 0, 0, 0, 0, 0, 2, 0];
        let (_, record) = d.decode(&buffer).unwrap();
        assert_eq!(record["off"], Value::Bool(false));
        assert_eq!(record["on"], Value::Bool(true));
    }

    #[test]
    fn test_raw_and_getter() {
        fn last_byte(item: &[u8], _len: usize, _offset: usize, segment: &[u8]) -> Value {
            // Getter sees both its own slice and the whole segment.
            assert!(segment.len() >= item.len());
            Value::Number(item[item.len() - 1] as f64)
        }

        let d = decoder(vec![PackedResponse::new("r", RecordKind::Settings, &[0x01], 9)
            .item(PackedItem::raw("header", 3))
            .item(PackedItem::raw("plain", 3))
            .item(PackedItem::raw_with("derived", 3, last_byte))]);

        let buffer = [0x55, 0xAA, 0x01, 1, 2, 3, 4, 5, 6];
        let (_, record) = d.decode(&buffer).unwrap();
        assert_eq!(record["plain"], Value::Bytes(vec![1, 2, 3]));
        assert_eq!(record["derived"], Value::Number(6.0));
    }

    #[test]
    fn test_repeated_key_collects_ordered_list() {
        let d = decoder(vec![PackedResponse::new("r", RecordKind::CellInfo, &[0x02], 9)
            .item(PackedItem::raw("header", 3))
            .repeated(PackedItem::number("voltages", NumberType::Uint16), 3)]);

        let buffer = [0x55, 0xAA, 0x02, 0x01, 0x00, 0x02, 0x00, 0x03, 0x00];
        let (_, record) = d.decode(&buffer).unwrap();
        assert_eq!(
            record["voltages"],
            Value::List(vec![
                Value::Number(1.0),
                Value::Number(2.0),
                Value::Number(3.0),
            ])
        );
    }

    #[test]
    fn test_single_repeatable_item_is_still_a_list() {
        let d = decoder(vec![PackedResponse::new("r", RecordKind::CellInfo, &[0x02], 5)
            .item(PackedItem::raw("header", 3))
            .repeated(PackedItem::number("voltages", NumberType::Uint16), 1)]);

        let buffer = [0x55, 0xAA, 0x02, 0x2A, 0x00];
        let (_, record) = d.decode(&buffer).unwrap();
        assert_eq!(record["voltages"], Value::List(vec![Value::Number(42.0)]));
    }

    #[test]
    fn test_unknown_signature() {
        let d = decoder(vec![PackedResponse::new("r", RecordKind::Settings, &[0x01], 3)
            .item(PackedItem::raw("header", 2))
            .item(PackedItem::raw("x", 1))]);

        let err = d.decode(&[0x55, 0xAA, 0x7F]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::UnknownSignature {
                signature: vec![0x7F]
            }
        );
    }

    #[test]
    fn test_short_buffer_names_item_and_offset() {
        let d = decoder(vec![PackedResponse::new("r", RecordKind::Settings, &[0x01], 8)
            .item(PackedItem::raw("header", 3))
            .item(PackedItem::raw("early", 1))
            .item(PackedItem::number("late", NumberType::Uint32))]);

        let err = d.decode(&[0x55, 0xAA, 0x01, 0xBB, 0xCC]).unwrap_err();
        match err {
            DecodeError::ShortBuffer { key, offset, .. } => {
                assert_eq!(key, "late");
                assert_eq!(offset, 4);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
