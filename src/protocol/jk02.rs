//! The JK BMS BLE protocol description.
//!
//! Everything the engine knows about the device lives in this table: GATT
//! endpoints, framing constants, the four commands and the three 300-byte
//! response layouts (settings `0x01`, cell info `0x02`, device info `0x03`).
//! Item offsets are not written here; the unpacker derives them from the
//! declaration order.

use std::time::Duration;

use bluest::Uuid;

use crate::binary::NumberType;
use crate::decode::Value;
use crate::protocol::unpack::{PackedCommand, PackedItem, PackedProtocol, PackedResponse};
use crate::protocol::{CommandName, RecordKind, TextEncoding};

/// Vendor serial service and characteristic the BMS exposes.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);
pub const CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

/// Every response segment starts with these four bytes.
pub const SEGMENT_HEADER: [u8; 4] = [0x55, 0xAA, 0xEB, 0x90];
/// Every command frame starts with these four bytes.
pub const COMMAND_HEADER: [u8; 4] = [0xAA, 0x55, 0x90, 0xEB];

/// Commands are fixed 20-byte frames; responses are fixed 300-byte segments.
pub const COMMAND_LENGTH: usize = 20;
pub const RESPONSE_LENGTH: usize = 300;

fn active_cell_count(item: &[u8], _len: usize, _offset: usize, _segment: &[u8]) -> Value {
    Value::Number(item.iter().map(|b| b.count_ones()).sum::<u32>() as f64)
}

/// The full protocol in compact form; run it through
/// [`unpack`](crate::protocol::unpack::unpack) or hand it to
/// [`Decoder::new`](crate::decode::Decoder::new).
pub fn protocol() -> PackedProtocol {
    PackedProtocol {
        name: "jk02".into(),
        service_uuid: SERVICE_UUID,
        characteristic_uuid: CHARACTERISTIC_UUID,
        segment_header: SEGMENT_HEADER.to_vec(),
        command_header: COMMAND_HEADER.to_vec(),
        command_length: COMMAND_LENGTH,
        inactivity_timeout: Duration::from_secs(10),
        connect_previous_timeout: Duration::from_secs(5),
        commands: vec![
            PackedCommand::new(CommandName::GetSettings, &[0x96], 2000, 600),
            PackedCommand::new(CommandName::GetDeviceInfo, &[0x97], 2000, 600),
            PackedCommand::new(CommandName::ToggleCharging, &[0x1D], 2000, 300),
            PackedCommand::new(CommandName::ToggleDischarging, &[0x1E], 2000, 300),
        ],
        responses: vec![settings(), cell_info(), device_info()],
    }
}

/// Settings segment (`0x01`): protection thresholds, limits, switches.
/// Voltages are stored in millivolts, currents in milliamps, temperature
/// limits in tenths of a degree; multipliers bring them to V / A / degC.
fn settings() -> PackedResponse {
    PackedResponse::new("settings", RecordKind::Settings, &[0x01], RESPONSE_LENGTH)
        .item(PackedItem::raw("header", 4))
        .item(PackedItem::number("record_type", NumberType::Uint8))
        .item(PackedItem::number("frame_counter", NumberType::Uint8))
        .item(PackedItem::number("smart_sleep_voltage", NumberType::Uint32).scaled(0.001, 3))
        .item(PackedItem::number("cell_undervoltage_protection", NumberType::Uint32).scaled(0.001, 3))
        .item(PackedItem::number("cell_undervoltage_recovery", NumberType::Uint32).scaled(0.001, 3))
        .item(PackedItem::number("cell_overvoltage_protection", NumberType::Uint32).scaled(0.001, 3))
        .item(PackedItem::number("cell_overvoltage_recovery", NumberType::Uint32).scaled(0.001, 3))
        .item(PackedItem::number("balance_trigger_voltage", NumberType::Uint32).scaled(0.001, 3))
        .item(PackedItem::number("soc_full_voltage", NumberType::Uint32).scaled(0.001, 3))
        .item(PackedItem::number("soc_empty_voltage", NumberType::Uint32).scaled(0.001, 3))
        .item(PackedItem::number("charge_request_voltage", NumberType::Uint32).scaled(0.001, 3))
        .item(PackedItem::number("float_charge_voltage", NumberType::Uint32).scaled(0.001, 3))
        .item(PackedItem::number("power_off_voltage", NumberType::Uint32).scaled(0.001, 3))
        .item(PackedItem::number("max_charge_current", NumberType::Uint32).scaled(0.001, 3))
        .item(PackedItem::number("charge_overcurrent_delay", NumberType::Uint32))
        .item(PackedItem::number("charge_overcurrent_recovery", NumberType::Uint32))
        .item(PackedItem::number("max_discharge_current", NumberType::Uint32).scaled(0.001, 3))
        .item(PackedItem::number("discharge_overcurrent_delay", NumberType::Uint32))
        .item(PackedItem::number("discharge_overcurrent_recovery", NumberType::Uint32))
        .item(PackedItem::number("short_circuit_recovery", NumberType::Uint32))
        .item(PackedItem::number("max_balance_current", NumberType::Uint32).scaled(0.001, 3))
        .item(PackedItem::number("charge_otp", NumberType::Uint32).scaled(0.1, 1))
        .item(PackedItem::number("charge_otp_recovery", NumberType::Uint32).scaled(0.1, 1))
        .item(PackedItem::number("discharge_otp", NumberType::Uint32).scaled(0.1, 1))
        .item(PackedItem::number("discharge_otp_recovery", NumberType::Uint32).scaled(0.1, 1))
        .item(PackedItem::number("charge_utp", NumberType::Int32).scaled(0.1, 1))
        .item(PackedItem::number("charge_utp_recovery", NumberType::Int32).scaled(0.1, 1))
        .item(PackedItem::number("mos_otp", NumberType::Uint32).scaled(0.1, 1))
        .item(PackedItem::number("mos_otp_recovery", NumberType::Uint32).scaled(0.1, 1))
        .item(PackedItem::number("cell_count", NumberType::Uint32))
        .item(PackedItem::boolean("charging_enabled", 4))
        .item(PackedItem::boolean("discharging_enabled", 4))
        .item(PackedItem::boolean("balancer_enabled", 4))
        .item(PackedItem::number("nominal_capacity", NumberType::Uint32).scaled(0.001, 3))
        .item(PackedItem::number("short_circuit_delay", NumberType::Uint32))
        .item(PackedItem::number("balance_start_voltage", NumberType::Uint32).scaled(0.001, 3))
        .item(PackedItem::raw("reserved", 157))
        .item(PackedItem::number("checksum", NumberType::Uint8))
}

/// Cell info segment (`0x02`): the live telemetry stream. Cell voltages and
/// resistances repeat 32 times and decode into ordered lists.
fn cell_info() -> PackedResponse {
    PackedResponse::new("cell_info", RecordKind::CellInfo, &[0x02], RESPONSE_LENGTH)
        .item(PackedItem::raw("header", 4))
        .item(PackedItem::number("record_type", NumberType::Uint8))
        .item(PackedItem::number("frame_counter", NumberType::Uint8))
        .repeated(
            PackedItem::number("cell_voltage", NumberType::Uint16).scaled(0.001, 3),
            32,
        )
        .item(PackedItem::raw_with("active_cell_count", 4, active_cell_count))
        .repeated(
            PackedItem::number("cell_resistance", NumberType::Uint16).scaled(0.001, 3),
            32,
        )
        .item(PackedItem::number("power_tube_temperature", NumberType::Int16).scaled(0.1, 1))
        .item(PackedItem::number("battery_voltage", NumberType::Uint32).scaled(0.001, 3))
        .item(PackedItem::number("battery_power", NumberType::Int32).scaled(0.001, 3))
        .item(PackedItem::number("battery_current", NumberType::Int32).scaled(0.001, 3))
        .item(PackedItem::number("temperature_1", NumberType::Int16).scaled(0.1, 1))
        .item(PackedItem::number("temperature_2", NumberType::Int16).scaled(0.1, 1))
        .item(PackedItem::text("alarm_flags", 2, TextEncoding::Hex))
        .item(PackedItem::number("balance_current", NumberType::Int16).scaled(0.001, 3))
        .item(PackedItem::number("balance_action", NumberType::Uint8))
        .item(PackedItem::number("state_of_charge", NumberType::Uint8))
        .item(PackedItem::number("remaining_capacity", NumberType::Uint32).scaled(0.001, 3))
        .item(PackedItem::number("nominal_capacity", NumberType::Uint32).scaled(0.001, 3))
        .item(PackedItem::number("cycle_count", NumberType::Uint32))
        .item(PackedItem::number("cycled_capacity", NumberType::Uint32).scaled(0.001, 3))
        .item(PackedItem::number("state_of_health", NumberType::Uint8))
        .item(PackedItem::boolean("precharging", 1))
        .item(PackedItem::number("user_alarm", NumberType::Uint16))
        .item(PackedItem::number("runtime_seconds", NumberType::Uint32))
        .item(PackedItem::boolean("charging_enabled", 1))
        .item(PackedItem::boolean("discharging_enabled", 1))
        .item(PackedItem::raw("reserved", 111))
        .item(PackedItem::number("checksum", NumberType::Uint8))
}

/// Device info segment (`0x03`): identity strings and counters. Strings are
/// NUL-padded on the wire; the decoder strips the padding.
fn device_info() -> PackedResponse {
    PackedResponse::new("device_info", RecordKind::DeviceInfo, &[0x03], RESPONSE_LENGTH)
        .item(PackedItem::raw("header", 4))
        .item(PackedItem::number("record_type", NumberType::Uint8))
        .item(PackedItem::number("frame_counter", NumberType::Uint8))
        .item(PackedItem::text("vendor_id", 16, TextEncoding::Utf8))
        .item(PackedItem::text("hardware_version", 8, TextEncoding::Utf8))
        .item(PackedItem::text("software_version", 8, TextEncoding::Utf8))
        .item(PackedItem::number("uptime_seconds", NumberType::Uint32))
        .item(PackedItem::number("power_on_count", NumberType::Uint32))
        .item(PackedItem::text("device_name", 16, TextEncoding::Utf8))
        .item(PackedItem::text("device_passcode", 16, TextEncoding::Utf8))
        .item(PackedItem::text("manufacturing_date", 8, TextEncoding::Utf8))
        .item(PackedItem::text("serial_number", 11, TextEncoding::Utf8))
        .item(PackedItem::text("passcode", 5, TextEncoding::Utf8))
        .item(PackedItem::text("user_data", 16, TextEncoding::Utf8))
        .item(PackedItem::text("setup_passcode", 16, TextEncoding::Utf8))
        .item(PackedItem::raw("reserved", 165))
        .item(PackedItem::number("checksum", NumberType::Uint8))
}
