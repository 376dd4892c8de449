//! Integration tests over the shipped JK protocol: unpack → reassemble →
//! decode, plus bit-exact command frames.

use jkread::binary::checksum;
use jkread::frame::FrameAssembler;
use jkread::protocol::{encode_command, jk02, CommandName};
use jkread::{Decoder, RecordKind, Value};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn decoder() -> Decoder {
    Decoder::new(jk02::protocol()).expect("shipped protocol must validate")
}

fn put(segment: &mut [u8], offset: usize, bytes: &[u8]) {
    segment[offset..offset + bytes.len()].copy_from_slice(bytes);
}

fn seal(segment: &mut [u8]) {
    let last = segment.len() - 1;
    segment[last] = checksum(&segment[..last]);
}

/// A plausible 300-byte cell info segment (signature 0x02).
fn cell_info_segment() -> Vec<u8> {
    let mut seg = vec![0u8; jk02::RESPONSE_LENGTH];
    put(&mut seg, 0, &jk02::SEGMENT_HEADER);
    seg[4] = 0x02;
    seg[5] = 7; // frame counter

    // 32 cell voltages, 3.200 V upwards in 1 mV steps.
    for cell in 0..32u16 {
        put(&mut seg, 6 + 2 * cell as usize, &(3200 + cell).to_le_bytes());
    }
    put(&mut seg, 70, &[0xFF, 0xFF, 0x00, 0x00]); // 16 cells active
    for cell in 0..32u16 {
        put(&mut seg, 74 + 2 * cell as usize, &(100 + cell).to_le_bytes());
    }
    put(&mut seg, 138, &215i16.to_le_bytes()); // power tube 21.5 C
    put(&mut seg, 140, &26_368u32.to_le_bytes()); // 26.368 V
    put(&mut seg, 144, &(-1_500i32).to_le_bytes()); // -1.5 W
    put(&mut seg, 148, &2_500i32.to_le_bytes()); // 2.5 A
    put(&mut seg, 152, &(-35i16).to_le_bytes()); // -3.5 C
    put(&mut seg, 154, &250i16.to_le_bytes()); // 25.0 C
    put(&mut seg, 156, &[0x00, 0x04]); // alarm flags
    put(&mut seg, 158, &150i16.to_le_bytes()); // 0.15 A balance
    seg[160] = 1; // balancing towards charge
    seg[161] = 88; // SOC %
    put(&mut seg, 162, &84_000u32.to_le_bytes()); // 84 Ah remaining
    put(&mut seg, 166, &100_000u32.to_le_bytes()); // 100 Ah nominal
    put(&mut seg, 170, &42u32.to_le_bytes()); // cycles
    put(&mut seg, 174, &4_200_000u32.to_le_bytes()); // 4200 Ah cycled
    seg[178] = 99; // SOH %
    put(&mut seg, 180, &0u16.to_le_bytes());
    put(&mut seg, 182, &360_000u32.to_le_bytes()); // runtime
    seg[186] = 1; // charging enabled
    seg[187] = 1; // discharging enabled
    seal(&mut seg);
    seg
}

/// A 300-byte device info segment (signature 0x03).
fn device_info_segment() -> Vec<u8> {
    let mut seg = vec![0u8; jk02::RESPONSE_LENGTH];
    put(&mut seg, 0, &jk02::SEGMENT_HEADER);
    seg[4] = 0x03;
    seg[5] = 1;
    put(&mut seg, 6, b"JK_B2A8S20P"); // vendor, NUL-padded to 16
    put(&mut seg, 22, b"V11.XW");
    put(&mut seg, 30, b"V11.26");
    put(&mut seg, 38, &86_400u32.to_le_bytes()); // one day up
    put(&mut seg, 42, &5u32.to_le_bytes());
    put(&mut seg, 46, b"JK_B2A8S20P");
    put(&mut seg, 62, b"1234");
    put(&mut seg, 78, b"2308");
    put(&mut seg, 86, b"4030612070");
    seal(&mut seg);
    seg
}

/// A 300-byte settings segment (signature 0x01).
fn settings_segment() -> Vec<u8> {
    let mut seg = vec![0u8; jk02::RESPONSE_LENGTH];
    put(&mut seg, 0, &jk02::SEGMENT_HEADER);
    seg[4] = 0x01;
    seg[5] = 2;
    put(&mut seg, 10, &2_500u32.to_le_bytes()); // cell UVP 2.5 V
    put(&mut seg, 18, &3_650u32.to_le_bytes()); // cell OVP 3.65 V
    put(&mut seg, 114, &8u32.to_le_bytes()); // cell count
    put(&mut seg, 118, &[1, 0, 0, 0]); // charging enabled
    put(&mut seg, 122, &[0, 0, 0, 0]); // discharging disabled
    put(&mut seg, 126, &[1, 0, 0, 0]); // balancer enabled
    put(&mut seg, 130, &100_000u32.to_le_bytes()); // 100 Ah
    seal(&mut seg);
    seg
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// Fragments of 20, 120 and 160 bytes reassemble into exactly one record.
#[test]
fn test_fragmented_cell_info_reassembles_once() {
    let decoder = decoder();
    let mut assembler = FrameAssembler::new();
    let seg = cell_info_segment();

    assert!(assembler.push(decoder.protocol(), &seg[..20]).is_none());
    assert!(assembler.push(decoder.protocol(), &seg[20..140]).is_none());
    let complete = assembler
        .push(decoder.protocol(), &seg[140..])
        .expect("third fragment completes the segment");
    assert_eq!(assembler.buffered(), 0);

    let (kind, record) = decoder.decode(&complete).unwrap();
    assert_eq!(kind, RecordKind::CellInfo);

    let voltages = record["cell_voltage"].as_list().unwrap();
    assert_eq!(voltages.len(), 32);
    assert_eq!(voltages[0], Value::Number(3.2));
    assert_eq!(voltages[31], Value::Number(3.231));

    assert_eq!(record["active_cell_count"], Value::Number(16.0));
    assert_eq!(record["battery_voltage"], Value::Number(26.368));
    assert_eq!(record["battery_power"], Value::Number(-1.5));
    assert_eq!(record["temperature_1"], Value::Number(-3.5));
    assert_eq!(record["alarm_flags"], Value::Text("00 04".into()));
    assert_eq!(record["state_of_charge"], Value::Number(88.0));
    assert_eq!(record["cycle_count"], Value::Number(42.0));
    assert_eq!(record["charging_enabled"], Value::Bool(true));
    assert_eq!(record["precharging"], Value::Bool(false));

    let resistances = record["cell_resistance"].as_list().unwrap();
    assert_eq!(resistances[0], Value::Number(0.1));
}

/// A single flipped bit in the trailing checksum suppresses the record.
#[test]
fn test_corrupted_checksum_is_silently_dropped() {
    let decoder = decoder();
    let mut assembler = FrameAssembler::new();
    let mut seg = cell_info_segment();
    let last = seg.len() - 1;
    seg[last] ^= 0x01;

    assert!(assembler.push(decoder.protocol(), &seg[..150]).is_none());
    assert!(assembler.push(decoder.protocol(), &seg[150..]).is_none());
    assert_eq!(assembler.buffered(), 0);

    // The assembler is immediately usable for the next segment.
    let good = cell_info_segment();
    assert!(assembler.push(decoder.protocol(), &good).is_some());
}

#[test]
fn test_device_info_strings_are_nul_stripped() {
    let decoder = decoder();
    let (kind, record) = decoder.decode(&device_info_segment()).unwrap();
    assert_eq!(kind, RecordKind::DeviceInfo);
    assert_eq!(record["vendor_id"].as_text(), Some("JK_B2A8S20P"));
    assert_eq!(record["hardware_version"], Value::Text("V11.XW".into()));
    assert_eq!(record["software_version"], Value::Text("V11.26".into()));
    assert_eq!(record["uptime_seconds"], Value::Number(86_400.0));
    assert_eq!(record["device_passcode"], Value::Text("1234".into()));
    assert_eq!(record["serial_number"], Value::Text("4030612070".into()));
    // Unset strings decode to empty, not to NUL runs.
    assert_eq!(record["user_data"], Value::Text("".into()));
}

#[test]
fn test_settings_switches_and_thresholds() {
    let decoder = decoder();
    let (kind, record) = decoder.decode(&settings_segment()).unwrap();
    assert_eq!(kind, RecordKind::Settings);
    assert_eq!(record["cell_undervoltage_protection"], Value::Number(2.5));
    assert_eq!(record["cell_overvoltage_protection"], Value::Number(3.65));
    assert_eq!(record["cell_count"].as_number(), Some(8.0));
    assert_eq!(record["charging_enabled"].as_bool(), Some(true));
    assert_eq!(record["discharging_enabled"], Value::Bool(false));
    assert_eq!(record["balancer_enabled"], Value::Bool(true));
    assert_eq!(record["nominal_capacity"], Value::Number(100.0));
}

/// Bit-exact command frames: header, code, padding, additive checksum.
#[test]
fn test_command_frames_are_bit_exact() {
    let decoder = decoder();
    let protocol = decoder.protocol();

    let settings = protocol.command(CommandName::GetSettings).unwrap();
    let frame = encode_command(protocol, settings, &[]).unwrap();
    let mut expected = vec![0xAA, 0x55, 0x90, 0xEB, 0x96];
    expected.extend_from_slice(&[0x00; 14]);
    expected.push(0x10);
    assert_eq!(frame, expected);

    let toggle = protocol.command(CommandName::ToggleCharging).unwrap();
    let frame = encode_command(protocol, toggle, &[0x01]).unwrap();
    assert_eq!(&frame[..6], &[0xAA, 0x55, 0x90, 0xEB, 0x1D, 0x01]);
    assert!(frame[6..19].iter().all(|b| *b == 0));
    assert_eq!(frame[19], 0x98);
    assert_eq!(frame[19], checksum(&frame[..19]));
}

/// Every response in the shipped table can round-trip a zero-filled segment
/// with a correct checksum; decoding never sees a short buffer.
#[test]
fn test_every_response_decodes_at_declared_length() {
    let decoder = decoder();
    for response in decoder.protocol().responses() {
        let mut seg = vec![0u8; response.length];
        put(&mut seg, 0, &jk02::SEGMENT_HEADER);
        seg[4] = response.signature[0];
        seal(&mut seg);

        let mut assembler = FrameAssembler::new();
        let complete = assembler
            .push(decoder.protocol(), &seg)
            .expect("zero segment completes");
        let (kind, _record) = decoder.decode(&complete).unwrap();
        assert_eq!(kind, response.kind);
    }
}
