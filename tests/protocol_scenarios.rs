//! End-to-end scenarios spanning the ASCII codec and the slave engine: a
//! request frame is encoded exactly as it would arrive over the wire,
//! decoded back to a PDU, dispatched, and the response re-encoded.

use modbus_ascii::ascii;
use modbus_ascii::pdu::{write_u16, ExceptionCode};
use modbus_ascii::slave::{AddressRange, CommandTable};

fn holding_registers_identity(
    start: u16,
    quantity: u16,
    out: &mut [u8],
    _exception_out: &mut ExceptionCode,
) -> i32 {
    for i in 0..quantity {
        write_u16(out, (i as usize) * 2, start + i);
    }
    quantity as i32
}

fn decode_one_frame(frame: &[u8]) -> heapless::Vec<u8, { ascii::MAX_RAW_LEN }> {
    let mut decoder = ascii::Decoder::new();
    let mut out = [0u8; ascii::MAX_RAW_LEN];
    let mut decoded = None;
    for &b in frame {
        if let Some(Ok(len)) = decoder.feed(b, &mut out) {
            decoded = Some(len);
        }
    }
    let len = decoded.expect("frame should decode cleanly");
    let mut v = heapless::Vec::new();
    v.extend_from_slice(&out[..len]).unwrap();
    v
}

#[test]
fn read_holding_registers_over_the_wire() {
    let mut table: CommandTable<4> = CommandTable::default();
    table
        .read_holding_registers
        .push(AddressRange::new(0x0000, 0xFFFF, holding_registers_identity))
        .ok();

    // Slave id 17, function 0x03, start 0x0006, quantity 2.
    let request = [0x11u8, 0x03, 0x00, 0x06, 0x00, 0x02];
    let mut wire = [0u8; 32];
    let len = ascii::encode(&request, &mut wire);
    assert_eq!(&wire[..9], b":11030006");

    let decoded = decode_one_frame(&wire[..len]);
    let (slave_id, pdu) = (decoded[0], &decoded[1..]);
    assert_eq!(slave_id, 0x11);

    let mut response = [0u8; 32];
    let response_len = modbus_ascii::slave::dispatch(pdu, &table, &mut response);
    assert_eq!(&response[..response_len], &[0x03, 0x04, 0x00, 0x06, 0x00, 0x07]);

    let mut reply = [0u8; 2 + 6];
    reply[0] = slave_id;
    reply[1..1 + response_len].copy_from_slice(&response[..response_len]);
    let mut reply_wire = [0u8; 32];
    let reply_len = ascii::encode(&reply[..1 + response_len], &mut reply_wire);
    assert_eq!(&reply_wire[..reply_len - 2], b":11030400060007DB\r");
}

#[test]
fn illegal_data_address_round_trips_as_an_exception_frame() {
    let mut table: CommandTable<4> = CommandTable::default();
    table
        .read_holding_registers
        .push(AddressRange::new(0x0010, 0x0020, holding_registers_identity))
        .ok();

    // Address 0x0000 falls outside the one configured range.
    let request = [0x01u8, 0x03, 0x00, 0x00, 0x00, 0x01];
    let mut wire = [0u8; 32];
    let len = ascii::encode(&request, &mut wire);

    let decoded = decode_one_frame(&wire[..len]);
    let mut response = [0u8; 8];
    let response_len = modbus_ascii::slave::dispatch(&decoded[1..], &table, &mut response);
    assert_eq!(&response[..response_len], &[0x83, 0x02]);
}

#[test]
fn unterminated_garbage_before_a_frame_does_not_corrupt_the_next_one() {
    let mut table: CommandTable<4> = CommandTable::default();
    table
        .read_holding_registers
        .push(AddressRange::new(0x0000, 0xFFFF, holding_registers_identity))
        .ok();

    let mut stream: heapless::Vec<u8, 64> = heapless::Vec::new();
    stream.extend_from_slice(b":001122").unwrap(); // unterminated, discarded on resync

    let request = [0x02u8, 0x03, 0x00, 0x00, 0x00, 0x01];
    let mut frame = [0u8; 32];
    let len = ascii::encode(&request, &mut frame);
    stream.extend_from_slice(&frame[..len]).unwrap();

    let decoded = decode_one_frame(&stream);
    assert_eq!(decoded.as_slice(), &request);

    let mut response = [0u8; 8];
    let response_len = modbus_ascii::slave::dispatch(&decoded[1..], &table, &mut response);
    assert_eq!(&response[..response_len], &[0x03, 0x02, 0x00, 0x00]);
}
