//! Feed arbitrary bytes to the RTU response parsers.
//!
//! Parsing must never panic, and a frame accepted as a read response must
//! carry exactly the requested number of registers.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use sensor_readdress::rtu::{expected_response_len, parse_read_response, parse_write_response};
use sensor_readdress::UnitId;

#[derive(Arbitrary, Debug)]
struct Input {
    unit: u8,
    address: u16,
    count: u16,
    frame: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let Ok(unit) = UnitId::new(input.unit) else {
        return;
    };

    if let Some(header) = input.frame.get(..3) {
        let header = [header[0], header[1], header[2]];
        let _ = expected_response_len(&header);
    }

    if let Ok(registers) = parse_read_response(&input.frame, unit, input.count) {
        assert_eq!(registers.len(), input.count as usize);
    }
    let _ = parse_write_response(&input.frame, unit, input.address, input.count);
});
