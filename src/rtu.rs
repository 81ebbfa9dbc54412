//! Modbus RTU transport
//!
//! Frames FC03 / FC16 requests for the RS-485 line and parses the replies.
//!
//! # Frame Layout
//!
//! ```text
//! | unit (1) | function (1) | payload (N) | CRC-16/MODBUS (2, low byte first) |
//! ```
//!
//! | Frame | Payload |
//! |-------|---------|
//! | FC03 request | address (2), quantity (2) |
//! | FC03 response | byte count (1), registers (2 × quantity) |
//! | FC16 request | address (2), quantity (2), byte count (1), registers |
//! | FC16 response | address (2), quantity (2) |
//! | Exception | exception code (1) |
//!
//! [`RtuTransport`] works over any blocking [`RtuLine`] whose reads time out
//! (`ErrorKind::TimedOut`) when the line stays silent. With the `rtu` feature,
//! [`open_serial`] produces one on a real serial port.
//!
//! Responses to FC03 do not echo the register address, so a reply that
//! arrives after its request timed out is indistinguishable from the answer
//! to the next read. Pending input is therefore discarded before every
//! request.

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use crc::{Crc, CRC_16_MODBUS};
use tracing::{debug, trace};

use crate::constants::{
    EXCEPTION_FLAG, FC_READ_HOLDING_REGISTERS, FC_WRITE_MULTIPLE_REGISTERS, MAX_READ_REGISTERS,
    MAX_RTU_FRAME_SIZE, MAX_WRITE_REGISTERS,
};
use crate::error::{TransportError, TransportResult};
use crate::protocol::UnitId;
use crate::transport::{ModbusTransport, TransportStats};

/// CRC-16/MODBUS (poly 0xA001 reflected, init 0xFFFF)
pub const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

// ============================================================================
// Frame Building
// ============================================================================

fn finish_frame(mut frame: BytesMut) -> BytesMut {
    let crc = MODBUS_CRC.checksum(&frame);
    frame.put_u16_le(crc);
    frame
}

/// Build an FC03 request frame.
pub fn build_read_request(unit: UnitId, address: u16, count: u16) -> TransportResult<BytesMut> {
    if count == 0 || count as usize > MAX_READ_REGISTERS {
        return Err(TransportError::unexpected(format!(
            "Invalid register count for FC03: {}",
            count
        )));
    }

    let mut frame = BytesMut::with_capacity(8);
    frame.put_u8(unit.get());
    frame.put_u8(FC_READ_HOLDING_REGISTERS);
    frame.put_u16(address);
    frame.put_u16(count);
    Ok(finish_frame(frame))
}

/// Build an FC16 request frame.
pub fn build_write_request(
    unit: UnitId,
    address: u16,
    values: &[u16],
) -> TransportResult<BytesMut> {
    if values.is_empty() || values.len() > MAX_WRITE_REGISTERS {
        return Err(TransportError::unexpected(format!(
            "Invalid register count for FC16: {}",
            values.len()
        )));
    }

    let mut frame = BytesMut::with_capacity(9 + values.len() * 2);
    frame.put_u8(unit.get());
    frame.put_u8(FC_WRITE_MULTIPLE_REGISTERS);
    frame.put_u16(address);
    frame.put_u16(values.len() as u16);
    frame.put_u8((values.len() * 2) as u8);
    for &value in values {
        frame.put_u16(value);
    }
    Ok(finish_frame(frame))
}

// ============================================================================
// Frame Parsing
// ============================================================================

/// Total length of a response frame given its first three bytes.
pub fn expected_response_len(header: &[u8; 3]) -> TransportResult<usize> {
    let function = header[1];
    if function & EXCEPTION_FLAG != 0 {
        return Ok(5);
    }
    match function {
        FC_READ_HOLDING_REGISTERS => Ok(3 + header[2] as usize + 2),
        FC_WRITE_MULTIPLE_REGISTERS => Ok(8),
        other => Err(TransportError::unexpected(format!(
            "Unsupported function code in response: {:02X}",
            other
        ))),
    }
}

/// Check the CRC, unit and function code of a complete frame and return its
/// payload (everything between the function code and the CRC).
fn check_frame(frame: &[u8], unit: UnitId, function: u8) -> TransportResult<&[u8]> {
    if frame.len() < 5 {
        return Err(TransportError::unexpected(format!(
            "Frame too short: {} bytes",
            frame.len()
        )));
    }

    let (body, crc_bytes) = frame.split_at(frame.len() - 2);
    let actual = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    let expected = MODBUS_CRC.checksum(body);
    if actual != expected {
        return Err(TransportError::Crc { expected, actual });
    }

    if body[0] != unit.get() {
        return Err(TransportError::unexpected(format!(
            "Response from unit {}, expected {}",
            body[0], unit
        )));
    }

    if body[1] == function | EXCEPTION_FLAG {
        return Err(TransportError::exception(function, body[2]));
    }
    if body[1] != function {
        return Err(TransportError::unexpected(format!(
            "Function code mismatch: expected {:02X}, got {:02X}",
            function, body[1]
        )));
    }

    Ok(&body[2..])
}

/// Parse an FC03 response into registers.
pub fn parse_read_response(frame: &[u8], unit: UnitId, count: u16) -> TransportResult<Vec<u16>> {
    let payload = check_frame(frame, unit, FC_READ_HOLDING_REGISTERS)?;
    let byte_count = payload[0] as usize;
    let data = &payload[1..];

    if byte_count != data.len() || byte_count % 2 != 0 {
        return Err(TransportError::unexpected(format!(
            "Byte count {} does not match {} data bytes",
            byte_count,
            data.len()
        )));
    }
    if byte_count != count as usize * 2 {
        return Err(TransportError::Malformed {
            expected: count as usize,
            actual: byte_count / 2,
        });
    }

    Ok(data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Parse an FC16 response and check it echoes the request.
pub fn parse_write_response(
    frame: &[u8],
    unit: UnitId,
    address: u16,
    count: u16,
) -> TransportResult<()> {
    let payload = check_frame(frame, unit, FC_WRITE_MULTIPLE_REGISTERS)?;
    if payload.len() != 4 {
        return Err(TransportError::unexpected(format!(
            "FC16 response payload is {} bytes",
            payload.len()
        )));
    }

    let echoed_address = u16::from_be_bytes([payload[0], payload[1]]);
    let echoed_count = u16::from_be_bytes([payload[2], payload[3]]);
    if echoed_address != address || echoed_count != count {
        return Err(TransportError::unexpected(format!(
            "FC16 echo mismatch: {}x{} for request {}x{}",
            echoed_address, echoed_count, address, count
        )));
    }
    Ok(())
}

// ============================================================================
// Transport
// ============================================================================

/// Blocking byte stream an [`RtuTransport`] talks over.
pub trait RtuLine: Read + Write {
    /// Drop every byte received but not yet read.
    fn discard_input(&mut self) -> std::io::Result<()>;
}

/// Modbus RTU transport over a blocking byte stream.
pub struct RtuTransport<S: RtuLine> {
    stream: S,
    connected: bool,
    timeout: Duration,
    packet_logging: bool,
    stats: TransportStats,
}

impl<S: RtuLine> RtuTransport<S> {
    /// Wrap an open stream. `timeout` is only used for error reporting; the
    /// stream enforces it.
    pub fn new(stream: S, timeout: Duration) -> Self {
        Self {
            stream,
            connected: false,
            timeout,
            packet_logging: false,
            stats: TransportStats::default(),
        }
    }

    /// Log every frame at debug level.
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    fn log_frame(&self, direction: &str, frame: &[u8]) {
        if self.packet_logging {
            debug!("{} {:02X?}", direction, frame);
        } else {
            trace!("{} {} bytes", direction, frame.len());
        }
    }

    /// Fill `buf`, mapping silence to `NoResponse` before the first byte and
    /// to `Timeout` afterwards.
    fn read_exact(&mut self, buf: &mut [u8], already: usize, unit: UnitId) -> TransportResult<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => return Err(self.silence(already + filled, unit)),
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    return Err(self.silence(already + filled, unit));
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.stats.bytes_received += buf.len() as u64;
        Ok(())
    }

    fn silence(&self, received: usize, unit: UnitId) -> TransportError {
        if received == 0 {
            TransportError::NoResponse { unit: unit.get() }
        } else {
            TransportError::timeout(self.timeout.as_millis() as u64)
        }
    }

    fn transact(&mut self, unit: UnitId, request: &[u8]) -> TransportResult<Vec<u8>> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }

        self.stream.discard_input()?;
        self.log_frame("TX", request);
        self.stream.write_all(request)?;
        self.stream.flush()?;
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += request.len() as u64;

        let mut header = [0u8; 3];
        self.read_exact(&mut header, 0, unit)?;
        let total = expected_response_len(&header)?;
        if total > MAX_RTU_FRAME_SIZE {
            return Err(TransportError::unexpected(format!(
                "Response length {} exceeds RTU limit",
                total
            )));
        }

        let mut frame = vec![0u8; total];
        frame[..3].copy_from_slice(&header);
        self.read_exact(&mut frame[3..], 3, unit)?;
        self.log_frame("RX", &frame);
        Ok(frame)
    }

    fn track<T>(&mut self, result: TransportResult<T>) -> TransportResult<T> {
        match &result {
            Ok(_) => self.stats.responses_received += 1,
            Err(e) => {
                self.stats.errors += 1;
                if e.is_timeout() {
                    self.stats.timeouts += 1;
                }
                if e.is_device_reported() {
                    self.stats.exceptions += 1;
                }
            }
        }
        result
    }
}

impl<S: RtuLine> ModbusTransport for RtuTransport<S> {
    fn connect(&mut self) -> TransportResult<()> {
        self.connected = true;
        debug!("RTU transport ready");
        Ok(())
    }

    fn close(&mut self) -> TransportResult<()> {
        if self.connected {
            self.connected = false;
            self.stream.flush()?;
            debug!("RTU transport closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn read_holding_registers(
        &mut self,
        unit: UnitId,
        address: u16,
        count: u16,
    ) -> TransportResult<Vec<u16>> {
        let result = build_read_request(unit, address, count)
            .and_then(|request| self.transact(unit, &request))
            .and_then(|frame| parse_read_response(&frame, unit, count));
        self.track(result)
    }

    fn write_holding_registers(
        &mut self,
        unit: UnitId,
        address: u16,
        values: &[u16],
    ) -> TransportResult<()> {
        let result = build_write_request(unit, address, values)
            .and_then(|request| self.transact(unit, &request))
            .and_then(|frame| parse_write_response(&frame, unit, address, values.len() as u16));
        self.track(result)
    }

    fn get_stats(&self) -> TransportStats {
        self.stats
    }
}

// ============================================================================
// Serial Port
// ============================================================================

#[cfg(feature = "rtu")]
mod serial {
    use super::{RtuLine, RtuTransport};
    use crate::config::{Parity, SerialConfig};
    use crate::error::{TransportError, TransportResult};

    /// Serial port handle produced by [`open_serial`]
    pub type SerialPort = Box<dyn tokio_serial::SerialPort>;

    impl RtuLine for SerialPort {
        fn discard_input(&mut self) -> std::io::Result<()> {
            self.clear(tokio_serial::ClearBuffer::Input)
                .map_err(std::io::Error::from)
        }
    }

    /// Open the RS-485 adapter described by `config`.
    pub fn open_serial(config: &SerialConfig) -> TransportResult<RtuTransport<SerialPort>> {
        let data_bits = match config.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let stop_bits = match config.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };
        let parity = match config.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        };

        let port = tokio_serial::new(config.port.as_str(), config.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(config.timeout)
            .open()
            .map_err(|e| TransportError::io(format!("Failed to open {}: {}", config.port, e)))?;

        tracing::info!(
            port = %config.port,
            baud = config.baud_rate,
            "Serial port opened"
        );
        Ok(RtuTransport::new(port, config.timeout))
    }
}

#[cfg(feature = "rtu")]
pub use serial::{open_serial, SerialPort};

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted line: every flushed request releases the next reply. Bytes
    /// marked late show up only after the reader has met silence once.
    struct Line {
        written: Vec<u8>,
        script: VecDeque<(Vec<u8>, Vec<u8>)>,
        pending: VecDeque<u8>,
        late: Vec<u8>,
        discarded: usize,
    }

    impl Line {
        fn scripted(script: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
            Self {
                written: Vec::new(),
                script: script.into(),
                pending: VecDeque::new(),
                late: Vec::new(),
                discarded: 0,
            }
        }

        fn replying(reply: &[u8]) -> Self {
            Self::scripted(vec![(reply.to_vec(), Vec::new())])
        }
    }

    impl Read for Line {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pending.is_empty() {
                self.pending.extend(self.late.drain(..));
                return Err(std::io::Error::new(ErrorKind::TimedOut, "silence"));
            }
            let n = buf.len().min(self.pending.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.pending.pop_front().unwrap_or_default();
            }
            Ok(n)
        }
    }

    impl Write for Line {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            if let Some((now, late)) = self.script.pop_front() {
                self.pending.extend(now);
                self.late = late;
            }
            Ok(())
        }
    }

    impl RtuLine for Line {
        fn discard_input(&mut self) -> std::io::Result<()> {
            self.discarded += self.pending.len();
            self.pending.clear();
            Ok(())
        }
    }

    fn unit(id: u8) -> UnitId {
        UnitId::new(id).unwrap()
    }

    fn with_crc(body: &[u8]) -> Vec<u8> {
        let mut frame = body.to_vec();
        frame.extend_from_slice(&MODBUS_CRC.checksum(body).to_le_bytes());
        frame
    }

    fn transport(reply: &[u8]) -> RtuTransport<Line> {
        let mut t = RtuTransport::new(Line::replying(reply), Duration::from_millis(100));
        t.connect().unwrap();
        t
    }

    #[test]
    fn test_crc_reference_frame() {
        // Read 1 holding register at 0 from unit 1: 01 03 00 00 00 01 84 0A
        let frame = build_read_request(unit(1), 0, 1).unwrap();
        assert_eq!(&frame[..], &[0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]);
    }

    #[test]
    fn test_build_write_request() {
        let frame = build_write_request(unit(5), 32790, &[0x3F80, 0x0000]).unwrap();
        assert_eq!(
            &frame[..11],
            &[0x05, 0x10, 0x80, 0x16, 0x00, 0x02, 0x04, 0x3F, 0x80, 0x00, 0x00]
        );
        assert_eq!(frame.len(), 13);
        assert_eq!(MODBUS_CRC.checksum(&frame[..11]).to_le_bytes(), [frame[11], frame[12]]);
    }

    #[test]
    fn test_read_round_trip() {
        let reply = with_crc(&[0x07, 0x03, 0x04, 0x40, 0xE0, 0x00, 0x00]);
        let mut t = transport(&reply);

        let regs = t.read_holding_registers(unit(7), 32782, 2).unwrap();
        assert_eq!(regs, vec![0x40E0, 0x0000]);
        assert_eq!(t.stream.written, build_read_request(unit(7), 32782, 2).unwrap().to_vec());

        let stats = t.get_stats();
        assert_eq!(stats.requests_sent, 1);
        assert_eq!(stats.responses_received, 1);
        assert_eq!(stats.bytes_received, reply.len() as u64);
    }

    #[test]
    fn test_write_round_trip() {
        let reply = with_crc(&[0x05, 0x10, 0x80, 0x16, 0x00, 0x02]);
        let mut t = transport(&reply);
        t.write_holding_registers(unit(5), 32790, &[0x3F80, 0x0000])
            .unwrap();
    }

    #[test]
    fn test_exception_response() {
        let reply = with_crc(&[0x05, 0x90, 0x03]);
        let mut t = transport(&reply);
        let err = t
            .write_holding_registers(unit(5), 32782, &[0x40E0, 0x0000])
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Exception {
                function: 0x10,
                code: 0x03,
                ..
            }
        ));
        assert_eq!(t.get_stats().exceptions, 1);
    }

    #[test]
    fn test_silence_is_no_response() {
        let mut t = transport(&[]);
        assert_eq!(
            t.read_holding_registers(unit(9), 0, 2),
            Err(TransportError::NoResponse { unit: 9 })
        );
        assert_eq!(t.get_stats().timeouts, 1);
    }

    #[test]
    fn test_partial_frame_is_timeout() {
        let mut t = transport(&[0x09, 0x03, 0x04, 0x00]);
        assert_eq!(
            t.read_holding_registers(unit(9), 0, 2),
            Err(TransportError::timeout(100))
        );
    }

    #[test]
    fn test_bad_crc() {
        let mut reply = with_crc(&[0x07, 0x03, 0x04, 0x40, 0xE0, 0x00, 0x00]);
        let last = reply.len() - 1;
        reply[last] ^= 0xFF;
        let mut t = transport(&reply);
        assert!(matches!(
            t.read_holding_registers(unit(7), 32782, 2),
            Err(TransportError::Crc { .. })
        ));
    }

    #[test]
    fn test_short_register_count_is_malformed() {
        let reply = with_crc(&[0x07, 0x03, 0x02, 0x40, 0xE0]);
        let mut t = transport(&reply);
        assert_eq!(
            t.read_holding_registers(unit(7), 32782, 2),
            Err(TransportError::Malformed {
                expected: 2,
                actual: 1
            })
        );
    }

    #[test]
    fn test_wrong_unit_rejected() {
        let reply = with_crc(&[0x08, 0x03, 0x04, 0x40, 0xE0, 0x00, 0x00]);
        let mut t = transport(&reply);
        assert!(matches!(
            t.read_holding_registers(unit(7), 32782, 2),
            Err(TransportError::UnexpectedResponse { .. })
        ));
    }

    #[test]
    fn test_late_reply_is_discarded_before_next_request() {
        // Identity read at 5 times out; its answer (5.0) lands afterwards,
        // just ahead of the request for the security register.
        let late_identity = with_crc(&[0x05, 0x03, 0x04, 0x40, 0xA0, 0x00, 0x00]);
        let locked = with_crc(&[0x05, 0x03, 0x04, 0x00, 0x00, 0x00, 0x00]);
        let line = Line::scripted(vec![
            (Vec::new(), late_identity.clone()),
            (locked, Vec::new()),
        ]);
        let mut t = RtuTransport::new(line, Duration::from_millis(100));
        t.connect().unwrap();

        assert_eq!(
            t.read_holding_registers(unit(5), 32782, 2),
            Err(TransportError::NoResponse { unit: 5 })
        );
        assert_eq!(
            crate::lock::LockController::read_lock_state(&mut t, unit(5)),
            Ok(crate::lock::SecurityState::Locked)
        );
        assert_eq!(t.stream.discarded, late_identity.len());
    }

    #[test]
    fn test_requires_connect() {
        let mut t = RtuTransport::new(Line::replying(&[]), Duration::from_millis(100));
        assert_eq!(
            t.read_holding_registers(unit(1), 0, 2),
            Err(TransportError::NotConnected)
        );
    }
}
