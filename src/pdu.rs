//! Protocol Data Unit types: function codes, exception codes, and the
//! big-endian integer helpers the Modbus wire format uses everywhere.

/// Maximum PDU length, per the Modbus application protocol specification.
pub const MAX_PDU_LEN: usize = 253;

/// Valid slave-id range; 0 is broadcast, 248..=255 are reserved.
pub const SLAVE_ID_MIN: u8 = 1;
pub const SLAVE_ID_MAX: u8 = 247;
pub const SLAVE_ID_BROADCAST: u8 = 0;

/// Modbus function codes this crate's slave/master engines support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(not(test), derive(defmt::Format))]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleCoils = 0x0F,
    WriteMultipleRegisters = 0x10,
    ReadWriteMultipleRegisters = 0x17,
}

impl FunctionCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::ReadCoils),
            0x02 => Some(Self::ReadDiscreteInputs),
            0x03 => Some(Self::ReadHoldingRegisters),
            0x04 => Some(Self::ReadInputRegisters),
            0x05 => Some(Self::WriteSingleCoil),
            0x06 => Some(Self::WriteSingleRegister),
            0x0F => Some(Self::WriteMultipleCoils),
            0x10 => Some(Self::WriteMultipleRegisters),
            0x17 => Some(Self::ReadWriteMultipleRegisters),
            _ => None,
        }
    }

    pub const fn code(self) -> u8 {
        self as u8
    }

    /// The fixed request-header length (function byte included) the Modbus
    /// spec mandates for this function, used for the length pre-check every
    /// supported function gets (see `SPEC_FULL.md` §4.2).
    pub const fn request_header_len(self) -> usize {
        match self {
            Self::ReadCoils
            | Self::ReadDiscreteInputs
            | Self::ReadHoldingRegisters
            | Self::ReadInputRegisters => 5,
            Self::WriteSingleCoil | Self::WriteSingleRegister => 5,
            // start(2) + qty(2) + byte_count(1), data follows
            Self::WriteMultipleCoils | Self::WriteMultipleRegisters => 6,
            // read_start(2)+read_qty(2)+write_start(2)+write_qty(2)+byte_count(1)
            Self::ReadWriteMultipleRegisters => 10,
        }
    }

    /// Valid quantity range for this function, per spec.md §3. `None` for
    /// the single-value writes (0x05/0x06), whose quantity is implicitly 1,
    /// and for 0x17, whose read and write sides are checked separately via
    /// [`Self::read_write_quantity_ranges`].
    pub const fn quantity_range(self) -> Option<(u16, u16)> {
        match self {
            Self::ReadCoils | Self::ReadDiscreteInputs => Some((1, 2000)),
            Self::ReadHoldingRegisters | Self::ReadInputRegisters => Some((1, 0x007D)),
            Self::WriteMultipleCoils => Some((1, 1968)),
            Self::WriteMultipleRegisters => Some((1, 0x007B)),
            Self::WriteSingleCoil | Self::WriteSingleRegister => None,
            Self::ReadWriteMultipleRegisters => None,
        }
    }

    /// `(read_min, read_max, write_min, write_max)` quantity ranges for 0x17.
    pub const fn read_write_quantity_ranges() -> (u16, u16, u16, u16) {
        (1, 0x007D, 1, 0x0079)
    }
}

/// Modbus exception codes (single-byte bodies of an exception response).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(not(test), derive(defmt::Format))]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
}

impl ExceptionCode {
    pub const fn code(self) -> u8 {
        self as u8
    }
}

/// A decoded response is either a normal reply or an exception; the
/// high-bit-on-function-code convention is an encoding detail confined to
/// `encode_into`, not something callers branch on.
#[derive(Debug, Clone, Copy)]
pub enum Response<'a> {
    Normal { function: u8, body: &'a [u8] },
    Exception { function: u8, code: ExceptionCode },
}

impl<'a> Response<'a> {
    /// Encode this response into `out`, returning the number of bytes
    /// written. `out` must be at least 2 bytes for an exception, or
    /// `1 + body.len()` for a normal response.
    pub fn encode_into(&self, out: &mut [u8]) -> usize {
        match *self {
            Response::Normal { function, body } => {
                out[0] = function;
                out[1..1 + body.len()].copy_from_slice(body);
                1 + body.len()
            }
            Response::Exception { function, code } => {
                out[0] = function | 0x80;
                out[1] = code.code();
                2
            }
        }
    }
}

/// Read a big-endian `u16` from `buf` starting at `offset`.
pub fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

/// Write a big-endian `u16` into `buf` starting at `offset`.
pub fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    let bytes = value.to_be_bytes();
    buf[offset] = bytes[0];
    buf[offset + 1] = bytes[1];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_code_round_trips() {
        for &(code, expected) in &[
            (0x01u8, FunctionCode::ReadCoils),
            (0x04, FunctionCode::ReadInputRegisters),
            (0x10, FunctionCode::WriteMultipleRegisters),
            (0x17, FunctionCode::ReadWriteMultipleRegisters),
        ] {
            assert_eq!(FunctionCode::from_u8(code), Some(expected));
            assert_eq!(expected.code(), code);
        }
        assert_eq!(FunctionCode::from_u8(0x00), None);
        assert_eq!(FunctionCode::from_u8(0xFF), None);
    }

    #[test]
    fn exception_response_sets_high_bit() {
        let resp = Response::Exception {
            function: 0x04,
            code: ExceptionCode::IllegalDataValue,
        };
        let mut out = [0u8; 8];
        let len = resp.encode_into(&mut out);
        assert_eq!(len, 2);
        assert_eq!(&out[..2], &[0x84, 0x03]);
    }

    #[test]
    fn normal_response_leaves_high_bit_clear() {
        let body = [0x02, 0x00, 0x01];
        let resp = Response::Normal {
            function: 0x04,
            body: &body,
        };
        let mut out = [0u8; 8];
        let len = resp.encode_into(&mut out);
        assert_eq!(len, 4);
        assert_eq!(&out[..4], &[0x04, 0x02, 0x00, 0x01]);
    }

    #[test]
    fn be_int_helpers() {
        let buf = [0x12, 0x34];
        assert_eq!(read_u16(&buf, 0), 0x1234);
        let mut out = [0u8; 2];
        write_u16(&mut out, 0, 0xBEEF);
        assert_eq!(out, [0xBE, 0xEF]);
    }
}
