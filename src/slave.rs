//! Slave PDU engine: a stateless request dispatcher. Given a request PDU
//! and an application-supplied [`CommandTable`], it validates the
//! function-code-specific operands, scans the configured address ranges
//! in order, and builds either a normal response or a Modbus exception.
//!
//! Every call is an independent `(request, table) -> response` transform;
//! the engine keeps no state across requests (spec.md §4.2).

use bitflags::bitflags;

use crate::pdu::{write_u16, ExceptionCode, FunctionCode, Response};

bitflags! {
    /// Compile-time-configurable per-function enable flags
    /// (`SPEC_FULL.md` §2's "per-function enable flags" configuration
    /// knob). A disabled function behaves exactly like one with an empty
    /// command list: exception `0x01`, checked before the list is even
    /// scanned.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(not(test), derive(defmt::Format))]
    pub struct EnabledFunctions: u16 {
        const READ_COILS = 0x0001;
        const READ_DISCRETE_INPUTS = 0x0002;
        const READ_HOLDING_REGISTERS = 0x0004;
        const READ_INPUT_REGISTERS = 0x0008;
        const WRITE_SINGLE_COIL = 0x0010;
        const WRITE_SINGLE_REGISTER = 0x0020;
        const WRITE_MULTIPLE_COILS = 0x0040;
        const WRITE_MULTIPLE_REGISTERS = 0x0080;
        const READ_WRITE_MULTIPLE_REGISTERS = 0x0100;
        const ALL = 0x01FF;
    }
}

impl FunctionCode {
    fn enabled_flag(self) -> EnabledFunctions {
        match self {
            Self::ReadCoils => EnabledFunctions::READ_COILS,
            Self::ReadDiscreteInputs => EnabledFunctions::READ_DISCRETE_INPUTS,
            Self::ReadHoldingRegisters => EnabledFunctions::READ_HOLDING_REGISTERS,
            Self::ReadInputRegisters => EnabledFunctions::READ_INPUT_REGISTERS,
            Self::WriteSingleCoil => EnabledFunctions::WRITE_SINGLE_COIL,
            Self::WriteSingleRegister => EnabledFunctions::WRITE_SINGLE_REGISTER,
            Self::WriteMultipleCoils => EnabledFunctions::WRITE_MULTIPLE_COILS,
            Self::WriteMultipleRegisters => EnabledFunctions::WRITE_MULTIPLE_REGISTERS,
            Self::ReadWriteMultipleRegisters => EnabledFunctions::READ_WRITE_MULTIPLE_REGISTERS,
        }
    }
}

/// An application-supplied read handler for one function code and address
/// range. Writes result bytes into `out` (already-sized by the engine: for
/// register reads, `2 * quantity` big-endian bytes; for coil/discrete
/// reads, `(quantity + 7) / 8` packed-bit bytes, LSB of `out[0]` is the
/// first coil). Returns the positive register/coil count on success, or a
/// value `<= 0` with `*exception_out` set on failure.
pub type ReadFn = fn(start: u16, quantity: u16, out: &mut [u8], exception_out: &mut ExceptionCode) -> i32;

/// Single-register or single-coil write handler. Returns `> 0` on success.
pub type WriteSingleFn = fn(address: u16, value: u16, exception_out: &mut ExceptionCode) -> i32;

/// Multiple-register or multiple-coil write handler; `data` is the raw
/// request bytes (big-endian register pairs, or packed coil bits).
/// Returns `> 0` on success.
pub type WriteMultipleFn =
    fn(start: u16, quantity: u16, data: &[u8], exception_out: &mut ExceptionCode) -> i32;

/// One `{min_address, max_address, handler}` entry. Overlap between
/// entries in the same list is permitted; the first match wins.
#[derive(Clone, Copy)]
pub struct AddressRange<F: Copy> {
    pub min_address: u16,
    pub max_address: u16,
    pub handler: F,
}

impl<F: Copy> AddressRange<F> {
    pub const fn new(min_address: u16, max_address: u16, handler: F) -> Self {
        Self {
            min_address,
            max_address,
            handler,
        }
    }

    fn covers(&self, address: u16) -> bool {
        address >= self.min_address && address <= self.max_address
    }
}

/// An ordered, bounded list of address-range handlers for one function
/// code. Capacity `N` is the maximum number of configured ranges.
pub type CommandList<F, const N: usize> = heapless::Vec<AddressRange<F>, N>;

/// Outcome of scanning a [`CommandList`] for a covering range.
enum ScanResult<'a, F: Copy> {
    /// The list itself is empty: the function has no handlers configured.
    NoHandlers,
    /// At least one range was visited but none covered the address.
    NoMatch,
    Matched(&'a AddressRange<F>),
}

fn scan<'a, F: Copy, const N: usize>(list: &'a CommandList<F, N>, address: u16) -> ScanResult<'a, F> {
    if list.is_empty() {
        return ScanResult::NoHandlers;
    }
    for range in list.iter() {
        if range.covers(address) {
            return ScanResult::Matched(range);
        }
    }
    ScanResult::NoMatch
}

/// The full set of address-range handler lists for one slave, one per
/// supported function code. A function with an empty list responds
/// `IllegalFunction` to every request, matching the "null function
/// pointer" convention of the original C command table.
pub struct CommandTable<const N: usize> {
    pub read_coils: CommandList<ReadFn, N>,
    pub read_discrete_inputs: CommandList<ReadFn, N>,
    pub read_holding_registers: CommandList<ReadFn, N>,
    pub read_input_registers: CommandList<ReadFn, N>,
    pub write_single_coil: CommandList<WriteSingleFn, N>,
    pub write_single_register: CommandList<WriteSingleFn, N>,
    pub write_multiple_coils: CommandList<WriteMultipleFn, N>,
    pub write_multiple_registers: CommandList<WriteMultipleFn, N>,
    /// Which function codes are compiled in; defaults to all nine. Clearing
    /// a bit disables that function everywhere on this table, independent
    /// of whether its command list is populated.
    pub enabled: EnabledFunctions,
}

impl<const N: usize> Default for CommandTable<N> {
    fn default() -> Self {
        Self {
            read_coils: CommandList::new(),
            read_discrete_inputs: CommandList::new(),
            read_holding_registers: CommandList::new(),
            read_input_registers: CommandList::new(),
            write_single_coil: CommandList::new(),
            write_single_register: CommandList::new(),
            write_multiple_coils: CommandList::new(),
            write_multiple_registers: CommandList::new(),
            enabled: EnabledFunctions::ALL,
        }
    }
}

fn exception(function: u8, code: ExceptionCode, response: &mut [u8]) -> usize {
    Response::Exception { function, code }.encode_into(response)
}

/// Dispatch one request PDU (`request[0]` is the function code) against
/// `table`, writing the response PDU into `response` and returning its
/// length. `response` must be at least [`crate::pdu::MAX_PDU_LEN`] bytes.
pub fn dispatch<const N: usize>(request: &[u8], table: &CommandTable<N>, response: &mut [u8]) -> usize {
    if request.is_empty() {
        return exception(0, ExceptionCode::IllegalFunction, response);
    }
    let raw_function = request[0];
    let Some(function) = FunctionCode::from_u8(raw_function) else {
        return exception(raw_function, ExceptionCode::IllegalFunction, response);
    };

    if request.len() < function.request_header_len() {
        return exception(raw_function, ExceptionCode::IllegalDataValue, response);
    }

    if !table.enabled.contains(function.enabled_flag()) {
        return exception(raw_function, ExceptionCode::IllegalFunction, response);
    }

    match function {
        FunctionCode::ReadCoils => dispatch_read(function, request, &table.read_coils, response),
        FunctionCode::ReadDiscreteInputs => {
            dispatch_read(function, request, &table.read_discrete_inputs, response)
        }
        FunctionCode::ReadHoldingRegisters => {
            dispatch_read(function, request, &table.read_holding_registers, response)
        }
        FunctionCode::ReadInputRegisters => {
            dispatch_read(function, request, &table.read_input_registers, response)
        }
        FunctionCode::WriteSingleCoil => {
            dispatch_write_single_coil(raw_function, request, &table.write_single_coil, response)
        }
        FunctionCode::WriteSingleRegister => {
            dispatch_write_single_register(raw_function, request, &table.write_single_register, response)
        }
        FunctionCode::WriteMultipleCoils => {
            dispatch_write_multiple(function, request, &table.write_multiple_coils, response)
        }
        FunctionCode::WriteMultipleRegisters => {
            dispatch_write_multiple(function, request, &table.write_multiple_registers, response)
        }
        FunctionCode::ReadWriteMultipleRegisters => {
            dispatch_read_write_multiple(raw_function, request, table, response)
        }
    }
}

/// `true` for the bit-oriented functions, whose response/request data is
/// packed `(quantity + 7) / 8` bytes rather than `2 * quantity` big-endian
/// register bytes.
fn is_bit_oriented(function: FunctionCode) -> bool {
    matches!(
        function,
        FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs | FunctionCode::WriteMultipleCoils
    )
}

fn dispatch_read<const N: usize>(
    function: FunctionCode,
    request: &[u8],
    list: &CommandList<ReadFn, N>,
    response: &mut [u8],
) -> usize {
    let raw_function = function.code();
    let is_bits = is_bit_oriented(function);
    let quantity = crate::pdu::read_u16(request, 3);
    // Every function dispatched here declares a quantity range;
    // `quantity_range()` is the one source of truth for it, shared with
    // `master.rs`'s request builders.
    let Some((min_qty, max_qty)) = function.quantity_range() else {
        return exception(raw_function, ExceptionCode::IllegalDataValue, response);
    };
    if quantity < min_qty || quantity > max_qty {
        return exception(raw_function, ExceptionCode::IllegalDataValue, response);
    }
    let start = crate::pdu::read_u16(request, 1);

    match scan(list, start) {
        ScanResult::NoHandlers => exception(raw_function, ExceptionCode::IllegalFunction, response),
        ScanResult::NoMatch => exception(raw_function, ExceptionCode::IllegalDataAddress, response),
        ScanResult::Matched(range) => {
            let data_cap = if is_bits {
                ((quantity as usize) + 7) / 8
            } else {
                quantity as usize * 2
            };
            let mut exception_code = ExceptionCode::IllegalDataValue;
            let n = (range.handler)(start, quantity, &mut response[2..2 + data_cap], &mut exception_code);
            if n > 0 {
                let byte_count = if is_bits { ((n as usize) + 7) / 8 } else { n as usize * 2 };
                response[0] = raw_function;
                response[1] = byte_count as u8;
                2 + byte_count
            } else {
                exception(raw_function, exception_code, response)
            }
        }
    }
}

fn dispatch_write_single_register<const N: usize>(
    function: u8,
    request: &[u8],
    list: &CommandList<WriteSingleFn, N>,
    response: &mut [u8],
) -> usize {
    let address = crate::pdu::read_u16(request, 1);
    let value = crate::pdu::read_u16(request, 3);
    match scan(list, address) {
        ScanResult::NoHandlers => exception(function, ExceptionCode::IllegalFunction, response),
        ScanResult::NoMatch => exception(function, ExceptionCode::IllegalDataAddress, response),
        ScanResult::Matched(range) => {
            let mut exception_code = ExceptionCode::IllegalDataValue;
            let n = (range.handler)(address, value, &mut exception_code);
            if n > 0 {
                response[0] = function;
                write_u16(response, 1, address);
                write_u16(response, 3, value);
                5
            } else {
                exception(function, exception_code, response)
            }
        }
    }
}

fn dispatch_write_single_coil<const N: usize>(
    function: u8,
    request: &[u8],
    list: &CommandList<WriteSingleFn, N>,
    response: &mut [u8],
) -> usize {
    let address = crate::pdu::read_u16(request, 1);
    let raw_value = crate::pdu::read_u16(request, 3);
    // On the wire a coil is 0x0000 (off) or 0xFF00 (on); anything else is
    // an illegal data value.
    if raw_value != 0x0000 && raw_value != 0xFF00 {
        return exception(function, ExceptionCode::IllegalDataValue, response);
    }
    match scan(list, address) {
        ScanResult::NoHandlers => exception(function, ExceptionCode::IllegalFunction, response),
        ScanResult::NoMatch => exception(function, ExceptionCode::IllegalDataAddress, response),
        ScanResult::Matched(range) => {
            let mut exception_code = ExceptionCode::IllegalDataValue;
            let n = (range.handler)(address, raw_value, &mut exception_code);
            if n > 0 {
                response[0] = function;
                write_u16(response, 1, address);
                write_u16(response, 3, raw_value);
                5
            } else {
                exception(function, exception_code, response)
            }
        }
    }
}

fn dispatch_write_multiple<const N: usize>(
    function: FunctionCode,
    request: &[u8],
    list: &CommandList<WriteMultipleFn, N>,
    response: &mut [u8],
) -> usize {
    let raw_function = function.code();
    let is_bits = is_bit_oriented(function);
    let start = crate::pdu::read_u16(request, 1);
    let quantity = crate::pdu::read_u16(request, 3);
    let Some((min_qty, max_qty)) = function.quantity_range() else {
        return exception(raw_function, ExceptionCode::IllegalDataValue, response);
    };
    if quantity < min_qty || quantity > max_qty {
        return exception(raw_function, ExceptionCode::IllegalDataValue, response);
    }
    let byte_count = request[5] as usize;
    let expected_byte_count = if is_bits {
        ((quantity as usize) + 7) / 8
    } else {
        quantity as usize * 2
    };
    if byte_count != expected_byte_count || request.len() < 6 + byte_count {
        return exception(raw_function, ExceptionCode::IllegalDataValue, response);
    }
    let data = &request[6..6 + byte_count];

    match scan(list, start) {
        ScanResult::NoHandlers => exception(raw_function, ExceptionCode::IllegalFunction, response),
        ScanResult::NoMatch => exception(raw_function, ExceptionCode::IllegalDataAddress, response),
        ScanResult::Matched(range) => {
            let mut exception_code = ExceptionCode::IllegalDataValue;
            let n = (range.handler)(start, quantity, data, &mut exception_code);
            if n > 0 {
                response[0] = raw_function;
                write_u16(response, 1, start);
                write_u16(response, 3, quantity);
                5
            } else {
                exception(raw_function, exception_code, response)
            }
        }
    }
}

/// 0x17 Read/Write Multiple Registers: the write side is applied first
/// (as the Modbus spec requires), then the read side is performed and its
/// result shapes the response, exactly like a 0x03 read. Both sides are
/// served by the holding-register tables, since 0x17 operates on holding
/// registers only.
fn dispatch_read_write_multiple<const N: usize>(
    function: u8,
    request: &[u8],
    table: &CommandTable<N>,
    response: &mut [u8],
) -> usize {
    let read_start = crate::pdu::read_u16(request, 1);
    let read_quantity = crate::pdu::read_u16(request, 3);
    let write_start = crate::pdu::read_u16(request, 5);
    let write_quantity = crate::pdu::read_u16(request, 7);
    let (read_min, read_max, write_min, write_max) = FunctionCode::read_write_quantity_ranges();

    if read_quantity < read_min || read_quantity > read_max {
        return exception(function, ExceptionCode::IllegalDataValue, response);
    }
    if write_quantity < write_min || write_quantity > write_max {
        return exception(function, ExceptionCode::IllegalDataValue, response);
    }

    let byte_count = request[9] as usize;
    let expected_byte_count = write_quantity as usize * 2;
    if byte_count != expected_byte_count || request.len() < 10 + byte_count {
        return exception(function, ExceptionCode::IllegalDataValue, response);
    }
    let write_data = &request[10..10 + byte_count];

    match scan(&table.write_multiple_registers, write_start) {
        ScanResult::NoHandlers => return exception(function, ExceptionCode::IllegalFunction, response),
        ScanResult::NoMatch => return exception(function, ExceptionCode::IllegalDataAddress, response),
        ScanResult::Matched(range) => {
            let mut exception_code = ExceptionCode::IllegalDataValue;
            let n = (range.handler)(write_start, write_quantity, write_data, &mut exception_code);
            if n <= 0 {
                return exception(function, exception_code, response);
            }
        }
    }

    match scan(&table.read_holding_registers, read_start) {
        ScanResult::NoHandlers => exception(function, ExceptionCode::IllegalFunction, response),
        ScanResult::NoMatch => exception(function, ExceptionCode::IllegalDataAddress, response),
        ScanResult::Matched(range) => {
            let data_cap = read_quantity as usize * 2;
            let mut exception_code = ExceptionCode::IllegalDataValue;
            let n = (range.handler)(
                read_start,
                read_quantity,
                &mut response[2..2 + data_cap],
                &mut exception_code,
            );
            if n > 0 {
                let byte_count = n as usize * 2;
                response[0] = function;
                response[1] = byte_count as u8;
                2 + byte_count
            } else {
                exception(function, exception_code, response)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn ranged_table() -> CommandTable<4> {
        let mut table = CommandTable::default();
        table
            .read_input_registers
            .push(AddressRange::new(0x0010, 0x0020, holding_registers_identity))
            .ok();
        table
            .read_holding_registers
            .push(AddressRange::new(0x0000, 0xFFFF, holding_registers_identity))
            .ok();
        table
    }

    #[test]
    fn unsupported_function_is_illegal_function() {
        let table: CommandTable<4> = CommandTable::default();
        let request = [0x00u8, 0x00, 0x00, 0x00, 0x00];
        let mut response = [0u8; 8];
        let len = dispatch(&request, &table, &mut response);
        assert_eq!(len, 2);
        assert_eq!(&response[..2], &[0x80, 0x01]);
    }

    #[test]
    fn read_input_registers_quantity_too_large() {
        let table = ranged_table();
        let request = [0x04u8, 0x00, 0x00, 0x00, 0x7E];
        let mut response = [0u8; 8];
        let len = dispatch(&request, &table, &mut response);
        assert_eq!(len, 2);
        assert_eq!(&response[..2], &[0x84, 0x03]);
    }

    #[test]
    fn read_input_registers_no_handlers() {
        let table: CommandTable<4> = CommandTable::default();
        let request = [0x04u8, 0x00, 0x00, 0x00, 0x01];
        let mut response = [0u8; 8];
        let len = dispatch(&request, &table, &mut response);
        assert_eq!(len, 2);
        assert_eq!(&response[..2], &[0x84, 0x01]);
    }

    #[test]
    fn read_input_registers_out_of_range() {
        let table = ranged_table();
        let mut response = [0u8; 8];

        let request = [0x04u8, 0x00, 0x0F, 0x00, 0x01];
        let len = dispatch(&request, &table, &mut response);
        assert_eq!(len, 2);
        assert_eq!(&response[..2], &[0x84, 0x02]);

        let request = [0x04u8, 0x00, 0x21, 0x00, 0x01];
        let len = dispatch(&request, &table, &mut response);
        assert_eq!(len, 2);
        assert_eq!(&response[..2], &[0x84, 0x02]);
    }

    #[test]
    fn read_input_registers_in_range() {
        let table = ranged_table();
        let request = [0x04u8, 0x00, 0x10, 0x00, 0x02];
        let mut response = [0u8; 8];
        let len = dispatch(&request, &table, &mut response);
        assert_eq!(len, 6);
        assert_eq!(&response[..6], &[0x04, 0x04, 0x00, 0x10, 0x00, 0x11]);
    }

    fn write_single_ok(_address: u16, _value: u16, _exception_out: &mut ExceptionCode) -> i32 {
        1
    }

    fn write_single_fails(_address: u16, _value: u16, exception_out: &mut ExceptionCode) -> i32 {
        *exception_out = ExceptionCode::ServerDeviceFailure;
        -1
    }

    #[test]
    fn write_single_register_echoes_request_on_success() {
        let mut table: CommandTable<4> = CommandTable::default();
        table
            .write_single_register
            .push(AddressRange::new(0, 0xFFFF, write_single_ok))
            .ok();
        let request = [0x06u8, 0x00, 0x05, 0x12, 0x34];
        let mut response = [0u8; 8];
        let len = dispatch(&request, &table, &mut response);
        assert_eq!(len, 5);
        assert_eq!(&response[..5], &request);
    }

    #[test]
    fn write_single_register_reports_handler_failure() {
        let mut table: CommandTable<4> = CommandTable::default();
        table
            .write_single_register
            .push(AddressRange::new(0, 0xFFFF, write_single_fails))
            .ok();
        let request = [0x06u8, 0x00, 0x05, 0x12, 0x34];
        let mut response = [0u8; 8];
        let len = dispatch(&request, &table, &mut response);
        assert_eq!(len, 2);
        assert_eq!(&response[..2], &[0x86, 0x04]);
    }

    fn write_multiple_ok(
        _start: u16,
        _quantity: u16,
        _data: &[u8],
        _exception_out: &mut ExceptionCode,
    ) -> i32 {
        1
    }

    #[test]
    fn write_multiple_registers_echoes_start_and_quantity() {
        let mut table: CommandTable<4> = CommandTable::default();
        table
            .write_multiple_registers
            .push(AddressRange::new(0, 0xFFFF, write_multiple_ok))
            .ok();
        let request = [0x10u8, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02];
        let mut response = [0u8; 8];
        let len = dispatch(&request, &table, &mut response);
        assert_eq!(len, 5);
        assert_eq!(&response[..5], &[0x10, 0x00, 0x01, 0x00, 0x02]);
    }

    #[test]
    fn write_multiple_registers_byte_count_mismatch_is_illegal_value() {
        let mut table: CommandTable<4> = CommandTable::default();
        table
            .write_multiple_registers
            .push(AddressRange::new(0, 0xFFFF, write_multiple_ok))
            .ok();
        // Claims 2 registers (4 bytes) but byte_count field says 2.
        let request = [0x10u8, 0x00, 0x01, 0x00, 0x02, 0x02, 0x00, 0x0A];
        let mut response = [0u8; 8];
        let len = dispatch(&request, &table, &mut response);
        assert_eq!(len, 2);
        assert_eq!(&response[..2], &[0x90, 0x03]);
    }

    #[test]
    fn read_write_multiple_writes_then_reads() {
        let mut table: CommandTable<4> = CommandTable::default();
        table
            .write_multiple_registers
            .push(AddressRange::new(0, 0xFFFF, write_multiple_ok))
            .ok();
        table
            .read_holding_registers
            .push(AddressRange::new(0, 0xFFFF, holding_registers_identity))
            .ok();
        // read start=0x0000 qty=2, write start=0x0010 qty=1, byte_count=2, data=[0x00,0x01]
        let request = [
            0x17u8, 0x00, 0x00, 0x00, 0x02, 0x00, 0x10, 0x00, 0x01, 0x02, 0x00, 0x01,
        ];
        let mut response = [0u8; 8];
        let len = dispatch(&request, &table, &mut response);
        assert_eq!(len, 6);
        assert_eq!(&response[..6], &[0x17, 0x04, 0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn zero_length_request_is_illegal_function() {
        let table: CommandTable<4> = CommandTable::default();
        let request: [u8; 0] = [];
        let mut response = [0u8; 8];
        let len = dispatch(&request, &table, &mut response);
        assert_eq!(len, 2);
        assert_eq!(response[1], ExceptionCode::IllegalFunction.code());
    }

    #[test]
    fn disabled_function_is_illegal_function_even_with_a_matching_handler() {
        let mut table = ranged_table();
        table.enabled.remove(EnabledFunctions::READ_INPUT_REGISTERS);
        let request = [0x04u8, 0x00, 0x10, 0x00, 0x02];
        let mut response = [0u8; 8];
        let len = dispatch(&request, &table, &mut response);
        assert_eq!(len, 2);
        assert_eq!(&response[..2], &[0x84, 0x01]);
    }

    #[test]
    fn short_request_fails_length_check_before_semantics() {
        let table = ranged_table();
        // Function 0x04 needs 5 bytes; only 3 given.
        let request = [0x04u8, 0x00, 0x10];
        let mut response = [0u8; 8];
        let len = dispatch(&request, &table, &mut response);
        assert_eq!(len, 2);
        assert_eq!(&response[..2], &[0x84, 0x03]);
    }
}
