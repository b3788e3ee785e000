//! Master PDU engine: builds request PDUs, tracks one in-flight request at
//! a time per master handle, and decodes the matching response (or times
//! out) against a monotonic clock.
//!
//! A master is a small state machine (spec.md §4.3):
//!
//! ```text
//! Idle --request()--> Requested --on_sent()--> Awaiting --response bytes-->
//!   Completed(Ok(..)) | Completed(Err(Exception)) | (deadline elapses) -> Completed(Err(Timeout))
//! ```
//!
//! Decoding which shape the response takes is driven by a tag captured at
//! request time rather than a trait object or closure, keeping the engine
//! allocation-free.

use embedded_time::duration::Milliseconds;
use embedded_time::{Clock, Instant};

use crate::pdu::{read_u16, write_u16, ExceptionCode, FunctionCode};

/// What shape of payload the pending request expects back, captured when
/// the request is built so `on_response` knows how to decode the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(not(test), derive(defmt::Format))]
enum Decode {
    /// Echo response: `[start_hi, start_lo, value_hi, value_lo]` (0x05/0x06)
    /// or `[start_hi, start_lo, qty_hi, qty_lo]` (0x0F/0x10). Nothing to
    /// decode beyond validating the function code matches.
    Echo,
    /// `[byte_count, data...]` register payload (0x03/0x04/0x17): decode
    /// `byte_count / 2` big-endian `u16`s. Carries the quantity that was
    /// requested, so the response's advertised byte count can be checked
    /// against what was actually asked for.
    Registers(u16),
}

/// Why a pending request did not complete successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(not(test), derive(defmt::Format))]
pub enum CompletionError {
    /// No response arrived before the deadline elapsed.
    Timeout,
    /// The slave replied with a Modbus exception.
    Exception(ExceptionCode),
    /// The response was shorter than its own advertised shape.
    Malformed,
    /// Caller's output buffer is too small for the decoded register count.
    OutputTooSmall,
}

/// Outcome of a completed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Registers decoded into the caller's buffer; value is the count.
    Registers(usize),
    /// A write (single or multiple) was acknowledged.
    Written,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum State<I> {
    Idle,
    /// Request PDU built, not yet handed to the transport.
    Requested,
    /// Sent; waiting for a response or the deadline.
    Awaiting { deadline: I },
    Completed(Result<Outcome, CompletionError>),
}

/// One master's request/response state machine. `C` is the clock type used
/// for request deadlines.
pub struct Master<C: Clock> {
    state: State<Instant<C>>,
    function: FunctionCode,
    decode: Decode,
}

impl<C: Clock> Master<C> {
    pub const fn new() -> Self {
        Self {
            state: State::Idle,
            function: FunctionCode::ReadHoldingRegisters,
            decode: Decode::Registers(0),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle)
    }

    /// `true` once a request PDU has been built but not yet handed to
    /// [`Master::on_sent`] — the gateway checks this before forwarding.
    pub fn is_requested(&self) -> bool {
        matches!(self.state, State::Requested)
    }

    /// `true` while a request has been sent and the deadline has not yet
    /// elapsed — the gateway uses this to decide whether an inbound
    /// response could possibly belong to this master.
    pub fn is_awaiting(&self) -> bool {
        matches!(self.state, State::Awaiting { .. })
    }

    /// The function code of the currently pending (or just-completed)
    /// request, used by the gateway to correlate an inbound response.
    pub fn function_code(&self) -> u8 {
        self.function.code()
    }

    fn build(&mut self, function: FunctionCode, decode: Decode, out: &mut [u8], body: &[u8]) -> usize {
        out[0] = function.code();
        out[1..1 + body.len()].copy_from_slice(body);
        self.function = function;
        self.decode = decode;
        self.state = State::Requested;
        1 + body.len()
    }

    /// Build a 0x03 Read Holding Registers request PDU into `out`, return
    /// its length. Panics (in the "this is a logic error" sense — it
    /// returns garbage in release via wrapping arithmetic) only if `out` is
    /// undersized; callers always supply a `MAX_PDU_LEN`-sized buffer.
    pub fn read_holding_registers(&mut self, start: u16, quantity: u16, out: &mut [u8]) -> usize {
        let mut body = [0u8; 4];
        write_u16(&mut body, 0, start);
        write_u16(&mut body, 2, quantity);
        self.build(FunctionCode::ReadHoldingRegisters, Decode::Registers(quantity), out, &body)
    }

    pub fn read_input_registers(&mut self, start: u16, quantity: u16, out: &mut [u8]) -> usize {
        let mut body = [0u8; 4];
        write_u16(&mut body, 0, start);
        write_u16(&mut body, 2, quantity);
        self.build(FunctionCode::ReadInputRegisters, Decode::Registers(quantity), out, &body)
    }

    pub fn write_single_register(&mut self, address: u16, value: u16, out: &mut [u8]) -> usize {
        let mut body = [0u8; 4];
        write_u16(&mut body, 0, address);
        write_u16(&mut body, 2, value);
        self.build(FunctionCode::WriteSingleRegister, Decode::Echo, out, &body)
    }

    /// Build a 0x10 Write Multiple Registers request. `values` is copied
    /// big-endian into the body; `out` must hold `7 + 2*values.len()` bytes.
    pub fn write_multiple_registers(&mut self, start: u16, values: &[u16], out: &mut [u8]) -> usize {
        let byte_count = values.len() * 2;
        let mut header = [0u8; 5];
        write_u16(&mut header, 0, start);
        write_u16(&mut header, 2, values.len() as u16);
        header[4] = byte_count as u8;

        out[0] = FunctionCode::WriteMultipleRegisters.code();
        out[1..6].copy_from_slice(&header);
        for (i, &v) in values.iter().enumerate() {
            write_u16(out, 6 + i * 2, v);
        }
        self.function = FunctionCode::WriteMultipleRegisters;
        self.decode = Decode::Echo;
        self.state = State::Requested;
        6 + byte_count
    }

    /// Mark the request as sent and set its deadline, transitioning to
    /// `Awaiting`. Must follow a `build`-family call.
    pub fn on_sent(&mut self, clock: &C, timeout: Milliseconds<u32>)
    where
        Instant<C>: core::ops::Add<Milliseconds<u32>, Output = Instant<C>>,
    {
        if !matches!(self.state, State::Requested) {
            return;
        }
        let Ok(now) = clock.try_now() else {
            self.state = State::Completed(Err(CompletionError::Timeout));
            return;
        };
        let deadline = now + timeout;
        self.state = State::Awaiting { deadline };
    }

    /// Called on every tick while `Awaiting`; transitions to `Completed`
    /// with a timeout if the deadline has elapsed. No-op otherwise.
    pub fn poll_timeout(&mut self, clock: &C) {
        if let State::Awaiting { deadline } = self.state {
            if let Ok(now) = clock.try_now() {
                if now >= deadline {
                    #[cfg(not(test))]
                    defmt::warn!("master request for function {} timed out", self.function.code());
                    self.state = State::Completed(Err(CompletionError::Timeout));
                }
            }
        }
    }

    /// Feed a received response PDU (`response[0]` is the function code,
    /// high bit set for an exception). The caller (the gateway) is
    /// responsible for the `from_slave_id == expected_slave_id` half of
    /// spec.md §4.3's correlation check before calling this; this half
    /// checks the function code. A response whose function code (masked
    /// to clear the exception bit) doesn't match the pending request is
    /// silently dropped — the master stays `Awaiting` (spec.md §4.3, §8:
    /// "never completes the pending request").
    ///
    /// Decodes register payloads into `registers_out` when applicable.
    /// Transitions to `Completed` only on a correlated response.
    pub fn on_response(&mut self, response: &[u8], registers_out: &mut [u16]) {
        if !matches!(self.state, State::Awaiting { .. }) || response.is_empty() {
            return;
        }

        let raw_function = response[0];
        if raw_function & 0x7F != self.function.code() {
            return;
        }

        if raw_function & 0x80 != 0 {
            let code = match response.get(1) {
                Some(0x01) => ExceptionCode::IllegalFunction,
                Some(0x02) => ExceptionCode::IllegalDataAddress,
                Some(0x03) => ExceptionCode::IllegalDataValue,
                _ => ExceptionCode::ServerDeviceFailure,
            };
            self.state = State::Completed(Err(CompletionError::Exception(code)));
            return;
        }

        let result = match self.decode {
            Decode::Echo => Ok(Outcome::Written),
            Decode::Registers(requested_quantity) => match response.get(1) {
                None => Err(CompletionError::Malformed),
                Some(&byte_count) => {
                    let byte_count = byte_count as usize;
                    if response.len() < 2 + byte_count
                        || byte_count % 2 != 0
                        || byte_count != requested_quantity as usize * 2
                    {
                        Err(CompletionError::Malformed)
                    } else {
                        let count = byte_count / 2;
                        if count > registers_out.len() {
                            Err(CompletionError::OutputTooSmall)
                        } else {
                            for i in 0..count {
                                registers_out[i] = read_u16(response, 2 + i * 2);
                            }
                            Ok(Outcome::Registers(count))
                        }
                    }
                }
            },
        };
        self.state = State::Completed(result);
    }

    /// Take the completed result, resetting to `Idle`. Returns `None` if
    /// the request is still pending.
    pub fn take_result(&mut self) -> Option<Result<Outcome, CompletionError>> {
        match self.state {
            State::Completed(result) => {
                self.state = State::Idle;
                Some(result)
            }
            _ => None,
        }
    }

    /// Force an immediate failure completion from any non-`Idle` state.
    /// Used by the gateway when a request can't even be dispatched (no
    /// route to the target slave-id) — there is no response to wait for.
    pub fn fail(&mut self, error: CompletionError) {
        if !matches!(self.state, State::Idle) {
            self.state = State::Completed(Err(error));
        }
    }

    /// Look at the completed result without consuming it or resetting to
    /// `Idle`. The gateway uses this to decide whether a register buffer
    /// needs copying out before it calls [`Master::take_result`].
    pub fn peek_result(&self) -> Option<Result<Outcome, CompletionError>> {
        match self.state {
            State::Completed(result) => Some(result),
            _ => None,
        }
    }
}

impl<C: Clock> Default for Master<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_support::FakeClock;
    use embedded_time::duration::Milliseconds;

    #[test]
    fn read_holding_registers_round_trip() {
        let clock = FakeClock::new();
        let mut master: Master<FakeClock> = Master::new();
        let mut request = [0u8; 8];
        let len = master.read_holding_registers(0x0006, 2, &mut request);
        assert_eq!(len, 5);
        assert_eq!(&request[..5], &[0x03, 0x00, 0x06, 0x00, 0x02]);

        master.on_sent(&clock, Milliseconds(1000u32));

        let response = [0x03u8, 0x04, 0x00, 0x0A, 0x00, 0x0B];
        let mut registers = [0u16; 4];
        master.on_response(&response, &mut registers);

        match master.take_result() {
            Some(Ok(Outcome::Registers(2))) => {
                assert_eq!(&registers[..2], &[0x000A, 0x000B]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn exception_response_is_reported() {
        let clock = FakeClock::new();
        let mut master: Master<FakeClock> = Master::new();
        let mut request = [0u8; 8];
        master.read_holding_registers(0x0000, 1, &mut request);
        master.on_sent(&clock, Milliseconds(1000u32));

        let response = [0x83u8, 0x02];
        let mut registers = [0u16; 4];
        master.on_response(&response, &mut registers);

        assert_eq!(
            master.take_result(),
            Some(Err(CompletionError::Exception(ExceptionCode::IllegalDataAddress)))
        );
    }

    #[test]
    fn write_single_register_echo_completes_as_written() {
        let clock = FakeClock::new();
        let mut master: Master<FakeClock> = Master::new();
        let mut request = [0u8; 8];
        master.write_single_register(0x0005, 0x1234, &mut request);
        master.on_sent(&clock, Milliseconds(1000u32));

        let response = [0x06u8, 0x00, 0x05, 0x12, 0x34];
        let mut registers = [0u16; 4];
        master.on_response(&response, &mut registers);

        assert_eq!(master.take_result(), Some(Ok(Outcome::Written)));
    }

    #[test]
    fn timeout_elapses_without_a_response() {
        let clock = FakeClock::new();
        let mut master: Master<FakeClock> = Master::new();
        let mut request = [0u8; 8];
        master.read_holding_registers(0x0000, 1, &mut request);
        master.on_sent(&clock, Milliseconds(100u32));

        master.poll_timeout(&clock);
        assert!(master.take_result().is_none());

        clock.advance(200);
        master.poll_timeout(&clock);
        assert_eq!(master.take_result(), Some(Err(CompletionError::Timeout)));
    }

    #[test]
    fn mismatched_function_is_dropped_and_stays_awaiting() {
        let clock = FakeClock::new();
        let mut master: Master<FakeClock> = Master::new();
        let mut request = [0u8; 8];
        master.read_holding_registers(0x0000, 1, &mut request);
        master.on_sent(&clock, Milliseconds(1000u32));

        // A response for function 0x04 while this master is awaiting 0x03.
        let response = [0x04u8, 0x02, 0x00, 0x01];
        let mut registers = [0u16; 4];
        master.on_response(&response, &mut registers);
        assert!(master.take_result().is_none());

        // The real response now arrives and completes the request normally.
        let response = [0x03u8, 0x02, 0x00, 0x2A];
        master.on_response(&response, &mut registers);
        match master.take_result() {
            Some(Ok(Outcome::Registers(1))) => assert_eq!(registers[0], 0x002A),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
