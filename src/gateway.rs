//! Gateway router: multiplexes N transports, M slaves and K masters by
//! slave-id (spec.md §4.5). A single `slave_id -> Route` map is shared by
//! both halves of the job: routing an inbound request (from a transport in
//! `AsciiSlave` mode) to whichever slave handles it, and routing an
//! outbound master request to whichever transport reaches that slave-id.
//! When both ends of a request live on the same gateway, the PDU never
//! touches a transport at all (spec.md §4.5's short-circuit path).

use embedded_time::duration::Milliseconds;
use embedded_time::Clock;

use crate::ascii;
use crate::device::ByteDevice;
use crate::handle::{Pool, PoolExhausted};
use crate::master::{CompletionError, Master, Outcome};
use crate::pdu::{ExceptionCode, MAX_PDU_LEN, SLAVE_ID_BROADCAST, SLAVE_ID_MAX, SLAVE_ID_MIN};
use crate::slave::{self, CommandTable};
use crate::transport::{AsciiTransport, Mode, TransportPool};

/// One byte-oriented ADU: slave-id followed by PDU.
const ADU_MAX: usize = 1 + MAX_PDU_LEN;

/// Largest register count a single read can return (spec.md §3: 0x03/0x04
/// cap at 125, 0x17's read side at the same limit).
const MAX_REGISTERS: usize = 125;

/// Distinguished "exception code" surfaced to [`OnComplete`] when a master
/// request times out, or is submitted for a slave-id with no route at all.
/// Not a real Modbus exception code (spec.md §7 correlation level:
/// "surfaced to the user callback with a distinguished exception code").
pub const TIMEOUT_EXCEPTION: u8 = 0xFF;

/// Completion callback fired from a master's tick (spec.md §6:
/// `on_complete(slave_id, function, exception_code)`, `0` on success).
pub type OnComplete = fn(slave_id: u8, function: u8, exception_code: u8);

/// Where a registered slave-id is reachable: hosted locally on this
/// gateway, or only reachable by forwarding over a transport. Stored as a
/// plain integer handle, never an owning pointer (spec.md §9's "cyclic
/// references" note / `SPEC_FULL.md`'s "handles, never owning pointers").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(not(test), derive(defmt::Format))]
pub enum Route {
    Local(usize),
    Remote(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(not(test), derive(defmt::Format))]
pub enum RouteError {
    /// No such master/slave/transport handle is open.
    NoRoute,
    /// The handle pool backing this registration is full.
    PoolExhausted,
    /// The master handle already has a request in flight.
    Busy,
    /// `slave_id` is outside `1..=247` (0 is broadcast, 248..=255 reserved).
    InvalidSlaveId,
}

impl From<PoolExhausted> for RouteError {
    fn from(_: PoolExhausted) -> Self {
        RouteError::PoolExhausted
    }
}

struct SlaveEntry<const CMDS: usize> {
    id: u8,
    table: CommandTable<CMDS>,
}

fn noop_on_complete(_slave_id: u8, _function: u8, _exception_code: u8) {}

struct MasterEntry<C: Clock> {
    master: Master<C>,
    target_slave_id: u8,
    timeout: Milliseconds<u32>,
    on_complete: OnComplete,
    pdu: heapless::Vec<u8, MAX_PDU_LEN>,
    registers: heapless::Vec<u16, MAX_REGISTERS>,
}

impl<C: Clock> MasterEntry<C> {
    fn new() -> Self {
        Self {
            master: Master::new(),
            target_slave_id: 0,
            timeout: Milliseconds(0u32),
            on_complete: noop_on_complete,
            pdu: heapless::Vec::new(),
            registers: heapless::Vec::new(),
        }
    }
}

/// The gateway: a fixed-capacity pool of open ASCII transports, locally
/// hosted slaves, and master handles, plus the slave-id route map that
/// ties them together. `SLAVES`/`MASTERS`/`CMDS`/`ASCII`/`RTU`/`TCP` are
/// the compile-time pool capacities from spec.md §6's configuration knobs
/// (`TOTAL_SLAVES`, `TOTAL_MASTERS`, `TOTAL_TRANSPORT_*`), modeled as const
/// generics per `SPEC_FULL.md` §2; `CMDS` additionally bounds how many
/// address-range handlers each function code on a locally hosted slave may
/// have configured.
pub struct Gateway<
    D: ByteDevice,
    C: Clock,
    const SLAVES: usize,
    const MASTERS: usize,
    const CMDS: usize,
    const ASCII: usize,
    const RTU: usize,
    const TCP: usize,
> {
    transports: TransportPool<D, ASCII, RTU, TCP>,
    slaves: Pool<SlaveEntry<CMDS>, SLAVES>,
    masters: Pool<MasterEntry<C>, MASTERS>,
    routes: [Option<Route>; 256],
}

impl<
        D: ByteDevice,
        C: Clock,
        const SLAVES: usize,
        const MASTERS: usize,
        const CMDS: usize,
        const ASCII: usize,
        const RTU: usize,
        const TCP: usize,
    > Default for Gateway<D, C, SLAVES, MASTERS, CMDS, ASCII, RTU, TCP>
{
    fn default() -> Self {
        Self {
            transports: TransportPool::default(),
            slaves: Pool::default(),
            masters: Pool::default(),
            routes: [None; 256],
        }
    }
}

impl<
        D: ByteDevice,
        C: Clock,
        const SLAVES: usize,
        const MASTERS: usize,
        const CMDS: usize,
        const ASCII: usize,
        const RTU: usize,
        const TCP: usize,
    > Gateway<D, C, SLAVES, MASTERS, CMDS, ASCII, RTU, TCP>
{
    pub fn new() -> Self {
        Self::default()
    }

    // -- registration -----------------------------------------------------

    pub fn add_transport(&mut self, device: D, mode: Mode) -> Result<usize, PoolExhausted> {
        self.transports.open(device, mode)
    }

    pub fn remove_transport(&mut self, handle: usize) {
        self.transports.close(handle);
    }

    pub fn transport(&self, handle: usize) -> Option<&AsciiTransport<D>> {
        self.transports.get(handle)
    }

    pub fn transport_mut(&mut self, handle: usize) -> Option<&mut AsciiTransport<D>> {
        self.transports.get_mut(handle)
    }

    /// Host `slave_id` locally on this gateway, dispatched through the
    /// slave engine against `table`. Requests for `slave_id` arriving on
    /// any transport, or submitted by a master on this same gateway, are
    /// handled without ever leaving the gateway.
    pub fn add_slave(&mut self, slave_id: u8, table: CommandTable<CMDS>) -> Result<usize, RouteError> {
        if !(SLAVE_ID_MIN..=SLAVE_ID_MAX).contains(&slave_id) {
            return Err(RouteError::InvalidSlaveId);
        }
        let handle = self.slaves.open(SlaveEntry { id: slave_id, table })?;
        self.routes[slave_id as usize] = Some(Route::Local(handle));
        Ok(handle)
    }

    pub fn remove_slave(&mut self, handle: usize) {
        if let Some(entry) = self.slaves.get(handle) {
            let id = entry.id;
            if self.routes[id as usize] == Some(Route::Local(handle)) {
                self.routes[id as usize] = None;
            }
        }
        self.slaves.close(handle);
    }

    /// Register `slave_id` as reachable through `transport_handle` instead
    /// of locally: inbound requests for it on any other transport are
    /// forwarded there, and masters on this gateway send to it there.
    pub fn add_remote_slave(&mut self, slave_id: u8, transport_handle: usize) -> Result<(), RouteError> {
        if !(SLAVE_ID_MIN..=SLAVE_ID_MAX).contains(&slave_id) {
            return Err(RouteError::InvalidSlaveId);
        }
        self.routes[slave_id as usize] = Some(Route::Remote(transport_handle));
        Ok(())
    }

    pub fn remove_route(&mut self, slave_id: u8) {
        self.routes[slave_id as usize] = None;
    }

    pub fn add_master(&mut self) -> Result<usize, PoolExhausted> {
        self.masters.open(MasterEntry::new())
    }

    pub fn remove_master(&mut self, handle: usize) {
        self.masters.close(handle);
    }

    /// Registers decoded from the most recently completed read this
    /// master performed. Valid to read once `on_complete` has fired with
    /// exception code `0` for a register-read request.
    pub fn master_registers(&self, handle: usize) -> &[u16] {
        self.masters
            .get(handle)
            .map(|e| e.registers.as_slice())
            .unwrap_or(&[])
    }

    // -- master request builders -------------------------------------------

    fn start_request<F>(
        &mut self,
        master: usize,
        slave_id: u8,
        timeout: Milliseconds<u32>,
        on_complete: OnComplete,
        build: F,
    ) -> Result<(), RouteError>
    where
        F: FnOnce(&mut Master<C>, &mut [u8]) -> usize,
    {
        let entry = self.masters.get_mut(master).ok_or(RouteError::NoRoute)?;
        if !entry.master.is_idle() {
            return Err(RouteError::Busy);
        }
        let mut buf = [0u8; MAX_PDU_LEN];
        let len = build(&mut entry.master, &mut buf);
        entry.pdu.clear();
        entry
            .pdu
            .extend_from_slice(&buf[..len])
            .map_err(|_| RouteError::NoRoute)?;
        entry.target_slave_id = slave_id;
        entry.timeout = timeout;
        entry.on_complete = on_complete;
        entry.registers.clear();
        Ok(())
    }

    pub fn master_read_holding_registers(
        &mut self,
        master: usize,
        slave_id: u8,
        start: u16,
        quantity: u16,
        timeout: Milliseconds<u32>,
        on_complete: OnComplete,
    ) -> Result<(), RouteError> {
        self.start_request(master, slave_id, timeout, on_complete, |m, buf| {
            m.read_holding_registers(start, quantity, buf)
        })
    }

    pub fn master_read_input_registers(
        &mut self,
        master: usize,
        slave_id: u8,
        start: u16,
        quantity: u16,
        timeout: Milliseconds<u32>,
        on_complete: OnComplete,
    ) -> Result<(), RouteError> {
        self.start_request(master, slave_id, timeout, on_complete, |m, buf| {
            m.read_input_registers(start, quantity, buf)
        })
    }

    pub fn master_write_single_register(
        &mut self,
        master: usize,
        slave_id: u8,
        address: u16,
        value: u16,
        timeout: Milliseconds<u32>,
        on_complete: OnComplete,
    ) -> Result<(), RouteError> {
        self.start_request(master, slave_id, timeout, on_complete, |m, buf| {
            m.write_single_register(address, value, buf)
        })
    }

    pub fn master_write_multiple_registers(
        &mut self,
        master: usize,
        slave_id: u8,
        start: u16,
        values: &[u16],
        timeout: Milliseconds<u32>,
        on_complete: OnComplete,
    ) -> Result<(), RouteError> {
        self.start_request(master, slave_id, timeout, on_complete, |m, buf| {
            m.write_multiple_registers(start, values, buf)
        })
    }

    // -- slave engine dispatch ---------------------------------------------

    /// Run the slave engine for `slave_handle` against `pdu`, returning the
    /// encoded response PDU. `None` if the handle has since been closed.
    fn run_slave(&self, slave_handle: usize, pdu: &[u8]) -> Option<heapless::Vec<u8, MAX_PDU_LEN>> {
        let entry = self.slaves.get(slave_handle)?;
        let mut response = [0u8; MAX_PDU_LEN];
        let len = slave::dispatch(pdu, &entry.table, &mut response);
        let mut out = heapless::Vec::new();
        out.extend_from_slice(&response[..len]).ok();
        Some(out)
    }

    // -- main task ----------------------------------------------------------

    /// One tick: drive every open transport's I/O, route any inbound ADU,
    /// and advance every master's state machine by at most one event
    /// (spec.md §4.5 / §9's "`tick()` advances state by at most one event").
    pub fn main_task(&mut self, clock: &C)
    where
        embedded_time::Instant<C>: core::ops::Add<Milliseconds<u32>, Output = embedded_time::Instant<C>>,
    {
        self.drive_transports();
        for handle in 0..MASTERS {
            self.tick_master(handle, clock);
        }
    }

    fn drive_transports(&mut self) {
        for handle in 0..ASCII {
            let mode = match self.transports.get(handle) {
                Some(t) => t.mode(),
                None => continue,
            };
            if let Some(transport) = self.transports.get_mut(handle) {
                let _ = transport.task();
            }
            let mut buf = [0u8; ascii::MAX_RAW_LEN];
            let received = self
                .transports
                .get_mut(handle)
                .and_then(|t| t.poll_recv(&mut buf));
            let Some(len) = received else { continue };
            if len == 0 {
                continue;
            }
            let slave_id = buf[0];
            let pdu_len = len - 1;
            let mut pdu = [0u8; MAX_PDU_LEN];
            pdu[..pdu_len].copy_from_slice(&buf[1..len]);

            match mode {
                Mode::AsciiSlave => self.handle_inbound_request(handle, slave_id, &pdu[..pdu_len]),
                Mode::AsciiMaster => self.handle_inbound_response(slave_id, &pdu[..pdu_len]),
                _ => {}
            }
        }
    }

    /// A request ADU arrived on `arrival_transport` for `slave_id`. Route
    /// it to a local slave (answering back over the same transport it
    /// arrived on) or forward it to the transport that owns it remotely.
    fn handle_inbound_request(&mut self, arrival_transport: usize, slave_id: u8, pdu: &[u8]) {
        if slave_id == SLAVE_ID_BROADCAST {
            self.handle_broadcast(pdu);
            return;
        }

        match self.routes[slave_id as usize] {
            Some(Route::Local(slave_handle)) => {
                if let Some(response) = self.run_slave(slave_handle, pdu) {
                    let mut adu = heapless::Vec::<u8, ADU_MAX>::new();
                    adu.push(slave_id).ok();
                    adu.extend_from_slice(&response).ok();
                    if let Some(t) = self.transports.get_mut(arrival_transport) {
                        let _ = t.send(&adu);
                    }
                }
            }
            Some(Route::Remote(dest_transport)) if dest_transport != arrival_transport => {
                #[cfg(not(test))]
                defmt::debug!(
                    "gateway: forwarding request for slave {} from transport {} to transport {}",
                    slave_id,
                    arrival_transport,
                    dest_transport
                );
                let mut adu = heapless::Vec::<u8, ADU_MAX>::new();
                adu.push(slave_id).ok();
                adu.extend_from_slice(pdu).ok();
                if let Some(t) = self.transports.get_mut(dest_transport) {
                    let _ = t.send(&adu);
                }
            }
            Some(Route::Remote(_)) => {
                // Routed back to the transport it arrived on: nothing to do.
            }
            None => {
                #[cfg(not(test))]
                defmt::debug!("gateway: no route for slave {}", slave_id);
            }
        }
    }

    /// Broadcast (slave-id 0): dispatched to every locally hosted slave for
    /// a write function, with no reply sent (spec.md §9's Open Question,
    /// resolved per `SPEC_FULL.md` §4.5). Reads are meaningless as a
    /// broadcast (no single requester to answer) and are dropped before
    /// ever reaching the slave engine.
    fn handle_broadcast(&mut self, pdu: &[u8]) {
        let Some(&raw_function) = pdu.first() else {
            return;
        };
        let is_write = matches!(raw_function, 0x05 | 0x06 | 0x0F | 0x10);
        if !is_write {
            return;
        }
        let handles: heapless::Vec<usize, SLAVES> = self.slaves.iter().map(|(h, _)| h).collect();
        for handle in handles {
            self.run_slave(handle, pdu);
        }
    }

    /// A response ADU arrived on a transport in `AsciiMaster` mode.
    /// Correlate it to the (at most one) master handle awaiting a response
    /// from `slave_id` for this function code; anything else is dropped,
    /// never queued (spec.md §5's ordering guarantee, §8's correlation
    /// law).
    fn handle_inbound_response(&mut self, slave_id: u8, pdu: &[u8]) {
        let Some(&raw_function) = pdu.first() else {
            return;
        };
        for handle in 0..MASTERS {
            let eligible = matches!(
                self.masters.get(handle),
                Some(entry)
                    if entry.master.is_awaiting()
                        && entry.target_slave_id == slave_id
                        && (raw_function & 0x7F) == entry.master.function_code()
            );
            if eligible {
                self.feed_response(handle, pdu);
                return;
            }
        }
        #[cfg(not(test))]
        defmt::debug!("gateway: response from slave {} matched no pending master", slave_id);
    }

    fn feed_response(&mut self, handle: usize, response: &[u8]) {
        let mut registers = [0u16; MAX_REGISTERS];
        if let Some(entry) = self.masters.get_mut(handle) {
            entry.master.on_response(response, &mut registers);
            if let Some(Ok(Outcome::Registers(n))) = entry.master.peek_result() {
                entry.registers.clear();
                entry.registers.extend_from_slice(&registers[..n]).ok();
            }
        }
    }

    fn tick_master(&mut self, handle: usize, clock: &C)
    where
        embedded_time::Instant<C>: core::ops::Add<Milliseconds<u32>, Output = embedded_time::Instant<C>>,
    {
        if matches!(self.masters.get(handle), Some(e) if e.master.is_requested()) {
            self.dispatch_master_request(handle, clock);
        }
        if let Some(entry) = self.masters.get_mut(handle) {
            entry.master.poll_timeout(clock);
        }
        self.finish_if_completed(handle);
    }

    /// A master handle just built a request PDU (state `Requested`). Look
    /// up its target slave-id in the shared route map: a local route is
    /// served synchronously with no transport involved at all; a remote
    /// route gets the ADU handed to that transport's send queue (retried
    /// next tick on backpressure, spec.md §5); no route at all fails the
    /// request immediately, there being nowhere to send it.
    fn dispatch_master_request(&mut self, handle: usize, clock: &C)
    where
        embedded_time::Instant<C>: core::ops::Add<Milliseconds<u32>, Output = embedded_time::Instant<C>>,
    {
        let (slave_id, pdu) = match self.masters.get(handle) {
            Some(entry) => (entry.target_slave_id, entry.pdu.clone()),
            None => return,
        };

        match self.routes[slave_id as usize] {
            Some(Route::Local(slave_handle)) => {
                let response = self.run_slave(slave_handle, &pdu);
                if let Some(entry) = self.masters.get_mut(handle) {
                    let timeout = entry.timeout;
                    entry.master.on_sent(clock, timeout);
                }
                if let Some(response) = response {
                    self.feed_response(handle, &response);
                }
            }
            Some(Route::Remote(transport_handle)) => {
                let mut adu = heapless::Vec::<u8, ADU_MAX>::new();
                adu.push(slave_id).ok();
                adu.extend_from_slice(&pdu).ok();
                let sent = match self.transports.get_mut(transport_handle) {
                    Some(t) => t.send(&adu),
                    None => Err(crate::transport::SendBufferFull),
                };
                if sent.is_ok() {
                    if let Some(entry) = self.masters.get_mut(handle) {
                        let timeout = entry.timeout;
                        entry.master.on_sent(clock, timeout);
                    }
                }
                // else: leave `Requested`, retry on the next tick.
            }
            None => {
                if let Some(entry) = self.masters.get_mut(handle) {
                    entry.master.fail(CompletionError::Timeout);
                }
            }
        }
    }

    fn finish_if_completed(&mut self, handle: usize) {
        let (result, on_complete, slave_id, function) = match self.masters.get_mut(handle) {
            Some(entry) => match entry.master.take_result() {
                Some(result) => (result, entry.on_complete, entry.target_slave_id, entry.master.function_code()),
                None => return,
            },
            None => return,
        };
        let exception_code = match result {
            Ok(_) => 0,
            Err(CompletionError::Timeout) => TIMEOUT_EXCEPTION,
            Err(CompletionError::Exception(code)) => code.code(),
            Err(CompletionError::Malformed) | Err(CompletionError::OutputTooSmall) => {
                ExceptionCode::ServerDeviceFailure.code()
            }
        };
        on_complete(slave_id, function, exception_code);
    }
}
