//! Transport registry: a fixed-capacity pool of open transports, keyed by
//! mode (spec.md §4.4). Only the ASCII mode is actually backed by framing
//! logic; RTU and TCP exist as reserved enumerators with zero default pool
//! capacity, so opening one always fails with [`handle::PoolExhausted`]
//! (see `SPEC_FULL.md` §4.4/§9 for the rationale).

use heapless::Vec;

use crate::ascii;
use crate::device::ByteDevice;
use crate::handle::{Pool, PoolExhausted};

/// The wire framing a transport speaks. Only `Ascii` is implemented; `Rtu`
/// and `Tcp` are reserved so callers can name a mode without the engine
/// ever accepting a request to actually open one (see module docs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(not(test), derive(defmt::Format))]
pub enum Mode {
    AsciiMaster,
    AsciiSlave,
    RtuMaster,
    RtuSlave,
    TcpMaster,
    TcpSlave,
}

impl Mode {
    fn family(self) -> Family {
        match self {
            Mode::AsciiMaster | Mode::AsciiSlave => Family::Ascii,
            Mode::RtuMaster | Mode::RtuSlave => Family::Rtu,
            Mode::TcpMaster | Mode::TcpSlave => Family::Tcp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Ascii,
    Rtu,
    Tcp,
}

/// Longest an encoded ASCII frame can be: `2 * MAX_RAW_LEN + 4`.
const MAX_FRAME_LEN: usize = ascii::MAX_RAW_LEN * 2 + 4;

/// `send` was called while a previous frame is still draining through
/// [`AsciiTransport::task`]. The caller must retry on its next tick, per
/// spec.md §5's backpressure contract — never block waiting for room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(not(test), derive(defmt::Format))]
pub struct SendBufferFull;

/// An open ASCII transport: a byte device plus its framing state.
pub struct AsciiTransport<D: ByteDevice> {
    device: D,
    mode: Mode,
    decoder: ascii::Decoder,
    /// Bytes of the current outbound frame not yet handed to the device.
    /// Draining this, a few bytes at a time, is [`AsciiTransport::task`]'s
    /// job — spec.md §4.4's "exposes `task(h)`" and §5's non-blocking
    /// write discipline.
    out: heapless::Deque<u8, MAX_FRAME_LEN>,
}

impl<D: ByteDevice> AsciiTransport<D> {
    fn new(device: D, mode: Mode) -> Self {
        Self {
            device,
            mode,
            decoder: ascii::Decoder::new(),
            out: heapless::Deque::new(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Direct access to the underlying device, for tests that need to
    /// inject bytes as if they arrived over the wire (bypassing `send`'s
    /// own ASCII encoding).
    #[cfg(test)]
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Drive the receive side: pull any bytes currently available from the
    /// device into the framing decoder. Returns `Some(pdu_len)` once a
    /// complete, validated frame lands in `pdu_out` (slave-id stripped by
    /// the caller, per spec.md §3 — this returns the raw decoded payload,
    /// slave-id still at `pdu_out[0]`). Returns `None` when no complete
    /// frame is ready yet; malformed frames are silently dropped and the
    /// decoder resyncs, matching spec.md §4.1's framing contract.
    ///
    /// `pdu_out` must be at least [`ascii::MAX_RAW_LEN`] bytes.
    pub fn poll_recv(&mut self, pdu_out: &mut [u8]) -> Option<usize> {
        loop {
            let byte = match embedded_hal::serial::Read::read(&mut self.device) {
                Ok(b) => b,
                Err(nb::Error::WouldBlock) => return None,
                Err(nb::Error::Other(_)) => continue,
            };
            match self.decoder.feed(byte, pdu_out) {
                None => continue,
                Some(Ok(len)) => return Some(len),
                Some(Err(_)) => continue,
            }
        }
    }

    /// Encode `payload` (slave-id byte included, per spec.md §3) as an
    /// ASCII frame and enqueue it for [`AsciiTransport::task`] to write out.
    /// Rejects a new frame while the previous one is still draining, rather
    /// than blocking — the caller retries on its next tick.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), SendBufferFull> {
        if !self.out.is_empty() {
            return Err(SendBufferFull);
        }
        let mut frame = [0u8; MAX_FRAME_LEN];
        let len = ascii::encode(payload, &mut frame);
        for &b in &frame[..len] {
            self.out.push_back(b).map_err(|_| SendBufferFull)?;
        }
        Ok(())
    }

    /// Write out as much of the pending outbound frame as the device
    /// accepts without blocking. Called once per gateway tick for every
    /// open transport (spec.md §4.5 step 1: "poll each transport's task to
    /// drive any pending I/O"). Returns `Err` only on a hard device error;
    /// `WouldBlock` just leaves the remainder queued for the next call.
    pub fn task(&mut self) -> Result<(), <D as embedded_hal::serial::Write<u8>>::Error> {
        while let Some(&b) = self.out.front() {
            match embedded_hal::serial::Write::write(&mut self.device, b) {
                Ok(()) => {
                    self.out.pop_front();
                }
                Err(nb::Error::WouldBlock) => return Ok(()),
                Err(nb::Error::Other(e)) => return Err(e),
            }
        }
        match embedded_hal::serial::Write::flush(&mut self.device) {
            Ok(()) | Err(nb::Error::WouldBlock) => Ok(()),
            Err(nb::Error::Other(e)) => Err(e),
        }
    }
}

/// The transport registry: one sub-pool per mode family. `ASCII`, `RTU`
/// and `TCP` are the compile-time capacities of each family's sub-pool
/// (spec.md §4.4's "TOTAL_TRANSPORT_*" configuration knobs, here modeled
/// as const generics per `SPEC_FULL.md` §2).
pub struct TransportPool<D: ByteDevice, const ASCII: usize, const RTU: usize, const TCP: usize> {
    ascii: Pool<AsciiTransport<D>, ASCII>,
    // RTU/TCP have no transport type yet (Non-goal); `RTU`/`TCP` name the
    // configured sub-pool capacities (`TOTAL_TRANSPORT_RTU`/`_TCP`,
    // defaulting to `0`) without backing an actual pool, since `open`
    // always rejects those families regardless of configured capacity.
    _rtu_capacity: core::marker::PhantomData<[(); RTU]>,
    _tcp_capacity: core::marker::PhantomData<[(); TCP]>,
}

impl<D: ByteDevice, const ASCII: usize, const RTU: usize, const TCP: usize> Default
    for TransportPool<D, ASCII, RTU, TCP>
{
    fn default() -> Self {
        Self {
            ascii: Pool::default(),
            _rtu_capacity: core::marker::PhantomData,
            _tcp_capacity: core::marker::PhantomData,
        }
    }
}

impl<D: ByteDevice, const ASCII: usize, const RTU: usize, const TCP: usize>
    TransportPool<D, ASCII, RTU, TCP>
{
    /// Open a transport on `device` in `mode`. RTU and TCP modes always
    /// fail with `PoolExhausted`: neither framing is implemented (see
    /// module docs), independent of the configured `RTU`/`TCP` capacity.
    pub fn open(&mut self, device: D, mode: Mode) -> Result<usize, PoolExhausted> {
        let result = match mode.family() {
            Family::Ascii => self.ascii.open(AsciiTransport::new(device, mode)),
            Family::Rtu | Family::Tcp => Err(PoolExhausted),
        };
        #[cfg(not(test))]
        if result.is_err() {
            defmt::warn!("transport pool exhausted opening mode {}", mode as u8);
        }
        result
    }

    pub fn close(&mut self, handle: usize) {
        self.ascii.close(handle);
    }

    pub fn get_mut(&mut self, handle: usize) -> Option<&mut AsciiTransport<D>> {
        self.ascii.get_mut(handle)
    }

    pub fn get(&self, handle: usize) -> Option<&AsciiTransport<D>> {
        self.ascii.get(handle)
    }

    /// Iterate over every open ASCII transport's handle, in ascending
    /// order — the order the gateway's main task polls transports in.
    pub fn iter_ascii(&self) -> impl Iterator<Item = (usize, &AsciiTransport<D>)> {
        self.ascii.iter()
    }

    pub fn iter_ascii_mut(&mut self) -> impl Iterator<Item = (usize, &mut AsciiTransport<D>)> {
        self.ascii.iter_mut()
    }
}

/// Scratch buffer sized for one decoded ASCII frame payload (slave-id byte
/// plus PDU), as handed to [`AsciiTransport::poll_recv`].
pub type AduBuffer = Vec<u8, { ascii::MAX_RAW_LEN }>;
