//! External collaborators this crate consumes but never implements: the
//! byte-oriented serial device, the RTOS mutual-exclusion primitive, and
//! the monotonic clock used for master deadlines (spec.md §6). Every type
//! in this module is a trait the host application provides; nothing here
//! drives real hardware.

use embedded_hal::serial;
use embedded_time::Clock;

/// A byte-oriented serial device. Reads and writes may be short or return
/// `nb::Error::WouldBlock`; the transport layer retries on its own tick.
/// Bound directly on `embedded_hal`'s non-blocking serial traits rather
/// than a bespoke fd-style interface, since that is how embedded Rust
/// hands a UART to a protocol crate once the host has already opened it.
pub trait ByteDevice: serial::Read<u8> + serial::Write<u8> {}

impl<T> ByteDevice for T where T: serial::Read<u8> + serial::Write<u8> {}

/// Marker type naming the single global resource the spec's `MODBUS_R`
/// lock guards: the handle-allocation tables (transport/slave/master
/// pools) and gateway route-map mutation.
#[derive(Debug, Clone, Copy)]
pub struct ModbusResource;

/// The RTOS/scheduler primitive the spec treats as an external
/// collaborator: resource acquisition and the current task identity.
/// `acquire`/`release` bracket `open`, `close`, and route-map mutation
/// (spec.md §5); they are never held across a blocking device read.
pub trait Scheduler {
    fn acquire(&self, resource: ModbusResource);
    fn release(&self, resource: ModbusResource);
    fn current_task_id(&self) -> u32;
}

/// A no-op scheduler for single-task deployments or tests, where there is
/// no concurrent opener to race against.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleTaskScheduler;

impl Scheduler for SingleTaskScheduler {
    fn acquire(&self, _resource: ModbusResource) {}
    fn release(&self, _resource: ModbusResource) {}
    fn current_task_id(&self) -> u32 {
        0
    }
}

/// The monotonic clock the master engine reads to set and check request
/// deadlines. Re-exported so callers don't need a direct `embedded_time`
/// dependency just to name the bound.
pub trait MonotonicClock: Clock {}
impl<T> MonotonicClock for T where T: Clock {}
