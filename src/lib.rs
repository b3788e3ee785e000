//! Modbus ASCII protocol core.
//!
//! This crate implements the Modbus ASCII serial transport and the PDU
//! engines that sit on top of it: a stateless slave request dispatcher, an
//! asynchronous per-handle master state machine, and a gateway router that
//! multiplexes many transports, slaves and masters by slave-id.
//!
//! Everything is allocation-free: handle pools are fixed-capacity arrays
//! sized by const generics, and buffers are `heapless::Vec`. Modbus RTU and
//! Modbus TCP exist only as reserved [`transport::Mode`] enumerators; this
//! crate frames and unframes ASCII only.
//!
//! ## Layering
//!
//! - [`ascii`] — the byte-stream framer/unframer and LRC.
//! - [`pdu`] — function codes, exception codes, and wire-format helpers.
//! - [`slave`] — request dispatch against application-supplied handlers.
//! - [`master`] — request/response correlation with deadlines.
//! - [`transport`] — the fixed-capacity transport handle pool.
//! - [`gateway`] — routes PDUs between transports, slaves and masters.
//! - [`device`] — the external collaborators (byte device, scheduler, clock).
//! - [`handle`] — the generic fixed-capacity slot allocator the pools share.

#![allow(dead_code)]
#![cfg_attr(not(test), no_std)]

pub mod ascii;
pub mod device;
pub mod gateway;
pub mod handle;
pub mod master;
pub mod pdu;
pub mod slave;
pub mod transport;

pub use pdu::{ExceptionCode, FunctionCode};
