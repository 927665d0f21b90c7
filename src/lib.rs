//! Transfer queues and control request dispatch for USB device controllers
//!
//! `usbd-queue` manages the transfer descriptors (TDs) of a ChipIdea-style
//! USB device controller, like the ones found in i.MX RT and LPC43xx
//! processors. Each endpoint owns a fixed pool of TDs. You schedule
//! transfers into the pool, the controller executes them in order, and the
//! USB interrupt hands finished transfers back to your callbacks. Control
//! endpoints get a small dispatcher that routes SETUP, DATA, and STATUS
//! stages to per-request-type handlers.
//!
//! The crate never touches controller registers. Provide a [`Hardware`]
//! implementation to prime endpoints, stall, and mask the USB interrupt.
//! See [`Device`] for a complete setup.
//!
//! # Features
//!
//! - `defmt-03` logs queue and control activity with `defmt` 0.3.
//! - `dcache` cleans and invalidates TDs from the Cortex-M7 data cache.

#![no_std]

#[macro_use]
mod log;

mod cache;
mod control;
mod device;
mod hardware;
mod queue;
mod ral;
mod state;
mod td;
mod vcell;

#[cfg(test)]
mod mock;

pub use control::{RequestHandler, RequestHandlers, RequestStatus, SetupPacket, Stage};
pub use device::{Device, QueryError};
pub use hardware::Hardware;
pub use queue::{Callback, Completion, TransferPool};
pub use state::MAX_ENDPOINTS;
pub use td::{Status, Td, MAX_TRANSFER_LEN};
