//! The controller-facing side of the queues
//!
//! This crate never touches controller registers. Priming endpoints,
//! extending descriptor chains, stalling, and masking the USB interrupt
//! are delegated to a [`Hardware`] implementation.

use crate::td::{Status, Td};
use usb_device::endpoint::EndpointAddress;

/// Register-level operations on a USB device controller
///
/// An implementation is expected to own the controller registers for one
/// USB instance. It's invoked from both the foreground and from the USB
/// interrupt handler.
///
/// # Interrupt masking
///
/// [`mask_interrupt()`](Hardware::mask_interrupt) and
/// [`unmask_interrupt()`](Hardware::unmask_interrupt) guard list updates
/// that race with transfer completion. Mask the one interrupt that drives
/// [`on_transfer_complete()`](crate::Device::on_transfer_complete); there's
/// no need to disable all interrupts.
///
/// ```no_run
/// use cortex_m::peripheral::NVIC;
/// # #[derive(Clone, Copy)] struct Irq;
/// # unsafe impl cortex_m::interrupt::InterruptNumber for Irq { fn number(self) -> u16 { 8 } }
/// # const USB0: Irq = Irq;
///
/// fn mask_interrupt() -> bool {
///     let unmasked = NVIC::is_enabled(USB0);
///     NVIC::mask(USB0);
///     unmasked
/// }
///
/// fn unmask_interrupt() {
///     // Safety: only re-enables what mask_interrupt() disabled.
///     unsafe { NVIC::unmask(USB0) };
/// }
/// ```
pub trait Hardware {
    /// Prime `endpoint` with `td`
    ///
    /// Called when the endpoint had no active transfers; the controller
    /// should start processing `td` immediately.
    fn schedule_wait(&self, endpoint: EndpointAddress, td: &Td);

    /// Link `td` behind `tail` in a chain that the controller may still be
    /// walking
    ///
    /// Use [`Td::set_next()`] to link the descriptors, then handle the
    /// add-TD tripwire (or re-prime) as the controller requires.
    fn schedule_append(&self, endpoint: EndpointAddress, tail: &Td, td: &Td);

    /// Stall `endpoint` to signal a request error
    fn stall(&self, endpoint: EndpointAddress);

    /// The controller gave up on a transfer on `endpoint`
    ///
    /// `status` has at least one error bit set. Called once per failed
    /// transfer while reclaiming it, before the transfer's callback runs, and
    /// even if the transfer has no callback. The controller usually halts the
    /// endpoint; decide here how to recover.
    fn transfer_error(&self, endpoint: EndpointAddress, status: Status);

    /// Called while [`schedule_block()`](crate::Device::schedule_block) waits
    /// for a transfer on `endpoint` to free up
    ///
    /// The default implementation hints that we're spinning.
    fn wait_for_transfer(&self, endpoint: EndpointAddress) {
        let _ = endpoint;
        core::hint::spin_loop();
    }

    /// Mask the interrupt that signals transfer completion
    ///
    /// Returns `true` if the interrupt was unmasked before the call.
    fn mask_interrupt(&self) -> bool;

    /// Unmask the interrupt that signals transfer completion
    fn unmask_interrupt(&self);
}

/// Run `f` while the completion interrupt is masked
///
/// Nests: the interrupt is only unmasked on exit if it was unmasked on entry.
/// When called from the completion interrupt itself, this masks nothing that
/// could preempt us, and leaves the mask alone on exit.
pub(crate) fn masked<H: Hardware + ?Sized, R>(hw: &H, f: impl FnOnce() -> R) -> R {
    let unmasked = hw.mask_interrupt();
    let result = f();
    if unmasked {
        hw.unmask_interrupt();
    }
    result
}
