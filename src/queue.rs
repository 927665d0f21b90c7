//! Per-endpoint transfer queues
//!
//! Every endpoint owns a fixed pool of transfers. A transfer is always on
//! exactly one of two intrusive, index-linked lists:
//!
//! - the *free* list, holding transfers available for scheduling, or
//! - the *active* list, holding transfers handed to the controller, in the
//!   order the controller processes them.
//!
//! The foreground schedules transfers, and the USB interrupt reclaims them.
//! The free list is a lock-free stack where the target supports
//! compare-and-swap; otherwise, it's updated with the completion interrupt
//! masked. The active list is only ever touched with the completion interrupt
//! masked. Completion callbacks run after the mask is released, so they may
//! schedule more transfers.

#![allow(clippy::declare_interior_mutable_const)] // Usage is legit in this module.

use core::{
    cell::{Cell, UnsafeCell},
    sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering},
};

use usb_device::{endpoint::EndpointAddress, UsbError};

use crate::{
    hardware::{masked, Hardware},
    td::{Status, Td, MAX_TRANSFER_LEN},
};

/// Terminates a list
const NIL: u16 = u16::MAX;

/// Invoked when a transfer leaves the active list
///
/// Receives the user data supplied when the transfer was scheduled.
pub type Callback = fn(user_data: usize, completion: Completion);

/// How a transfer left the active list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The controller retired the transfer after moving this many bytes
    Transferred(usize),
    /// The queue was flushed before the controller retired the transfer
    Aborted,
    /// The controller gave up on the transfer
    ///
    /// The status has at least one of the error bits set. Controllers
    /// typically halt the endpoint when this happens; transfers behind this
    /// one stay active until the endpoint is flushed.
    Error(Status),
}

impl Completion {
    /// Returns the number of bytes transferred, if the transfer finished
    /// without error
    pub fn transferred(self) -> Option<usize> {
        match self {
            Completion::Transferred(bytes) => Some(bytes),
            Completion::Aborted | Completion::Error(_) => None,
        }
    }
}

/// A transfer descriptor, and the software state that tracks it
pub(crate) struct Transfer {
    td: Td,
    next: AtomicU16,
    max_len: Cell<usize>,
    callback: Cell<Option<Callback>>,
    user_data: Cell<usize>,
}

// Safety: the cells are only accessed by the context that holds the transfer.
// A transfer is held by the foreground between allocation and the active list
// append, and by the reclaiming context between the active list unlink and the
// free list push.
unsafe impl Sync for Transfer {}

impl Transfer {
    const fn new() -> Self {
        Transfer {
            td: Td::new(),
            next: AtomicU16::new(NIL),
            max_len: Cell::new(0),
            callback: Cell::new(None),
            user_data: Cell::new(0),
        }
    }

    /// Bytes moved by the controller
    fn transferred(&self) -> usize {
        self.max_len.get().saturating_sub(self.td.remaining())
    }

    fn complete(&self, completion: Completion) {
        if let Some(callback) = self.callback.get() {
            callback(self.user_data.get(), completion);
        }
    }
}

/// Static memory for an endpoint's transfers
///
/// Allocate a `static` pool for each endpoint that you want to queue, and
/// supply it to [`Device::queue_init()`](crate::Device::queue_init). The
/// pool's size bounds the number of transfers that can be outstanding on
/// that endpoint.
///
/// ```
/// use usbd_queue::TransferPool;
///
/// static EP1_IN_POOL: TransferPool<4> = TransferPool::new();
/// assert_eq!(EP1_IN_POOL.capacity(), 4);
/// ```
///
/// A pool can be used by only one endpoint.
pub struct TransferPool<const N: usize> {
    transfers: [Transfer; N],
    taken: AtomicBool,
}

impl<const N: usize> TransferPool<N> {
    /// Allocate a pool of `N` transfers
    ///
    /// # Panics
    ///
    /// `N` must be non-zero, and less than 65535.
    pub const fn new() -> Self {
        assert!(N > 0 && N < NIL as usize, "Unsupported transfer pool size");
        const TRANSFER: Transfer = Transfer::new();
        Self {
            transfers: [TRANSFER; N],
            taken: AtomicBool::new(false),
        }
    }

    /// Returns the number of transfers in this pool
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Acquire the transfers.
    ///
    /// Returns `None` if the transfers were already taken.
    pub(crate) fn take(&self) -> Option<&[Transfer]> {
        (!self.taken.swap(true, Ordering::SeqCst)).then_some(&self.transfers[..])
    }
}

impl<const N: usize> Default for TransferPool<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Low half of the free list head is a transfer index. The high half is a
/// generation count that defeats ABA on compare-and-swap targets.
const INDEX_MASK: u32 = 0xFFFF;
const GENERATION: u32 = 1 << 16;

fn next_head(head: u32, index: u16) -> u32 {
    (head & !INDEX_MASK).wrapping_add(GENERATION) | u32::from(index)
}

/// A stack of free transfers
///
/// Targets with compare-and-swap update the head lock-free. Others update it
/// with the completion interrupt masked. Tests exercise both.
struct FreeList {
    head: AtomicU32,
}

impl FreeList {
    const fn new(index: u16) -> Self {
        FreeList {
            head: AtomicU32::new(index as u32),
        }
    }

    /// Take a transfer off the stack, if there is one
    #[cfg(target_has_atomic = "32")]
    fn pop<H: Hardware>(&self, transfers: &[Transfer], _: &H) -> Option<u16> {
        self.pop_atomic(transfers)
    }

    /// Put a transfer on the stack
    #[cfg(target_has_atomic = "32")]
    fn push<H: Hardware>(&self, transfers: &[Transfer], _: &H, index: u16) {
        self.push_atomic(transfers, index)
    }

    /// Take a transfer off the stack, if there is one
    #[cfg(not(target_has_atomic = "32"))]
    fn pop<H: Hardware>(&self, transfers: &[Transfer], hw: &H) -> Option<u16> {
        self.pop_masked(transfers, hw)
    }

    /// Put a transfer on the stack
    #[cfg(not(target_has_atomic = "32"))]
    fn push<H: Hardware>(&self, transfers: &[Transfer], hw: &H, index: u16) {
        self.push_masked(transfers, hw, index)
    }

    #[cfg(target_has_atomic = "32")]
    fn pop_atomic(&self, transfers: &[Transfer]) -> Option<u16> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let index = (head & INDEX_MASK) as u16;
            if index == NIL {
                return None;
            }
            // Another context could pop this transfer before we swap the head.
            // If that happens, the generation changes, and the exchange fails.
            let next = transfers[usize::from(index)].next.load(Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                next_head(head, next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(index),
                Err(actual) => head = actual,
            }
        }
    }

    #[cfg(target_has_atomic = "32")]
    fn push_atomic(&self, transfers: &[Transfer], index: u16) {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            transfers[usize::from(index)]
                .next
                .store((head & INDEX_MASK) as u16, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                next_head(head, index),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    #[cfg(any(not(target_has_atomic = "32"), test))]
    fn pop_masked<H: Hardware>(&self, transfers: &[Transfer], hw: &H) -> Option<u16> {
        masked(hw, || {
            let head = self.head.load(Ordering::Relaxed);
            let index = (head & INDEX_MASK) as u16;
            if index == NIL {
                return None;
            }
            let next = transfers[usize::from(index)].next.load(Ordering::Relaxed);
            self.head.store(next_head(head, next), Ordering::Relaxed);
            Some(index)
        })
    }

    #[cfg(any(not(target_has_atomic = "32"), test))]
    fn push_masked<H: Hardware>(&self, transfers: &[Transfer], hw: &H, index: u16) {
        masked(hw, || {
            let head = self.head.load(Ordering::Relaxed);
            transfers[usize::from(index)]
                .next
                .store((head & INDEX_MASK) as u16, Ordering::Relaxed);
            self.head.store(next_head(head, index), Ordering::Relaxed);
        })
    }

    /// Count the free transfers
    fn len<H: Hardware>(&self, transfers: &[Transfer], hw: &H) -> usize {
        masked(hw, || {
            let mut index = (self.head.load(Ordering::Acquire) & INDEX_MASK) as u16;
            let mut count = 0;
            while index != NIL {
                count += 1;
                index = transfers[usize::from(index)].next.load(Ordering::Relaxed);
            }
            count
        })
    }
}

/// Transfers handed to the controller, oldest first
#[derive(Clone, Copy)]
struct Active {
    head: u16,
    tail: u16,
}

impl Active {
    const EMPTY: Active = Active {
        head: NIL,
        tail: NIL,
    };
}

/// The transfer queue for one endpoint
pub(crate) struct EndpointQueue<'a> {
    address: EndpointAddress,
    transfers: &'a [Transfer],
    free: FreeList,
    active: UnsafeCell<Active>,
}

// Safety: the active list is only accessed with the completion interrupt
// masked. The free list and transfers are safe to share; see their notes.
unsafe impl Sync for EndpointQueue<'_> {}

impl<'a> EndpointQueue<'a> {
    /// Bind `transfers` to the endpoint, placing all of them on the free list
    pub(crate) fn new(address: EndpointAddress, transfers: &'a [Transfer]) -> Self {
        for (index, transfer) in transfers.iter().enumerate() {
            let next = if index + 1 < transfers.len() {
                (index + 1) as u16
            } else {
                NIL
            };
            transfer.next.store(next, Ordering::Relaxed);
        }
        EndpointQueue {
            address,
            transfers,
            free: FreeList::new(if transfers.is_empty() { NIL } else { 0 }),
            active: UnsafeCell::new(Active::EMPTY),
        }
    }

    fn transfer(&self, index: u16) -> &Transfer {
        &self.transfers[usize::from(index)]
    }

    /// Access the active list with the completion interrupt masked
    fn with_active<H: Hardware, R>(&self, hw: &H, f: impl FnOnce(&mut Active) -> R) -> R {
        masked(hw, || {
            // Safety: the only other context that touches the active list is
            // the completion interrupt, which can't run right now. `f` never
            // calls back into the queue.
            let active = unsafe { &mut *self.active.get() };
            f(active)
        })
    }

    /// Schedule a transfer of up to `max_len` bytes at `buffer`
    ///
    /// Returns `WouldBlock` if there are no free transfers.
    ///
    /// # Panics
    ///
    /// Panics if `max_len` exceeds [`MAX_TRANSFER_LEN`].
    pub(crate) fn schedule<H: Hardware>(
        &self,
        hw: &H,
        buffer: *mut u8,
        max_len: usize,
        callback: Option<Callback>,
        user_data: usize,
    ) -> Result<(), UsbError> {
        assert!(
            max_len <= MAX_TRANSFER_LEN,
            "EP{} {:?} transfer of {} bytes exceeds the {} byte limit",
            self.address.index(),
            self.address.direction(),
            max_len,
            MAX_TRANSFER_LEN
        );

        let Some(index) = self.free.pop(self.transfers, hw) else {
            trace!("EP{} EXHAUSTED", self.address.index());
            return Err(UsbError::WouldBlock);
        };

        let transfer = self.transfer(index);
        transfer.next.store(NIL, Ordering::Relaxed);
        transfer.max_len.set(max_len);
        transfer.callback.set(callback);
        transfer.user_data.set(user_data);

        transfer.td.set_terminate();
        transfer.td.prepare(buffer, max_len);
        transfer.td.clean_invalidate_dcache();

        self.with_active(hw, |active| {
            if active.tail == NIL {
                active.head = index;
                active.tail = index;
                hw.schedule_wait(self.address, &transfer.td);
            } else {
                let tail = self.transfer(active.tail);
                tail.next.store(index, Ordering::Relaxed);
                active.tail = index;
                hw.schedule_append(self.address, &tail.td, &transfer.td);
            }
        });

        trace!("EP{} SCHEDULE {} {}", self.address.index(), index, max_len);
        Ok(())
    }

    /// Unlink the head of the active list if the controller is done with it
    fn retire_head(&self, active: &mut Active) -> Option<(u16, Status)> {
        if active.head == NIL {
            return None;
        }
        let index = active.head;
        let transfer = self.transfer(index);
        // Drop any stale copy before polling the controller's write-back.
        transfer.td.clean_invalidate_dcache();
        let status = transfer.td.status();
        if !status.is_error() && status.contains(Status::ACTIVE) {
            return None;
        }

        active.head = transfer.next.load(Ordering::Relaxed);
        if active.head == NIL {
            active.tail = NIL;
        }
        Some((index, status))
    }

    /// Reclaim every transfer that the controller retired
    ///
    /// Walks from the oldest transfer, and stops at the first transfer that's
    /// still active. Each reclaimed transfer is unlinked before its callback
    /// runs, and returned to the free list after its callback returns. Errors
    /// are reported to the hardware before the callback runs.
    pub(crate) fn complete<H: Hardware>(&self, hw: &H) {
        while let Some((index, status)) = self.with_active(hw, |active| self.retire_head(active)) {
            let transfer = self.transfer(index);
            let completion = if status.is_error() {
                warn!(
                    "EP{} TRANSFER {} ERROR {=u32:#X}",
                    self.address.index(),
                    index,
                    status.bits()
                );
                hw.transfer_error(self.address, status);
                Completion::Error(status)
            } else {
                Completion::Transferred(transfer.transferred())
            };
            trace!("EP{} COMPLETE {}", self.address.index(), index);
            transfer.complete(completion);
            self.free.push(self.transfers, hw, index);
        }
    }

    /// Abort every transfer on the active list, regardless of its status
    ///
    /// Returns the number of aborted transfers.
    pub(crate) fn flush<H: Hardware>(&self, hw: &H) -> usize {
        let mut index = self.with_active(hw, |active| {
            let head = active.head;
            *active = Active::EMPTY;
            head
        });

        // The detached chain is only reachable from here.
        let mut aborted = 0;
        while index != NIL {
            let transfer = self.transfer(index);
            let next = transfer.next.load(Ordering::Relaxed);
            transfer.complete(Completion::Aborted);
            self.free.push(self.transfers, hw, index);
            index = next;
            aborted += 1;
        }

        debug!("EP{} FLUSH {}", self.address.index(), aborted);
        aborted
    }

    /// Indicates if any transfer is on the active list
    pub(crate) fn is_active<H: Hardware>(&self, hw: &H) -> bool {
        self.with_active(hw, |active| active.head != NIL)
    }

    /// Returns the number of transfers that could be scheduled right now
    pub(crate) fn free_space<H: Hardware>(&self, hw: &H) -> usize {
        self.free.len(self.transfers, hw)
    }

    /// Returns the bytes moved so far by the oldest active transfer
    pub(crate) fn transferred_bytes<H: Hardware>(&self, hw: &H) -> Option<usize> {
        self.with_active(hw, |active| {
            (active.head != NIL).then(|| {
                let transfer = self.transfer(active.head);
                transfer.td.clean_invalidate_dcache();
                transfer.transferred()
            })
        })
    }

    #[cfg(test)]
    fn capacity(&self) -> usize {
        self.transfers.len()
    }

    #[cfg(test)]
    fn active_len<H: Hardware>(&self, hw: &H) -> usize {
        self.with_active(hw, |active| {
            let mut index = active.head;
            let mut count = 0;
            while index != NIL {
                count += 1;
                index = self.transfer(index).next.load(Ordering::Relaxed);
            }
            count
        })
    }
}
