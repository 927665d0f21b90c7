//! The endpoint → queue table

use core::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    sync::atomic::{AtomicU32, Ordering},
};

use crate::queue::{EndpointQueue, Transfer};
use usb_device::{endpoint::EndpointAddress, UsbDirection};

/// The maximum supported number of endpoints.
///
/// Eight endpoints, two directions.
pub const MAX_ENDPOINTS: usize = 8 * 2;

/// Produces an index into the queue table
fn index(ep_addr: EndpointAddress) -> usize {
    (ep_addr.index() * 2) + (UsbDirection::In == ep_addr.direction()) as usize
}

/// Returns the table bit for `ep_addr`, or `None` if the endpoint can't be
/// represented
fn mask(ep_addr: EndpointAddress) -> Option<u32> {
    let index = index(ep_addr);
    (index < MAX_ENDPOINTS).then_some(1 << index)
}

/// One transfer queue per endpoint, per direction.
///
/// Queues are only ever added. Once a queue is registered, it lives as long
/// as the table.
pub(crate) struct QueueTable<'a> {
    queues: UnsafeCell<[MaybeUninit<EndpointQueue<'a>>; MAX_ENDPOINTS]>,
    /// Set when a caller claims the slot for initialization.
    claimed: AtomicU32,
    /// Set once the queue in the slot is initialized.
    ready: AtomicU32,
}

// Safety: a slot is written exactly once, by the caller that won the claim,
// before it's published through `ready`. All other access is shared.
unsafe impl Sync for QueueTable<'_> {}

impl<'a> QueueTable<'a> {
    pub(crate) const fn new() -> Self {
        Self {
            // Safety: an array of MaybeUninit doesn't need initialization.
            queues: UnsafeCell::new(unsafe { MaybeUninit::uninit().assume_init() }),
            claimed: AtomicU32::new(0),
            ready: AtomicU32::new(0),
        }
    }

    fn slot(&self, index: usize) -> *mut MaybeUninit<EndpointQueue<'a>> {
        debug_assert!(index < MAX_ENDPOINTS);
        // Point at the one element, never the whole array; other slots may be
        // borrowed.
        unsafe { self.queues.get().cast::<MaybeUninit<EndpointQueue<'a>>>().add(index) }
    }

    /// Register a queue for `ep_addr` using `transfers`.
    ///
    /// Returns `None` if any are true:
    ///
    /// - A queue is already registered for the endpoint.
    /// - We cannot register a queue for the given address.
    pub(crate) fn insert(
        &self,
        ep_addr: EndpointAddress,
        transfers: &'a [Transfer],
    ) -> Option<&EndpointQueue<'a>> {
        let mask = mask(ep_addr)?;

        // If we pass this check, we're the only caller able to write the
        // queue at this index.
        (self.claimed.fetch_or(mask, Ordering::SeqCst) & mask == 0).then_some(())?;

        let slot = self.slot(index(ep_addr));
        // Safety: claim is exclusive, and the slot isn't published yet.
        // Nothing to drop in an uninitialized slot.
        unsafe { (*slot).write(EndpointQueue::new(ep_addr, transfers)) };
        self.ready.fetch_or(mask, Ordering::Release);

        // Safety: queue is initialized.
        Some(unsafe { (*slot).assume_init_ref() })
    }

    /// Acquire the queue for `ep_addr`.
    ///
    /// Returns `None` if there's no queue for the endpoint.
    pub(crate) fn get(&self, ep_addr: EndpointAddress) -> Option<&EndpointQueue<'a>> {
        let mask = mask(ep_addr)?;
        (self.ready.load(Ordering::Acquire) & mask != 0).then_some(())?;
        // Safety: published queues are initialized, and never written again.
        Some(unsafe { (*self.slot(index(ep_addr))).assume_init_ref() })
    }
}

#[cfg(test)]
mod tests {
    use super::{QueueTable, MAX_ENDPOINTS};
    use crate::{mock::Mock, queue::TransferPool};
    use usb_device::{endpoint::EndpointAddress, UsbDirection};

    #[test]
    fn insert_queue() {
        let out_pool = TransferPool::<2>::new();
        let in_pool = TransferPool::<3>::new();
        let other_pool = TransferPool::<1>::new();
        let table = QueueTable::new();
        let hw = Mock::new();

        // First queue.
        let addr = EndpointAddress::from(0);
        assert!(table.get(addr).is_none());

        let queue = table.insert(addr, out_pool.take().unwrap()).unwrap();
        assert_eq!(queue.free_space(&hw), 2);
        assert!(table.get(addr).is_some());

        // Double-insert existing queue.
        assert!(table.insert(addr, other_pool.take().unwrap()).is_none());
        assert_eq!(table.get(addr).unwrap().free_space(&hw), 2);

        // Same number, other direction.
        let addr = EndpointAddress::from(1 << 7);
        assert!(table.get(addr).is_none());
        let queue = table.insert(addr, in_pool.take().unwrap()).unwrap();
        assert_eq!(queue.free_space(&hw), 3);
    }

    #[test]
    fn out_of_range() {
        let pool = TransferPool::<1>::new();
        let table = QueueTable::new();
        let addr = EndpointAddress::from_parts(MAX_ENDPOINTS / 2, UsbDirection::Out);
        assert!(table.insert(addr, pool.take().unwrap()).is_none());
        assert!(table.get(addr).is_none());
    }
}
