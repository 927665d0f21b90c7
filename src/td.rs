//! Endpoint Transfer Descriptors (TD)
//!
//! The module implements a RAL-compatible interface for working
//! with transfer descriptors. A TD is the only memory shared with the
//! controller's DMA engine: software fills it in, the controller retires
//! it by clearing `ACTIVE` and writing back the untransferred byte count.

#![allow(non_snake_case, non_upper_case_globals)]

use crate::{ral, vcell::VCell};

/// Size of one buffer page referenced by a TD
const PAGE_SIZE: u32 = 4096;

/// The largest transfer that a single TD can describe
///
/// Five buffer pages always cover 16KiB, no matter how the buffer
/// is aligned within its first page.
pub const MAX_TRANSFER_LEN: usize = 16 * 1024;

/// An endpoint transfer descriptor, laid out for the controller
#[repr(C, align(32))]
pub struct Td {
    NEXT: VCell<u32>,
    TOKEN: VCell<u32>,
    BUFFERS: [VCell<u32>; 5],
    // Reserved memory could be used for other things!
    _reserved: [u32; 1],
}

impl Default for Td {
    fn default() -> Self {
        Self::new()
    }
}

impl Td {
    pub const fn new() -> Self {
        Td {
            NEXT: VCell::new(0),
            TOKEN: VCell::new(0),
            BUFFERS: [
                VCell::new(0),
                VCell::new(0),
                VCell::new(0),
                VCell::new(0),
                VCell::new(0),
            ],
            _reserved: [0; 1],
        }
    }

    /// Mark this TD as the end of the chain
    pub fn set_terminate(&self) {
        ral::write_reg!(crate::td, self, NEXT, TERMINATE: 1);
    }

    /// Link `next` after this TD
    ///
    /// Hardware collaborators use this to extend a chain that the
    /// controller may already be walking. The link is cleaned from the
    /// D-cache, so the controller sees it right away.
    ///
    /// With the `dcache` feature, cleaning writes back the whole TD. Place
    /// transfer pools in memory that isn't write-back cached (like DTCM) if
    /// the controller could retire this TD while it's being linked.
    pub fn set_next(&self, next: &Td) {
        let addr = next as *const Td as usize as u32;
        ral::write_reg!(crate::td, self, NEXT, NEXT_LINK_POINTER: addr >> 5);
        self.clean_invalidate_dcache();
    }

    /// Returns the address of the next TD, or `None` if this TD
    /// terminates the chain
    pub fn next(&self) -> Option<u32> {
        if ral::read_reg!(crate::td, self, NEXT, TERMINATE == 1) {
            None
        } else {
            Some(ral::read_reg!(crate::td, self, NEXT, NEXT_LINK_POINTER) << 5)
        }
    }

    /// Describe a transfer of `size` bytes starting at `buffer`, and hand the
    /// TD to the controller
    ///
    /// Sets the interrupt-on-complete and active bits, and fills every buffer
    /// page pointer.
    pub fn prepare(&self, buffer: *mut u8, size: usize) {
        ral::write_reg!(
            crate::td,
            self,
            TOKEN,
            TOTAL_BYTES: size as u32,
            IOC: 1,
            MULTO: 0,
            STATUS: Status::ACTIVE.bits()
        );

        let ptr = buffer as usize as u32;
        self.BUFFERS[0].write(ptr);
        for (page, pointer) in self.BUFFERS.iter().enumerate().skip(1) {
            pointer.write(ptr.wrapping_add(page as u32 * PAGE_SIZE) & !(PAGE_SIZE - 1));
        }
    }

    /// Returns the status bits that the controller wrote back
    pub fn status(&self) -> Status {
        Status::from_bits_truncate(ral::read_reg!(crate::td, self, TOKEN, STATUS))
    }

    /// Returns the number of bytes that the controller has not yet transferred
    pub fn remaining(&self) -> usize {
        ral::read_reg!(crate::td, self, TOKEN, TOTAL_BYTES) as usize
    }

    /// Returns the address of buffer page `page`
    pub fn buffer_page(&self, page: usize) -> u32 {
        self.BUFFERS[page].read()
    }

    /// Clean and invalidate this TD from DCache
    pub fn clean_invalidate_dcache(&self) {
        crate::cache::clean_invalidate_dcache_by_address(
            self as *const _ as usize,
            core::mem::size_of_val(self),
        );
    }
}

bitflags::bitflags! {
    /// Status of a transfer descriptor
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status : u32 {
        /// Active
        const ACTIVE = 1 << 7;
        /// Halted
        const HALTED = 1 << 6;
        /// Data buffer error
        const DATA_BUS_ERROR = 1 << 5;
        /// Transaction error
        const TRANSACTION_ERROR = 1 << 3;
    }
}

impl Status {
    /// Any of the bits that the controller sets when it gives up on a TD
    pub const ERRORS: Status = Status::HALTED
        .union(Status::DATA_BUS_ERROR)
        .union(Status::TRANSACTION_ERROR);

    /// Indicates if the controller reported an error
    pub fn is_error(self) -> bool {
        self.intersects(Status::ERRORS)
    }
}

mod NEXT {
    pub mod TERMINATE {
        pub const offset: u32 = 0;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod NEXT_LINK_POINTER {
        pub const offset: u32 = 5;
        pub const mask: u32 = 0x7ffffff << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

mod TOKEN {
    pub mod STATUS {
        pub const offset: u32 = 0;
        pub const mask: u32 = 0xFF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod MULTO {
        pub const offset: u32 = 10;
        pub const mask: u32 = 0b11 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod IOC {
        pub const offset: u32 = 15;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod TOTAL_BYTES {
        pub const offset: u32 = 16;
        pub const mask: u32 = 0x7FFF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

const _: [(); 1] = [(); (core::mem::size_of::<Td>() == 32) as usize];

/// Simulate the controller retiring a TD
#[cfg(test)]
pub(crate) fn retire(td: &Td, remaining: usize, status: Status) {
    ral::write_reg!(
        crate::td,
        td,
        TOKEN,
        TOTAL_BYTES: remaining as u32,
        STATUS: status.bits()
    );
}
