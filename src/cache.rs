//! Cache maintenance operations
//!
//! These functions were adapted from the cortex-m (0.7.1) crate.
//! cortex-m only lets you access these functions when you have
//! the SCB in cortex_m::Peripherals collection. But, we neither want
//! to steal the peripheral(s), nor own them. So, we're duplicating
//! the routines that we need, and making sure that we're using
//! them safely.
//!
//! Maintenance only happens when the `dcache` feature is enabled on an
//! ARM target. Cortex-M4 parts have no D-cache, and writing the cache
//! maintenance registers there is not defined.
//!
//! cortex-m crate available at <https://github.com/rust-embedded/cortex-m>.

/// Cleans and invalidates D-cache by address.
///
/// * `addr`: The address to clean and invalidate.
/// * `size`: The number of bytes to clean and invalidate.
///
/// Cleans and invalidates D-cache starting from the first cache line containing `addr`,
/// finishing once at least `size` bytes have been cleaned and invalidated.
///
/// Transfer descriptors are 32 byte aligned and 32 bytes large, so a descriptor
/// always occupies exactly one cache line.
#[cfg(all(target_arch = "arm", feature = "dcache", not(test)))]
pub fn clean_invalidate_dcache_by_address(addr: usize, size: usize) {
    // No-op zero sized operations
    if size == 0 {
        return;
    }

    // Safety: write-only registers, pointer to static memory
    let cbp = unsafe { &*cortex_m::peripheral::CBP::PTR };

    cortex_m::asm::dsb();

    // Cache lines are fixed to 32 bit on Cortex-M7 and not present in earlier Cortex-M
    const LINESIZE: usize = 32;
    let num_lines = ((size - 1) / LINESIZE) + 1;

    let mut addr = addr & 0xFFFF_FFE0;

    for _ in 0..num_lines {
        // Safety: write to Cortex-M write-only register
        unsafe { cbp.dccimvac.write(addr as u32) };
        addr += LINESIZE;
    }

    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

/// No cache to maintain.
#[cfg(not(any(all(target_arch = "arm", feature = "dcache"), test)))]
#[inline(always)]
pub fn clean_invalidate_dcache_by_address(_addr: usize, _size: usize) {}

/// Remember the maintenance, so tests can check when it happens.
#[cfg(test)]
pub fn clean_invalidate_dcache_by_address(addr: usize, _size: usize) {
    crate::mock::clean_invalidate_dcache(addr);
}
