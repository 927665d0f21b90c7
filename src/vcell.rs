//! Volatile cell that conforms to the RAL's register API
//!
//! Descriptor words are shared with the controller's DMA engine,
//! so every access is a volatile load or store.

use core::cell::UnsafeCell;

#[repr(transparent)]
pub struct VCell<T>(UnsafeCell<T>);

impl<T> VCell<T> {
    pub const fn new(val: T) -> Self {
        VCell(UnsafeCell::new(val))
    }
}

impl<T: Copy> VCell<T> {
    pub fn read(&self) -> T {
        unsafe { self.0.get().read_volatile() }
    }
    pub fn write(&self, val: T) {
        unsafe { self.0.get().write_volatile(val) }
    }
}

#[cfg(test)]
mod tests {
    use super::VCell;

    #[test]
    fn read_write() {
        let cell = VCell::new(0u32);
        cell.write(0xDEAD_BEEF);
        assert_eq!(cell.read(), 0xDEAD_BEEF);
        cell.write(0);
        assert_eq!(cell.read(), 0);
    }
}
