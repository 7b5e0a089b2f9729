//! `Ring<T>` pairs a DMA-coherent allocation with a typed, indexable view
//! (design §9) so `RxQueue`/`TxQueue` never touch raw pointers directly.

use std::marker::PhantomData;
use std::mem::size_of;

use crate::error::ConfigResult;

pub struct Ring<T> {
    region: mqnic_dma::DmaMemory,
    len: usize,
    _marker: PhantomData<T>,
}

// SAFETY: a `Ring<T>` is handed to exactly one owning queue at bring-up
// and never touched from another thread afterwards (design §5).
unsafe impl<T> Send for Ring<T> {}

impl<T: Copy> Ring<T> {
    /// Allocate a DMA-coherent, zero-initialised ring of `len` slots.
    pub fn allocate_zeroed(len: usize) -> ConfigResult<Self> {
        let bytes = len * size_of::<T>();
        let region = mqnic_dma::allocate_dma(bytes)?;
        unsafe { std::ptr::write_bytes(region.virt.as_ptr(), 0, bytes) };
        Ok(Self { region, len, _marker: PhantomData })
    }

    pub fn phys(&self) -> u64 {
        self.region.phys
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Raw pointer to slot `idx`. Callers are responsible for volatile
    /// access on fields the NIC writes concurrently (e.g. completion
    /// `len`).
    #[inline]
    pub fn slot_ptr(&self, idx: usize) -> *mut T {
        debug_assert!(idx < self.len);
        unsafe { self.region.virt.as_ptr().add(idx * size_of::<T>()) as *mut T }
    }

    #[inline]
    pub fn read(&self, idx: usize) -> T {
        unsafe { std::ptr::read_volatile(self.slot_ptr(idx)) }
    }

    #[inline]
    pub fn write(&self, idx: usize, value: T) {
        unsafe { std::ptr::write_volatile(self.slot_ptr(idx), value) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Completion;

    #[test]
    fn write_then_read_round_trips() {
        let ring: Ring<Completion> = Ring::allocate_zeroed(8).unwrap();
        assert_eq!(ring.read(3).len, 0);
        let mut cpl = Completion::zeroed();
        cpl.len = 42;
        cpl.queue = 1;
        ring.write(3, cpl);
        assert_eq!(ring.read(3).len, 42);
    }
}
