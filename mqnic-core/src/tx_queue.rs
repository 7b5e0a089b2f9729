//! TX descriptor ring + completion ring (design §3, §4.5).
//!
//! Symmetric to [`crate::rx_queue::RxQueue`] but without a mempool of its
//! own — TX buffers are supplied by the caller and freed back into
//! whichever mempool they came from once their completion is reaped.

use crate::bar::Bar;
use crate::descriptor::{Completion, Descriptor};
use crate::error::ConfigResult;
use crate::mempool::PktBuf;
use crate::regs;
use crate::ring::Ring;

/// TX completion reap budget per `tx_batch` call (design §4.5, §6).
const TX_CQ_REAP_BUDGET: u32 = regs::TX_CQ_REAP_BUDGET;

#[inline]
fn hw_diff(a: u32, b: u32) -> u32 {
    a.wrapping_sub(b) & regs::HW_PTR_MASK
}

pub struct TxQueue {
    txq_bar: Bar,
    cpl_bar: Bar,
    size: u32,
    size_mask: u32,
    full_size: u32,
    log_desc_block_size: u32,
    bypass: bool,

    txq_head: u32,
    txq_tail: u32,
    txq_clean_tail: u32,

    cpl_head: u32,
    cpl_tail: u32,
    #[allow(dead_code)]
    cpl_clean_tail: u32,

    desc_ring: Ring<Descriptor>,
    cpl_ring: Ring<Completion>,
    virt_addrs: Vec<Option<PktBuf>>,
}

// SAFETY: see `RxQueue` — single owning thread, all NIC-facing access goes
// through volatile/fenced `Bar`/`Ring` operations.
unsafe impl Send for TxQueue {}

impl TxQueue {
    /// Allocate rings and program the deactivated, sized register blocks
    /// (design §4.8 `init_tx`, first pass).
    pub fn new_deactivated(txq_bar: Bar, cpl_bar: Bar, size: usize, bypass: bool) -> ConfigResult<Self> {
        if !size.is_power_of_two() {
            return Err(crate::error::ConfigError::NotPowerOfTwo { size });
        }

        let cpl_ring: Ring<Completion> = Ring::allocate_zeroed(size)?;
        let desc_ring: Ring<Descriptor> = Ring::allocate_zeroed(size)?;
        for i in 0..size {
            desc_ring.write(i, Descriptor { tx_csum_cmd: 0xffff, _rsvd: 0xffff, len: 0xffff_ffff, addr: 0xffff_ffff_ffff_ffff });
        }

        // Single descriptor per slot (design §3: "descriptor block" of 1,
        // `log_desc_block_size = 0`).
        let log_desc_block_size = 0u32;

        cpl_bar.write32(regs::CPL_QUEUE_ACTIVE_LOG_SIZE_REG, 0);
        cpl_bar.write32(regs::CPL_QUEUE_BASE_ADDR_REG, (cpl_ring.phys() & 0xffff_ffff) as u32);
        cpl_bar.write32(regs::CPL_QUEUE_BASE_ADDR_REG + 4, (cpl_ring.phys() >> 32) as u32);
        cpl_bar.write32(regs::CPL_QUEUE_HEAD_PTR_REG, 0);
        cpl_bar.write32(regs::CPL_QUEUE_TAIL_PTR_REG, 0);
        cpl_bar.write32(regs::CPL_QUEUE_ACTIVE_LOG_SIZE_REG, regs::log2_floor(size as u32));

        txq_bar.write32(regs::QUEUE_ACTIVE_LOG_SIZE_REG, 0);
        txq_bar.write32(regs::QUEUE_BASE_ADDR_REG, (desc_ring.phys() & 0xffff_ffff) as u32);
        txq_bar.write32(regs::QUEUE_BASE_ADDR_REG + 4, (desc_ring.phys() >> 32) as u32);
        txq_bar.write32(regs::QUEUE_CPL_QUEUE_INDEX_REG, 0);
        txq_bar.write32(regs::QUEUE_HEAD_PTR_REG, 0);
        txq_bar.write32(regs::QUEUE_TAIL_PTR_REG, 0);
        txq_bar.write32(regs::QUEUE_ACTIVE_LOG_SIZE_REG, regs::log2_floor(size as u32) | (log_desc_block_size << 8));

        let mut virt_addrs = Vec::with_capacity(size);
        virt_addrs.resize_with(size, || None);

        Ok(Self {
            txq_bar,
            cpl_bar,
            size: size as u32,
            size_mask: size as u32 - 1,
            full_size: size as u32 / 2,
            log_desc_block_size,
            bypass,
            txq_head: 0,
            txq_tail: 0,
            txq_clean_tail: 0,
            cpl_head: 0,
            cpl_tail: 0,
            cpl_clean_tail: 0,
            desc_ring,
            cpl_ring,
            virt_addrs,
        })
    }

    /// Activate this queue and its completion queue, binding the CPL index
    /// (design §4.8 `start_txq_cpl_queue`).
    pub fn activate(&mut self, queue_id: u16, kernel_queue_number: u32, num_event_queues: u32) {
        self.cpl_bar.write32(regs::CPL_QUEUE_INTERRUPT_INDEX_REG, num_event_queues.wrapping_sub(1));
        self.cpl_bar
            .write32(regs::CPL_QUEUE_ACTIVE_LOG_SIZE_REG, regs::log2_floor(self.size) | regs::CPL_QUEUE_ACTIVE_MASK);

        self.txq_bar.write32(regs::QUEUE_CPL_QUEUE_INDEX_REG, queue_id as u32 + kernel_queue_number);
        self.txq_bar.write32(
            regs::QUEUE_ACTIVE_LOG_SIZE_REG,
            regs::log2_floor(self.size) | (self.log_desc_block_size << 8) | regs::QUEUE_ACTIVE_MASK,
        );
    }

    fn read_tail_ptr(&mut self) {
        let nic_tail = self.txq_bar.read32(regs::QUEUE_TAIL_PTR_REG);
        self.txq_tail = self.txq_tail.wrapping_add(hw_diff(nic_tail, self.txq_tail));
    }

    fn completion_available(&mut self) -> bool {
        let cpl_index = (self.cpl_tail & self.size_mask) as usize;
        if self.bypass {
            self.cpl_ring.read(cpl_index).len != 0
        } else {
            let nic_head = self.cpl_bar.read32(regs::CPL_QUEUE_HEAD_PTR_REG);
            self.cpl_head = self.cpl_head.wrapping_add(hw_diff(nic_head, self.cpl_head));
            self.cpl_head != self.cpl_tail
        }
    }

    /// Reap up to [`TX_CQ_REAP_BUDGET`] finished completions, freeing their
    /// buffers (design §4.5 step 1).
    fn process_completions(&mut self) {
        let mut done = 0u32;
        while done < TX_CQ_REAP_BUDGET && self.completion_available() {
            let cpl_index = (self.cpl_tail & self.size_mask) as usize;
            let cpl = self.cpl_ring.read(cpl_index);
            let txq_index = (cpl.index as u32 & self.size_mask) as usize;

            if let Some(buf) = self.virt_addrs[txq_index].take() {
                buf.free();
            }
            self.cpl_ring.write(cpl_index, Completion { len: 0, ..cpl });

            done += 1;
            self.cpl_tail = self.cpl_tail.wrapping_add(1);
        }

        self.cpl_bar.write32(regs::CPL_QUEUE_TAIL_PTR_REG, self.cpl_tail & regs::HW_PTR_MASK);

        if self.bypass {
            self.txq_tail = self.txq_tail.wrapping_add(done);
        } else {
            self.read_tail_ptr();
        }

        while self.txq_clean_tail != self.txq_tail {
            let index = (self.txq_clean_tail & self.size_mask) as usize;
            if self.virt_addrs[index].is_some() {
                if self.bypass {
                    // Design §7 `InvariantViolation`: a non-null slot past
                    // the established tail in bypass mode means the ring
                    // desynchronised. Fatal, programming bug.
                    panic!("mqnic: tx completion ring desynchronized at slot {index}");
                }
                break;
            }
            self.txq_clean_tail = self.txq_clean_tail.wrapping_add(1);
        }
    }

    fn is_full(&self) -> bool {
        self.txq_head.wrapping_sub(self.txq_clean_tail) >= self.full_size
    }

    /// Enqueue as many of `bufs` as fit, after reaping finished completions
    /// (design §4.5). Returns the number actually enqueued; never blocks.
    pub fn tx_batch(&mut self, bufs: Vec<PktBuf>) -> usize {
        self.process_completions();

        let mut sent = 0usize;
        for buf in bufs {
            if self.is_full() {
                break;
            }
            let index = (self.txq_head & self.size_mask) as usize;
            self.desc_ring.write(index, Descriptor { tx_csum_cmd: 0, _rsvd: 0, len: buf.size as u32, addr: buf.payload_phys() });
            self.virt_addrs[index] = Some(buf);
            self.txq_head = self.txq_head.wrapping_add(1);
            sent += 1;
        }

        self.txq_bar.write32(regs::QUEUE_HEAD_PTR_REG, self.txq_head & regs::HW_PTR_MASK);
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mempool::Mempool;

    fn fake_bar(words: usize) -> Bar {
        let region = Box::leak(vec![0u32; words].into_boxed_slice());
        unsafe { Bar::new(region.as_mut_ptr() as *mut u8) }
    }

    fn test_queue(size: usize, bypass: bool) -> TxQueue {
        let mut q = TxQueue::new_deactivated(fake_bar(64), fake_bar(64), size, bypass).unwrap();
        q.activate(0, 0, 1);
        q
    }

    #[test]
    fn enqueue_zero_buffers_is_a_noop_apart_from_reap() {
        let mut q = test_queue(256, true);
        let sent = q.tx_batch(vec![]);
        assert_eq!(sent, 0);
        assert_eq!(q.txq_head, 0);
    }

    #[test]
    fn enqueue_writes_descriptors_and_bumps_head() {
        let mut q = test_queue(256, true);
        let pool = Mempool::allocate(8, crate::mempool::PKT_BUF_ENTRY_SIZE).unwrap();
        let bufs: Vec<PktBuf> = (0..3).map(|_| pool.alloc_buf().unwrap()).collect();
        let sent = q.tx_batch(bufs);
        assert_eq!(sent, 3);
        assert_eq!(q.txq_head, 3);
        for i in 0..3 {
            assert!(q.virt_addrs[i].is_some());
        }
    }

    #[test]
    fn back_pressure_stops_at_full_size_with_no_completions_pending() {
        let mut q = test_queue(256, true);
        q.txq_head = 128;
        q.txq_clean_tail = 0;
        let pool = Mempool::allocate(16, crate::mempool::PKT_BUF_ENTRY_SIZE).unwrap();
        let bufs: Vec<PktBuf> = (0..10).map(|_| pool.alloc_buf().unwrap()).collect();
        let sent = q.tx_batch(bufs);
        assert_eq!(sent, 0);
    }

    #[test]
    fn unsent_buffers_on_back_pressure_return_to_the_pool() {
        let mut q = test_queue(256, true);
        q.txq_head = 128;
        q.txq_clean_tail = 0;
        let pool = Mempool::allocate(16, crate::mempool::PKT_BUF_ENTRY_SIZE).unwrap();
        let bufs: Vec<PktBuf> = (0..10).map(|_| pool.alloc_buf().unwrap()).collect();
        assert_eq!(pool.free_count(), 6);
        let sent = q.tx_batch(bufs);
        assert_eq!(sent, 0);
        // none of the 10 buffers made it into a descriptor slot, so dropping
        // the rejected Vec must hand every one of them back to the pool.
        assert_eq!(pool.free_count(), 16);
    }

    #[test]
    fn reap_frees_buffer_and_advances_clean_tail() {
        let mut q = test_queue(256, true);
        let pool = Mempool::allocate(8, crate::mempool::PKT_BUF_ENTRY_SIZE).unwrap();
        let bufs: Vec<PktBuf> = (0..2).map(|_| pool.alloc_buf().unwrap()).collect();
        q.tx_batch(bufs);
        assert_eq!(pool.free_count(), 6);

        q.cpl_ring.write(0, Completion { queue: 0, index: 0, len: 64, ts: 0, rx_hash: 0, rx_hash_type: 0, _rsvd: [0; 8] });
        q.cpl_ring.write(1, Completion { queue: 0, index: 1, len: 64, ts: 0, rx_hash: 0, rx_hash_type: 0, _rsvd: [0; 8] });
        q.tx_batch(vec![]);

        assert_eq!(pool.free_count(), 8);
        assert_eq!(q.txq_clean_tail, 2);
    }
}
