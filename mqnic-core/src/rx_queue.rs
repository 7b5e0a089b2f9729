//! RX descriptor ring + completion ring + mempool (design §3, §4.3, §4.4).
//!
//! A `RxQueue` is single-owner (design §5): only the thread that brought it
//! up ever calls `refill`/`rx_batch_hints` on it. It is `Send` (handed to
//! its owning thread once at bring-up) but deliberately not `Sync`.

use crate::bar::Bar;
use crate::descriptor::{Completion, Descriptor};
use crate::error::ConfigResult;
use crate::hints::{decode_hint, Hint};
use crate::mempool::{Mempool, PktBuf};
use crate::regs;
use crate::ring::Ring;

/// Minimum free-slot hysteresis before a refill runs (design §4.3).
const REFILL_HYSTERESIS: u32 = 8;

/// `(a - b) & hw_ptr_mask`, never signed comparison (design §9).
#[inline]
fn hw_diff(a: u32, b: u32) -> u32 {
    a.wrapping_sub(b) & regs::HW_PTR_MASK
}

pub struct RxQueue {
    rxq_bar: Bar,
    cpl_bar: Bar,
    size: u32,
    size_mask: u32,
    bypass: bool,

    rxq_head: u32,
    rxq_tail: u32,
    rxq_clean_tail: u32,

    cpl_head: u32,
    cpl_tail: u32,
    #[allow(dead_code)]
    cpl_clean_tail: u32,

    desc_ring: Ring<Descriptor>,
    cpl_ring: Ring<Completion>,
    virt_addrs: Vec<Option<PktBuf>>,
    accumulated_cq_updates: u32,
    mempool: Option<Mempool>,
}

// SAFETY: handed to exactly one owning thread at bring-up (design §5); the
// NIC is the only concurrent accessor of the underlying rings/registers,
// guarded by the volatile+fence discipline in `Bar`/`Ring`.
unsafe impl Send for RxQueue {}

impl RxQueue {
    /// Allocate rings and program the deactivated, sized register blocks
    /// (design §4.8 `init_rx`, first pass). Not yet activated; no mempool.
    pub fn new_deactivated(rxq_bar: Bar, cpl_bar: Bar, size: usize, bypass: bool) -> ConfigResult<Self> {
        if !size.is_power_of_two() {
            return Err(crate::error::ConfigError::NotPowerOfTwo { size });
        }

        let cpl_ring: Ring<Completion> = Ring::allocate_zeroed(size)?;
        let desc_ring: Ring<Descriptor> = Ring::allocate_zeroed(size)?;
        // The source memsets the descriptor ring to all-ones; its `len`
        // fields don't gate hardware (design §3), only the completion
        // ring's zeroed `len` is the bypass sentinel.
        for i in 0..size {
            desc_ring.write(i, Descriptor { tx_csum_cmd: 0xffff, _rsvd: 0xffff, len: 0xffff_ffff, addr: 0xffff_ffff_ffff_ffff });
        }

        cpl_bar.write32(regs::CPL_QUEUE_ACTIVE_LOG_SIZE_REG, 0);
        cpl_bar.write32(regs::CPL_QUEUE_BASE_ADDR_REG, (cpl_ring.phys() & 0xffff_ffff) as u32);
        cpl_bar.write32(regs::CPL_QUEUE_BASE_ADDR_REG + 4, (cpl_ring.phys() >> 32) as u32);
        cpl_bar.write32(regs::CPL_QUEUE_HEAD_PTR_REG, 0);
        cpl_bar.write32(regs::CPL_QUEUE_TAIL_PTR_REG, 0);
        cpl_bar.write32(regs::CPL_QUEUE_ACTIVE_LOG_SIZE_REG, regs::log2_floor(size as u32));

        rxq_bar.write32(regs::QUEUE_ACTIVE_LOG_SIZE_REG, 0);
        rxq_bar.write32(regs::QUEUE_BASE_ADDR_REG, (desc_ring.phys() & 0xffff_ffff) as u32);
        rxq_bar.write32(regs::QUEUE_BASE_ADDR_REG + 4, (desc_ring.phys() >> 32) as u32);
        rxq_bar.write32(regs::QUEUE_CPL_QUEUE_INDEX_REG, 0);
        rxq_bar.write32(regs::QUEUE_HEAD_PTR_REG, 0);
        rxq_bar.write32(regs::QUEUE_TAIL_PTR_REG, 0);
        rxq_bar.write32(regs::QUEUE_ACTIVE_LOG_SIZE_REG, regs::log2_floor(size as u32));

        let mut virt_addrs = Vec::with_capacity(size);
        virt_addrs.resize_with(size, || None);

        Ok(Self {
            rxq_bar,
            cpl_bar,
            size: size as u32,
            size_mask: size as u32 - 1,
            bypass,
            rxq_head: 0,
            rxq_tail: 0,
            rxq_clean_tail: 0,
            cpl_head: 0,
            cpl_tail: 0,
            cpl_clean_tail: 0,
            desc_ring,
            cpl_ring,
            virt_addrs,
            accumulated_cq_updates: 0,
            mempool: None,
        })
    }

    /// Activate this queue and its completion queue, bind the CPL index,
    /// refill the ring, and arm the per-core dispatcher (design §4.3, §4.8
    /// `start_rxq_cpl_queue`).
    pub fn activate(&mut self, queue_id: u16, kernel_queue_number: u32, num_event_queues: u32, mempool: Mempool) {
        self.mempool = Some(mempool);

        self.cpl_bar.write32(regs::CPL_QUEUE_INTERRUPT_INDEX_REG, num_event_queues.wrapping_sub(1));
        self.cpl_bar
            .write32(regs::CPL_QUEUE_ACTIVE_LOG_SIZE_REG, regs::log2_floor(self.size) | regs::CPL_QUEUE_ACTIVE_MASK);

        self.rxq_bar.write32(regs::QUEUE_CPL_QUEUE_INDEX_REG, queue_id as u32 + kernel_queue_number);
        self.rxq_bar.write32(regs::QUEUE_ACTIVE_LOG_SIZE_REG, regs::log2_floor(self.size) | regs::QUEUE_ACTIVE_MASK);

        self.refill();

        // per-core dispatcher init (design §4.6, opcode 17).
        self.cpl_bar.write32(regs::CPL_QUEUE_CPU_MSG_REG, crate::appctl::DISPATCHER_INIT);

        if !self.bypass {
            self.read_tail_ptr();
        }
    }

    /// Write a pre-packed 32-bit word to this queue's CPU-message mailbox
    /// register (design §4.6, §9). The packing itself lives in
    /// [`crate::appctl`]; this is the single point that actually touches
    /// the register.
    pub fn write_mailbox(&self, value: u32) {
        self.cpl_bar.write32(regs::CPL_QUEUE_CPU_MSG_REG, value);
    }

    fn read_tail_ptr(&mut self) {
        let nic_tail = self.rxq_bar.read32(regs::QUEUE_TAIL_PTR_REG);
        self.rxq_tail = self.rxq_tail.wrapping_add(hw_diff(nic_tail, self.rxq_tail));
    }

    /// Refill missing descriptor slots from the mempool (design §4.3).
    /// Short-returns on pool exhaustion (design §7 `ResourceExhaustion`) —
    /// never panics, never blocks.
    pub fn refill(&mut self) {
        let missing = self.size.wrapping_sub(self.rxq_head.wrapping_sub(self.rxq_clean_tail));
        if missing < REFILL_HYSTERESIS {
            return;
        }

        let mempool = match &self.mempool {
            Some(m) => m.clone(),
            None => return,
        };

        let mut posted = 0u32;
        for _ in 0..missing {
            let Some(buf) = mempool.alloc_buf() else {
                log::warn!("mqnic: rx mempool exhausted during refill, ring partially refilled");
                break;
            };
            let index = (self.rxq_head & self.size_mask) as usize;
            self.desc_ring.write(index, Descriptor { tx_csum_cmd: 0, _rsvd: 0, len: mempool.entry_size() as u32, addr: buf.payload_phys() });
            self.virt_addrs[index] = Some(buf);
            self.rxq_head = self.rxq_head.wrapping_add(1);
            posted += 1;
        }

        if posted > 0 {
            self.rxq_bar.write32(regs::QUEUE_HEAD_PTR_REG, self.rxq_head & regs::HW_PTR_MASK);
        }
    }

    /// Whether a completion is available, without consuming it (design
    /// §4.4 step 3). Returns the tail index the caller should act on.
    fn completion_available(&mut self) -> bool {
        let cpl_index = (self.cpl_tail & self.size_mask) as usize;
        if self.bypass {
            let peek_index = ((cpl_index as u32 + regs::RXCQ_BYPASS_BATCH) & self.size_mask) as usize;
            self.cpl_ring.read(peek_index).len != 0
        } else {
            let nic_head = self.cpl_bar.read32(regs::CPL_QUEUE_HEAD_PTR_REG);
            self.cpl_head = self.cpl_head.wrapping_add(hw_diff(nic_head, self.cpl_head));
            self.cpl_head != self.cpl_tail
        }
    }

    /// Drain available completions into `out`, decoding hints into
    /// `hints_out` when `want_hints` is set (design §4.4). Returns
    /// `(harvested, hint_count)`; `harvested <= out.len()` and
    /// `hint_count <= hints_out.len()`.
    pub fn rx_batch_hints(&mut self, out: &mut [Option<PktBuf>], want_hints: bool, hints_out: &mut [Hint]) -> (usize, usize) {
        self.refill();

        let mut harvested = 0usize;
        let mut hint_count = 0usize;

        while harvested < out.len() && self.completion_available() {
            let cpl_index = (self.cpl_tail & self.size_mask) as usize;
            let cpl = self.cpl_ring.read(cpl_index);

            if want_hints && hint_count < hints_out.len() {
                if let Some(hint) = decode_hint(cpl.rx_hash) {
                    hints_out[hint_count] = hint;
                    hint_count += 1;
                }
            }

            let rxq_index = (cpl.index as u32 & self.size_mask) as usize;
            if let Some(mut buf) = self.virt_addrs[rxq_index].take() {
                // Open question (design §9): the source clamps then
                // immediately overwrites with the unclamped length. Keep
                // the clamp, drop the dead overwrite.
                buf.size = (cpl.len as usize).min(buf.capacity);
                out[harvested] = Some(buf);
            }

            self.cpl_ring.write(cpl_index, Completion { len: 0, ..cpl });
            harvested += 1;
            self.cpl_tail = self.cpl_tail.wrapping_add(1);
        }

        if harvested > 0 {
            self.accumulated_cq_updates += harvested as u32;
            if self.accumulated_cq_updates > regs::RXCQ_TAIL_UPDATE_BATCH {
                self.cpl_bar.write32(regs::CPL_QUEUE_TAIL_PTR_REG, self.cpl_tail & regs::HW_PTR_MASK);
                self.accumulated_cq_updates = 0;
            }
        }

        if self.bypass {
            self.rxq_tail = self.rxq_tail.wrapping_add(harvested as u32);
        } else {
            self.read_tail_ptr();
        }

        while self.rxq_clean_tail != self.rxq_tail {
            let index = (self.rxq_clean_tail & self.size_mask) as usize;
            if self.virt_addrs[index].is_some() {
                break;
            }
            self.rxq_clean_tail = self.rxq_clean_tail.wrapping_add(1);
        }

        (harvested, hint_count)
    }

    /// Plain `rx_batch` — drain with hint decoding disabled.
    pub fn rx_batch(&mut self, out: &mut [Option<PktBuf>]) -> usize {
        let (harvested, _) = self.rx_batch_hints(out, false, &mut []);
        harvested
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

    fn test_queue(size: usize, bypass: bool) -> RxQueue {
        let mut q = RxQueue::new_deactivated(fake_bar(64), fake_bar(64), size, bypass).unwrap();
        let mempool = Mempool::allocate_for_ring(size).unwrap();
        q.activate(0, 0, 1, mempool);
        q
    }

    #[test]
    fn refill_posts_up_to_full_ring() {
        let q = test_queue(16, true);
        assert_eq!(q.rxq_head, 16);
        assert!(q.virt_addrs.iter().all(|slot| slot.is_some()));
    }

    #[test]
    fn empty_cq_drain_returns_zero_and_no_mmio_flush() {
        let mut q = test_queue(16, true);
        let before = q.accumulated_cq_updates;
        let mut out: [Option<PktBuf>; 4] = Default::default();
        let (harvested, hints) = q.rx_batch_hints(&mut out, true, &mut [Hint { app_id: 0, content: 0 }]);
        assert_eq!(harvested, 0);
        assert_eq!(hints, 0);
        assert_eq!(q.accumulated_cq_updates, before);
    }

    #[test]
    fn drain_harvests_available_completions_and_nulls_slots() {
        let mut q = test_queue(16, true);
        // simulate the NIC publishing 3 completions at cpl_tail..cpl_tail+3
        for i in 0..3u32 {
            q.cpl_ring.write(i as usize, Completion { queue: 0, index: i as u16, len: 64, ts: 0, rx_hash: 0, rx_hash_type: 0, _rsvd: [0; 8] });
        }
        let mut out: [Option<PktBuf>; 8] = Default::default();
        let (harvested, _) = q.rx_batch_hints(&mut out, false, &mut []);
        assert_eq!(harvested, 3);
        assert_eq!(q.cpl_tail, 3);
        assert_eq!(q.accumulated_cq_updates, 3);
        for i in 0..3 {
            assert!(q.virt_addrs[i].is_none());
            assert_eq!(q.cpl_ring.read(i).len, 0);
        }
        assert!(out[0].is_some());
        assert_eq!(out[0].as_ref().unwrap().size, 64);
    }

    #[test]
    fn drain_crosses_batch_threshold_flushes_cq_tail() {
        let mut q = test_queue(64, true);
        q.accumulated_cq_updates = 30;
        for i in 0..5u32 {
            q.cpl_ring.write(i as usize, Completion { queue: 0, index: i as u16, len: 64, ts: 0, rx_hash: 0, rx_hash_type: 0, _rsvd: [0; 8] });
        }
        let mut out: [Option<PktBuf>; 8] = Default::default();
        let (harvested, _) = q.rx_batch_hints(&mut out, false, &mut []);
        assert_eq!(harvested, 5);
        assert_eq!(q.accumulated_cq_updates, 0);
    }

    #[test]
    fn hint_carrying_completion_is_decoded() {
        let mut q = test_queue(16, true);
        q.cpl_ring.write(
            0,
            Completion { queue: 0, index: 0, len: 64, ts: 0, rx_hash: 0x0012_0040, rx_hash_type: 0, _rsvd: [0; 8] },
        );
        let mut out: [Option<PktBuf>; 4] = Default::default();
        let mut hints = [Hint { app_id: 0, content: 0 }; 16];
        let (harvested, hint_count) = q.rx_batch_hints(&mut out, true, &mut hints);
        assert_eq!(harvested, 1);
        assert_eq!(hint_count, 1);
        assert_eq!(hints[0], Hint { app_id: 4, content: 0x0012 });
    }

    #[test]
    fn rejects_non_power_of_two_size() {
        let err = RxQueue::new_deactivated(fake_bar(64), fake_bar(64), 100, true).unwrap_err();
        assert_eq!(err, crate::error::ConfigError::NotPowerOfTwo { size: 100 });
    }
}
