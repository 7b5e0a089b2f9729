//! Register offsets and wire-layout constants (design §4.8, §6).
//!
//! Per-queue and per-completion-queue register blocks share one stride
//! and one offset layout; `MQNIC_CPL_QUEUE_STRIDE`/`MQNIC_QUEUE_STRIDE`
//! pick out the i-th queue's block within its region.

pub const DESC_SIZE: usize = 16;
pub const CPL_SIZE: usize = 32;

pub const QUEUE_STRIDE: usize = 0x20;
pub const CPL_QUEUE_STRIDE: usize = 0x20;

pub const QUEUE_ACTIVE_MASK: u32 = 1 << 31;
pub const CPL_QUEUE_ACTIVE_MASK: u32 = 1 << 31;

// Per-queue register block (offsets within one QUEUE_STRIDE window).
pub const QUEUE_ACTIVE_LOG_SIZE_REG: usize = 0x00;
pub const QUEUE_CPL_QUEUE_INDEX_REG: usize = 0x04;
pub const QUEUE_HEAD_PTR_REG: usize = 0x08;
pub const QUEUE_TAIL_PTR_REG: usize = 0x0c;
pub const QUEUE_BASE_ADDR_REG: usize = 0x10;

// Completion-queue register block.
pub const CPL_QUEUE_ACTIVE_LOG_SIZE_REG: usize = 0x00;
pub const CPL_QUEUE_INTERRUPT_INDEX_REG: usize = 0x04;
pub const CPL_QUEUE_HEAD_PTR_REG: usize = 0x08;
pub const CPL_QUEUE_TAIL_PTR_REG: usize = 0x0c;
pub const CPL_QUEUE_BASE_ADDR_REG: usize = 0x10;
pub const CPL_QUEUE_CPU_MSG_REG: usize = 0x18;

// Top-level CSR block (at BAR0 + 0).
pub const REG_FW_ID: usize = 0x00;
pub const REG_FW_VER: usize = 0x04;
pub const REG_BOARD_ID: usize = 0x08;
pub const REG_BOARD_VER: usize = 0x0c;
pub const REG_IF_CSR_OFFSET: usize = 0x10;

// Interface CSR block.
pub const IF_REG_EVENT_QUEUE_COUNT: usize = 0x00;
pub const IF_REG_RX_QUEUE_COUNT: usize = 0x04;
pub const IF_REG_TX_QUEUE_COUNT: usize = 0x08;
pub const IF_REG_RX_QUEUE_OFFSET: usize = 0x0c;
pub const IF_REG_RX_CPL_QUEUE_OFFSET: usize = 0x10;
pub const IF_REG_TX_QUEUE_OFFSET: usize = 0x14;
pub const IF_REG_TX_CPL_QUEUE_OFFSET: usize = 0x18;
pub const IF_REG_PORT_OFFSET: usize = 0x1c;

// Port register block.
pub const PORT_REG_SCHED_OFFSET: usize = 0x00;
pub const PORT_REG_SCHED_ENABLE: usize = 0x04;
pub const PORT_REG_APP_CONFIG: usize = 0x08;
pub const PORT_REG_USER_OFFSET: usize = 0x0c;
pub const PORT_REG_USER_RSS_MASK: usize = 0x10;
pub const PORT_REG_USER_IP: usize = 0x14;
pub const PORT_REG_DISPATCH_POLICY: usize = 0x18;
pub const PORT_REG_USER_QUEUE_BOUND: usize = 0x1c;

/// PCI base class for network controllers. `init` rejects anything else.
pub const PCI_CLASS_NETWORK: u8 = 2;

pub const HW_PTR_MASK: u32 = 0xFFFF;

pub const NUM_RX_QUEUE_ENTRIES: usize = 256;
pub const NUM_TX_QUEUE_ENTRIES: usize = 256;

pub const RXCQ_BYPASS_BATCH: u32 = 0;
pub const RXCQ_TAIL_UPDATE_BATCH: u32 = 32;
pub const TX_CQ_REAP_BUDGET: u32 = 64;

pub const RX_KERNEL_QUEUE_NUMBER: u32 = 0;
pub const TX_KERNEL_QUEUE_NUMBER: u32 = 0;

pub const HINT_CAPACITY: usize = 16;

pub const MAX_QUEUES: u16 = 64;
pub const PER_CORE_RANK_BOUND: u32 = 32;

/// `round_power` / `log2_floor` (design §4.8, §9): the floor of log2 of a
/// power-of-two queue size, used to program `*_ACTIVE_LOG_SIZE_REG`.
pub fn log2_floor(x: u32) -> u32 {
    31 - x.leading_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log2_floor_matches_power_of_two_sizes() {
        assert_eq!(log2_floor(256), 8);
        assert_eq!(log2_floor(1), 0);
        assert_eq!(log2_floor(65536), 16);
    }
}
