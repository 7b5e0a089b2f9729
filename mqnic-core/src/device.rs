//! Device bring-up and the public driver surface (design §4.8, §6).

use std::time::Duration;

use crate::appctl;
use crate::bar::Bar;
use crate::config::DeviceConfig;
use crate::error::{ConfigError, ConfigResult};
use crate::hints::Hint;
use crate::mempool::{Mempool, PktBuf};
use crate::regs;
use crate::rx_queue::RxQueue;
use crate::tx_queue::TxQueue;

/// A bring-up'd interface: BAR0, discovered per-interface CSR offsets, and
/// the RX/TX queue arrays (design §3 `Device`).
pub struct Device {
    _bar0: mqnic_pci::Bar0,
    port_bar: Bar,
    rx_queues: Vec<RxQueue>,
    tx_queues: Vec<TxQueue>,
}

// SAFETY: each RxQueue/TxQueue is handed to exactly one owning thread after
// `init` returns (design §5); `Device` itself is only ever touched from the
// thread that called `init` for bring-up and queue lookup, never
// concurrently with per-queue hot-path calls on the same queue.
unsafe impl Send for Device {}

impl Device {
    /// Full bring-up sequence (design §4.8): open BAR0, discover interface
    /// CSR offsets, validate queue counts, program and activate every
    /// queue, enable the scheduler, and configure RSS.
    pub fn init(config: &DeviceConfig) -> ConfigResult<Self> {
        if config.rx_queues > regs::MAX_QUEUES {
            return Err(ConfigError::TooManyQueues { requested: config.rx_queues, max: regs::MAX_QUEUES });
        }
        if config.tx_queues > regs::MAX_QUEUES {
            return Err(ConfigError::TooManyQueues { requested: config.tx_queues, max: regs::MAX_QUEUES });
        }

        let bar0 = mqnic_pci::open_bar0(&config.pci_addr)?;
        let bar = unsafe { Bar::new(bar0.addr) };

        let fw_id = bar.read32(regs::REG_FW_ID);
        let fw_ver = bar.read32(regs::REG_FW_VER);
        let board_id = bar.read32(regs::REG_BOARD_ID);
        let board_ver = bar.read32(regs::REG_BOARD_VER);
        log::info!("mqnic: fw_id=0x{fw_id:08x} fw_ver=0x{fw_ver:08x} board_id=0x{board_id:08x} board_ver=0x{board_ver:08x}");

        let if_csr_offset = bar.read32(regs::REG_IF_CSR_OFFSET) as usize;
        let csr_bar = bar.sub_bar(if_csr_offset);

        let num_event_queues = csr_bar.read32(regs::IF_REG_EVENT_QUEUE_COUNT);
        let rx_queue_offset = csr_bar.read32(regs::IF_REG_RX_QUEUE_OFFSET) as usize;
        let rx_cpl_queue_offset = csr_bar.read32(regs::IF_REG_RX_CPL_QUEUE_OFFSET) as usize;
        let tx_queue_offset = csr_bar.read32(regs::IF_REG_TX_QUEUE_OFFSET) as usize;
        let tx_cpl_queue_offset = csr_bar.read32(regs::IF_REG_TX_CPL_QUEUE_OFFSET) as usize;
        let port_offset = csr_bar.read32(regs::IF_REG_PORT_OFFSET) as usize;

        log::info!(
            "mqnic: rx_queue_offset=0x{rx_queue_offset:x} rx_cpl_queue_offset=0x{rx_cpl_queue_offset:x} \
             tx_queue_offset=0x{tx_queue_offset:x} tx_cpl_queue_offset=0x{tx_cpl_queue_offset:x} port_offset=0x{port_offset:x}"
        );

        // init_tx (design §4.8 step 4): program every TX queue's register
        // blocks deactivated-then-sized before any queue is activated.
        let mut tx_queues = Vec::with_capacity(config.tx_queues as usize);
        for i in 0..config.tx_queues {
            let txq_bar = bar.sub_bar(tx_queue_offset + i as usize * regs::QUEUE_STRIDE + regs::TX_KERNEL_QUEUE_NUMBER as usize * regs::QUEUE_STRIDE);
            let cpl_bar = bar.sub_bar(
                tx_cpl_queue_offset + i as usize * regs::CPL_QUEUE_STRIDE + regs::TX_KERNEL_QUEUE_NUMBER as usize * regs::CPL_QUEUE_STRIDE,
            );
            tx_queues.push(TxQueue::new_deactivated(txq_bar, cpl_bar, regs::NUM_TX_QUEUE_ENTRIES, config.bypass_mode)?);
        }

        // init_rx (design §4.8 step 5): mirror of init_tx.
        let mut rx_queues = Vec::with_capacity(config.rx_queues as usize);
        for i in 0..config.rx_queues {
            let rxq_bar = bar.sub_bar(rx_queue_offset + i as usize * regs::QUEUE_STRIDE + regs::RX_KERNEL_QUEUE_NUMBER as usize * regs::QUEUE_STRIDE);
            let cpl_bar = bar.sub_bar(
                rx_cpl_queue_offset + i as usize * regs::CPL_QUEUE_STRIDE + regs::RX_KERNEL_QUEUE_NUMBER as usize * regs::CPL_QUEUE_STRIDE,
            );
            rx_queues.push(RxQueue::new_deactivated(rxq_bar, cpl_bar, regs::NUM_RX_QUEUE_ENTRIES, config.bypass_mode)?);
        }

        // start_txq_cpl_queue (design §4.8 step 6): activate every TX queue
        // only after all queues are fully programmed.
        for (i, queue) in tx_queues.iter_mut().enumerate() {
            queue.activate(i as u16, regs::TX_KERNEL_QUEUE_NUMBER, num_event_queues);
        }

        // start_rxq_cpl_queue (design §4.8 step 7): allocate each queue's
        // mempool, activate, refill, and read back the tail pointer.
        for (i, queue) in rx_queues.iter_mut().enumerate() {
            let mempool = Mempool::allocate_for_ring(regs::NUM_RX_QUEUE_ENTRIES)?;
            queue.activate(i as u16, regs::RX_KERNEL_QUEUE_NUMBER, num_event_queues, mempool);
        }

        let port_bar = bar.sub_bar(port_offset);

        // activate_hw_sche (design §4.8 step 8).
        let sched_offset = port_bar.read32(regs::PORT_REG_SCHED_OFFSET);
        port_bar.write32(regs::PORT_REG_SCHED_ENABLE, 0xffff_ffff);
        for k in regs::TX_KERNEL_QUEUE_NUMBER..(regs::TX_KERNEL_QUEUE_NUMBER + config.tx_queues as u32) {
            port_bar.write32(sched_offset as usize + k as usize * 4, 3);
        }

        // RSS / dispatch configuration (design §4.8 step 9).
        port_bar.write32(regs::PORT_REG_USER_OFFSET, regs::RX_KERNEL_QUEUE_NUMBER);
        port_bar.write32(regs::PORT_REG_USER_RSS_MASK, config.rx_queues as u32 - 1);
        port_bar.write32(regs::PORT_REG_USER_IP, 0xc0a8_e902);
        port_bar.write32(regs::PORT_REG_DISPATCH_POLICY, 1);
        port_bar.write32(regs::PORT_REG_USER_QUEUE_BOUND, regs::PER_CORE_RANK_BOUND * 5);

        // Hardware settle time (design §4.8 step 10).
        std::thread::sleep(Duration::from_millis(5));

        log::info!("mqnic: bring-up complete, {} rx / {} tx queues active", rx_queues.len(), tx_queues.len());

        Ok(Self { _bar0: bar0, port_bar, rx_queues, tx_queues })
    }

    pub fn num_rx_queues(&self) -> usize {
        self.rx_queues.len()
    }

    pub fn num_tx_queues(&self) -> usize {
        self.tx_queues.len()
    }

    /// Consume the device, returning every RX and TX queue for the caller
    /// to distribute across polling threads (design §5).
    pub fn into_queues(self) -> (Vec<RxQueue>, Vec<TxQueue>) {
        (self.rx_queues, self.tx_queues)
    }

    pub fn rx_batch(&mut self, qid: usize, out: &mut [Option<PktBuf>]) -> usize {
        self.rx_queues[qid].rx_batch(out)
    }

    pub fn rx_batch_hints(&mut self, qid: usize, out: &mut [Option<PktBuf>], want_hints: bool, hints_out: &mut [Hint]) -> (usize, usize) {
        self.rx_queues[qid].rx_batch_hints(out, want_hints, hints_out)
    }

    pub fn tx_batch(&mut self, qid: usize, bufs: Vec<PktBuf>) -> usize {
        self.tx_queues[qid].tx_batch(bufs)
    }

    /// Register an application on `queue_id`'s mailbox (design §4.6,
    /// opcode 3).
    pub fn register_app(&self, queue_id: usize, app_id: u16, priority: u8) {
        self.rx_queues[queue_id].write_mailbox(appctl::pack_register_app(app_id, priority));
    }

    /// Deregister an application (design §4.6, opcode 4).
    pub fn deregister_app(&self, queue_id: usize, app_id: u16) {
        self.rx_queues[queue_id].write_mailbox(appctl::pack_deregister_app(app_id));
    }

    /// Report feedback for `app_id` on `queue_id`'s mailbox (design §4.6,
    /// opcode 5). `update_count == 0` is legal.
    pub fn rx_feedback(&self, queue_id: usize, app_id: u16, update_count: u16) {
        self.rx_queues[queue_id].write_mailbox(appctl::pack_feedback(app_id, update_count));
    }

    /// Configure the port-wide application match table (design §4.6, op=0:
    /// plain app-to-port mapping, no opcode nibble).
    pub fn config_app_mat(&self, app_id: u16, port_num: u16, priority: u8) {
        self.port_bar.write32(regs::PORT_REG_APP_CONFIG, appctl::pack_port_config_app(app_id, port_num, priority));
    }

    /// Device-wide monitor reset (design §4.6, op=2).
    pub fn port_reset_monitor(&self) {
        self.port_bar.write32(regs::PORT_REG_APP_CONFIG, appctl::pack_port_reset_monitor());
    }

    /// Configure/arm the device-wide congestion monitor for `app_id`
    /// (design §4.6, op=1).
    pub fn port_set_monitor(&self, app_id: u16, cong_epoch_log: u8, scale_down_epoch_log: u8, scale_down_thresh: u8) {
        self.port_bar
            .write32(regs::PORT_REG_APP_CONFIG, appctl::pack_port_set_monitor(app_id, cong_epoch_log, scale_down_epoch_log, scale_down_thresh));
    }

    /// Rearm the per-app monitor on `queue_id` after a hint (design §4.7):
    /// opcode 6 (monitor reset-for-app) followed by opcode 7 (rearm).
    pub fn rearm_monitor(&self, queue_id: usize, app_id: u16) {
        self.rx_queues[queue_id].write_mailbox(appctl::pack_monitor_reset_for_app(app_id));
        self.rx_queues[queue_id].write_mailbox(appctl::pack_rearm_monitor(app_id));
    }

    /// Rearm the scale-down monitor on `queue_id` — opcode 7 alone, no
    /// preceding reset (design §4.6).
    pub fn rearm_scale_down_monitor(&self, queue_id: usize, app_id: u16) {
        self.rx_queues[queue_id].write_mailbox(appctl::pack_rearm_monitor(app_id));
    }
}
