//! Per-queue polling throughput benchmark (design §2, §6). One thread per
//! user queue, pinned to a distinct core, does a trivial swap of the
//! Ethernet/IP/port fields to stand in for real packet processing and
//! bounces the packet back out the same interface.
//!
//! This binary is an example consumer of `mqnic_core`, not part of the
//! driver: it owns no register layout knowledge beyond the queue count it
//! asks `Device::init` to bring up.

use std::time::Instant;

use mqnic_core::mempool::PktBuf;
use mqnic_core::{appctl, Device, DeviceConfig, Hint, RxQueue, TxQueue};

const USER_QUEUE_NUMBER: u16 = 4;
const RING_SIZE: usize = 128;
const RX_BATCH_SIZE: usize = 16;
const TX_BATCH_SIZE: usize = 1;
const FEEDBACK_BATCH_SIZE: u16 = 1;
const THROUGHPUT_REPORT_BYTES: u64 = 10_000_000;

/// Per-thread bookkeeping mirroring the reference benchmark's worker ring:
/// a fixed-size circular buffer of in-flight buffers plus running counters
/// for the periodic throughput print.
struct WorkerRing {
    queue_id: usize,
    bufs: Vec<Option<PktBuf>>,
    ring_head: usize,
    work_head: usize,
    ring_tail: usize,
    ring_empty_slots: usize,
    unprocessed_work_count: usize,
    unsent_work_count: usize,
    unsent_feedback_count: u16,

    total_count: u64,
    total_byte_count: u64,
    total_rx_batch_num: u64,
    total_rx_returned_count: u64,
    total_tx_batch_num: u64,
    total_tx_returned_count: u64,
    report_started: Instant,
}

impl WorkerRing {
    fn new(queue_id: usize) -> Self {
        let mut bufs = Vec::with_capacity(RING_SIZE);
        bufs.resize_with(RING_SIZE, || None);
        Self {
            queue_id,
            bufs,
            ring_head: 0,
            work_head: 0,
            ring_tail: 0,
            ring_empty_slots: RING_SIZE,
            unprocessed_work_count: 0,
            unsent_work_count: 0,
            unsent_feedback_count: 0,
            total_count: 0,
            total_byte_count: 0,
            total_rx_batch_num: 0,
            total_rx_returned_count: 0,
            total_tx_batch_num: 0,
            total_tx_returned_count: 0,
            report_started: Instant::now(),
        }
    }
}

/// `if_pull_rx`: drain up to a batch worth of RX, decode hints and rearm
/// their monitors, thread freshly-received buffers into the ring.
fn pull_rx(rxq: &mut RxQueue, ring: &mut WorkerRing) {
    if RING_SIZE - ring.ring_empty_slots >= TX_BATCH_SIZE + 4 {
        return;
    }
    if ring.ring_empty_slots < RX_BATCH_SIZE {
        return;
    }

    let rounded = RING_SIZE - ring.ring_head;
    let batch = RX_BATCH_SIZE.min(rounded).min(ring.ring_empty_slots);
    if batch == 0 {
        return;
    }

    let mut hints = [Hint { app_id: 0, content: 0 }; 16];
    let (num_rx, hint_count) = rxq.rx_batch_hints(&mut ring.bufs[ring.ring_head..ring.ring_head + batch], true, &mut hints);

    for hint in &hints[..hint_count] {
        log::info!("queue {}: scale-up hint app={} content=0x{:x}", ring.queue_id, hint.app_id, hint.content);
        rxq.write_mailbox(appctl::pack_monitor_reset_for_app(hint.app_id as u16));
        rxq.write_mailbox(appctl::pack_rearm_monitor(hint.app_id as u16));
    }

    if num_rx > 0 {
        ring.total_rx_returned_count += 1;
        ring.total_rx_batch_num += num_rx as u64;
        ring.unprocessed_work_count += num_rx;
        ring.ring_empty_slots -= num_rx;

        for i in 0..num_rx {
            let idx = ring.ring_head + i;
            if let Some(buf) = &ring.bufs[idx] {
                ring.total_count += 1;
                ring.total_byte_count += buf.size as u64;
            }
            ring.ring_head = (ring.ring_head + 1) % RING_SIZE;
        }
    }
}

/// `if_do_work`: swap source/destination MAC, IP and port on the oldest
/// unprocessed buffer, standing in for real packet processing.
fn do_work(ring: &mut WorkerRing) {
    if ring.unprocessed_work_count == 0 {
        return;
    }

    if let Some(buf) = &mut ring.bufs[ring.work_head] {
        let data = buf.payload_mut();
        if data.len() >= 38 {
            for i in 0..6 {
                data.swap(i, 6 + i);
            }
            for i in 0..4 {
                data.swap(26 + i, 30 + i);
            }
            data.swap(34, 36);
            data.swap(35, 37);
        }
    }

    ring.unprocessed_work_count -= 1;
    ring.unsent_feedback_count += 1;
    ring.unsent_work_count += 1;
    ring.work_head = (ring.work_head + 1) % RING_SIZE;
}

/// `if_send_feedback`: report processed-packet feedback once a batch of
/// work has accumulated.
fn send_feedback(rxq: &RxQueue, ring: &mut WorkerRing) {
    if ring.unsent_feedback_count >= FEEDBACK_BATCH_SIZE {
        rxq.write_mailbox(appctl::pack_feedback(1, FEEDBACK_BATCH_SIZE));
        ring.unsent_feedback_count -= FEEDBACK_BATCH_SIZE;
    }
}

/// `if_send_tx`: send back whatever has finished processing.
fn send_tx(txq: &mut TxQueue, ring: &mut WorkerRing) {
    if ring.unsent_work_count < TX_BATCH_SIZE {
        return;
    }

    let rounded = RING_SIZE - ring.ring_tail;
    let batch = TX_BATCH_SIZE.min(rounded).min(ring.unsent_work_count);
    if batch == 0 {
        return;
    }

    let bufs: Vec<PktBuf> = (0..batch).filter_map(|i| ring.bufs[ring.ring_tail + i].take()).collect();
    let sent = txq.tx_batch(bufs);

    ring.total_tx_returned_count += 1;
    ring.total_tx_batch_num += sent as u64;
    ring.ring_empty_slots += sent;
    ring.unsent_work_count -= sent;
    ring.ring_tail = (ring.ring_tail + sent) % RING_SIZE;
}

fn maybe_report(ring: &mut WorkerRing) {
    if ring.total_byte_count <= THROUGHPUT_REPORT_BYTES {
        return;
    }

    let elapsed = ring.report_started.elapsed().as_secs_f64();
    log::info!(
        "queue {}: {:.2} MB, {:.2} MBps, {:.3} Mpps, avg rx batch {:.2}, avg tx batch {:.2}",
        ring.queue_id,
        ring.total_byte_count as f64 / 1_000_000.0,
        ring.total_byte_count as f64 / 1_000_000.0 / elapsed,
        ring.total_count as f64 / 1_000_000.0 / elapsed,
        ring.total_rx_batch_num as f64 / ring.total_rx_returned_count.max(1) as f64,
        ring.total_tx_batch_num as f64 / ring.total_tx_returned_count.max(1) as f64,
    );

    ring.total_rx_batch_num = 0;
    ring.total_rx_returned_count = 0;
    ring.total_tx_batch_num = 0;
    ring.total_tx_returned_count = 0;
    ring.total_count = 0;
    ring.total_byte_count = 0;
    ring.report_started = Instant::now();
}

/// Pin the calling thread to core `core_id`, matching the reference
/// benchmark's `pthread_setaffinity_np` call. Best-effort: a failure here
/// degrades to unpinned scheduling rather than aborting the run.
fn pin_to_core(core_id: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core_id, &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            log::warn!("core {core_id}: failed to set CPU affinity, continuing unpinned");
        }
    }
}

fn poll_queue(mut rxq: RxQueue, mut txq: TxQueue, queue_id: usize) {
    pin_to_core(queue_id);
    log::info!("launching poll thread for queue {queue_id}");

    rxq.write_mailbox(appctl::pack_register_app(1, 0));
    rxq.write_mailbox(appctl::pack_register_app(2, 0));

    let mut ring = WorkerRing::new(queue_id);
    loop {
        pull_rx(&mut rxq, &mut ring);
        do_work(&mut ring);
        send_feedback(&rxq, &mut ring);
        send_tx(&mut txq, &mut ring);
        maybe_report(&mut ring);
    }
}

fn main() {
    simple_logger::SimpleLogger::new().init().expect("logger already initialized");

    let pci_addr = match std::env::args().nth(1) {
        Some(addr) => addr,
        None => {
            eprintln!("usage: mqnic-throughput <pci bus id>");
            std::process::exit(1);
        }
    };

    log::info!("currently only works against interface 0");

    let config = DeviceConfig::new(pci_addr).rx_queues(USER_QUEUE_NUMBER).tx_queues(USER_QUEUE_NUMBER);
    let mut dev = match Device::init(&config) {
        Ok(dev) => dev,
        Err(err) => {
            eprintln!("mqnic: bring-up failed: {err}");
            std::process::exit(1);
        }
    };

    dev.config_app_mat(1, 5678, 1);
    dev.config_app_mat(2, 1234, 2);
    dev.port_reset_monitor();

    // Each RX/TX queue pair is single-owner (design §5): hand the pair to
    // its thread once and never touch it from anywhere else again.
    let (rx_queues, tx_queues) = dev.into_queues();
    let handles: Vec<_> = rx_queues
        .into_iter()
        .zip(tx_queues)
        .enumerate()
        .map(|(queue_id, (rxq, txq))| std::thread::spawn(move || poll_queue(rxq, txq, queue_id)))
        .collect();

    for handle in handles {
        let _ = handle.join();
    }
}
