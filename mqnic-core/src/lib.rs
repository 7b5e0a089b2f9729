//! Userspace polling-mode driver core for a multi-queue programmable NIC
//! (design §1).
//!
//! This crate is the per-interface queue engine only: descriptor ring
//! management, DMA buffer pooling, the batched RX/TX state machine, and the
//! application-registration/feedback/monitor control protocol. PCI
//! enumeration and BAR0 mapping live in [`mqnic_pci`]; DMA allocation lives
//! in [`mqnic_dma`]. Both are external collaborators this crate consumes,
//! not reimplements (design §1).

pub mod appctl;
pub mod bar;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod hints;
pub mod mempool;
pub mod regs;
pub mod ring;
pub mod rx_queue;
pub mod tx_queue;

pub use config::DeviceConfig;
pub use device::Device;
pub use error::{ConfigError, ConfigResult};
pub use hints::Hint;
pub use mempool::{Mempool, PktBuf};
pub use rx_queue::RxQueue;
pub use tx_queue::TxQueue;
