//! Error types surfaced at the public driver API (see design §7).

/// Errors that can occur while configuring or bringing up the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Requested queue count exceeds `MAX_QUEUES`.
    TooManyQueues { requested: u16, max: u16 },
    /// The PCI device is not a NIC.
    NotANic,
    /// A queue size was not a power of two.
    NotPowerOfTwo { size: usize },
    /// Mapping BAR0 failed.
    Mmio(String),
    /// PCI resolution failed before BAR0 was even reached.
    Pci(String),
    /// A DMA allocation needed at bring-up failed.
    Dma(String),
}

impl ConfigError {
    pub fn description(&self) -> String {
        match self {
            ConfigError::TooManyQueues { requested, max } => {
                format!("requested {} queues, limit is {}", requested, max)
            }
            ConfigError::NotANic => "PCI device is not a NIC".to_string(),
            ConfigError::NotPowerOfTwo { size } => format!("queue size {} is not a power of two", size),
            ConfigError::Mmio(msg) => format!("BAR0 mapping failed: {}", msg),
            ConfigError::Pci(msg) => format!("PCI resolution failed: {}", msg),
            ConfigError::Dma(msg) => format!("DMA allocation failed: {}", msg),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.description())
    }
}

impl std::error::Error for ConfigError {}

impl From<mqnic_pci::PciError> for ConfigError {
    fn from(e: mqnic_pci::PciError) -> Self {
        match e {
            mqnic_pci::PciError::NotANic { .. } => ConfigError::NotANic,
            other => ConfigError::Pci(other.to_string()),
        }
    }
}

impl From<mqnic_dma::DmaError> for ConfigError {
    fn from(e: mqnic_dma::DmaError) -> Self {
        ConfigError::Dma(e.to_string())
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;
