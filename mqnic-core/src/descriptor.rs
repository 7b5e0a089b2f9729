//! Fixed-layout DMA structures: descriptors, completion records (design §3).

/// A 16-byte TX or RX descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Descriptor {
    pub tx_csum_cmd: u16,
    pub _rsvd: u16,
    pub len: u32,
    pub addr: u64,
}

pub const DESCRIPTOR_SIZE: usize = 16;

impl Descriptor {
    pub const fn zeroed() -> Self {
        Self { tx_csum_cmd: 0, _rsvd: 0, len: 0, addr: 0 }
    }
}

const _: () = assert!(std::mem::size_of::<Descriptor>() == DESCRIPTOR_SIZE);

/// A 32-byte completion record.
///
/// `len == 0` is the bypass-read sentinel for "not yet written by the
/// NIC" (design §3, §4.4): hardware zeros `len` when a ring slot is
/// reused and writes a non-zero `len` only after the completion's other
/// fields are fully published, which is why a bypass reader may treat a
/// non-zero `len` as a linearisation point without reading anything else
/// first.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub queue: u16,
    pub index: u16,
    pub len: u32,
    pub ts: u64,
    pub rx_hash: u32,
    pub rx_hash_type: u32,
    pub _rsvd: [u8; 8],
}

pub const COMPLETION_SIZE: usize = 32;

impl Completion {
    pub const fn zeroed() -> Self {
        Self { queue: 0, index: 0, len: 0, ts: 0, rx_hash: 0, rx_hash_type: 0, _rsvd: [0; 8] }
    }
}

const _: () = assert!(std::mem::size_of::<Completion>() == COMPLETION_SIZE);

/// Fixed offset of a packet's payload region within its `PktBuf` backing
/// storage. The driver always programs descriptors with
/// `buf_phys + PAYLOAD_OFFSET`, never a bare buffer-start address.
pub const PAYLOAD_OFFSET: usize = 64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts_match_wire_sizes() {
        assert_eq!(std::mem::size_of::<Descriptor>(), 16);
        assert_eq!(std::mem::size_of::<Completion>(), 32);
    }

    #[test]
    fn zero_len_completion_is_the_bypass_sentinel() {
        let cpl = Completion::zeroed();
        assert_eq!(cpl.len, 0);
    }
}
