//! Scale-up hint decoding (design §4.4, §4.7).
//!
//! The NIC piggybacks out-of-band scale-up notifications on a
//! completion's `rx_hash` field. Decoding is pure and separate from
//! acting on a hint (rearming the monitor is the caller's job, see
//! [`crate::appctl::pack_rearm_monitor`]).

/// A decoded scale-up notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hint {
    pub app_id: u8,
    pub content: u16,
}

/// Decode `rx_hash` into a [`Hint`], or `None` if it carries no hint
/// (`rx_hash == 0`).
pub fn decode_hint(rx_hash: u32) -> Option<Hint> {
    if rx_hash == 0 {
        return None;
    }
    Some(Hint { app_id: ((rx_hash >> 4) & 0xff) as u8, content: ((rx_hash >> 16) & 0xffff) as u16 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_rx_hash_carries_no_hint() {
        assert_eq!(decode_hint(0), None);
    }

    #[test]
    fn hint_carrying_completion_scenario() {
        // rx_hash = 0x00120040 -> app_id = 4, content = 0x0012
        let hint = decode_hint(0x0012_0040).unwrap();
        assert_eq!(hint.app_id, 4);
        assert_eq!(hint.content, 0x0012);
    }
}
