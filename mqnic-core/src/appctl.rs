//! CPU-message mailbox packing (design §4.6, §9).
//!
//! One function per opcode, each returning the packed 32-bit word. This
//! is the single place the bit layout exists — both the live device
//! path and the test suite call through here, never hand-roll the
//! shifts/masks themselves.

/// Value written directly (not bitfield-packed) at RX-queue bring-up to
/// tell the per-core dispatcher this mailbox slot is live.
pub const DISPATCHER_INIT: u32 = 17;

pub fn pack_register_app(app_id: u16, priority: u8) -> u32 {
    ((1u32 << 20) & 0x00f0_0000)
        | ((5u32 << 16) & 0x000f_0000)
        | ((u32::from(app_id) << 4) & 0x0000_0ff0)
        | ((u32::from(priority) << 12) & 0x0000_f000)
        | (3 & 0x0000_000f)
}

pub fn pack_deregister_app(app_id: u16) -> u32 {
    ((u32::from(app_id) << 4) & 0x0000_0ff0) | (4 & 0x0000_000f)
}

pub fn pack_feedback(app_id: u16, update_count: u16) -> u32 {
    ((u32::from(update_count) << 16) & 0xffff_0000)
        | ((u32::from(app_id) << 4) & 0x0000_0ff0)
        | (5 & 0x0000_000f)
}

pub fn pack_monitor_reset_for_app(app_id: u16) -> u32 {
    ((u32::from(app_id) << 4) & 0x0000_0ff0) | (6 & 0x0000_000f)
}

pub fn pack_rearm_monitor(app_id: u16) -> u32 {
    ((u32::from(app_id) << 4) & 0x0000_0ff0) | (7 & 0x0000_000f)
}

/// Port-wide application match table, op=0: plain app-to-port mapping.
pub fn pack_port_config_app(app_id: u16, port_num: u16, priority: u8) -> u32 {
    ((u32::from(port_num) << 16) & 0xffff_0000)
        | ((u32::from(priority) << 12) & 0x0000_f000)
        | ((u32::from(app_id) << 4) & 0x0000_0ff0)
}

/// Port-wide application match table, op=2: device-wide monitor reset.
pub fn pack_port_reset_monitor() -> u32 {
    2 & 0x0000_000f
}

/// Port-wide application match table, op=1: configure/monitor set.
pub fn pack_port_set_monitor(app_id: u16, cong_epoch_log: u8, scale_down_epoch_log: u8, scale_down_thresh: u8) -> u32 {
    ((u32::from(scale_down_thresh) << 28) & 0xf000_0000)
        | ((u32::from(cong_epoch_log) << 20) & 0x0ff0_0000)
        | ((u32::from(scale_down_epoch_log) << 12) & 0x000f_f000)
        | ((u32::from(app_id) << 4) & 0x0000_0ff0)
        | (1 & 0x0000_000f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_app_scenario() {
        // register_app(q=2, app=5, prio=3)
        assert_eq!(pack_register_app(5, 3), (1 << 20) | (5 << 16) | (5 << 4) | (3 << 12) | 3);
    }

    #[test]
    fn feedback_scenario() {
        // rx_feedback(q=2, app=5, count=7)
        assert_eq!(pack_feedback(5, 7), (7 << 16) | (5 << 4) | 5);
    }

    #[test]
    fn feedback_zero_count_is_legal() {
        assert_eq!(pack_feedback(5, 0), (5 << 4) | 5);
    }

    #[test]
    fn deregister_app_packs_opcode_four() {
        assert_eq!(pack_deregister_app(9), (9 << 4) | 4);
    }

    #[test]
    fn monitor_reset_and_rearm_pack_distinct_opcodes() {
        assert_eq!(pack_monitor_reset_for_app(4), (4 << 4) | 6);
        assert_eq!(pack_rearm_monitor(4), (4 << 4) | 7);
    }

    #[test]
    fn hint_scenario_rearm_sequence() {
        // hint for app_id=4 -> rearm_monitor issues opcode 6 then opcode 7
        assert_eq!(pack_monitor_reset_for_app(4), (4 << 4) | 6);
        assert_eq!(pack_rearm_monitor(4), (4 << 4) | 7);
    }

    #[test]
    fn port_config_app_has_no_opcode_nibble() {
        assert_eq!(pack_port_config_app(5, 2, 3), (2 << 16) | (3 << 12) | (5 << 4));
    }

    #[test]
    fn port_reset_monitor_is_opcode_two() {
        assert_eq!(pack_port_reset_monitor(), 2);
    }

    #[test]
    fn port_set_monitor_packs_all_fields() {
        assert_eq!(pack_port_set_monitor(5, 2, 3, 1), (1u32 << 28) | (2 << 20) | (3 << 12) | (5 << 4) | 1);
    }
}
