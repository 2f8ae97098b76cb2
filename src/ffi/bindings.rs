//! Hand-maintained perf_event kernel ABI.
//!
//! This is the one translation unit that must match the running kernel
//! byte for byte. Struct layouts follow
//! `include/uapi/linux/perf_event.h`; the attribute flag word is kept as
//! a plain `u64` with named accessors instead of relying on compiler
//! bit-field layout.

#![allow(non_camel_case_types)]

// perf_event_attr::type
pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_SOFTWARE: u32 = 1;
pub const PERF_TYPE_TRACEPOINT: u32 = 2;
pub const PERF_TYPE_HW_CACHE: u32 = 3;
pub const PERF_TYPE_RAW: u32 = 4;

// Generalized hardware event ids (perf_event_attr::config for PERF_TYPE_HARDWARE).
pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
pub const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
pub const PERF_COUNT_HW_CACHE_REFERENCES: u64 = 2;
pub const PERF_COUNT_HW_CACHE_MISSES: u64 = 3;
pub const PERF_COUNT_HW_BRANCH_INSTRUCTIONS: u64 = 4;
pub const PERF_COUNT_HW_BRANCH_MISSES: u64 = 5;
pub const PERF_COUNT_HW_BUS_CYCLES: u64 = 6;
pub const PERF_COUNT_HW_STALLED_CYCLES_FRONTEND: u64 = 7;
pub const PERF_COUNT_HW_STALLED_CYCLES_BACKEND: u64 = 8;
pub const PERF_COUNT_HW_REF_CPU_CYCLES: u64 = 9;

// Software event ids (perf_event_attr::config for PERF_TYPE_SOFTWARE).
pub const PERF_COUNT_SW_CPU_CLOCK: u64 = 0;
pub const PERF_COUNT_SW_TASK_CLOCK: u64 = 1;
pub const PERF_COUNT_SW_PAGE_FAULTS: u64 = 2;
pub const PERF_COUNT_SW_CONTEXT_SWITCHES: u64 = 3;
pub const PERF_COUNT_SW_CPU_MIGRATIONS: u64 = 4;
pub const PERF_COUNT_SW_PAGE_FAULTS_MIN: u64 = 5;
pub const PERF_COUNT_SW_PAGE_FAULTS_MAJ: u64 = 6;

// Hardware cache event encoding: id | (op << 8) | (result << 16).
pub const PERF_COUNT_HW_CACHE_L1D: u64 = 0;
pub const PERF_COUNT_HW_CACHE_L1I: u64 = 1;
pub const PERF_COUNT_HW_CACHE_LL: u64 = 2;
pub const PERF_COUNT_HW_CACHE_DTLB: u64 = 3;
pub const PERF_COUNT_HW_CACHE_ITLB: u64 = 4;
pub const PERF_COUNT_HW_CACHE_BPU: u64 = 5;
pub const PERF_COUNT_HW_CACHE_NODE: u64 = 6;
pub const PERF_COUNT_HW_CACHE_OP_READ: u64 = 0;
pub const PERF_COUNT_HW_CACHE_OP_WRITE: u64 = 1;
pub const PERF_COUNT_HW_CACHE_OP_PREFETCH: u64 = 2;
pub const PERF_COUNT_HW_CACHE_RESULT_ACCESS: u64 = 0;
pub const PERF_COUNT_HW_CACHE_RESULT_MISS: u64 = 1;

// perf_event_attr::read_format
pub const PERF_FORMAT_TOTAL_TIME_ENABLED: u64 = 1 << 0;
pub const PERF_FORMAT_TOTAL_TIME_RUNNING: u64 = 1 << 1;
pub const PERF_FORMAT_ID: u64 = 1 << 2;
pub const PERF_FORMAT_GROUP: u64 = 1 << 3;

// perf_event_attr::sample_type
pub const PERF_SAMPLE_IP: u64 = 1 << 0;

// perf_event_header::type
pub const PERF_RECORD_LOST: u32 = 2;
pub const PERF_RECORD_SAMPLE: u32 = 9;

// ioctls on perf event fds: _IO('$', 0..) and friends.
pub const PERF_EVENT_IOC_ENABLE: u64 = 0x2400;
pub const PERF_EVENT_IOC_DISABLE: u64 = 0x2401;
pub const PERF_EVENT_IOC_REFRESH: u64 = 0x2402;
pub const PERF_EVENT_IOC_RESET: u64 = 0x2403;
pub const PERF_EVENT_IOC_ID: u64 = 0x8008_2407;

// perf_event_open() flags.
pub const PERF_FLAG_FD_CLOEXEC: u64 = 1 << 3;

// perf_event_mmap_page::capabilities
pub const PERF_CAP_USER_RDPMC: u64 = 1 << 2;

/// `struct perf_event_attr`, PERF_ATTR_SIZE_VER5 (112 bytes).
///
/// The kernel accepts any attr whose trailing bytes past the size it
/// knows are zero, so a zeroed `Default` is forward and backward safe.
/// Anonymous unions are collapsed to the single member this crate uses
/// (`sample_period`/`sample_freq` share storage, as do
/// `wakeup_events`/`wakeup_watermark` and `config1`/`config2` with the
/// breakpoint fields).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct perf_event_attr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period: u64,
    pub sample_type: u64,
    pub read_format: u64,
    flags: u64,
    pub wakeup_events: u32,
    pub bp_type: u32,
    pub config1: u64,
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub __reserved_2: u16,
}

macro_rules! attr_flag {
    ($(#[$doc:meta])* $get:ident, $set:ident, $bit:literal) => {
        $(#[$doc])*
        pub fn $get(&self) -> bool {
            self.flags & (1 << $bit) != 0
        }

        pub fn $set(&mut self, on: bool) {
            if on {
                self.flags |= 1 << $bit;
            } else {
                self.flags &= !(1 << $bit);
            }
        }
    };
}

impl perf_event_attr {
    pub fn sized() -> Self {
        Self {
            size: size_of::<Self>() as _,
            ..Default::default()
        }
    }

    attr_flag!(disabled, set_disabled, 0);
    attr_flag!(inherit, set_inherit, 1);
    attr_flag!(pinned, set_pinned, 2);
    attr_flag!(exclusive, set_exclusive, 3);
    attr_flag!(exclude_user, set_exclude_user, 4);
    attr_flag!(exclude_kernel, set_exclude_kernel, 5);
    attr_flag!(exclude_hv, set_exclude_hv, 6);
    attr_flag!(exclude_idle, set_exclude_idle, 7);
    attr_flag!(mmap, set_mmap, 8);
    attr_flag!(comm, set_comm, 9);
    attr_flag!(
        /// `sample_period` holds a frequency instead of a period.
        freq,
        set_freq,
        10
    );
    attr_flag!(inherit_stat, set_inherit_stat, 11);
    attr_flag!(enable_on_exec, set_enable_on_exec, 12);
    attr_flag!(task, set_task, 13);
    attr_flag!(
        /// `wakeup_events` holds a byte watermark instead of a sample count.
        watermark,
        set_watermark,
        14
    );
    // Bits 15-16 are the two-bit precise_ip skid constraint.
    attr_flag!(mmap_data, set_mmap_data, 17);
    attr_flag!(sample_id_all, set_sample_id_all, 18);
    attr_flag!(exclude_host, set_exclude_host, 19);
    attr_flag!(exclude_guest, set_exclude_guest, 20);

    pub fn precise_ip(&self) -> u8 {
        ((self.flags >> 15) & 0b11) as u8
    }

    pub fn set_precise_ip(&mut self, skid: u8) {
        self.flags &= !(0b11 << 15);
        self.flags |= u64::from(skid & 0b11) << 15;
    }
}

/// `struct perf_event_header`, the 8-byte prefix of every ring-buffer record.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct perf_event_header {
    pub type_: u32,
    pub misc: u16,
    pub size: u16,
}

/// `struct perf_event_mmap_page`, the control page at the start of a
/// counter's mmap region. `data_head` sits at byte offset 1024 per the
/// ABI; the reserved block below pads out to exactly that.
#[repr(C)]
pub struct perf_event_mmap_page {
    pub version: u32,
    pub compat_version: u32,
    pub lock: u32,
    pub index: u32,
    pub offset: i64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub capabilities: u64,
    pub pmc_width: u16,
    pub time_shift: u16,
    pub time_mult: u32,
    pub time_offset: u64,
    pub time_zero: u64,
    pub size: u32,
    pub __reserved_1: u32,
    pub time_cycles: u64,
    pub time_mask: u64,
    pub __reserved: [u8; 116 * 8],
    pub data_head: u64,
    pub data_tail: u64,
    pub data_offset: u64,
    pub data_size: u64,
    pub aux_head: u64,
    pub aux_tail: u64,
    pub aux_offset: u64,
    pub aux_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn attr_is_size_ver5() {
        assert_eq!(size_of::<perf_event_attr>(), 112);
    }

    #[test]
    fn mmap_page_data_head_offset() {
        assert_eq!(offset_of!(perf_event_mmap_page, data_head), 1024);
        assert_eq!(offset_of!(perf_event_mmap_page, data_tail), 1032);
    }

    #[test]
    fn attr_flag_accessors_round_trip() {
        let mut attr = perf_event_attr::sized();
        attr.set_disabled(true);
        attr.set_pinned(true);
        attr.set_exclude_kernel(true);
        assert!(attr.disabled());
        assert!(attr.pinned());
        assert!(attr.exclude_kernel());
        assert!(!attr.exclude_user());

        attr.set_pinned(false);
        assert!(!attr.pinned());
        assert!(attr.disabled());

        attr.set_precise_ip(2);
        assert_eq!(attr.precise_ip(), 2);
        assert!(!attr.watermark());
    }
}
