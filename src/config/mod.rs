//! Kernel feature detection and counting-mode configuration.

use std::fs;

use crate::ffi::bindings as b;

/// Which privilege levels a counter measures. Combines with `|`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Domain(u8);

impl Domain {
    pub const USER: Self = Self(1 << 0);
    pub const KERNEL: Self = Self(1 << 1);
    pub const SUPERVISOR: Self = Self(1 << 2);
    pub const OTHER: Self = Self(1 << 3);
    pub const ALL: Self = Self(0b1111);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Domain {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Default for Domain {
    fn default() -> Self {
        Self::USER | Self::KERNEL
    }
}

/// Whether a set counts one thread or a whole CPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Granularity {
    #[default]
    Thread,
    System,
}

/// Running kernel version, packed as `(major << 16) | (minor << 8) | patch`
/// so version thresholds compare as plain integers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelInfo(u32);

impl KernelInfo {
    pub fn from_version(major: u32, minor: u32, patch: u32) -> Self {
        Self((major << 16) | (minor << 8) | patch)
    }

    /// Queries the running kernel via `uname(2)`. A release string that
    /// fails to parse is treated as a current kernel, which disables
    /// every old-kernel workaround.
    pub fn current() -> Self {
        let mut name: libc::utsname = unsafe { std::mem::zeroed() };
        if unsafe { libc::uname(&mut name) } != 0 {
            return Self::from_version(u32::MAX >> 16, 0, 0);
        }
        let release = name
            .release
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8 as char)
            .collect::<String>();
        Self::parse(&release).unwrap_or(Self::from_version(u32::MAX >> 16, 0, 0))
    }

    fn parse(release: &str) -> Option<Self> {
        let mut parts = release.split(['.', '-']).map(|p| p.parse::<u32>().ok());
        let major = parts.next()??;
        let minor = parts.next()??;
        let patch = parts.next().flatten().unwrap_or(0);
        Some(Self::from_version(major, minor, patch))
    }

    /// Before 2.6.34 (and on MIPS at any version) a grouped read on an
    /// inherited event returns garbage, so FORMAT_GROUP must be avoided.
    pub fn format_group_bug(self) -> bool {
        if cfg!(target_arch = "mips") || cfg!(target_arch = "mips64") {
            return true;
        }
        self < Self::from_version(2, 6, 34)
    }

    /// Before 2.6.33 a read does not synchronize the child counts of an
    /// inherited event into the parent.
    pub fn sync_read_bug(self) -> bool {
        self < Self::from_version(2, 6, 33)
    }

    /// The kernel rotates over-committed event groups itself from 2.6.34.
    pub fn multiplexing_supported(self) -> bool {
        self >= Self::from_version(2, 6, 34)
    }

    /// `F_SETOWN_EX` landed in 2.6.32; without it overflow signals for a
    /// multi-threaded process cannot be steered to the right thread.
    pub fn setown_ex_supported(self) -> bool {
        self >= Self::from_version(2, 6, 32)
    }

    /// `PERF_FLAG_FD_CLOEXEC` landed in 3.14; earlier kernels reject
    /// unknown open flags with EINVAL.
    pub fn cloexec_flag_supported(self) -> bool {
        self >= Self::from_version(3, 14, 0)
    }
}

/// Value passed to `PERF_EVENT_IOC_REFRESH` to re-arm one overflow.
/// PowerPC kernels treat the argument as an increment-past, not a count.
pub fn refresh_value() -> u64 {
    if cfg!(target_arch = "powerpc") || cfg!(target_arch = "powerpc64") {
        0
    } else {
        1
    }
}

/// Picks the `read_format` bits for every event in a set.
///
/// Multiplexed sets need the enabled/running times to scale raw counts.
/// Grouped reads cut the syscall count to one per set but are refused
/// when events are inherited into children or the kernel mis-reports
/// grouped reads.
pub fn read_format(multiplexed: bool, inherit: bool, want_group: bool, kernel: &KernelInfo) -> u64 {
    let mut format = 0;

    if multiplexed {
        format |= b::PERF_FORMAT_TOTAL_TIME_ENABLED | b::PERF_FORMAT_TOTAL_TIME_RUNNING;
    }

    if !inherit && !kernel.format_group_bug() && want_group {
        format |= b::PERF_FORMAT_GROUP;
    }

    format
}

/// Reads `/proc/sys/kernel/perf_event_paranoid`. Missing or unreadable
/// means perf_event is not configured into this kernel.
pub fn paranoid_level() -> Option<i32> {
    let text = fs::read_to_string("/proc/sys/kernel/perf_event_paranoid").ok()?;
    text.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_packing_orders() {
        assert!(KernelInfo::from_version(2, 6, 32) < KernelInfo::from_version(2, 6, 34));
        assert!(KernelInfo::from_version(3, 0, 0) > KernelInfo::from_version(2, 6, 39));
        assert!(KernelInfo::from_version(5, 15, 0) > KernelInfo::from_version(4, 19, 260));
    }

    #[test]
    fn release_string_parses() {
        assert_eq!(
            KernelInfo::parse("6.8.0-45-generic"),
            Some(KernelInfo::from_version(6, 8, 0))
        );
        assert_eq!(
            KernelInfo::parse("5.15.133"),
            Some(KernelInfo::from_version(5, 15, 133))
        );
        assert_eq!(KernelInfo::parse("mystery"), None);
    }

    #[test]
    fn old_kernel_workarounds() {
        let old = KernelInfo::from_version(2, 6, 30);
        assert!(old.format_group_bug());
        assert!(old.sync_read_bug());
        assert!(!old.setown_ex_supported());

        let new = KernelInfo::from_version(6, 8, 0);
        if !cfg!(any(target_arch = "mips", target_arch = "mips64")) {
            assert!(!new.format_group_bug());
        }
        assert!(!new.sync_read_bug());
        assert!(new.setown_ex_supported());
    }

    #[test]
    fn cloexec_open_flag_needs_3_14() {
        assert!(!KernelInfo::from_version(3, 13, 11).cloexec_flag_supported());
        assert!(KernelInfo::from_version(3, 14, 0).cloexec_flag_supported());
        assert!(KernelInfo::from_version(6, 8, 0).cloexec_flag_supported());
    }

    #[test]
    fn read_format_negotiation() {
        let new = KernelInfo::from_version(6, 8, 0);
        let times = b::PERF_FORMAT_TOTAL_TIME_ENABLED | b::PERF_FORMAT_TOTAL_TIME_RUNNING;

        // Plain counting on a current kernel gets a grouped read.
        if !cfg!(any(target_arch = "mips", target_arch = "mips64")) {
            assert_eq!(read_format(false, false, true, &new), b::PERF_FORMAT_GROUP);
            assert_eq!(read_format(true, false, true, &new), times | b::PERF_FORMAT_GROUP);
        }

        // Inheritance forbids grouped reads but keeps scaling times.
        assert_eq!(read_format(true, true, true, &new), times);
        assert_eq!(read_format(false, true, true, &new), 0);

        // A buggy kernel never gets FORMAT_GROUP.
        let old = KernelInfo::from_version(2, 6, 33);
        assert_eq!(read_format(false, false, true, &old), 0);
    }

    #[test]
    fn domain_combines() {
        let d = Domain::USER | Domain::KERNEL;
        assert!(d.contains(Domain::USER));
        assert!(d.contains(Domain::KERNEL));
        assert!(!d.contains(Domain::SUPERVISOR));
        assert_eq!(Domain::default(), d);
    }
}
