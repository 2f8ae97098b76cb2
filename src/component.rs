//! Component-level capability detection and the backend seam.

use std::os::fd::RawFd;

use log::{debug, error};

use crate::config::{self, Domain, Granularity, KernelInfo};
use crate::error::{PerfError, Result};
use crate::event::{EventConfig, EventTable, Hardware};
use crate::ffi::bindings as b;
use crate::ffi::{syscall, Attr, PAGE_SIZE};
use crate::sample::OverflowSink;
use crate::set::{Context, EventSet, SetOption};

/// One instance of the perf_event backend, built once at startup.
///
/// Holds everything that is a property of the running kernel rather
/// than of any one event set.
#[derive(Clone, Copy, Debug)]
pub struct Component {
    pub kernel: KernelInfo,
    /// Value of `/proc/sys/kernel/perf_event_paranoid` at init.
    pub paranoid: i32,
    /// Signal number used for overflow delivery.
    pub overflow_signal: i32,
    pub default_domain: Domain,
    /// Domains the paranoid setting lets this process measure.
    pub available_domains: Domain,
    pub default_granularity: Granularity,
    /// Whether the kernel rotates over-committed groups itself.
    pub kernel_multiplexing: bool,
    pub max_counters: usize,
    /// Counters readable from user space via rdpmc.
    pub fast_counter_read: bool,
}

impl Component {
    /// Probes the kernel and builds the component description.
    ///
    /// A missing paranoid file means perf_event support is not compiled
    /// into this kernel, which is unrecoverable.
    pub fn init() -> Result<Self> {
        let paranoid = config::paranoid_level().ok_or(PerfError::Unsupported)?;
        let kernel = KernelInfo::current();
        let root = unsafe { libc::getuid() } == 0;

        let component = Self {
            kernel,
            paranoid,
            overflow_signal: libc::SIGRTMIN() + 2,
            default_domain: Domain::default(),
            available_domains: available_domains(paranoid, root),
            default_granularity: Granularity::default(),
            kernel_multiplexing: kernel.multiplexing_supported(),
            max_counters: crate::set::MAX_COUNTERS,
            fast_counter_read: detect_rdpmc(&kernel),
        };
        debug!("perf_event component: {component:?}");
        Ok(component)
    }
}

/// Paranoid levels above 1 deny kernel-mode counting to unprivileged
/// processes; the other domains stay measurable.
fn available_domains(paranoid: i32, root: bool) -> Domain {
    if paranoid > 1 && !root {
        debug!("paranoid level {paranoid}: kernel domain unavailable");
        Domain::USER | Domain::SUPERVISOR
    } else {
        Domain::USER | Domain::KERNEL | Domain::SUPERVISOR
    }
}

/// Opens a throwaway counter and inspects its mmap control page for the
/// user-space-read capability bit. Any failure just means no fast path.
fn detect_rdpmc(kernel: &KernelInfo) -> bool {
    let probe = EventConfig::from(Hardware::Instr);
    let mut attr = Attr::sized();
    attr.type_ = probe.ty;
    attr.config = probe.config;
    attr.set_disabled(true);
    attr.set_exclude_kernel(true);

    let Ok(file) =
        syscall::perf_event_open_cloexec(&attr, 0, -1, -1, kernel.cloexec_flag_supported())
    else {
        return false;
    };

    let prot = libc::PROT_READ;
    let flags = libc::MAP_SHARED;
    let page: std::io::Result<*mut crate::ffi::Metadata> =
        unsafe { syscall::mmap(std::ptr::null_mut(), *PAGE_SIZE, prot, flags, &file, 0) };

    let rdpmc = match page {
        Ok(ptr) => {
            let caps = unsafe { (*ptr).capabilities };
            if let Err(err) = unsafe { syscall::munmap(ptr, *PAGE_SIZE) } {
                error!("unmapping rdpmc probe page: {err}");
            }
            caps & b::PERF_CAP_USER_RDPMC != 0
        }
        Err(_) => false,
    };

    if let Err(err) = syscall::close(file) {
        error!("closing rdpmc probe: {err}");
    }
    rdpmc
}

/// The operations a counting backend exposes to the framework above it.
///
/// Only the perf_event implementation lives in this crate, but the
/// framework selects backends through this trait rather than a table of
/// function pointers.
pub trait Backend {
    fn update_control_state(
        &self,
        ctx: &mut Context,
        set: &mut EventSet,
        table: &dyn EventTable,
        names: &[&str],
    ) -> Result<()>;

    fn start(&self, ctx: &mut Context, set: &mut EventSet) -> Result<()>;

    fn stop(&self, ctx: &mut Context, set: &mut EventSet) -> Result<()>;

    fn read<'a>(&self, ctx: &Context, set: &'a mut EventSet) -> Result<&'a [u64]>;

    fn reset(&self, set: &EventSet) -> Result<()>;

    fn write(&self, set: &mut EventSet, values: &[u64]) -> Result<()>;

    fn ctl(&self, ctx: &mut Context, set: &mut EventSet, option: SetOption) -> Result<()>;

    fn set_overflow(
        &self,
        ctx: &mut Context,
        set: &mut EventSet,
        index: usize,
        threshold: u64,
    ) -> Result<()>;

    fn set_profile(
        &self,
        ctx: &mut Context,
        set: &mut EventSet,
        index: usize,
        threshold: u64,
    ) -> Result<()>;

    fn dispatch_timer(&self, set: &EventSet, fd: RawFd, sink: &mut dyn OverflowSink);

    fn stop_profiling(&self, set: &EventSet, sink: &mut dyn OverflowSink);
}

/// The perf_event backend.
pub struct PerfEvent {
    component: Component,
}

impl PerfEvent {
    pub fn new() -> Result<Self> {
        Ok(Self {
            component: Component::init()?,
        })
    }

    pub fn component(&self) -> &Component {
        &self.component
    }

    pub fn new_set(&self) -> (Context, EventSet) {
        (Context::default(), EventSet::new(&self.component))
    }
}

impl Backend for PerfEvent {
    fn update_control_state(
        &self,
        ctx: &mut Context,
        set: &mut EventSet,
        table: &dyn EventTable,
        names: &[&str],
    ) -> Result<()> {
        set.update(ctx, table, names)
    }

    fn start(&self, ctx: &mut Context, set: &mut EventSet) -> Result<()> {
        set.start(ctx)
    }

    fn stop(&self, ctx: &mut Context, set: &mut EventSet) -> Result<()> {
        set.stop(ctx)
    }

    fn read<'a>(&self, ctx: &Context, set: &'a mut EventSet) -> Result<&'a [u64]> {
        set.read(ctx)
    }

    fn reset(&self, set: &EventSet) -> Result<()> {
        set.reset()
    }

    fn write(&self, set: &mut EventSet, values: &[u64]) -> Result<()> {
        set.write(values)
    }

    fn ctl(&self, ctx: &mut Context, set: &mut EventSet, option: SetOption) -> Result<()> {
        set.ctl(ctx, option)
    }

    fn set_overflow(
        &self,
        ctx: &mut Context,
        set: &mut EventSet,
        index: usize,
        threshold: u64,
    ) -> Result<()> {
        set.set_overflow(ctx, index, threshold)
    }

    fn set_profile(
        &self,
        ctx: &mut Context,
        set: &mut EventSet,
        index: usize,
        threshold: u64,
    ) -> Result<()> {
        set.set_profile(ctx, index, threshold)
    }

    fn dispatch_timer(&self, set: &EventSet, fd: RawFd, sink: &mut dyn OverflowSink) {
        set.dispatch_timer(fd, sink)
    }

    fn stop_profiling(&self, set: &EventSet, sink: &mut dyn OverflowSink) {
        set.stop_profiling(sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paranoid_strips_only_the_kernel_domain() {
        let restricted = available_domains(2, false);
        assert!(restricted.contains(Domain::USER));
        assert!(restricted.contains(Domain::SUPERVISOR));
        assert!(!restricted.contains(Domain::KERNEL));

        assert!(available_domains(2, true).contains(Domain::KERNEL));
        assert!(available_domains(1, false).contains(Domain::KERNEL));
    }
}
