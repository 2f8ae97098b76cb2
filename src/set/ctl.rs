//! Set options: multiplexing, attach targets, domains, overflow and
//! profiling configuration.

use log::error;

use crate::config::{self, Domain, Granularity, KernelInfo};
use crate::error::{PerfError, Result};
use crate::event::{EventConfig, Hardware};
use crate::ffi::bindings as b;
use crate::ffi::{syscall, Attr};

use super::{Context, EventSet, WakeupMode};

/// Runtime-adjustable knobs on an event set. Every variant that changes
/// how counters are opened is probed with a throwaway event first, so a
/// setting the kernel will refuse never destroys a working set.
#[derive(Clone, Copy, Debug)]
pub enum SetOption {
    /// Let the kernel rotate events onto the PMU; reads are scaled.
    Multiplex,
    /// Count another thread instead of the calling one.
    Attach(i32),
    /// Return to counting the calling thread.
    Detach,
    /// Count everything on one CPU instead of one thread.
    CpuAttach(i32),
    Domain(Domain),
    Granularity(Granularity),
    /// Fold counts from forked children into the parent.
    Inherit(bool),
}

/// Opens and immediately closes a throwaway counter with the candidate
/// settings.
///
/// The probe uses retired instructions: unlike cycles it exists on
/// every PMU the kernel supports, so a refusal reflects the settings
/// and not the event.
pub fn check_permissions(
    tid: i32,
    cpu: i32,
    domain: Domain,
    granularity: Granularity,
    multiplexed: bool,
    inherit: bool,
    kernel: &KernelInfo,
) -> Result<()> {
    let probe = EventConfig::from(Hardware::Instr);
    let mut attr = Attr::sized();
    attr.type_ = probe.ty;
    attr.config = probe.config;
    attr.set_disabled(true);
    attr.set_inherit(inherit);
    attr.read_format = config::read_format(multiplexed, inherit, !multiplexed, kernel);
    attr.set_exclude_user(!domain.contains(Domain::USER));
    attr.set_exclude_kernel(!domain.contains(Domain::KERNEL));
    attr.set_exclude_hv(!domain.contains(Domain::SUPERVISOR));

    let pid = match granularity {
        Granularity::System => -1,
        Granularity::Thread => tid,
    };

    let file =
        syscall::perf_event_open_cloexec(&attr, pid, cpu, -1, kernel.cloexec_flag_supported())
            .map_err(PerfError::from_os)?;
    if let Err(err) = syscall::close(file) {
        error!("closing permission probe: {err}");
    }
    Ok(())
}

impl EventSet {
    /// Closes and reopens the set's fds so changed settings take
    /// effect. A set with no fds keeps its settings for the next
    /// `update`.
    fn rebuild(&mut self, ctx: &mut Context) -> Result<()> {
        if !ctx.opened {
            return Ok(());
        }
        self.close_events(ctx)?;
        // Leader links depend on the multiplex setting.
        for (idx, desc) in self.events.iter_mut().enumerate() {
            desc.leader = if self.multiplexed || idx == 0 {
                None
            } else {
                Some(0)
            };
        }
        self.open_events(ctx)
    }

    pub fn ctl(&mut self, ctx: &mut Context, option: SetOption) -> Result<()> {
        match option {
            SetOption::Multiplex => {
                check_permissions(
                    self.tid,
                    self.cpu,
                    self.domain,
                    self.granularity,
                    true,
                    self.inherit,
                    &self.kernel,
                )?;
                self.multiplexed = true;
                if let Err(err) = self.rebuild(ctx) {
                    self.multiplexed = false;
                    return Err(err);
                }
                Ok(())
            }
            SetOption::Attach(tid) => {
                check_permissions(
                    tid,
                    self.cpu,
                    self.domain,
                    self.granularity,
                    self.multiplexed,
                    self.inherit,
                    &self.kernel,
                )?;
                let old = self.tid;
                self.tid = tid;
                if let Err(err) = self.rebuild(ctx) {
                    self.tid = old;
                    return Err(err);
                }
                Ok(())
            }
            SetOption::Detach => {
                self.tid = syscall::gettid();
                self.rebuild(ctx)
            }
            SetOption::CpuAttach(cpu) => {
                check_permissions(
                    -1,
                    cpu,
                    self.domain,
                    self.granularity,
                    self.multiplexed,
                    self.inherit,
                    &self.kernel,
                )?;
                let (old_tid, old_cpu) = (self.tid, self.cpu);
                self.tid = -1;
                self.cpu = cpu;
                if let Err(err) = self.rebuild(ctx) {
                    self.tid = old_tid;
                    self.cpu = old_cpu;
                    return Err(err);
                }
                Ok(())
            }
            SetOption::Domain(domain) => {
                check_permissions(
                    self.tid,
                    self.cpu,
                    domain,
                    self.granularity,
                    self.multiplexed,
                    self.inherit,
                    &self.kernel,
                )?;
                // Applied to attrs the next time descriptors are built.
                self.domain = domain;
                Ok(())
            }
            SetOption::Granularity(granularity) => {
                let (old_gran, old_cpu) = (self.granularity, self.cpu);
                self.granularity = granularity;
                if granularity == Granularity::System {
                    // System-wide counting is per CPU; pin the one the
                    // caller is on, since pid=-1 with cpu=-1 is invalid.
                    self.cpu = syscall::sched_getcpu();
                }
                if let Err(err) = self.rebuild(ctx) {
                    self.granularity = old_gran;
                    self.cpu = old_cpu;
                    return Err(err);
                }
                Ok(())
            }
            SetOption::Inherit(inherit) => {
                check_permissions(
                    self.tid,
                    self.cpu,
                    self.domain,
                    self.granularity,
                    self.multiplexed,
                    inherit,
                    &self.kernel,
                )?;
                let old = self.inherit;
                self.inherit = inherit;
                if let Err(err) = self.rebuild(ctx) {
                    self.inherit = old;
                    return Err(err);
                }
                Ok(())
            }
        }
    }

    /// Arms or clears overflow signaling on the event at `idx`.
    ///
    /// A zero threshold clears a previously armed period; clearing an
    /// event that was never armed is an error. The set-level
    /// overflowing flag tracks whether any event still has a period, so
    /// the caller knows when the signal handler can be retired.
    pub fn set_overflow(&mut self, ctx: &mut Context, idx: usize, threshold: u64) -> Result<()> {
        let desc = self.events.get_mut(idx).ok_or(PerfError::Invalid)?;

        if threshold == 0 {
            if desc.attr.sample_period == 0 {
                return Err(PerfError::Invalid);
            }
            desc.attr.sample_period = 0;
            self.overflowing = self.events.iter().any(|e| e.attr.sample_period != 0);
        } else {
            desc.attr.sample_period = threshold;
            match desc.wakeup_mode {
                // Profiling drains in batches; wake only on a full page.
                WakeupMode::Profiling => desc.attr.wakeup_events = 0,
                WakeupMode::CounterOverflow => {
                    desc.attr.wakeup_events = 1;
                    desc.attr.sample_type = b::PERF_SAMPLE_IP;
                    desc.mmap_pages = 1 + 2;
                }
            }
            self.overflowing = true;
        }

        self.rebuild(ctx)
    }

    /// Switches the event at `idx` into batched profiling: a larger
    /// ring, page-granularity wakeups and an instruction pointer per
    /// sample. A zero threshold tears the profiling state back down.
    pub fn set_profile(&mut self, ctx: &mut Context, idx: usize, threshold: u64) -> Result<()> {
        let desc = self.events.get_mut(idx).ok_or(PerfError::Invalid)?;

        if threshold == 0 {
            desc.profiling = false;
            desc.wakeup_mode = WakeupMode::CounterOverflow;
            desc.mmap_pages = 0;
            desc.attr.sample_type &= !b::PERF_SAMPLE_IP;
            return self.set_overflow(ctx, idx, 0);
        }

        desc.profiling = true;
        desc.wakeup_mode = WakeupMode::Profiling;
        desc.mmap_pages = 1 + 8;
        desc.attr.sample_type = b::PERF_SAMPLE_IP;
        self.set_overflow(ctx, idx, threshold)
    }
}
