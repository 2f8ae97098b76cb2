//! Event-set control state: descriptor building, group scheduling,
//! open/close bookkeeping and the start/stop/reset surface.

pub mod ctl;
mod read;

use std::fs::File;
use std::os::fd::{AsRawFd, RawFd};

use arrayvec::ArrayVec;
use log::{debug, error};

use crate::component::Component;
use crate::config::{self, Domain, Granularity, KernelInfo};
use crate::error::{PerfError, Result};
use crate::event::EventTable;
use crate::ffi::bindings as b;
use crate::ffi::{syscall, Attr};
use crate::sample::SampleBuffer;

pub use ctl::SetOption;

/// Hard ceiling on events per set, matching the largest group the
/// kernel will multiplex.
pub const MAX_COUNTERS: usize = 64;

/// Lifecycle bits for one set. Opened means fds exist; running means
/// the group leaders are enabled. Both can be true at once, neither
/// implies the other.
#[derive(Clone, Copy, Debug, Default)]
pub struct Context {
    pub opened: bool,
    pub running: bool,
}

/// What an overflow wakeup on a sampled fd should mean.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WakeupMode {
    /// One signal per `sample_period` counter overflows.
    #[default]
    CounterOverflow,
    /// Signals only when the ring buffer fills a page; samples are
    /// drained in batches.
    Profiling,
}

/// One kernel counter inside a set.
pub struct EventDescriptor {
    pub name: String,
    pub attr: Attr,
    /// Open fd; `None` until `open_events` succeeds for this slot.
    pub fd: Option<File>,
    /// Index of the group leader this event schedules under, `None`
    /// when the event is itself a leader.
    pub leader: Option<usize>,
    pub cpu: i32,
    /// Ring size for sampling: one control page plus a power of two of
    /// data pages. Zero means no ring is mapped.
    pub mmap_pages: usize,
    pub sample_buf: Option<SampleBuffer>,
    pub wakeup_mode: WakeupMode,
    pub profiling: bool,
}

/// Control state for one measured set of counters.
pub struct EventSet {
    pub(crate) events: Vec<EventDescriptor>,
    pub(crate) counts: Vec<u64>,
    pub(crate) tid: i32,
    pub(crate) cpu: i32,
    pub(crate) domain: Domain,
    pub(crate) granularity: Granularity,
    pub(crate) multiplexed: bool,
    pub(crate) inherit: bool,
    pub(crate) overflow_signal: i32,
    pub(crate) overflowing: bool,
    /// fd to descriptor index, consulted on the signal path.
    pub(crate) fd_index: ArrayVec<(RawFd, usize), MAX_COUNTERS>,
    pub(crate) kernel: KernelInfo,
}

impl EventSet {
    pub fn new(component: &Component) -> Self {
        Self {
            events: Vec::new(),
            counts: Vec::new(),
            tid: syscall::gettid(),
            cpu: -1,
            domain: component.default_domain,
            granularity: component.default_granularity,
            multiplexed: false,
            inherit: false,
            overflow_signal: component.overflow_signal,
            overflowing: false,
            fd_index: ArrayVec::new(),
            kernel: component.kernel,
        }
    }

    pub fn num_events(&self) -> usize {
        self.events.len()
    }

    pub fn is_multiplexed(&self) -> bool {
        self.multiplexed
    }

    pub fn is_overflowing(&self) -> bool {
        self.overflowing
    }

    pub fn overflow_signal(&self) -> i32 {
        self.overflow_signal
    }

    /// Replaces the set's contents with the named events, then reopens.
    ///
    /// Existing fds are torn down first; an empty name list is a valid
    /// clear and leaves the set closed. Names the table cannot resolve
    /// are skipped with a trace; if nothing resolves the set is left
    /// empty and `NoEvent` is returned.
    pub fn update(
        &mut self,
        ctx: &mut Context,
        table: &dyn EventTable,
        names: &[&str],
    ) -> Result<()> {
        if ctx.opened {
            self.close_events(ctx)?;
        }
        self.build_descriptors(table, names)?;
        if self.events.is_empty() {
            return Ok(());
        }
        self.open_events(ctx)
    }

    /// Populates descriptors from resolved names without touching any
    /// fds. Scheduling bits (pinned, disabled, read_format) are left to
    /// `open_events`; only the measurement selection is fixed here.
    pub(crate) fn build_descriptors(
        &mut self,
        table: &dyn EventTable,
        names: &[&str],
    ) -> Result<()> {
        self.events.clear();
        self.counts.clear();
        if names.is_empty() {
            return Ok(());
        }

        let mut resolved = Vec::with_capacity(names.len());
        for name in names {
            match table.resolve(name) {
                Some(event) => resolved.push(event),
                None => debug!("no native event for {name:?}, skipping"),
            }
        }
        if resolved.is_empty() {
            return Err(PerfError::NoEvent);
        }
        if resolved.len() > MAX_COUNTERS {
            return Err(PerfError::TooManyOpen);
        }

        for (idx, event) in resolved.into_iter().enumerate() {
            let mut attr = Attr::sized();
            attr.type_ = event.config.ty;
            attr.config = event.config.config;
            attr.config1 = event.config.config1;
            attr.config2 = event.config.config2;

            // Set-wide domain masks yield to a privilege qualifier the
            // event carries in its own name.
            if !event.has_user_mask() {
                attr.set_exclude_user(!self.domain.contains(Domain::USER));
            }
            if !event.has_kernel_mask() {
                attr.set_exclude_kernel(!self.domain.contains(Domain::KERNEL));
            }
            attr.set_exclude_hv(!self.domain.contains(Domain::SUPERVISOR));

            // Multiplexed events each lead their own group; otherwise
            // everything schedules under event 0.
            let leader = if self.multiplexed || idx == 0 {
                None
            } else {
                Some(0)
            };

            self.events.push(EventDescriptor {
                name: event.name,
                attr,
                fd: None,
                leader,
                cpu: event.cpu.map(|c| c as i32).unwrap_or(self.cpu),
                mmap_pages: 0,
                sample_buf: None,
                wakeup_mode: WakeupMode::default(),
                profiling: false,
            });
        }
        self.counts = vec![0; self.events.len()];
        Ok(())
    }

    /// Opens every descriptor, leaders first.
    ///
    /// Leaders are pinned (unless multiplexing) and start disabled so
    /// the whole group begins counting on one enable. Any failure rolls
    /// back every fd opened so far and leaves the context closed.
    pub(crate) fn open_events(&mut self, ctx: &mut Context) -> Result<()> {
        let pid = match self.granularity {
            Granularity::System => -1,
            Granularity::Thread => self.tid,
        };

        for idx in 0..self.events.len() {
            let leader_fd = match self.events[idx].leader {
                None => -1,
                Some(l) => match &self.events[l].fd {
                    Some(file) => file.as_raw_fd(),
                    None => {
                        self.unwind(ctx, idx);
                        return Err(PerfError::Bug("group leader not open before child"));
                    }
                },
            };

            {
                let is_leader = self.events[idx].leader.is_none();
                let multiplexed = self.multiplexed;
                let inherit = self.inherit;
                let format = config::read_format(
                    multiplexed,
                    inherit,
                    is_leader && !multiplexed,
                    &self.kernel,
                );
                let attr = &mut self.events[idx].attr;
                attr.set_pinned(is_leader && !multiplexed);
                attr.set_disabled(is_leader);
                attr.set_inherit(inherit);
                attr.read_format = format;
            }

            let desc = &self.events[idx];
            match syscall::perf_event_open_cloexec(
                &desc.attr,
                pid,
                desc.cpu,
                leader_fd,
                self.kernel.cloexec_flag_supported(),
            ) {
                Ok(file) => {
                    debug!(
                        "opened {:?} as fd {} (pid {pid}, cpu {}, leader fd {leader_fd})",
                        desc.name,
                        file.as_raw_fd(),
                        desc.cpu,
                    );
                    self.events[idx].fd = Some(file);
                }
                Err(err) => {
                    debug!("open of {:?} failed: {err}", desc.name);
                    self.unwind(ctx, idx);
                    return Err(PerfError::from_os(err));
                }
            }

            // The kernel accepts over-committed groups at open time and
            // only refuses to schedule them, so force a schedule now.
            if !self.multiplexed {
                if let Err(err) = self.check_schedulability(idx) {
                    self.unwind(ctx, idx + 1);
                    return Err(err);
                }
            }
        }

        for idx in 0..self.events.len() {
            if self.events[idx].attr.sample_period != 0 {
                if let Err(err) = self.attach_sample_buffer(idx) {
                    self.unwind(ctx, self.events.len());
                    return Err(err);
                }
            }
        }

        ctx.opened = true;
        Ok(())
    }

    /// Drops the first `opened` fds in reverse, children before their
    /// leader, after a partial open.
    fn unwind(&mut self, ctx: &mut Context, opened: usize) {
        for idx in (0..opened).rev() {
            self.events[idx].sample_buf = None;
            if let Some(file) = self.events[idx].fd.take() {
                if let Err(err) = syscall::close(file) {
                    error!("closing fd during open rollback: {err}");
                }
            }
        }
        self.fd_index.clear();
        ctx.opened = false;
    }

    /// Verifies the newly opened event at `idx` can actually be
    /// scheduled alongside everything opened before it.
    ///
    /// A brief enable/disable on its leader forces the kernel to
    /// schedule the group; a zero-byte read afterwards means it never
    /// got on the PMU. The enable leaks counts, so every prior fd is
    /// reset individually (resetting the leader does not reset the
    /// whole group, and later slots are not open yet).
    fn check_schedulability(&self, idx: usize) -> Result<()> {
        let leader_idx = self.events[idx].leader.unwrap_or(idx);
        let leader = self.events[leader_idx]
            .fd
            .as_ref()
            .ok_or(PerfError::Bug("schedulability probe on unopened leader"))?;

        syscall::ioctl(leader, b::PERF_EVENT_IOC_ENABLE).map_err(PerfError::Sys)?;
        syscall::ioctl(leader, b::PERF_EVENT_IOC_DISABLE).map_err(PerfError::Sys)?;

        let mut buf = [0u8; read::READ_BUFFER_WORDS * 8];
        let bytes = syscall::read(leader, &mut buf).map_err(PerfError::Sys)?;
        if bytes == 0 {
            debug!("event {:?} did not schedule", self.events[idx].name);
            return Err(PerfError::Conflict);
        }

        for prior in 0..idx {
            if let Some(file) = &self.events[prior].fd {
                syscall::ioctl(file, b::PERF_EVENT_IOC_RESET).map_err(PerfError::Sys)?;
            }
        }
        Ok(())
    }

    /// Maps the ring buffer and routes overflow signals for the sampled
    /// event at `idx`.
    fn attach_sample_buffer(&mut self, idx: usize) -> Result<()> {
        if !self.kernel.setown_ex_supported() {
            return Err(PerfError::Unsupported);
        }
        let pages = self.events[idx].mmap_pages;
        let signal = self.overflow_signal;
        let file = self.events[idx]
            .fd
            .as_ref()
            .ok_or(PerfError::Bug("sampling tune-up on unopened event"))?;

        syscall::fcntl_arg(
            file,
            libc::F_SETFL,
            (libc::O_ASYNC | libc::O_NONBLOCK) as i64,
        )
        .map_err(PerfError::Sys)?;

        // Deliver the signal to this thread, not the process group.
        let owner = syscall::f_owner_ex {
            type_: syscall::F_OWNER_TID,
            pid: syscall::gettid(),
        };
        syscall::fcntl_owner_ex(file, &owner).map_err(PerfError::Sys)?;
        syscall::fcntl_arg(file, syscall::F_SETSIG, signal as i64).map_err(PerfError::Sys)?;

        let buf = SampleBuffer::map(file, pages)?;
        let fd = file.as_raw_fd();
        self.events[idx].sample_buf = Some(buf);
        self.fd_index.retain(|(_, i)| *i != idx);
        self.fd_index
            .try_push((fd, idx))
            .map_err(|_| PerfError::TooManyOpen)?;
        Ok(())
    }

    /// Closes every fd, children before leaders, unmapping sample
    /// buffers first. Descriptors that never opened are tolerated, but
    /// the books must balance.
    pub fn close_events(&mut self, ctx: &mut Context) -> Result<()> {
        let mut closed = 0;
        let mut never_opened = 0;

        // leaders_pass = false closes children, true closes leaders.
        for leaders_pass in [false, true] {
            for idx in 0..self.events.len() {
                if (self.events[idx].leader.is_none()) != leaders_pass {
                    continue;
                }
                self.events[idx].sample_buf = None;
                match self.events[idx].fd.take() {
                    Some(file) => {
                        if let Err(err) = syscall::close(file) {
                            error!("closing {:?}: {err}", self.events[idx].name);
                        }
                        closed += 1;
                    }
                    None => never_opened += 1,
                }
            }
        }

        self.fd_index.clear();
        ctx.opened = false;
        ctx.running = false;

        if closed + never_opened != self.events.len() {
            return Err(PerfError::Bug("close count does not match event count"));
        }
        Ok(())
    }

    /// Zeroes every counter, then enables the group leaders.
    pub fn start(&mut self, ctx: &mut Context) -> Result<()> {
        self.reset()?;

        let mut enabled = 0;
        for desc in &self.events {
            if desc.leader.is_some() {
                continue;
            }
            if let Some(file) = &desc.fd {
                syscall::ioctl(file, b::PERF_EVENT_IOC_ENABLE).map_err(PerfError::Sys)?;
                enabled += 1;
            }
        }
        if enabled == 0 {
            return Err(PerfError::Bug("start enabled no group leaders"));
        }
        ctx.running = true;
        Ok(())
    }

    /// Disables the group leaders; children stop with them.
    pub fn stop(&mut self, ctx: &mut Context) -> Result<()> {
        for desc in &self.events {
            if desc.leader.is_some() {
                continue;
            }
            if let Some(file) = &desc.fd {
                syscall::ioctl(file, b::PERF_EVENT_IOC_DISABLE).map_err(PerfError::Sys)?;
            }
        }
        ctx.running = false;
        Ok(())
    }

    /// Zeroes every counter in place. Resetting only the leader leaves
    /// the children's counts intact, so each fd is reset on its own.
    pub fn reset(&self) -> Result<()> {
        for desc in &self.events {
            if let Some(file) = &desc.fd {
                syscall::ioctl(file, b::PERF_EVENT_IOC_RESET).map_err(PerfError::Sys)?;
            }
        }
        Ok(())
    }

    /// Hardware counters cannot be preloaded with a value.
    pub fn write(&mut self, _values: &[u64]) -> Result<()> {
        Err(PerfError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventTable, NativeEvent, GENERALIZED_EVENTS};

    struct OneEvent;

    impl EventTable for OneEvent {
        fn resolve(&self, name: &str) -> Option<NativeEvent> {
            GENERALIZED_EVENTS.resolve(name)
        }
    }

    /// Pins every resolved event to CPU 2, the way a PMU-specific table
    /// with per-CPU uncore events would.
    struct PinnedTable;

    impl EventTable for PinnedTable {
        fn resolve(&self, name: &str) -> Option<NativeEvent> {
            GENERALIZED_EVENTS.resolve(name).map(|e| e.on_cpu(2))
        }
    }

    fn empty_set() -> EventSet {
        EventSet {
            events: Vec::new(),
            counts: Vec::new(),
            tid: 0,
            cpu: -1,
            domain: Domain::default(),
            granularity: Granularity::Thread,
            multiplexed: false,
            inherit: false,
            overflow_signal: 0,
            overflowing: false,
            fd_index: ArrayVec::new(),
            kernel: KernelInfo::from_version(6, 8, 0),
        }
    }

    #[test]
    fn leader_assignment() {
        let mut set = empty_set();
        set.build_descriptors(&OneEvent, &["instructions", "cycles", "branches"])
            .unwrap();
        assert_eq!(set.events[0].leader, None);
        assert_eq!(set.events[1].leader, Some(0));
        assert_eq!(set.events[2].leader, Some(0));
        assert_eq!(set.counts.len(), 3);

        set.multiplexed = true;
        set.build_descriptors(&OneEvent, &["instructions", "cycles"])
            .unwrap();
        assert!(set.events.iter().all(|e| e.leader.is_none()));
    }

    #[test]
    fn unresolved_names_skipped_and_all_skipped_errors() {
        let mut set = empty_set();
        set.build_descriptors(&OneEvent, &["nonsense", "cycles"])
            .unwrap();
        assert_eq!(set.events.len(), 1);
        assert_eq!(set.events[0].name, "cycles");

        let err = set
            .build_descriptors(&OneEvent, &["nonsense", "more-nonsense"])
            .unwrap_err();
        assert!(matches!(err, PerfError::NoEvent));
        assert!(set.events.is_empty());
    }

    #[test]
    fn empty_name_list_clears() {
        let mut set = empty_set();
        set.build_descriptors(&OneEvent, &["cycles"]).unwrap();
        set.build_descriptors(&OneEvent, &[]).unwrap();
        assert!(set.events.is_empty());
        assert!(set.counts.is_empty());
    }

    #[test]
    fn domain_masks_respect_event_qualifiers() {
        let mut set = empty_set();
        set.domain = Domain::USER;
        set.build_descriptors(&OneEvent, &["cycles", "cycles:k=1", "cycles:u=0"])
            .unwrap();

        // Plain event takes the set-wide masks.
        assert!(!set.events[0].attr.exclude_user());
        assert!(set.events[0].attr.exclude_kernel());

        // ":k=" in the name pins the kernel mask; user mask still set-wide.
        assert!(!set.events[1].attr.exclude_kernel());
        assert!(!set.events[1].attr.exclude_user());

        // ":u=" pins the user mask; kernel mask still excluded set-wide.
        assert!(!set.events[2].attr.exclude_user());
        assert!(set.events[2].attr.exclude_kernel());
    }

    #[test]
    fn per_event_cpu_overrides_set_default() {
        let mut set = empty_set();
        set.cpu = 7;
        set.build_descriptors(&PinnedTable, &["cycles"]).unwrap();
        assert_eq!(set.events[0].cpu, 2);

        set.build_descriptors(&OneEvent, &["cycles"]).unwrap();
        assert_eq!(set.events[0].cpu, 7);
    }

    #[test]
    fn close_tolerates_never_opened() {
        let mut set = empty_set();
        let mut ctx = Context::default();
        set.build_descriptors(&OneEvent, &["instructions", "cycles"])
            .unwrap();
        ctx.opened = true;
        ctx.running = true;
        set.close_events(&mut ctx).unwrap();
        assert!(!ctx.opened);
        assert!(!ctx.running);
    }

    #[test]
    fn write_is_unsupported() {
        let mut set = empty_set();
        assert!(matches!(set.write(&[0]), Err(PerfError::Unsupported)));
    }
}
