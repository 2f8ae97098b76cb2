//! The mmap sample ring and signal-time overflow dispatch.
//!
//! Everything here may run inside a signal handler, so the hot path
//! allocates nothing and reports problems through `log` instead of
//! returning errors the handler could not act on anyway.

pub mod record;

use std::cell::Cell;
use std::fs::File;
use std::os::fd::RawFd;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, error};

use crate::config;
use crate::error::{PerfError, Result};
use crate::ffi::bindings as b;
use crate::ffi::{syscall, Metadata, PAGE_SIZE};
use crate::set::EventSet;

pub use record::Record;

/// Receives overflow notifications and profile hits, one level up from
/// the signal handler.
pub trait OverflowSink {
    /// A counter crossed its period. `overflow_vector` has bit `i` set
    /// for the overflowed event's position in the set.
    fn overflow(&mut self, ip: u64, overflow_vector: u64);

    /// One profiling sample for the event at `event_index`.
    fn profile_hit(&mut self, ip: u64, event_index: usize);
}

/// The mmap region behind a sampled fd: one metadata page then a power
/// of two of data pages.
struct Arena {
    ptr: *mut Metadata,
    len: usize,
}

unsafe impl Send for Arena {}

impl Arena {
    fn map(file: &File, len: usize) -> std::io::Result<Self> {
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let flags = libc::MAP_SHARED;
        let ptr = unsafe { syscall::mmap(std::ptr::null_mut(), len, prot, flags, file, 0)? };
        Ok(Self { ptr, len })
    }

    fn metadata(&self) -> &Metadata {
        unsafe { &*self.ptr }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if let Err(err) = unsafe { syscall::munmap(self.ptr, self.len) } {
            error!("unmapping sample buffer: {err}");
        }
    }
}

/// Reader state over one event's sample ring.
///
/// `data_head` belongs to the kernel and is loaded with Acquire so the
/// record bytes it covers are visible; `data_tail` is stored back with
/// Release to return space. The tail only ever advances.
pub struct SampleBuffer {
    arena: Arena,
    mask: u64,
    tail: Cell<u64>,
}

impl SampleBuffer {
    pub(crate) fn map(file: &File, pages: usize) -> Result<Self> {
        if pages < 2 || !(pages - 1).is_power_of_two() {
            return Err(PerfError::Bug("sample ring needs 1 + 2^n pages"));
        }
        let page_size = *PAGE_SIZE;
        let arena = Arena::map(file, pages * page_size).map_err(PerfError::Sys)?;
        let mask = ((pages - 1) * page_size - 1) as u64;
        Ok(Self {
            arena,
            mask,
            tail: Cell::new(0),
        })
    }

    fn data(&self) -> &[u8] {
        let start = unsafe { (self.arena.ptr as *const u8).add(*PAGE_SIZE) };
        unsafe { slice::from_raw_parts(start, (self.mask + 1) as usize) }
    }

    fn head(&self) -> u64 {
        let head = &self.arena.metadata().data_head as *const u64 as *const AtomicU64;
        unsafe { &*head }.load(Ordering::Acquire)
    }

    fn advance_tail(&self, tail: u64) {
        self.tail.set(tail);
        let slot = &self.arena.metadata().data_tail as *const u64 as *const AtomicU64;
        unsafe { &*slot }.store(tail, Ordering::Release);
    }

    /// Drains every pending record, feeding samples to the sink as
    /// profile hits for `event_index`.
    pub(crate) fn drain(&self, event_index: usize, sink: &mut dyn OverflowSink) {
        let head = self.head();
        let tail = record::walk_records(self.data(), self.mask, self.tail.get(), head, |rec| {
            match rec {
                Record::Sample { ip } => sink.profile_hit(ip, event_index),
                Record::Lost { id, count } => {
                    error!("sample ring dropped {count} records (id {id})");
                }
                Record::Unknown { ty } => debug!("skipping record type {ty}"),
            }
        });
        self.advance_tail(tail);
    }

    /// Returns the instruction pointer of the newest sample without
    /// walking the ring, then discards everything pending so the buffer
    /// never fills while only overflow notifications are wanted.
    pub(crate) fn last_ip(&self) -> Option<u64> {
        let head = self.head();
        if head == 0 {
            error!("overflow notification with an empty sample ring");
            return None;
        }
        let mut bytes = [0u8; 8];
        record::copy_wrapped(self.data(), self.mask, head.wrapping_sub(8), &mut bytes);
        self.advance_tail(head);
        Some(u64::from_ne_bytes(bytes))
    }
}

impl EventSet {
    /// Signal-handler entry point: routes the overflow on `fd` to the
    /// sink and re-arms the counter.
    ///
    /// An fd with no registered descriptor means the notification raced
    /// a close; it is logged and dropped rather than acted on.
    pub fn dispatch_timer(&self, fd: RawFd, sink: &mut dyn OverflowSink) {
        let Some(&(_, idx)) = self.fd_index.iter().find(|(f, _)| *f == fd) else {
            error!("overflow signal for unregistered fd {fd}");
            return;
        };
        let desc = &self.events[idx];
        let Some(file) = desc.fd.as_ref() else {
            error!("overflow signal for closed event {:?}", desc.name);
            return;
        };

        if let Err(err) = syscall::ioctl(file, b::PERF_EVENT_IOC_DISABLE) {
            error!("disabling {:?} in overflow handler: {err}", desc.name);
        }

        if let Some(buf) = &desc.sample_buf {
            if desc.profiling {
                buf.drain(idx, sink);
            } else if let Some(ip) = buf.last_ip() {
                sink.overflow(ip, 1u64 << idx);
            }
        }

        if let Err(err) = syscall::ioctl_arg(file, b::PERF_EVENT_IOC_REFRESH, config::refresh_value())
        {
            error!("re-arming {:?} after overflow: {err}", desc.name);
        }
    }

    /// Flushes the samples still sitting in every profiling ring, for
    /// the final harvest before the rings go away.
    pub fn stop_profiling(&self, sink: &mut dyn OverflowSink) {
        for (idx, desc) in self.events.iter().enumerate() {
            if !desc.profiling {
                continue;
            }
            if let Some(buf) = &desc.sample_buf {
                buf.drain(idx, sink);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Domain, Granularity, KernelInfo};

    #[derive(Default)]
    struct Recorder {
        overflows: Vec<(u64, u64)>,
        hits: Vec<(u64, usize)>,
    }

    impl OverflowSink for Recorder {
        fn overflow(&mut self, ip: u64, overflow_vector: u64) {
            self.overflows.push((ip, overflow_vector));
        }

        fn profile_hit(&mut self, ip: u64, event_index: usize) {
            self.hits.push((ip, event_index));
        }
    }

    #[test]
    fn dispatch_on_unregistered_fd_is_dropped() {
        let set = EventSet {
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
            fd_index: arrayvec::ArrayVec::new(),
            kernel: KernelInfo::from_version(6, 8, 0),
        };
        let mut sink = Recorder::default();
        set.dispatch_timer(9999, &mut sink);
        assert!(sink.overflows.is_empty());
        assert!(sink.hits.is_empty());
    }
}
