//! Counter read strategies: grouped, individual and multiplexed.

use std::fs::File;
use std::io;

use log::error;

use crate::error::{PerfError, Result};
use crate::ffi::bindings as b;
use crate::ffi::syscall;

use super::{Context, EventSet, MAX_COUNTERS};

/// Largest grouped read: count word, two time words, then a value and
/// an id per event.
pub(crate) const READ_BUFFER_WORDS: usize = 3 + 2 * MAX_COUNTERS;

fn short_read() -> PerfError {
    PerfError::Sys(io::Error::from(io::ErrorKind::UnexpectedEof))
}

/// Reads as many u64 words as the kernel returns into `buf`.
fn read_words(file: &File, buf: &mut [u64]) -> Result<usize> {
    let mut bytes = [0u8; READ_BUFFER_WORDS * 8];
    let bytes = &mut bytes[..buf.len() * 8];
    let n = syscall::read(file, bytes).map_err(PerfError::Sys)?;
    if n % 8 != 0 {
        return Err(short_read());
    }
    for (word, chunk) in buf.iter_mut().zip(bytes.chunks_exact(8)) {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(chunk);
        *word = u64::from_ne_bytes(raw);
    }
    Ok(n / 8)
}

/// Scales a multiplexed count up to what a fully scheduled counter
/// would have read, in x100 fixed point.
///
/// A counter scheduled the whole time needs no scaling; one that never
/// ran has no basis to scale from and its raw count is reported as is.
pub(crate) fn scale_count(raw: u64, enabled: u64, running: u64) -> u64 {
    if running == enabled || running == 0 {
        raw
    } else {
        let scale = enabled * 100 / running;
        scale * raw / 100
    }
}

/// Validates a FORMAT_GROUP read and returns the per-event values.
///
/// The leading word is the kernel's event count for the group; if it
/// disagrees with the control state the two have desynchronized and no
/// value in the buffer can be trusted.
pub(crate) fn parse_group_counts(buf: &[u64], num_events: usize) -> Result<&[u64]> {
    let nr = *buf.first().ok_or_else(short_read)?;
    if nr as usize != num_events {
        error!("grouped read returned {nr} events, control state holds {num_events}");
        return Err(PerfError::Sys(io::Error::from(io::ErrorKind::InvalidData)));
    }
    buf.get(1..1 + num_events).ok_or_else(short_read)
}

impl EventSet {
    /// Reads every counter into the set's counts array, in descriptor
    /// order, and returns it.
    pub fn read(&mut self, ctx: &Context) -> Result<&[u64]> {
        // Kernels with the sync-read bug only fold inherited child
        // counts into the parent on disable, so pause around the read.
        let pause = self.kernel.sync_read_bug() && ctx.running;
        if pause {
            self.toggle_leaders(b::PERF_EVENT_IOC_DISABLE)?;
        }

        let result = if self.multiplexed {
            self.read_multiplexed()
        } else if self.inherit || self.kernel.format_group_bug() {
            self.read_individual()
        } else {
            self.read_grouped()
        };

        if pause {
            self.toggle_leaders(b::PERF_EVENT_IOC_ENABLE)?;
        }

        result?;
        Ok(&self.counts)
    }

    fn toggle_leaders(&self, op: u64) -> Result<()> {
        for desc in &self.events {
            if desc.leader.is_some() {
                continue;
            }
            if let Some(file) = &desc.fd {
                syscall::ioctl(file, op).map_err(PerfError::Sys)?;
            }
        }
        Ok(())
    }

    /// Every event is its own group: three words each, value scaled by
    /// the time the counter actually spent on the PMU.
    fn read_multiplexed(&mut self) -> Result<()> {
        for (idx, desc) in self.events.iter().enumerate() {
            let file = desc.fd.as_ref().ok_or(PerfError::Bug("read on unopened event"))?;
            let mut buf = [0u64; 3];
            if read_words(file, &mut buf)? != 3 {
                return Err(short_read());
            }
            self.counts[idx] = scale_count(buf[0], buf[1], buf[2]);
        }
        Ok(())
    }

    /// One plain value per fd, for inherited events and kernels whose
    /// grouped reads cannot be trusted.
    fn read_individual(&mut self) -> Result<()> {
        for (idx, desc) in self.events.iter().enumerate() {
            let file = desc.fd.as_ref().ok_or(PerfError::Bug("read on unopened event"))?;
            let mut buf = [0u64; 1];
            if read_words(file, &mut buf)? != 1 {
                return Err(short_read());
            }
            self.counts[idx] = buf[0];
        }
        Ok(())
    }

    /// One syscall on the leader returns the whole group.
    fn read_grouped(&mut self) -> Result<()> {
        let leader = self
            .events
            .first()
            .and_then(|d| d.fd.as_ref())
            .ok_or(PerfError::Bug("read on unopened event"))?;
        let mut buf = [0u64; READ_BUFFER_WORDS];
        let words = read_words(leader, &mut buf)?;
        let values = parse_group_counts(&buf[..words], self.events.len())?;
        self.counts.copy_from_slice(values);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaling_identity_when_fully_scheduled() {
        assert_eq!(scale_count(1000, 500, 500), 1000);
    }

    #[test]
    fn scaling_extrapolates_partial_schedule() {
        // On the PMU half the time: the estimate doubles the raw count.
        assert_eq!(scale_count(1000, 800, 400), 2000);
        // A third of the time, x100 fixed point truncates the ratio.
        assert_eq!(scale_count(900, 900, 300), 2700);
    }

    #[test]
    fn scaling_never_divides_by_zero() {
        assert_eq!(scale_count(1234, 5000, 0), 1234);
        assert_eq!(scale_count(0, 0, 0), 0);
    }

    #[test]
    fn group_parse_returns_values_in_order() {
        let buf = [3u64, 10, 20, 30];
        let values = parse_group_counts(&buf, 3).unwrap();
        assert_eq!(values, &[10, 20, 30]);
    }

    #[test]
    fn group_parse_detects_desync() {
        let buf = [2u64, 10, 20];
        assert!(matches!(
            parse_group_counts(&buf, 3),
            Err(PerfError::Sys(_))
        ));
    }

    #[test]
    fn group_parse_rejects_truncated_buffer() {
        let buf = [3u64, 10];
        assert!(matches!(
            parse_group_counts(&buf, 3),
            Err(PerfError::Sys(_))
        ));
        assert!(matches!(parse_group_counts(&[], 0), Err(PerfError::Sys(_))));
    }
}
