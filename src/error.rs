use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PerfError>;

/// Classified failures from the perf_event kernel interface.
///
/// `perf_event_open` reports wildly different conditions through a
/// handful of errnos, so the raw OS error is folded into a category the
/// caller can act on; anything without a better home stays `Sys`.
#[derive(Debug, Error)]
pub enum PerfError {
    #[error("permission denied, check /proc/sys/kernel/perf_event_paranoid")]
    Permission,

    #[error("event not supported by this hardware or kernel")]
    Unsupported,

    #[error("no such event")]
    NoEvent,

    #[error("events in the set conflict and cannot be scheduled together")]
    Conflict,

    #[error("out of kernel memory for event buffers")]
    NoMemory,

    #[error("too many open events or file descriptors")]
    TooManyOpen,

    #[error("invalid event attributes or combination")]
    Invalid,

    #[error("internal inconsistency: {0}")]
    Bug(&'static str),

    #[error(transparent)]
    Sys(#[from] io::Error),
}

impl PerfError {
    /// Maps the errno left behind by a failed perf syscall.
    pub fn from_os(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EPERM) | Some(libc::EACCES) => Self::Permission,
            Some(libc::ENODEV) | Some(libc::EOPNOTSUPP) => Self::Unsupported,
            Some(libc::ENOENT) => Self::NoEvent,
            Some(libc::ENFILE) | Some(libc::EMFILE) => Self::TooManyOpen,
            Some(libc::ENOMEM) => Self::NoMemory,
            Some(libc::ENOSYS) | Some(libc::EAGAIN) | Some(libc::EBUSY) | Some(libc::E2BIG)
            | Some(libc::EBADF) | Some(libc::EFAULT) | Some(libc::ESRCH) => Self::Sys(err),
            Some(libc::EINVAL) | _ => Self::Invalid,
        }
    }
}
