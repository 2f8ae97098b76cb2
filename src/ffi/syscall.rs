use std::fs::File;
use std::io::{Error, Result};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use super::{bindings, Attr};

// fcntl(F_SETSIG) and the F_SETOWN_EX family have no libc bindings on
// gnu targets, so they are carried here next to the wrappers that use
// them. Values from include/uapi/asm-generic/fcntl.h.
pub const F_SETSIG: i32 = 10;
pub const F_SETOWN_EX: i32 = 15;
pub const F_OWNER_TID: i32 = 0;

/// `struct f_owner_ex`, the argument to `fcntl(F_SETOWN_EX)`.
#[allow(non_camel_case_types)]
#[repr(C)]
pub struct f_owner_ex {
    pub type_: i32,
    pub pid: i32,
}

pub fn perf_event_open(attr: &Attr, pid: i32, cpu: i32, group_fd: i32, flags: u64) -> Result<File> {
    let num = libc::SYS_perf_event_open;
    let fd = unsafe { libc::syscall(num, attr, pid, cpu, group_fd, flags) };
    if fd != -1 {
        Ok(unsafe { File::from_raw_fd(fd as _) })
    } else {
        Err(Error::last_os_error())
    }
}

pub fn ioctl(file: &File, op: u64) -> Result<i32> {
    let fd = file.as_raw_fd();
    let result = unsafe { libc::ioctl(fd, op as _) };
    if result != -1 {
        Ok(result)
    } else {
        Err(Error::last_os_error())
    }
}

pub fn ioctl_arg(file: &File, op: u64, arg: u64) -> Result<i32> {
    let fd = file.as_raw_fd();
    let result = unsafe { libc::ioctl(fd, op as _, arg) };
    if result != -1 {
        Ok(result)
    } else {
        Err(Error::last_os_error())
    }
}

pub fn read(file: &File, buf: &mut [u8]) -> Result<usize> {
    let fd = file.as_raw_fd();
    let count = buf.len();
    let buf = buf.as_mut_ptr() as _;
    let bytes = unsafe { libc::read(fd, buf, count) };
    if bytes != -1 {
        Ok(bytes as _)
    } else {
        Err(Error::last_os_error())
    }
}

/// Closes the fd explicitly so the result can be inspected, unlike a
/// plain `File` drop which discards it.
pub fn close(file: File) -> Result<()> {
    let fd = file.into_raw_fd();
    let result = unsafe { libc::close(fd) };
    if result != -1 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

pub fn fcntl_arg(file: &File, op: i32, arg: i64) -> Result<i32> {
    let fd = file.as_raw_fd();
    let result = unsafe { libc::fcntl(fd, op, arg) };
    if result != -1 {
        Ok(result)
    } else {
        Err(Error::last_os_error())
    }
}

pub fn fcntl_owner_ex(file: &File, owner: &f_owner_ex) -> Result<()> {
    let fd = file.as_raw_fd();
    let result = unsafe { libc::fcntl(fd, F_SETOWN_EX, owner as *const _) };
    if result != -1 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

/// Opens the counter close-on-exec. Kernels from 3.14 take the flag at
/// open time; older ones need an fcntl afterwards, leaving a short
/// window across a concurrent fork.
pub fn perf_event_open_cloexec(
    attr: &Attr,
    pid: i32,
    cpu: i32,
    group_fd: i32,
    flag_supported: bool,
) -> Result<File> {
    if flag_supported {
        return perf_event_open(attr, pid, cpu, group_fd, bindings::PERF_FLAG_FD_CLOEXEC);
    }
    let file = perf_event_open(attr, pid, cpu, group_fd, 0)?;
    fcntl_arg(&file, libc::F_SETFD, libc::FD_CLOEXEC as i64)?;
    Ok(file)
}

pub unsafe fn mmap<T>(
    ptr: *mut (),
    len: usize,
    prot: i32,
    flags: i32,
    file: &File,
    offset: i64,
) -> Result<*mut T> {
    let ptr = libc::mmap(ptr as _, len, prot, flags, file.as_raw_fd(), offset);
    if ptr != libc::MAP_FAILED {
        Ok(ptr as _)
    } else {
        Err(Error::last_os_error())
    }
}

pub unsafe fn munmap<T>(ptr: *mut T, len: usize) -> Result<()> {
    let result = libc::munmap(ptr as _, len);
    if result != -1 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

pub fn gettid() -> i32 {
    unsafe { libc::syscall(libc::SYS_gettid) as _ }
}

pub fn sched_getcpu() -> i32 {
    unsafe { libc::sched_getcpu() }
}

/// Extracts `si_fd` from a signal delivered for an `O_ASYNC` fd.
///
/// libc does not expose the `_sigpoll` variant of the siginfo union, so
/// overlay it by hand: three ints plus padding to the union at offset
/// 16 (on 64-bit), then `si_band` (long) followed by `si_fd`.
pub fn siginfo_fd(info: &libc::siginfo_t) -> RawFd {
    #[repr(C)]
    struct SigPoll {
        _pad: [i32; 4],
        si_band: libc::c_long,
        si_fd: i32,
    }
    let overlay = unsafe { &*(info as *const libc::siginfo_t as *const SigPoll) };
    overlay.si_fd
}
