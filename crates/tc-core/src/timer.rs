//! timerfd-backed port timers.
//!
//! Each port carries a handful of timer slots in its fd array; the poll
//! loop treats an expired timer like any other readable descriptor. Timer
//! periods are expressed as log2 seconds, the PTP interval convention
//! (`0` = 1 s, `-1` = 500 ms, `1` = 2 s).

use anyhow::Result;
use std::os::fd::RawFd;

use crate::tmv::NSEC_PER_SEC;

/// Creates a non-blocking monotonic timerfd, disarmed.
pub fn create() -> Result<RawFd> {
    #[cfg(target_os = "linux")]
    {
        let fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK)
        };
        if fd < 0 {
            anyhow::bail!("timerfd_create: {}", std::io::Error::last_os_error());
        }
        Ok(fd)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Ok(-1)
    }
}

fn log_interval_to_ns(log_seconds: i8) -> i64 {
    if log_seconds >= 0 {
        NSEC_PER_SEC << log_seconds
    } else {
        NSEC_PER_SEC >> -log_seconds
    }
}

/// Arms `fd` to fire once after `2^log_seconds` seconds. Unused slots
/// (fd < 0) are ignored.
pub fn set_log(fd: RawFd, log_seconds: i8) {
    if fd < 0 {
        return;
    }
    #[cfg(target_os = "linux")]
    {
        let ns = log_interval_to_ns(log_seconds);
        let spec = libc::itimerspec {
            it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            it_value: libc::timespec {
                tv_sec: (ns / NSEC_PER_SEC) as libc::time_t,
                tv_nsec: (ns % NSEC_PER_SEC) as libc::c_long,
            },
        };
        unsafe {
            libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut());
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = log_seconds;
    }
}

/// Disarms `fd` and drains any pending expiration count.
pub fn clear(fd: RawFd) {
    if fd < 0 {
        return;
    }
    #[cfg(target_os = "linux")]
    {
        let spec: libc::itimerspec = unsafe { std::mem::zeroed() };
        unsafe {
            libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut());
            let mut expirations = 0u64;
            libc::read(fd, &mut expirations as *mut _ as _, 8);
        }
    }
}

/// Consumes the expiration count after poll reported the timer readable.
pub fn drain(fd: RawFd) {
    if fd < 0 {
        return;
    }
    #[cfg(target_os = "linux")]
    unsafe {
        let mut expirations = 0u64;
        libc::read(fd, &mut expirations as *mut _ as _, 8);
    }
}

pub fn close(fd: RawFd) {
    if fd < 0 {
        return;
    }
    #[cfg(unix)]
    unsafe {
        libc::close(fd);
    }
}
