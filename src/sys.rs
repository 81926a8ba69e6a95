// SPDX-License-Identifier: MIT OR Apache-2.0
//! Platform shims for the orchestrator's bounded readiness wait.
//!
//! The update loop parks in `select(2)` so it wakes as soon as any worker or
//! proxy socket becomes readable, without spending the full wait budget.
//! Non-unix targets fall back to a plain sleep for the same duration.

use std::time::Duration;

#[cfg(unix)]
pub type RawFd = std::os::fd::RawFd;
#[cfg(not(unix))]
pub type RawFd = i32;

/// Sleeps for the given duration. Used by polling loops that have no
/// readiness handle to wait on.
pub fn sleep(duration: Duration) {
    std::thread::sleep(duration);
}

/// Blocks until one of `fds` is readable or `timeout` elapses, returning the
/// number of ready descriptors (0 on timeout).
///
/// An empty `fds` slice degrades to a plain sleep. Interruption by a signal
/// is reported as a timeout rather than an error.
#[cfg(unix)]
pub fn wait_readable(fds: &[RawFd], timeout: Duration) -> std::io::Result<usize> {
    if fds.is_empty() {
        sleep(timeout);
        return Ok(0);
    }
    // fd_set cannot represent descriptors at or above FD_SETSIZE
    if fds.iter().any(|&fd| fd < 0 || fd as usize >= libc::FD_SETSIZE as usize) {
        sleep(timeout);
        return Ok(0);
    }
    let mut set: libc::fd_set = unsafe { std::mem::zeroed() };
    let mut max_fd: RawFd = -1;
    unsafe {
        libc::FD_ZERO(&mut set);
        for &fd in fds {
            libc::FD_SET(fd, &mut set);
            if fd > max_fd {
                max_fd = fd;
            }
        }
    }
    let mut tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    let rc = unsafe {
        libc::select(
            max_fd + 1,
            &mut set,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            &mut tv,
        )
    };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            Ok(0)
        } else {
            Err(err)
        }
    } else {
        Ok(rc as usize)
    }
}

#[cfg(not(unix))]
pub fn wait_readable(_fds: &[RawFd], timeout: Duration) -> std::io::Result<usize> {
    sleep(timeout);
    Ok(0)
}
