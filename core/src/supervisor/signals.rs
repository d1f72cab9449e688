/*
 * signals.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Forchetta, a pre-fork application server.
 *
 * Forchetta is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Forchetta is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Forchetta.  If not, see <http://www.gnu.org/licenses/>.
 */

//! The supervisor's signal pipe: handlers write the signal number as one
//! byte to a self-pipe, serializing asynchronous delivery into the main
//! loop's select.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

static PIPE_W: AtomicI32 = AtomicI32::new(-1);

/// Signals the supervisor subscribes to.
pub const SUPERVISOR_SIGNALS: &[libc::c_int] = &[
    libc::SIGHUP,
    libc::SIGQUIT,
    libc::SIGINT,
    libc::SIGTERM,
    libc::SIGUSR1,
    libc::SIGUSR2,
    libc::SIGWINCH,
    libc::SIGTTIN,
    libc::SIGTTOU,
    libc::SIGCHLD,
];

extern "C" fn on_signal(sig: libc::c_int) {
    let fd = PIPE_W.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = [sig as u8];
        unsafe {
            let _ = libc::write(fd, byte.as_ptr() as *const libc::c_void, 1);
        }
    }
}

/// The read end of the signal pipe, polled by the supervisor.
pub struct SignalPipe {
    read: OwnedFd,
    _write: OwnedFd,
}

impl SignalPipe {
    /// Create the pipe and install handlers for every supervisor signal.
    pub fn install() -> io::Result<SignalPipe> {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        let pipe = SignalPipe {
            read: unsafe { OwnedFd::from_raw_fd(fds[0]) },
            _write: unsafe { OwnedFd::from_raw_fd(fds[1]) },
        };
        PIPE_W.store(fds[1], Ordering::SeqCst);
        for &sig in SUPERVISOR_SIGNALS {
            unsafe {
                let mut action: libc::sigaction = std::mem::zeroed();
                action.sa_sigaction = on_signal as libc::sighandler_t;
                action.sa_flags = libc::SA_RESTART;
                libc::sigemptyset(&mut action.sa_mask);
                if libc::sigaction(sig, &action, std::ptr::null_mut()) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
        }
        // SIGPIPE would kill the whole tree on a dead socket write.
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }
        Ok(pipe)
    }

    pub fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Block up to `timeout_ms` for pending signals; drains everything that
    /// arrived.
    pub fn wait(&self, timeout_ms: i32) -> io::Result<Vec<libc::c_int>> {
        let mut pfd = libc::pollfd {
            fd: self.read.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }
        if rc == 0 {
            return Ok(Vec::new());
        }
        let mut buf = [0u8; 64];
        let mut signals = Vec::new();
        loop {
            let n = unsafe {
                libc::read(
                    self.read.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
            signals.extend(buf[..n as usize].iter().map(|&b| b as libc::c_int));
        }
        Ok(signals)
    }

    /// In forked children the worker must not hold the supervisor's pipe.
    pub fn disarm_in_child(&self) {
        PIPE_W.store(-1, Ordering::SeqCst);
        for &sig in SUPERVISOR_SIGNALS {
            unsafe {
                libc::signal(sig, libc::SIG_DFL);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_times_out_without_signals() {
        // Install on a scratch pipe without touching process handlers:
        // exercise only the poll/drain path via a manual write.
        let pipe = SignalPipe::install().unwrap();
        assert!(pipe.wait(10).unwrap().is_empty());
        unsafe {
            let byte = [libc::SIGHUP as u8];
            libc::write(
                pipe._write.as_raw_fd(),
                byte.as_ptr() as *const libc::c_void,
                1,
            );
        }
        let signals = pipe.wait(100).unwrap();
        assert_eq!(signals, vec![libc::SIGHUP]);
    }
}
