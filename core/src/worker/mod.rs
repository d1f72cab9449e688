/*
 * mod.rs
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

//! Worker process common ground: heartbeat notification, worker-side signal
//! handling, the request-count self-restart, and engine selection.

pub mod asgi;
pub mod pool;
pub mod threaded;

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

use rand::Rng;

use crate::app::{Application, AsgiApplication};
use crate::config::{Config, WorkerClass};
use crate::listener::Listener;
use crate::supervisor::heartbeat::Heartbeat;

/// The application a worker serves, matching its engine.
#[derive(Clone)]
pub enum AppHandle {
    Sync(Arc<dyn Application>),
    Asgi(Arc<dyn AsgiApplication>),
}

// Worker-side signal state: a bitmask of pending signals plus the write end
// of the engine's wake pipe (signal-safe: handlers only fetch_or and write).
static WORKER_SIGNALS: AtomicU32 = AtomicU32::new(0);
static WORKER_WAKE_FD: AtomicI32 = AtomicI32::new(-1);

pub const SIG_GRACEFUL: u32 = 1;
pub const SIG_FAST_EXIT: u32 = 1 << 1;
pub const SIG_REOPEN_LOGS: u32 = 1 << 2;

extern "C" fn on_quit(_sig: libc::c_int) {
    WORKER_SIGNALS.fetch_or(SIG_GRACEFUL, Ordering::SeqCst);
    wake();
}

extern "C" fn on_term(_sig: libc::c_int) {
    WORKER_SIGNALS.fetch_or(SIG_FAST_EXIT, Ordering::SeqCst);
    wake();
}

extern "C" fn on_usr1(_sig: libc::c_int) {
    WORKER_SIGNALS.fetch_or(SIG_REOPEN_LOGS, Ordering::SeqCst);
    wake();
}

fn wake() {
    let fd = WORKER_WAKE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        unsafe {
            let _ = libc::write(fd, b".".as_ptr() as *const libc::c_void, 1);
        }
    }
}

/// Take and clear the pending signal mask.
pub fn take_signals() -> u32 {
    WORKER_SIGNALS.swap(0, Ordering::SeqCst)
}

/// Point signal wake-ups at the engine's method-queue pipe.
pub fn set_wake_fd(fd: RawFd) {
    WORKER_WAKE_FD.store(fd, Ordering::SeqCst);
}

/// Install the worker's own handlers: QUIT graceful, TERM/INT fast, USR1
/// reopen logs, WINCH ignored. The supervisor reset everything to default
/// right after fork; this runs from `init_process`.
pub fn init_signals() -> io::Result<()> {
    unsafe {
        install(libc::SIGQUIT, on_quit as libc::sighandler_t)?;
        install(libc::SIGTERM, on_term as libc::sighandler_t)?;
        install(libc::SIGINT, on_term as libc::sighandler_t)?;
        install(libc::SIGUSR1, on_usr1 as libc::sighandler_t)?;
        install(libc::SIGWINCH, libc::SIG_IGN)?;
        install(libc::SIGPIPE, libc::SIG_IGN)?;
    }
    Ok(())
}

unsafe fn install(sig: libc::c_int, handler: libc::sighandler_t) -> io::Result<()> {
    let mut action: libc::sigaction = std::mem::zeroed();
    action.sa_sigaction = handler;
    action.sa_flags = libc::SA_RESTART;
    libc::sigemptyset(&mut action.sa_mask);
    if libc::sigaction(sig, &action, std::ptr::null_mut()) != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Per-worker bookkeeping owned by the engine's main thread.
pub struct WorkerState {
    pub age: u64,
    pub ppid: libc::pid_t,
    pub heartbeat: Heartbeat,
    pub alive: bool,
    /// Requests served.
    pub nr: u64,
    /// Jittered self-restart threshold; 0 disables.
    pub max_requests: u64,
}

impl WorkerState {
    pub fn new(age: u64, heartbeat: Heartbeat, cfg: &Config) -> Self {
        let max_requests = if cfg.max_requests == 0 {
            0
        } else {
            let jitter = if cfg.max_requests_jitter > 0 {
                rand::thread_rng().gen_range(0..=cfg.max_requests_jitter)
            } else {
                0
            };
            cfg.max_requests + jitter
        };
        WorkerState {
            age,
            ppid: unsafe { libc::getppid() },
            heartbeat,
            alive: true,
            nr: 0,
            max_requests,
        }
    }

    /// Touch the heartbeat token; the supervisor's liveness signal.
    pub fn notify(&mut self) {
        if let Err(e) = self.heartbeat.notify() {
            tracing::debug!(error = %e, "heartbeat notify failed");
        }
    }

    /// The supervisor died (or changed); the worker exits cleanly.
    pub fn parent_changed(&self) -> bool {
        (unsafe { libc::getppid() }) != self.ppid
    }

    /// Count served requests; flips `alive` once the jittered max-requests
    /// threshold is crossed so the worker restarts itself.
    pub fn count_requests(&mut self, n: u64) {
        self.nr += n;
        if self.max_requests > 0 && self.nr >= self.max_requests && self.alive {
            tracing::info!(nr = self.nr, "max requests reached, restarting worker");
            self.alive = false;
        }
    }
}

/// Worker entry point, called in the forked child after privileges were
/// dropped. Runs the engine matching `worker_class` until exit.
pub fn run_worker(
    cfg: Arc<Config>,
    listeners: Arc<Vec<Listener>>,
    app: AppHandle,
    state: WorkerState,
) -> io::Result<()> {
    init_signals()?;
    tracing::info!(pid = unsafe { libc::getpid() }, age = state.age, "worker booted");
    match (cfg.worker_class, app) {
        (WorkerClass::Threaded, AppHandle::Sync(app)) => {
            threaded::ThreadedWorker::new(cfg, listeners, app, state)?.run()
        }
        (WorkerClass::Asgi, AppHandle::Asgi(app)) => asgi::run(cfg, listeners, app, state),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "worker_class does not match the application kind",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_requests_jitter_stays_in_band() {
        let cfg = Config {
            max_requests: 100,
            max_requests_jitter: 10,
            ..Config::default()
        };
        for _ in 0..20 {
            let state = WorkerState::new(1, Heartbeat::for_test().unwrap(), &cfg);
            assert!((100..=110).contains(&state.max_requests));
        }
    }

    #[test]
    fn count_requests_trips_alive() {
        let cfg = Config {
            max_requests: 3,
            ..Config::default()
        };
        let mut state = WorkerState::new(1, Heartbeat::for_test().unwrap(), &cfg);
        state.count_requests(2);
        assert!(state.alive);
        state.count_requests(1);
        assert!(!state.alive);
    }

    #[test]
    fn zero_max_requests_never_trips() {
        let cfg = Config::default();
        let mut state = WorkerState::new(1, Heartbeat::for_test().unwrap(), &cfg);
        state.count_requests(1_000_000);
        assert!(state.alive);
    }
}
