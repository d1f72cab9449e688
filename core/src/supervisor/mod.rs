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

//! The supervisor: owns the listeners, forks and respawns workers, watches
//! heartbeats, and turns signals into lifecycle operations (reload, rolling
//! restart, binary upgrade, worker-count changes). Single-threaded; all
//! asynchrony is serialized through the signal pipe.

pub mod heartbeat;
pub mod signals;

use std::collections::BTreeMap;
use std::ffi::CString;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::listener::{fd_env_value, inherited_fds, Address, Listener, FD_ENV};
use crate::util::set_cloexec;
use crate::worker::{self, AppHandle, WorkerState};

use heartbeat::WorkerTmp;
use signals::SignalPipe;

/// The supervisor's view of one worker.
struct WorkerHandle {
    pid: libc::pid_t,
    birth: Instant,
    tmp: WorkerTmp,
}

pub struct Supervisor {
    cfg: Arc<Config>,
    app: AppHandle,
    listeners: Arc<Vec<Listener>>,
    /// Age → handle; age is a monotonically increasing id, so the oldest
    /// workers are always the smallest keys.
    workers: BTreeMap<u64, WorkerHandle>,
    age_counter: u64,
    num_workers: usize,
    pipe: SignalPipe,
    /// Ages queued for one-per-heartbeat graceful retirement after reload.
    retiring: Vec<u64>,
    /// WINCH: workers stopped but supervisor keeps the listeners.
    paused: bool,
}

enum Next {
    Continue,
    /// Stop: graceful drains within graceful_timeout, fast does not.
    Stop { graceful: bool },
}

impl Supervisor {
    /// Bind the listener set (or adopt inherited fds after a binary
    /// upgrade) and prepare to run. Binding errors abort boot.
    pub fn new(cfg: Config, addresses: &[Address], app: AppHandle) -> io::Result<Supervisor> {
        let inherited = inherited_fds()?;
        let mut listeners = Vec::new();
        if inherited.is_empty() {
            for address in addresses {
                let listener = Listener::bind(address, &cfg)?;
                tracing::info!(listener = %listener.address(), "listening");
                listeners.push(listener);
            }
        } else {
            for fd in inherited {
                let listener = Listener::from_fd(fd)?;
                tracing::info!(listener = %listener.address(), "adopted inherited listener");
                listeners.push(listener);
            }
            std::env::remove_var(FD_ENV);
        }
        if listeners.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no listeners configured",
            ));
        }
        let num_workers = cfg.workers.max(1);
        let pipe = SignalPipe::install()?;
        Ok(Supervisor {
            cfg: Arc::new(cfg),
            app,
            listeners: Arc::new(listeners),
            workers: BTreeMap::new(),
            age_counter: 0,
            num_workers,
            pipe,
            retiring: Vec::new(),
            paused: false,
        })
    }

    /// The main loop: reap, maintain, murder, wait for signals.
    pub fn run(mut self) -> io::Result<()> {
        if let Some(hook) = &self.cfg.hooks.on_starting {
            hook();
        }
        tracing::info!(
            pid = unsafe { libc::getpid() },
            workers = self.num_workers,
            "supervisor booted"
        );
        self.maintain_worker_count()?;
        if let Some(hook) = &self.cfg.hooks.when_ready {
            hook();
        }

        let stop = loop {
            self.reap_workers();
            if !self.paused {
                self.maintain_worker_count()?;
            }
            self.murder_workers();
            self.retire_one();

            let signals = self.pipe.wait(1000)?;
            let mut next = Next::Continue;
            for sig in signals {
                next = self.handle_signal(sig)?;
                if let Next::Stop { .. } = next {
                    break;
                }
            }
            if let Next::Stop { graceful } = next {
                break graceful;
            }
        };

        self.stop_workers(stop);
        for listener in self.listeners.iter() {
            listener.cleanup();
        }
        if let Some(hook) = &self.cfg.hooks.on_exit {
            hook();
        }
        tracing::info!("supervisor exiting");
        Ok(())
    }

    fn handle_signal(&mut self, sig: libc::c_int) -> io::Result<Next> {
        match sig {
            libc::SIGCHLD => Ok(Next::Continue),
            libc::SIGHUP => {
                tracing::info!("reloading (SIGHUP)");
                self.reload()?;
                Ok(Next::Continue)
            }
            libc::SIGTERM | libc::SIGINT => {
                tracing::info!("graceful shutdown requested");
                Ok(Next::Stop { graceful: true })
            }
            libc::SIGQUIT => {
                tracing::info!("fast shutdown requested");
                Ok(Next::Stop { graceful: false })
            }
            libc::SIGUSR1 => {
                // Log reopening is the subscriber's concern; workers get the
                // same signal to reopen theirs.
                self.kill_all(libc::SIGUSR1);
                Ok(Next::Continue)
            }
            libc::SIGUSR2 => {
                self.binary_upgrade()?;
                Ok(Next::Continue)
            }
            libc::SIGWINCH => {
                tracing::info!("stopping workers, keeping listeners (SIGWINCH)");
                self.paused = true;
                self.kill_all(libc::SIGTERM);
                Ok(Next::Continue)
            }
            libc::SIGTTIN => {
                self.adjust_workers(self.num_workers + 1);
                Ok(Next::Continue)
            }
            libc::SIGTTOU => {
                if self.num_workers > 1 {
                    self.adjust_workers(self.num_workers - 1);
                }
                Ok(Next::Continue)
            }
            other => {
                tracing::debug!(signal = other, "ignoring signal");
                Ok(Next::Continue)
            }
        }
    }

    fn adjust_workers(&mut self, target: usize) {
        let old = self.num_workers;
        self.num_workers = target;
        self.paused = false;
        tracing::info!(from = old, to = target, "worker count changed");
        if let Some(hook) = &self.cfg.hooks.nworkers_changed {
            hook(old, target);
        }
        // Surplus: retire the oldest workers until the count matches.
        while self.workers.len() > self.num_workers {
            if let Some((&age, handle)) = self.workers.iter().next() {
                let pid = handle.pid;
                tracing::info!(pid, age, "retiring surplus worker");
                kill(pid, libc::SIGQUIT);
                self.workers.remove(&age);
            }
        }
    }

    /// Non-blocking reap of every terminated child.
    fn reap_workers(&mut self) {
        loop {
            let mut status = 0 as libc::c_int;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid <= 0 {
                break;
            }
            if let Some(hook) = &self.cfg.hooks.child_exit {
                hook(pid);
            }
            let age = self
                .workers
                .iter()
                .find(|(_, h)| h.pid == pid)
                .map(|(&age, _)| age);
            if let Some(age) = age {
                // Dropping the handle removes the heartbeat token.
                let handle = self.workers.remove(&age);
                self.retiring.retain(|&a| a != age);
                if let Some(handle) = handle {
                    tracing::info!(
                        pid,
                        age,
                        uptime_secs = handle.birth.elapsed().as_secs(),
                        "worker exited"
                    );
                }
                if let Some(hook) = &self.cfg.hooks.worker_exit {
                    hook(pid);
                }
            }
        }
    }

    /// Fork workers until the configured count is alive.
    fn maintain_worker_count(&mut self) -> io::Result<()> {
        while self.workers.len() < self.num_workers + self.retiring.len() {
            self.fork_worker()?;
        }
        Ok(())
    }

    /// SIGKILL workers whose heartbeat token is older than `timeout`.
    fn murder_workers(&mut self) {
        let timeout = Duration::from_secs(self.cfg.timeout);
        let mut stuck = Vec::new();
        for (&age, handle) in &self.workers {
            match handle.tmp.since_update() {
                Ok(elapsed) if elapsed > timeout => stuck.push((age, handle.pid)),
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(pid = handle.pid, error = %e, "heartbeat stat failed");
                }
            }
        }
        for (age, pid) in stuck {
            tracing::error!(pid, age, "worker heartbeat timeout, killing");
            if let Some(hook) = &self.cfg.hooks.worker_abort {
                hook(pid);
            }
            kill(pid, libc::SIGKILL);
            // The next reap_workers collects the corpse and the following
            // maintain_worker_count replaces it.
        }
    }

    /// Retire at most one old-age worker per loop iteration, keeping
    /// capacity available during a rolling restart.
    fn retire_one(&mut self) {
        if self.retiring.is_empty() {
            return;
        }
        let age = self.retiring.remove(0);
        if let Some(handle) = self.workers.get(&age) {
            tracing::info!(pid = handle.pid, age, "retiring worker after reload");
            kill(handle.pid, libc::SIGTERM);
        }
    }

    /// Graceful reload: re-read config if a reloader is set, rebuild the
    /// listener set to match, then roll the workers: new ones first, old
    /// ages retired one per heartbeat. In-flight requests are never
    /// interrupted.
    fn reload(&mut self) -> io::Result<()> {
        if let Some(hook) = &self.cfg.hooks.on_reload {
            hook();
        }
        if let Some(reloader) = &self.cfg.reloader {
            let new_cfg = reloader();
            self.num_workers = new_cfg.workers.max(1);
            self.cfg = Arc::new(new_cfg);
        }
        // All current workers move to the retirement queue, oldest first.
        self.retiring = self.workers.keys().copied().collect();
        self.maintain_worker_count()?;
        Ok(())
    }

    /// Apply an address-set change from a reloaded config: keep listeners
    /// whose address survives, close removed ones, open added ones.
    pub fn rebind(&mut self, addresses: &[Address]) -> io::Result<()> {
        let mut kept: Vec<Listener> = Vec::new();
        let old = Arc::get_mut(&mut self.listeners).ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "listeners still shared by a worker fork")
        })?;
        let mut old: Vec<Listener> = std::mem::take(old);
        for address in addresses {
            if let Some(i) = old.iter().position(|l| &l.address() == address) {
                kept.push(old.remove(i));
            } else {
                let listener = Listener::bind(address, &self.cfg)?;
                tracing::info!(listener = %listener.address(), "listening (added by reload)");
                kept.push(listener);
            }
        }
        for dropped in old {
            tracing::info!(listener = %dropped.address(), "closing (removed by reload)");
            dropped.cleanup();
        }
        self.listeners = Arc::new(kept);
        Ok(())
    }

    /// USR2: re-exec the server binary with the listeners passed through
    /// the fd environment protocol. The old supervisor keeps serving until
    /// the operator retires it with WINCH + TERM.
    fn binary_upgrade(&mut self) -> io::Result<()> {
        tracing::info!("binary upgrade requested (SIGUSR2)");
        for listener in self.listeners.iter() {
            set_cloexec(listener.raw_fd(), false)?;
        }
        let env_value = fd_env_value(&self.listeners);
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(io::Error::last_os_error());
        }
        if pid == 0 {
            // New supervisor: exec the same binary with the same arguments.
            std::env::set_var(FD_ENV, &env_value);
            let exe = std::env::current_exe().unwrap_or_else(|_| "/proc/self/exe".into());
            let exe_c = CString::new(exe.to_string_lossy().into_owned())
                .unwrap_or_else(|_| CString::new("/proc/self/exe").expect("cstring"));
            let args: Vec<CString> = std::env::args()
                .filter_map(|a| CString::new(a).ok())
                .collect();
            let mut argv: Vec<*const libc::c_char> =
                args.iter().map(|a| a.as_ptr()).collect();
            argv.push(std::ptr::null());
            unsafe {
                libc::execv(exe_c.as_ptr(), argv.as_ptr());
                // Exec only returns on failure.
                libc::_exit(127);
            }
        }
        // Old supervisor: restore CLOEXEC and keep serving.
        for listener in self.listeners.iter() {
            set_cloexec(listener.raw_fd(), true)?;
        }
        tracing::info!(new_pid = pid, "spawned upgraded supervisor");
        Ok(())
    }

    fn fork_worker(&mut self) -> io::Result<()> {
        self.age_counter += 1;
        let age = self.age_counter;
        let (tmp, heartbeat) = WorkerTmp::new()?;
        let state = WorkerState::new(age, heartbeat, &self.cfg);

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(io::Error::last_os_error());
        }
        if pid == 0 {
            // Child: shed the supervisor's signal machinery, drop
            // privileges, run the engine.
            self.pipe.disarm_in_child();
            drop_privileges(&self.cfg);
            let code = match worker::run_worker(
                Arc::clone(&self.cfg),
                Arc::clone(&self.listeners),
                self.app.clone(),
                state,
            ) {
                Ok(()) => 0,
                Err(e) => {
                    tracing::error!(error = %e, "worker failed");
                    1
                }
            };
            std::process::exit(code);
        }

        self.workers.insert(
            age,
            WorkerHandle {
                pid,
                birth: Instant::now(),
                tmp,
            },
        );
        tracing::info!(pid, age, "forked worker");
        Ok(())
    }

    fn kill_all(&self, sig: libc::c_int) {
        for handle in self.workers.values() {
            kill(handle.pid, sig);
        }
    }

    /// Stop every worker: graceful sends SIGTERM and waits out
    /// graceful_timeout before SIGKILL; fast goes straight to SIGQUIT.
    fn stop_workers(&mut self, graceful: bool) {
        if graceful {
            self.kill_all(libc::SIGTERM);
            let deadline = Instant::now() + Duration::from_secs(self.cfg.graceful_timeout);
            while !self.workers.is_empty() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(100));
                self.reap_workers();
            }
        } else {
            self.kill_all(libc::SIGQUIT);
            let deadline = Instant::now() + Duration::from_secs(1);
            while !self.workers.is_empty() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(50));
                self.reap_workers();
            }
        }
        self.kill_all(libc::SIGKILL);
        self.reap_workers();
    }
}

fn kill(pid: libc::pid_t, sig: libc::c_int) {
    unsafe {
        if libc::kill(pid, sig) != 0 {
            let err = io::Error::last_os_error();
            tracing::debug!(pid, sig, error = %err, "kill failed");
        }
    }
}

fn drop_privileges(cfg: &Config) {
    unsafe {
        if let Some(group) = cfg.group {
            if libc::setgid(group) != 0 {
                tracing::warn!(group, "setgid failed");
            }
        }
        if let Some(user) = cfg.user {
            if libc::setuid(user) != 0 {
                tracing::warn!(user, "setuid failed");
            }
        }
    }
}
