/*
 * pool.rs
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

//! The threaded engine's bounded worker pool, and the pollable method queue
//! used to hand connections back to the accept thread.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Sender};
use crossbeam::queue::SegQueue;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of request-handler threads.
pub struct ThreadPool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(threads: usize) -> ThreadPool {
        let (tx, rx) = unbounded::<Job>();
        let workers = (0..threads.max(1))
            .map(|i| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("handler-{}", i))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            // A panicking handler must not take the pool down.
                            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                                tracing::error!("request handler panicked");
                            }
                        }
                    })
                    .expect("spawn pool thread")
            })
            .collect();
        ThreadPool {
            tx: Some(tx),
            workers,
        }
    }

    pub fn execute(&self, job: Job) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(job);
        }
    }

    /// Stop accepting jobs. With `wait`, queued and running jobs finish and
    /// threads are joined; otherwise running handlers are abandoned to the
    /// process exit.
    pub fn shutdown(&mut self, wait: bool) {
        self.tx = None;
        if wait {
            for handle in self.workers.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

/// A pollable in-process queue: a lock-free queue of callbacks paired with a
/// self-pipe whose read end sits in the engine's poller, so pool threads and
/// signal handlers can wake the accept loop.
pub struct MethodQueue<T> {
    queue: Arc<SegQueue<T>>,
    wake_r: OwnedFd,
    wake_w: Arc<OwnedFd>,
}

impl<T> MethodQueue<T> {
    pub fn new() -> io::Result<MethodQueue<T>> {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(MethodQueue {
            queue: Arc::new(SegQueue::new()),
            wake_r: unsafe { OwnedFd::from_raw_fd(fds[0]) },
            wake_w: Arc::new(unsafe { OwnedFd::from_raw_fd(fds[1]) }),
        })
    }

    /// The fd registered with the readiness poller.
    pub fn poll_fd(&self) -> RawFd {
        self.wake_r.as_raw_fd()
    }

    /// Raw write end, handed to the signal layer.
    pub fn wake_fd(&self) -> RawFd {
        self.wake_w.as_raw_fd()
    }

    /// A cloneable producer for pool threads.
    pub fn sender(&self) -> MethodSender<T> {
        MethodSender {
            queue: Arc::clone(&self.queue),
            wake_w: Arc::clone(&self.wake_w),
        }
    }

    /// Drain the pipe and pop everything queued so far.
    pub fn drain(&self) -> Vec<T> {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                libc::read(
                    self.wake_r.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
        let mut out = Vec::new();
        while let Some(item) = self.queue.pop() {
            out.push(item);
        }
        out
    }
}

/// Producer half of a [`MethodQueue`].
pub struct MethodSender<T> {
    queue: Arc<SegQueue<T>>,
    wake_w: Arc<OwnedFd>,
}

impl<T> Clone for MethodSender<T> {
    fn clone(&self) -> Self {
        MethodSender {
            queue: Arc::clone(&self.queue),
            wake_w: Arc::clone(&self.wake_w),
        }
    }
}

impl<T> MethodSender<T> {
    pub fn send(&self, item: T) {
        self.queue.push(item);
        unsafe {
            let _ = libc::write(
                self.wake_w.as_raw_fd(),
                b".".as_ptr() as *const libc::c_void,
                1,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn pool_runs_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pool = ThreadPool::new(2);
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            pool.execute(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.shutdown(true);
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn pool_survives_panicking_job() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pool = ThreadPool::new(1);
        pool.execute(Box::new(|| panic!("boom")));
        let c = Arc::clone(&counter);
        pool.execute(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        pool.shutdown(true);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn method_queue_wakes_and_drains() {
        let queue: MethodQueue<u32> = MethodQueue::new().unwrap();
        let sender = queue.sender();
        let t = std::thread::spawn(move || {
            sender.send(1);
            sender.send(2);
        });
        t.join().unwrap();
        // The pipe is readable once something was sent.
        let mut pfd = libc::pollfd {
            fd: queue.poll_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, 1000) };
        assert_eq!(rc, 1);
        let drained = queue.drain();
        assert_eq!(drained, vec![1, 2]);
        // Drained pipe no longer polls readable.
        let mut pfd = libc::pollfd {
            fd: queue.poll_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, 10) };
        assert_eq!(rc, 0);
    }
}
