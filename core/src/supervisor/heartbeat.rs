/*
 * heartbeat.rs
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

//! The heartbeat token: a small temporary file per worker. The worker
//! rewrites one byte to bump its mtime; the supervisor's liveness check is
//! exactly the file's age. No application-visible state crosses this file.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::time::{Duration, SystemTime};

use tempfile::NamedTempFile;

/// Worker side: the open file handle inherited across fork.
pub struct Heartbeat {
    file: File,
    spinner: u8,
}

impl Heartbeat {
    pub fn new(file: File) -> Heartbeat {
        Heartbeat { file, spinner: 0 }
    }

    /// Rewrite one byte at offset 0; the mtime bump is the signal.
    pub fn notify(&mut self) -> io::Result<()> {
        self.spinner = self.spinner.wrapping_add(1);
        self.file.write_at(&[self.spinner], 0)?;
        Ok(())
    }

    /// A standalone token for unit tests.
    pub fn for_test() -> io::Result<Heartbeat> {
        let tmp = NamedTempFile::new()?;
        Ok(Heartbeat::new(tmp.into_file()))
    }
}

/// Supervisor side: owns the token path; the file is removed when the
/// handle is dropped (on reap).
pub struct WorkerTmp {
    tmp: NamedTempFile,
}

impl WorkerTmp {
    /// Create a token and the worker-side handle to it.
    pub fn new() -> io::Result<(WorkerTmp, Heartbeat)> {
        let tmp = tempfile::Builder::new().prefix("wforchetta-").tempfile()?;
        let file = tmp.as_file().try_clone()?;
        Ok((WorkerTmp { tmp }, Heartbeat::new(file)))
    }

    /// Time since the worker last notified. A clock step backwards clamps
    /// to zero, so a jump can only delay a murder, never cause one.
    pub fn since_update(&self) -> io::Result<Duration> {
        let mtime = self.tmp.as_file().metadata()?.modified()?;
        Ok(SystemTime::now()
            .duration_since(mtime)
            .unwrap_or(Duration::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_bumps_mtime() {
        let (tmp, mut heartbeat) = WorkerTmp::new().unwrap();
        heartbeat.notify().unwrap();
        let age = tmp.since_update().unwrap();
        assert!(age < Duration::from_secs(5));
    }

    #[test]
    fn repeated_notify_is_cheap_and_safe() {
        let (tmp, mut heartbeat) = WorkerTmp::new().unwrap();
        for _ in 0..100 {
            heartbeat.notify().unwrap();
        }
        assert!(tmp.since_update().unwrap() < Duration::from_secs(5));
    }

    #[test]
    fn token_removed_on_drop() {
        let (tmp, _heartbeat) = WorkerTmp::new().unwrap();
        let path = tmp.tmp.path().to_path_buf();
        assert!(path.exists());
        drop(tmp);
        assert!(!path.exists());
    }
}
