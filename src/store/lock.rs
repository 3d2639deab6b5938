//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Maildirbox.
//
// Maildirbox is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Maildirbox is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without  even the implied  warranty of MERCHANTABILITY or
// FITNESS FOR  A PARTICULAR  PURPOSE.  See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along with
// Maildirbox. If not, see <http://www.gnu.org/licenses/>.

//! The cross-process scan lock.
//!
//! The lock is a `.maildirbox-lock` marker file in the mailbox root, taken
//! with `O_CREAT|O_EXCL` so exactly one process can hold it. It serialises
//! only the scan/reconcile window; deliveries, flag renames, and message
//! reads proceed without it since they rely on `rename()`/`link()` atomicity
//! alone.
//!
//! A holder that dies leaves the marker behind. Anyone finding a marker
//! older than five minutes concludes the holder is gone and removes it; a
//! healthy scan completes in well under a second.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use log::{error, warn};

use crate::support::error::Error;
use crate::support::file_ops::IgnoreKinds;

const LOCK_NAME: &str = ".maildirbox-lock";
const RETRY_SLEEP: Duration = Duration::from_secs(1);
const STALE_AFTER: Duration = Duration::from_secs(300);
const MAX_ATTEMPTS: u32 = 30;

/// An acquired scan lock. Released on drop.
#[derive(Debug)]
pub struct ScanLock {
    path: Option<PathBuf>,
    log_prefix: String,
}

impl ScanLock {
    /// Acquire the scan lock for the mailbox at `root`, waiting a bounded
    /// amount of time for another holder to finish.
    pub fn acquire(log_prefix: &str, root: &Path) -> Result<Self, Error> {
        Self::acquire_with(log_prefix, root, MAX_ATTEMPTS, RETRY_SLEEP)
    }

    fn acquire_with(
        log_prefix: &str,
        root: &Path,
        max_attempts: u32,
        retry_sleep: Duration,
    ) -> Result<Self, Error> {
        let path = root.join(LOCK_NAME);

        for attempt in 0..max_attempts {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => {
                    return Ok(ScanLock {
                        path: Some(path),
                        log_prefix: log_prefix.to_owned(),
                    })
                }
                Err(e) if io::ErrorKind::AlreadyExists == e.kind() => {
                    if marker_is_stale(&path) {
                        warn!(
                            "{} Breaking stale scan lock at {}",
                            log_prefix,
                            path.display()
                        );
                        // Racing another breaker is fine; NotFound just
                        // means they got there first.
                        match fs::remove_file(&path) {
                            Ok(())  => continue,
                            Err(e)
                                if io::ErrorKind::NotFound == e.kind() =>
                            {
                                continue
                            }
                            Err(e) => return Err(e.into()),
                        }
                    }

                    if attempt + 1 < max_attempts {
                        std::thread::sleep(retry_sleep);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::LockUnavailable)
    }

    /// Release the lock.
    ///
    /// Idempotent. Failure to unlink the marker is logged and swallowed;
    /// a leftover marker only delays the next scanner until the staleness
    /// takeover, it cannot corrupt anything.
    pub fn release(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = fs::remove_file(&path).ignore_not_found() {
                error!(
                    "{} Unable to remove scan lock {}: {}",
                    self.log_prefix,
                    path.display(),
                    e
                );
            }
        }
    }
}

impl Drop for ScanLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn marker_is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|md| md.modified())
        .ok()
        .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
        .map(|age| age > STALE_AFTER)
        .unwrap_or(false)
}
