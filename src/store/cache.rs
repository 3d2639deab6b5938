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

//! Durable per-mailbox state: the UID cache and the UID validity sidecar.
//!
//! Both files are TOML and carry an explicit version tag which must match
//! exactly; any mismatch, truncation, or other parse failure makes the file
//! count as absent, never as partially valid. Corruption here can therefore
//! never corrupt mailbox content; at worst it forces a full re-derivation
//! from the filesystem under a fresh UID validity.
//!
//! Both files are replaced via write-to-`tmp/`-then-rename and never edited
//! in place, so a concurrent reader always sees either the old or the new
//! file, complete.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::support::error::Error;
use crate::support::file_ops;

pub const CACHE_VERSION: &str = "maildirbox-cache/1";
pub const VALIDITY_VERSION: &str = "maildirbox-uidvalidity/1";

const CACHE_NAME: &str = ".maildirbox-cache";
const VALIDITY_NAME: &str = ".maildirbox-uidvalidity";

/// The durable UID cache of one mailbox.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheFile {
    /// Format tag; must equal `CACHE_VERSION` exactly.
    pub version: String,
    /// The UID validity epoch these rows belong to.
    pub uidvalidity: u32,
    /// The next UID to be allocated; strictly greater than every row's UID.
    pub uidnext: u32,
    /// One row per known message, in UID order.
    #[serde(default)]
    pub messages: Vec<CacheRow>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheRow {
    pub unique_name: String,
    pub uid: u32,
    /// Size with canonicalised (CRLF) line endings.
    pub size: u64,
    /// Arrival time, UNIX seconds.
    pub internal_date: i64,
}

/// The result of attempting to load a cache.
#[derive(Clone, Debug)]
pub enum CacheState {
    Loaded(CacheFile),
    /// The cache is absent or unusable. The caller must mint a fresh UID
    /// validity, reset the UID counter, and force a rewrite.
    Missing,
}

pub fn cache_path(root: &Path) -> PathBuf {
    root.join(CACHE_NAME)
}

/// Load the UID cache for the mailbox at `root`.
///
/// Only a real I/O failure (other than the file not existing) is an `Err`;
/// every form of unusable content comes back as `Missing`.
pub fn load_cache(log_prefix: &str, root: &Path) -> Result<CacheState, Error> {
    let path = cache_path(root);
    let data = match fs::read(&path) {
        Ok(data) => data,
        Err(e) if io::ErrorKind::NotFound == e.kind() => {
            return Ok(CacheState::Missing)
        }
        Err(e) => return Err(e.into()),
    };

    let cache: CacheFile = match toml::from_slice(&data) {
        Ok(cache) => cache,
        Err(e) => {
            warn!("{} Unreadable UID cache, discarding: {}", log_prefix, e);
            return Ok(CacheState::Missing);
        }
    };

    if cache.version != CACHE_VERSION {
        warn!(
            "{} UID cache has version '{}', expected '{}'; discarding",
            log_prefix, cache.version, CACHE_VERSION
        );
        return Ok(CacheState::Missing);
    }

    if 0 == cache.uidvalidity
        || 0 == cache.uidnext
        || cache.messages.iter().any(|row| 0 == row.uid)
    {
        warn!("{} UID cache contains zero identifiers; discarding", log_prefix);
        return Ok(CacheState::Missing);
    }

    Ok(CacheState::Loaded(cache))
}

/// Atomically replace the UID cache for the mailbox at `root`.
///
/// The previous cache file remains untouched until the new one has been
/// fully written and synced.
pub fn store_cache(root: &Path, cache: &CacheFile) -> Result<(), Error> {
    let text = toml::to_string(cache)?;
    file_ops::spit(
        root.join("tmp"),
        cache_path(root),
        true,
        0o600,
        text.as_bytes(),
    )?;
    Ok(())
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ValidityFile {
    version: String,
    uidvalidity: u32,
}

pub fn validity_path(root: &Path) -> PathBuf {
    root.join(VALIDITY_NAME)
}

/// Load the UID validity sidecar, with the same absence semantics as
/// `load_cache`.
pub fn load_validity(
    log_prefix: &str,
    root: &Path,
) -> Result<Option<u32>, Error> {
    let data = match fs::read(validity_path(root)) {
        Ok(data) => data,
        Err(e) if io::ErrorKind::NotFound == e.kind() => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    match toml::from_slice::<ValidityFile>(&data) {
        Ok(v) if v.version == VALIDITY_VERSION && v.uidvalidity != 0 => {
            Ok(Some(v.uidvalidity))
        }
        Ok(_) => {
            warn!("{} Unusable UID validity file; discarding", log_prefix);
            Ok(None)
        }
        Err(e) => {
            warn!(
                "{} Unreadable UID validity file, discarding: {}",
                log_prefix, e
            );
            Ok(None)
        }
    }
}

pub fn store_validity(root: &Path, uidvalidity: u32) -> Result<(), Error> {
    let text = toml::to_string(&ValidityFile {
        version: VALIDITY_VERSION.to_owned(),
        uidvalidity,
    })?;
    file_ops::spit(
        root.join("tmp"),
        validity_path(root),
        true,
        0o600,
        text.as_bytes(),
    )?;
    Ok(())
}
