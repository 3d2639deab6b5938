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

//! The in-memory index from unique names to UIDs and current filenames.
//!
//! This is a pure lookup structure with no persistence of its own. The
//! filename half is rebuilt by every directory walk; the UID half is only
//! authoritative once it has been loaded from, or reconciled with, the
//! durable cache.

use std::collections::hash_map::{self, HashMap};

use crate::store::model::Uid;

/// One entry of the index.
///
/// Either half may be unknown: a file seen on disk before the cache is
/// loaded has a filename but no UID; a cache row whose file has not yet been
/// seen in the current pass has a UID but no filename.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexEntry {
    pub uid: Option<Uid>,
    pub filename: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct UidIndex {
    entries: HashMap<String, IndexEntry>,
}

impl UidIndex {
    pub fn new() -> Self {
        UidIndex::default()
    }

    /// Insert or merge an entry for `unique`.
    ///
    /// A known UID is never overwritten by `None`, and a known filename is
    /// never overwritten by `None`; merging information from a directory
    /// walk and a cache load therefore cannot lose either half, regardless
    /// of which arrives first.
    pub fn insert(
        &mut self,
        unique: &str,
        uid: Option<Uid>,
        filename: Option<String>,
    ) {
        match self.entries.get_mut(unique) {
            Some(entry) => {
                if uid.is_some() {
                    entry.uid = uid;
                }
                if filename.is_some() {
                    entry.filename = filename;
                }
            }
            None => {
                self.entries
                    .insert(unique.to_owned(), IndexEntry { uid, filename });
            }
        }
    }

    pub fn remove(&mut self, unique: &str) -> Option<IndexEntry> {
        self.entries.remove(unique)
    }

    pub fn find(&self, unique: &str) -> Option<&IndexEntry> {
        self.entries.get(unique)
    }

    pub fn find_mut(&mut self, unique: &str) -> Option<&mut IndexEntry> {
        self.entries.get_mut(unique)
    }

    /// Forget every UID while retaining the names and filenames.
    ///
    /// Called immediately before a cache reload, so that entries the reload
    /// does not repopulate are distinguishable from entries simply not yet
    /// seen in this pass.
    pub fn clear_uids(&mut self) {
        for entry in self.entries.values_mut() {
            entry.uid = None;
        }
    }

    /// Forget every filename while retaining the names and UIDs.
    ///
    /// Called immediately before a filename-only rescan of the working area,
    /// so that files renamed by another accessor are re-indexed instead of
    /// being treated as deleted and recreated.
    pub fn clear_filenames(&mut self) {
        for entry in self.entries.values_mut() {
            entry.filename = None;
        }
    }

    pub fn iter(&self) -> hash_map::Iter<String, IndexEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
