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

//! A small cache of open message files.
//!
//! Clients commonly fetch the same message several times in a row (headers,
//! then structure, then body), each fetch nominally requiring its own
//! `open()`. The cache keeps the last few descriptors warm so repeat fetches
//! skip the path walk.
//!
//! This is a plain value owned by whoever coordinates message access, passed
//! down by `&mut` where needed. Handles obtained on a hit share one file
//! description per cached message and are rewound on every access, so at
//! most one reader per message may be live at a time; callers needing
//! concurrent readers of a single message open it directly instead.

use std::collections::VecDeque;
use std::fs;
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};

pub const DEFAULT_MAX_OPEN: usize = 4;

#[derive(Debug)]
pub struct OpenMessageCache {
    max: usize,
    // Most recently used at the back. Linear search is fine at this size.
    entries: VecDeque<(PathBuf, fs::File)>,
}

impl Default for OpenMessageCache {
    fn default() -> Self {
        OpenMessageCache::new(DEFAULT_MAX_OPEN)
    }
}

impl OpenMessageCache {
    pub fn new(max: usize) -> Self {
        assert!(max > 0);
        OpenMessageCache {
            max,
            entries: VecDeque::with_capacity(max),
        }
    }

    /// Open the file at `path`, reusing a cached descriptor if one exists.
    ///
    /// The returned handle is positioned at the start of the file. Opening
    /// past the bound silently closes the least recently used entry.
    pub fn open(&mut self, path: &Path) -> io::Result<fs::File> {
        if let Some(ix) = self.entries.iter().position(|(p, _)| p == path) {
            let entry = self.entries.remove(ix).unwrap();
            let mut handle = entry.1.try_clone()?;
            handle.seek(SeekFrom::Start(0))?;
            self.entries.push_back(entry);
            return Ok(handle);
        }

        let file = fs::File::open(path)?;
        let handle = file.try_clone()?;
        while self.entries.len() >= self.max {
            self.entries.pop_front();
        }
        self.entries.push_back((path.to_owned(), file));
        Ok(handle)
    }

    /// Drop any cached descriptor for `path`.
    ///
    /// Called when the underlying message is expunged so the descriptor does
    /// not pin the dead file's storage.
    pub fn forget(&mut self, path: &Path) {
        self.entries.retain(|(p, _)| p != path);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod test {
    use std::io::Read;

    use super::*;

    fn file_with(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn repeat_opens_rewind_and_return_full_content() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = file_with(dir.path(), "m", b"hello world");
        let mut cache = OpenMessageCache::new(2);

        for _ in 0..3 {
            let mut content = Vec::new();
            cache.open(&path).unwrap().read_to_end(&mut content).unwrap();
            assert_eq!(b"hello world".to_vec(), content);
        }
        assert_eq!(1, cache.len());
    }

    #[test]
    fn bound_is_enforced_lru_first() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = file_with(dir.path(), "a", b"a");
        let b = file_with(dir.path(), "b", b"b");
        let c = file_with(dir.path(), "c", b"c");

        let mut cache = OpenMessageCache::new(2);
        cache.open(&a).unwrap();
        cache.open(&b).unwrap();
        // Touch a so b becomes least recently used
        cache.open(&a).unwrap();
        cache.open(&c).unwrap();

        assert_eq!(2, cache.len());
        // The evicted entry was b; a survives even though the file is gone
        fs::remove_file(&a).unwrap();
        let mut content = Vec::new();
        cache.open(&a).unwrap().read_to_end(&mut content).unwrap();
        assert_eq!(b"a".to_vec(), content);
    }

    #[test]
    fn forget_drops_the_entry() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = file_with(dir.path(), "m", b"x");
        let mut cache = OpenMessageCache::default();

        cache.open(&path).unwrap();
        cache.forget(&path);
        assert!(cache.is_empty());
    }
}
