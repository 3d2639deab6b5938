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

//! The polymorphic seam between the engine and its physical storage.
//!
//! Everything above this crate talks to a mailbox through the `MailStore`
//! trait, so alternate physical layouts can be added without touching the
//! engine. `Maildir` is the one implementation provided here.
//!
//! Which storage families exist is decided once at process startup: the
//! `StoreRegistry` is built by the bootstrap code and immutable afterwards,
//! and gets passed explicitly to whatever resolves mailbox names. There is
//! no global registry.

use std::collections::HashMap;
use std::fs;
use std::io::{BufReader, Read};
use std::path::Path;

use chrono::prelude::*;

use crate::store::mailbox::Maildir;
use crate::store::model::*;
use crate::store::open_cache::OpenMessageCache;
use crate::support::error::Error;

/// The capability set a mailbox backend exposes to the protocol layer.
pub trait MailStore {
    /// Select the mailbox and produce the `SELECT`/`EXAMINE` responses.
    fn select(&mut self) -> Result<SelectResponse, Error>;
    /// Bring the view up to date. Returns whether anything changed.
    fn scan(&mut self, force: bool) -> Result<bool, Error>;
    /// Rescan and compute the pending updates to report.
    fn poll(&mut self, types: UpdateTypes) -> Result<PollResponse, Error>;
    /// Answer a `STATUS` request.
    fn status(
        &mut self,
        request: &StatusRequest,
    ) -> Result<StatusResponse, Error>;

    fn uid_validity(&self) -> u32;
    fn uid_next(&self) -> u32;
    fn max_uid(&self) -> Option<Uid>;
    fn max_seqnum(&self) -> Option<Seqnum>;

    /// The UIDs of the current snapshot, in order.
    fn uids(&self, include_pending_removed: bool) -> Vec<Uid>;
    fn uid_for_seqnum(&self, seqnum: Seqnum) -> Option<Uid>;
    fn seqnum_for_uid(&self, uid: Uid) -> Option<Seqnum>;

    fn set_flags(&mut self, uid: Uid, flags: Flags) -> Result<Flags, Error>;
    fn expunge(&mut self) -> Result<(), Error>;
    /// Stage and commit one message delivered by the protocol layer.
    fn append(
        &mut self,
        internal_date: DateTime<Utc>,
        flags: Flags,
        data: &mut dyn Read,
    ) -> Result<String, Error>;
    /// Open a message's bytes for reading, returning its canonical size.
    fn open_message(
        &mut self,
        uid: Uid,
        cache: &mut OpenMessageCache,
    ) -> Result<(u64, BufReader<fs::File>), Error>;

    fn close(&mut self);
}

#[cfg(test)]
impl std::fmt::Debug for dyn MailStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn MailStore")
    }
}

impl MailStore for Maildir {
    fn select(&mut self) -> Result<SelectResponse, Error> {
        Maildir::select(self)
    }

    fn scan(&mut self, force: bool) -> Result<bool, Error> {
        Maildir::scan(self, force)
    }

    fn poll(&mut self, types: UpdateTypes) -> Result<PollResponse, Error> {
        Maildir::poll(self, types)
    }

    fn status(
        &mut self,
        request: &StatusRequest,
    ) -> Result<StatusResponse, Error> {
        Maildir::status(self, request)
    }

    fn uid_validity(&self) -> u32 {
        Maildir::uid_validity(self)
    }

    fn uid_next(&self) -> u32 {
        Maildir::uid_next(self)
    }

    fn max_uid(&self) -> Option<Uid> {
        Maildir::max_uid(self)
    }

    fn max_seqnum(&self) -> Option<Seqnum> {
        Maildir::max_seqnum(self)
    }

    fn uids(&self, include_pending_removed: bool) -> Vec<Uid> {
        self.messages(include_pending_removed)
            .map(|m| m.uid)
            .collect()
    }

    fn uid_for_seqnum(&self, seqnum: Seqnum) -> Option<Uid> {
        Maildir::uid_for_seqnum(self, seqnum)
    }

    fn seqnum_for_uid(&self, uid: Uid) -> Option<Seqnum> {
        Maildir::seqnum_for_uid(self, uid)
    }

    fn set_flags(&mut self, uid: Uid, flags: Flags) -> Result<Flags, Error> {
        Maildir::set_flags(self, uid, flags)
    }

    fn expunge(&mut self) -> Result<(), Error> {
        Maildir::expunge(self)
    }

    fn append(
        &mut self,
        internal_date: DateTime<Utc>,
        flags: Flags,
        data: &mut dyn Read,
    ) -> Result<String, Error> {
        Maildir::append(self, internal_date, flags, data)
    }

    fn open_message(
        &mut self,
        uid: Uid,
        cache: &mut OpenMessageCache,
    ) -> Result<(u64, BufReader<fs::File>), Error> {
        Maildir::open_message(self, uid, Some(cache))
    }

    fn close(&mut self) {
        Maildir::close(self)
    }
}

/// Opens a mailbox of one storage family.
pub type StoreConstructor =
    fn(&Path, bool) -> Result<Box<dyn MailStore>, Error>;

/// The immutable table of storage families known to this process.
pub struct StoreRegistry {
    families: HashMap<&'static str, StoreConstructor>,
}

pub struct StoreRegistryBuilder {
    families: HashMap<&'static str, StoreConstructor>,
}

impl StoreRegistryBuilder {
    pub fn register(
        mut self,
        family: &'static str,
        constructor: StoreConstructor,
    ) -> Self {
        self.families.insert(family, constructor);
        self
    }

    pub fn build(self) -> StoreRegistry {
        StoreRegistry {
            families: self.families,
        }
    }
}

fn open_maildir(
    path: &Path,
    read_only: bool,
) -> Result<Box<dyn MailStore>, Error> {
    Ok(Box::new(Maildir::open(path, read_only)?))
}

impl StoreRegistry {
    pub fn builder() -> StoreRegistryBuilder {
        StoreRegistryBuilder {
            families: HashMap::new(),
        }
    }

    /// The standard registry, knowing only the `maildir` family.
    pub fn with_defaults() -> Self {
        Self::builder().register("maildir", open_maildir).build()
    }

    pub fn families(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.families.keys().copied()
    }

    /// Open the mailbox at `path` with the named storage family.
    pub fn open(
        &self,
        family: &str,
        path: &Path,
        read_only: bool,
    ) -> Result<Box<dyn MailStore>, Error> {
        let constructor =
            self.families.get(family).ok_or(Error::NxStoreFamily)?;
        constructor(path, read_only)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::mailbox::paths;

    fn maildir_at(root: &Path) -> std::path::PathBuf {
        let path = root.join("INBOX");
        fs::create_dir(&path).unwrap();
        for sub in &["cur", "new", "tmp"] {
            fs::create_dir(path.join(sub)).unwrap();
        }
        path
    }

    #[test]
    fn unknown_family_is_rejected() {
        let root = tempfile::TempDir::new().unwrap();
        let path = maildir_at(root.path());

        let registry = StoreRegistry::with_defaults();
        assert_matches!(
            Err(Error::NxStoreFamily),
            registry.open("mbox", &path, false)
        );
    }

    #[test]
    fn full_session_through_the_trait() {
        let root = tempfile::TempDir::new().unwrap();
        let path = maildir_at(root.path());

        let registry = StoreRegistry::with_defaults();
        assert!(registry.families().any(|f| "maildir" == f));

        let mut store = registry.open("maildir", &path, false).unwrap();
        let select = store.select().unwrap();
        assert_eq!(0, select.exists);

        store
            .append(Utc::now(), Flags::empty(), &mut &b"hi\r\n"[..])
            .unwrap();
        let response = store.poll(UpdateTypes::ALL).unwrap();
        assert_eq!(Some(1), response.exists);
        assert_eq!(vec![Uid::u(1)], store.uids(false));

        let mut cache = OpenMessageCache::default();
        let (size, _) = store.open_message(Uid::u(1), &mut cache).unwrap();
        assert_eq!(4, size);

        store.close();
        assert!(paths::exists(&path));
    }
}
