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

use std::collections::HashSet;
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::warn;

use crate::store::model::*;
use crate::store::open_cache::OpenMessageCache;
use crate::store::uid_index::UidIndex;
use crate::support::error::Error;

/// The lifecycle of a mailbox handle.
///
/// Transitions are strictly `Unopened → Selected → Closed`. Every operation
/// that needs a reconciled view checks for `Selected`; nothing can revive a
/// `Closed` handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Unopened,
    Selected,
    Closed,
}

impl Lifecycle {
    pub(super) fn select(&mut self) -> Result<(), Error> {
        match *self {
            Lifecycle::Unopened => {
                *self = Lifecycle::Selected;
                Ok(())
            }
            Lifecycle::Selected | Lifecycle::Closed => {
                Err(Error::MailboxUnselected)
            }
        }
    }

    pub(super) fn close(&mut self) {
        *self = Lifecycle::Closed;
    }

    pub fn is_selected(self) -> bool {
        Lifecycle::Selected == self
    }
}

/// One logical message inside a mailbox.
///
/// The unique name is immutable; the filename (its current name under
/// `cur/`) changes with every flag rename. `uid` is `None` only between
/// discovery and the UID assignment step of the same scan pass, or after a
/// UID validity reset.
#[derive(Clone, Debug)]
pub(super) struct MessageRecord {
    pub(super) unique_name: String,
    pub(super) uid: Option<Uid>,
    pub(super) filename: Option<String>,
    /// Size with canonicalised (CRLF) line endings.
    pub(super) size: u64,
    /// Arrival time, UNIX seconds.
    pub(super) internal_date: i64,
    pub(super) flags: Flags,
    /// Tentatively or definitely gone from disk; reported and evicted by
    /// the next poll that asks for expungements.
    pub(super) expunged: bool,
    /// Flags differ from what was last reported to the session.
    pub(super) flags_changed: bool,
    /// Not yet counted in an `exists` reported to the session.
    pub(super) just_arrived: bool,
    /// This record has been written to the durable cache. Unsaved records
    /// whose file vanishes are pruned silently; saved ones must be reported
    /// as expunged.
    pub(super) saved: bool,
}

/// Change-detection and dirtiness state for the scan engine.
#[derive(Clone, Debug, Default)]
pub(super) struct ScanState {
    pub(super) first_scan_done: bool,
    pub(super) last_cur_mtime: Option<SystemTime>,
    pub(super) last_new_mtime: Option<SystemTime>,
    pub(super) cache_dirty: bool,
    pub(super) uids_dirty: bool,
}

/// A handle on one Maildir mailbox.
pub struct Maildir {
    pub(super) log_prefix: String,
    pub(super) root: PathBuf,
    pub(super) read_only: bool,
    pub(super) lifecycle: Lifecycle,
    pub(super) scan: ScanState,
    pub(super) uid_validity: u32,
    pub(super) uid_next: u32,
    /// All known records, ordered by UID once assignment has run.
    pub(super) records: Vec<MessageRecord>,
    pub(super) index: UidIndex,
    /// Unique names this process published but has not yet seen a scan move
    /// out of `new/`. Exempt from the arrival admission timestamp check.
    pub(super) just_staged: HashSet<String>,
    /// Unique names this handle moved from `new/` to `cur/`; these get the
    /// `\Recent` pseudo-flag when their record is created.
    pub(super) fresh_from_new: HashSet<String>,
    pub(super) reported_exists: Option<u32>,
    pub(super) reported_recent: Option<u32>,
}

#[cfg(test)]
impl std::fmt::Debug for Maildir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Maildir")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

/// A read-only view of one message, produced from the reconciled snapshot.
///
/// Sequence numbers are positions within the snapshot, so records pending
/// removal continue to occupy a position until a poll reports their
/// expungement.
#[derive(Clone, Copy, Debug)]
pub struct MessageInfo<'a> {
    pub seqnum: Seqnum,
    pub uid: Uid,
    pub flags: Flags,
    pub size: u64,
    pub internal_date: i64,
    pub unique_name: &'a str,
    pub pending_removal: bool,
}

impl Maildir {
    /// Open a handle on the Maildir at `root`.
    ///
    /// This validates the physical structure but performs no scan; the
    /// handle must be `select()`ed before messages are visible.
    pub fn open(
        root: impl Into<PathBuf>,
        read_only: bool,
    ) -> Result<Self, Error> {
        let root = root.into();
        if !root.join("cur").is_dir() || !root.join("new").is_dir() {
            return Err(Error::MailboxCorrupt);
        }
        // tmp is expendable; recreate it if something removed it
        match fs::create_dir(root.join("tmp")) {
            Ok(()) => (),
            Err(e)
                if std::io::ErrorKind::AlreadyExists == e.kind() => (),
            Err(e) => return Err(e.into()),
        }

        let log_prefix = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| root.display().to_string());

        Ok(Maildir {
            log_prefix,
            root,
            read_only,
            lifecycle: Lifecycle::Unopened,
            scan: ScanState::default(),
            uid_validity: 0,
            uid_next: 1,
            records: Vec::new(),
            index: UidIndex::new(),
            just_staged: HashSet::new(),
            fresh_from_new: HashSet::new(),
            reported_exists: None,
            reported_recent: None,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub(super) fn cur_dir(&self) -> PathBuf {
        self.root.join("cur")
    }

    pub(super) fn new_dir(&self) -> PathBuf {
        self.root.join("new")
    }

    pub(super) fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn uid_validity(&self) -> u32 {
        self.uid_validity
    }

    pub fn uid_next(&self) -> u32 {
        self.uid_next
    }

    pub fn max_uid(&self) -> Option<Uid> {
        self.records.iter().filter_map(|r| r.uid).max()
    }

    pub fn max_seqnum(&self) -> Option<Seqnum> {
        match self.records.len() {
            0 => None,
            n => Some(Seqnum::from_index(n - 1)),
        }
    }

    pub(super) fn require_selected(&self) -> Result<(), Error> {
        if self.lifecycle.is_selected() {
            Ok(())
        } else {
            Err(Error::MailboxUnselected)
        }
    }

    pub(super) fn not_read_only(&self) -> Result<(), Error> {
        if self.read_only {
            Err(Error::MailboxReadOnly)
        } else {
            Ok(())
        }
    }

    /// Iterate the reconciled snapshot in UID order.
    pub fn messages(
        &self,
        include_pending_removed: bool,
    ) -> impl Iterator<Item = MessageInfo<'_>> + '_ {
        self.records
            .iter()
            .enumerate()
            .filter(move |(_, r)| include_pending_removed || !r.expunged)
            .filter_map(|(ix, r)| {
                r.uid.map(|uid| MessageInfo {
                    seqnum: Seqnum::from_index(ix),
                    uid,
                    flags: r.flags,
                    size: r.size,
                    internal_date: r.internal_date,
                    unique_name: &r.unique_name,
                    pending_removal: r.expunged,
                })
            })
    }

    pub fn message_by_uid(&self, uid: Uid) -> Option<MessageInfo<'_>> {
        self.messages(true).find(|m| uid == m.uid)
    }

    pub fn message_by_seqnum(
        &self,
        seqnum: Seqnum,
    ) -> Option<MessageInfo<'_>> {
        self.messages(true).find(|m| seqnum == m.seqnum)
    }

    pub fn uid_for_seqnum(&self, seqnum: Seqnum) -> Option<Uid> {
        self.message_by_seqnum(seqnum).map(|m| m.uid)
    }

    pub fn seqnum_for_uid(&self, uid: Uid) -> Option<Seqnum> {
        self.message_by_uid(uid).map(|m| m.seqnum)
    }

    pub(super) fn record_ix_by_uid(&self, uid: Uid) -> Option<usize> {
        self.records
            .iter()
            .position(|r| Some(uid) == r.uid && !r.expunged)
    }

    /// Open the stored bytes of a message for reading.
    ///
    /// Returns the canonical (CRLF) size together with a buffered reader
    /// over the on-disk (LF) bytes. When an `OpenMessageCache` is supplied,
    /// repeat opens of the same message reuse its descriptor.
    pub fn open_message(
        &self,
        uid: Uid,
        cache: Option<&mut OpenMessageCache>,
    ) -> Result<(u64, BufReader<fs::File>), Error> {
        self.require_selected()?;

        let record = self
            .records
            .iter()
            .find(|r| Some(uid) == r.uid && !r.expunged)
            .ok_or(Error::NxMessage)?;
        let filename = record.filename.as_ref().ok_or(Error::NxMessage)?;
        let path = self.cur_dir().join(filename);

        let file = match cache {
            Some(cache) => cache.open(&path),
            None => fs::File::open(&path),
        };
        match file {
            Ok(file) => Ok((record.size, BufReader::new(file))),
            Err(e) if std::io::ErrorKind::NotFound == e.kind() => {
                // Deleted under us; the next scan will turn this into an
                // expunge event.
                Err(Error::NxMessage)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Close the handle, flushing any state the last scan left dirty.
    pub fn close(&mut self) {
        if self.lifecycle.is_selected() && self.scan.cache_dirty {
            if let Err(e) = self.flush_under_lock() {
                warn!(
                    "{} Unable to flush cache on close: {}",
                    self.log_prefix, e
                );
            }
        }
        self.lifecycle.close();
    }
}

#[cfg(test)]
mod test {
    use super::super::test_prelude::*;
    use super::*;

    #[test]
    fn open_requires_maildir_structure() {
        let setup = set_up();
        assert!(Maildir::open(&setup.path, false).is_ok());

        std::fs::remove_dir(setup.path.join("cur")).unwrap();
        assert_matches!(
            Err(Error::MailboxCorrupt),
            Maildir::open(&setup.path, false)
        );
    }

    #[test]
    fn open_recreates_missing_tmp() {
        let setup = set_up();
        std::fs::remove_dir(setup.path.join("tmp")).unwrap();
        Maildir::open(&setup.path, false).unwrap();
        assert!(setup.path.join("tmp").is_dir());
    }

    #[test]
    fn lifecycle_is_one_way() {
        let setup = set_up();
        let mut mb = setup.mailbox();
        assert_eq!(Lifecycle::Unopened, mb.lifecycle());
        assert_matches!(Err(Error::MailboxUnselected), mb.scan(true));

        mb.select().unwrap();
        assert_eq!(Lifecycle::Selected, mb.lifecycle());
        assert_matches!(Err(Error::MailboxUnselected), mb.select());

        mb.close();
        assert_eq!(Lifecycle::Closed, mb.lifecycle());
        assert_matches!(Err(Error::MailboxUnselected), mb.scan(true));
    }

    #[test]
    fn open_message_returns_size_and_bytes() {
        use std::io::Read;

        let setup = set_up();
        setup.deliver("m.host", b"Subject: x\n\nbody\n", 2);
        let mb = setup.selected();

        let uid = mb.messages(false).next().unwrap().uid;
        let (size, mut reader) = mb.open_message(uid, None).unwrap();
        let mut content = String::new();
        reader.read_to_string(&mut content).unwrap();
        assert_eq!("Subject: x\n\nbody\n", content);
        // Three LFs, each standing for a CRLF in canonical form
        assert_eq!(content.len() as u64 + 3, size);
    }

    #[test]
    fn open_message_unknown_uid_is_nx() {
        let setup = set_up();
        let mb = setup.selected();
        assert_matches!(
            Err(Error::NxMessage),
            mb.open_message(Uid::u(42), None)
        );
    }
}
