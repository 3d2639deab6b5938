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

//! The scan/reconcile engine.
//!
//! One scan pass brings the in-memory view up to date with the filesystem:
//!
//! 1. Compare the `cur`/`new` directory mtimes against the last observed
//!    values and return immediately if nothing can have changed. This is
//!    what makes high-frequency idle polling affordable.
//! 2. Take the scan lock.
//! 3. Reload the UID cache, which is authoritative for UID assignments.
//!    Rows for unique names never seen by this handle become carried-over
//!    records. On the first scan only, rows whose UIDs are not strictly
//!    increasing betray a broken accessor; the epoch is then reset and the
//!    caller retries once. Later scans trust the cache this handle itself
//!    maintains; revalidating every pass would turn a transient reorder by
//!    an external accessor into a storm of validity bumps.
//! 4. Move completed deliveries from `new/` into `cur/`. A file is complete
//!    if its mtime is strictly in the past (the delivery agent may still be
//!    writing within the current second) or if this process staged it.
//! 5. Mark every record tentatively expunged, then walk `cur/` clearing the
//!    mark for each file found, reconciling filename-derived flags and
//!    re-indexing files renamed by other accessors. Whatever is still
//!    marked afterwards is genuinely gone.
//! 6. Prune marked records never written to the cache; keep the rest for
//!    expunge reporting. Assign UIDs to new arrivals in delivery order.
//! 7. Flush the cache and validity sidecar if dirty, release the lock.

use std::collections::HashMap;
use std::convert::TryFrom;
use std::fs;
use std::io::{self, BufRead};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::SystemTime;

use chrono::prelude::*;
use log::{error, warn};

use super::defs::{Maildir, MessageRecord};
use crate::store::cache::{self, CacheRow, CacheState, CACHE_VERSION};
use crate::store::filename;
use crate::store::lock::ScanLock;
use crate::store::model::*;
use crate::support::error::Error;
use crate::support::file_ops::IgnoreKinds;

impl Maildir {
    /// Select the mailbox: run the initial scan and produce the untagged
    /// responses for `SELECT`/`EXAMINE`.
    pub fn select(&mut self) -> Result<SelectResponse, Error> {
        self.lifecycle.select()?;

        match self.scan(true) {
            Ok(_) => (),
            // The epoch was reset; a second scan rebuilds from scratch
            Err(Error::UidsReordered) => {
                self.scan(true)?;
            }
            Err(e) => return Err(e),
        }

        // Rows whose file disappeared before this session ever saw them
        // need no expunge report; just drop them from the cache.
        let before = self.records.len();
        let index = &mut self.index;
        self.records.retain(|r| {
            if r.expunged {
                index.remove(&r.unique_name);
                false
            } else {
                true
            }
        });
        if before != self.records.len() {
            self.scan.cache_dirty = true;
            self.flush_under_lock()?;
        }

        let mut exists = 0u32;
        let mut recent = 0u32;
        let mut unseen = None;
        for (ix, r) in self.records.iter_mut().enumerate() {
            exists += 1;
            if r.flags.contains(Flags::RECENT) {
                recent += 1;
            }
            if unseen.is_none() && !r.flags.contains(Flags::SEEN) {
                unseen = Some(Seqnum::from_index(ix));
            }
            r.just_arrived = false;
            r.flags_changed = false;
        }

        self.reported_exists = Some(exists);
        self.reported_recent = Some(recent);

        Ok(SelectResponse {
            exists,
            recent,
            unseen,
            uidnext: self.uid_next,
            uidvalidity: self.uid_validity,
            read_only: self.read_only,
        })
    }

    /// Run one scan pass.
    ///
    /// Returns whether anything about the view changed. With `force` false,
    /// the pass is skipped entirely when the directory mtimes match the
    /// last observed values.
    pub fn scan(&mut self, force: bool) -> Result<bool, Error> {
        self.require_selected()?;

        if !force
            && self.scan.first_scan_done
            && Some(dir_mtime(&self.cur_dir())?) == self.scan.last_cur_mtime
            && Some(dir_mtime(&self.new_dir())?) == self.scan.last_new_mtime
        {
            return Ok(false);
        }

        let _lock = ScanLock::acquire(&self.log_prefix, &self.root)?;

        let mut changed = self.load_cache_state()?;
        changed |= self.reconcile_new()?;

        let expunged_before =
            self.records.iter().filter(|r| r.expunged).count();
        for r in &mut self.records {
            // Tentative; the cur walk clears the mark for every file still
            // present.
            r.expunged = true;
        }
        changed |= self.walk_cur()?;
        changed |= self.prune_missing();
        changed |= expunged_before
            != self.records.iter().filter(|r| r.expunged).count();
        changed |= self.assign_uids()?;

        self.flush_dirty()?;

        // Stamps are taken after our own renames so they reflect the state
        // this pass left behind.
        self.scan.last_cur_mtime = Some(dir_mtime(&self.cur_dir())?);
        self.scan.last_new_mtime = Some(dir_mtime(&self.new_dir())?);
        self.scan.first_scan_done = true;

        Ok(changed)
    }

    /// Reload the UID cache and merge it into the in-memory view.
    fn load_cache_state(&mut self) -> Result<bool, Error> {
        self.index.clear_uids();
        for r in &mut self.records {
            r.uid = None;
        }

        let cache = match cache::load_cache(&self.log_prefix, &self.root)? {
            CacheState::Loaded(cache) => cache,
            CacheState::Missing => {
                self.reset_validity()?;
                return Ok(true);
            }
        };

        let first_scan = !self.scan.first_scan_done;
        let mut changed = false;

        let mut by_name: HashMap<String, usize> =
            HashMap::with_capacity(self.records.len());
        for (ix, r) in self.records.iter().enumerate() {
            by_name.insert(r.unique_name.clone(), ix);
        }

        self.uid_validity = cache.uidvalidity;

        let mut last_uid = 0u32;
        for row in &cache.messages {
            if first_scan && row.uid <= last_uid {
                return self.handle_reordered_uids();
            }
            last_uid = last_uid.max(row.uid);

            let uid = match Uid::of(row.uid) {
                Some(uid) => uid,
                // load_cache rejects zero rows; don't crash if it didn't
                None => continue,
            };

            match by_name.get(row.unique_name.as_str()) {
                Some(&ix) => {
                    let r = &mut self.records[ix];
                    r.uid = Some(uid);
                    r.saved = true;
                }
                None => {
                    self.records.push(MessageRecord {
                        unique_name: row.unique_name.clone(),
                        uid: Some(uid),
                        filename: None,
                        size: row.size,
                        internal_date: row.internal_date,
                        flags: Flags::empty(),
                        expunged: false,
                        flags_changed: false,
                        just_arrived: true,
                        saved: true,
                    });
                    changed = true;
                }
            }
            self.index.insert(&row.unique_name, Some(uid), None);
        }

        self.uid_next = cache.uidnext.max(last_uid.saturating_add(1)).max(1);
        Ok(changed)
    }

    /// The cache claims UIDs out of delivery order, which means some
    /// accessor corrupted it. Drop the cache, mint a fresh epoch, and make
    /// the caller rebuild from scratch.
    fn handle_reordered_uids(&mut self) -> Result<bool, Error> {
        error!(
            "{} UID cache rows out of order; resetting UID validity",
            self.log_prefix
        );

        fs::remove_file(cache::cache_path(&self.root)).ignore_not_found()?;
        self.reset_validity()?;
        // Persist the bump immediately so it survives even if the caller
        // gives up instead of retrying
        cache::store_validity(&self.root, self.uid_validity)?;
        self.scan.uids_dirty = false;

        Err(Error::UidsReordered)
    }

    /// Mint a fresh UID validity and forget all UID assignments.
    fn reset_validity(&mut self) -> Result<(), Error> {
        let old = cache::load_validity(&self.log_prefix, &self.root)?
            .unwrap_or(self.uid_validity);
        let now = match u32::try_from(Utc::now().timestamp()) {
            Ok(now) => now,
            Err(_) => u32::MAX,
        };
        self.uid_validity = now.max(old.saturating_add(1)).max(1);
        self.uid_next = 1;

        for r in &mut self.records {
            r.uid = None;
            r.saved = false;
        }
        self.index.clear_uids();

        self.scan.cache_dirty = true;
        self.scan.uids_dirty = true;
        Ok(())
    }

    /// Move completed deliveries from `new/` into `cur/`.
    fn reconcile_new(&mut self) -> Result<bool, Error> {
        let now = Utc::now().timestamp();
        let new_dir = self.new_dir();
        let cur_dir = self.cur_dir();
        let mut changed = false;

        for entry in fs::read_dir(&new_dir)? {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if name.starts_with('.') {
                continue;
            }

            let unique = filename::unique_name(&name).to_owned();

            let complete = self.just_staged.contains(&unique)
                || match entry.metadata() {
                    Ok(md) => md.mtime() < now,
                    Err(e) if io::ErrorKind::NotFound == e.kind() => {
                        continue
                    }
                    Err(e) => {
                        warn!(
                            "{} Unable to stat new/{}: {}",
                            self.log_prefix, name, e
                        );
                        continue;
                    }
                };
            if !complete {
                continue;
            }

            // A crash between the commit protocol's two renames can leave a
            // bare unique name here; it enters cur with empty flags.
            let (_, flags) = filename::parse(&name);
            let target = filename::format(&unique, flags);

            match fs::rename(new_dir.join(&name), cur_dir.join(&target)) {
                Ok(()) => {
                    self.just_staged.remove(&unique);
                    self.fresh_from_new.insert(unique);
                    changed = true;
                }
                // Another scanner moved it first
                Err(e) if io::ErrorKind::NotFound == e.kind() => (),
                Err(e) => {
                    warn!(
                        "{} Unable to move new/{} into cur: {}",
                        self.log_prefix, name, e
                    );
                }
            }
        }

        Ok(changed)
    }

    /// Walk `cur/`, clearing tentative expunge marks and reconciling
    /// filenames and flags.
    ///
    /// A file vanishing between listing and stat is a benign race with
    /// another accessor; it triggers one full re-listing before the entry
    /// is given up on.
    fn walk_cur(&mut self) -> Result<bool, Error> {
        let cur_dir = self.cur_dir();
        let mut changed = false;

        'attempt: for attempt in 0..2 {
            self.index.clear_filenames();
            for r in &mut self.records {
                r.filename = None;
            }

            let mut by_name: HashMap<String, usize> =
                HashMap::with_capacity(self.records.len());
            for (ix, r) in self.records.iter().enumerate() {
                by_name.insert(r.unique_name.clone(), ix);
            }

            for entry in fs::read_dir(&cur_dir)? {
                let entry = entry?;
                let name = match entry.file_name().into_string() {
                    Ok(name) => name,
                    Err(_) => continue,
                };
                if name.starts_with('.') {
                    continue;
                }

                let (unique, disk_flags) = filename::parse(&name);

                if let Some(&ix) = by_name.get(unique) {
                    let r = &mut self.records[ix];
                    r.expunged = false;
                    r.filename = Some(name.clone());
                    if r.flags.persistent() != disk_flags {
                        if !r.just_arrived {
                            r.flags_changed = true;
                        }
                        r.flags = disk_flags | (r.flags & Flags::RECENT);
                        changed = true;
                    }
                    let uid = r.uid;
                    self.index.insert(unique, uid, Some(name.clone()));
                    continue;
                }

                // Never seen before; derive metadata from the file
                let (size, internal_date) = match message_metadata(
                    &cur_dir.join(&name),
                    &entry,
                ) {
                    Ok(meta) => meta,
                    Err(e) if io::ErrorKind::NotFound == e.kind() => {
                        if 0 == attempt {
                            continue 'attempt;
                        }
                        continue;
                    }
                    Err(e) => {
                        warn!(
                            "{} Unable to read cur/{}: {}",
                            self.log_prefix, name, e
                        );
                        continue;
                    }
                };

                let mut flags = disk_flags;
                if self.fresh_from_new.contains(unique) {
                    flags |= Flags::RECENT;
                }

                let ix = self.records.len();
                self.records.push(MessageRecord {
                    unique_name: unique.to_owned(),
                    uid: None,
                    filename: Some(name.clone()),
                    size,
                    internal_date,
                    flags,
                    expunged: false,
                    flags_changed: false,
                    just_arrived: true,
                    saved: false,
                });
                by_name.insert(unique.to_owned(), ix);
                self.index.insert(unique, None, Some(name.clone()));
                changed = true;
            }

            break;
        }

        Ok(changed)
    }

    /// Drop records whose file is gone and which were never durably cached.
    ///
    /// Everything else still marked expunged stays in the snapshot until a
    /// poll reports it.
    fn prune_missing(&mut self) -> bool {
        let before = self.records.len();
        let index = &mut self.index;
        self.records.retain(|r| {
            if r.expunged && !r.saved {
                index.remove(&r.unique_name);
                false
            } else {
                true
            }
        });
        before != self.records.len()
    }

    /// Assign UIDs to records that have none, strictly in delivery order.
    fn assign_uids(&mut self) -> Result<bool, Error> {
        let mut pending: Vec<usize> = (0..self.records.len())
            .filter(|&ix| {
                self.records[ix].uid.is_none() && !self.records[ix].expunged
            })
            .collect();

        let assigned = !pending.is_empty();
        if assigned {
            pending.sort_by(|&a, &b| {
                let ra = &self.records[a];
                let rb = &self.records[b];
                ra.internal_date
                    .cmp(&rb.internal_date)
                    .then_with(|| ra.unique_name.cmp(&rb.unique_name))
            });

            for ix in pending {
                let uid =
                    Uid::of(self.uid_next).ok_or(Error::MailboxFull)?;
                self.uid_next = self
                    .uid_next
                    .checked_add(1)
                    .ok_or(Error::MailboxFull)?;
                self.records[ix].uid = Some(uid);
                let unique = self.records[ix].unique_name.clone();
                self.index.insert(&unique, Some(uid), None);
            }

            self.scan.cache_dirty = true;
        }

        self.records
            .sort_by_key(|r| r.uid.map(u32::from).unwrap_or(u32::MAX));
        Ok(assigned)
    }

    /// Write out whatever durable state the pass left dirty.
    pub(super) fn flush_dirty(&mut self) -> Result<(), Error> {
        if self.scan.uids_dirty {
            cache::store_validity(&self.root, self.uid_validity)?;
            self.scan.uids_dirty = false;
        }

        if self.scan.cache_dirty {
            let mut rows: Vec<CacheRow> = self
                .records
                .iter()
                .filter_map(|r| {
                    r.uid.map(|uid| CacheRow {
                        unique_name: r.unique_name.clone(),
                        uid: uid.into(),
                        size: r.size,
                        internal_date: r.internal_date,
                    })
                })
                .collect();
            rows.sort_by_key(|r| r.uid);

            cache::store_cache(
                &self.root,
                &cache::CacheFile {
                    version: CACHE_VERSION.to_owned(),
                    uidvalidity: self.uid_validity,
                    uidnext: self.uid_next,
                    messages: rows,
                },
            )?;
            self.scan.cache_dirty = false;
            for r in &mut self.records {
                if r.uid.is_some() {
                    r.saved = true;
                }
            }
        }

        Ok(())
    }

    /// Flush dirty state under a freshly taken scan lock, for callers
    /// outside a scan pass.
    pub(super) fn flush_under_lock(&mut self) -> Result<(), Error> {
        if !self.scan.cache_dirty && !self.scan.uids_dirty {
            return Ok(());
        }
        let _lock = ScanLock::acquire(&self.log_prefix, &self.root)?;
        self.flush_dirty()
    }
}

fn dir_mtime(path: &Path) -> Result<SystemTime, Error> {
    match fs::metadata(path) {
        Ok(md) => Ok(md.modified()?),
        Err(e) if io::ErrorKind::NotFound == e.kind() => {
            Err(Error::MailboxCorrupt)
        }
        Err(e) => Err(e.into()),
    }
}

/// Canonical (CRLF) size plus arrival time of a message file.
fn message_metadata(
    path: &Path,
    entry: &fs::DirEntry,
) -> io::Result<(u64, i64)> {
    let internal_date = entry.metadata()?.mtime();

    let file = fs::File::open(path)?;
    let mut reader = io::BufReader::new(file);
    let mut size = 0u64;
    loop {
        let n = {
            let buf = reader.fill_buf()?;
            if buf.is_empty() {
                break;
            }
            // Each stored LF stands for a CRLF in canonical form
            size += buf.len() as u64
                + memchr::memchr_iter(b'\n', buf).count() as u64;
            buf.len()
        };
        reader.consume(n);
    }

    Ok((size, internal_date))
}

#[cfg(test)]
mod test {
    use std::fs;

    use super::super::test_prelude::*;
    use crate::store::cache::{self, CacheState};

    #[test]
    fn past_delivery_is_admitted_with_uid_and_recent() {
        let setup = set_up();
        setup.deliver("1000.one.host", b"hello\n", 2);

        let mut mb = setup.mailbox();
        let select = mb.select().unwrap();

        assert_eq!(1, select.exists);
        assert_eq!(1, select.recent);
        assert_eq!(2, select.uidnext);
        assert!(select.uidvalidity > 0);

        let msg = mb.messages(false).next().unwrap();
        assert_eq!(Uid::u(1), msg.uid);
        assert_eq!("1000.one.host", msg.unique_name);
        assert!(msg.flags.contains(Flags::RECENT));

        assert!(setup.path.join("cur/1000.one.host:2,").is_file());
        assert!(!setup.path.join("new/1000.one.host").exists());
    }

    #[test]
    fn in_progress_delivery_is_left_alone() {
        let setup = set_up();
        let path = setup.deliver("1000.one.host", b"partial", 0);
        // Push the mtime into the future so "now" can never pass it during
        // the test
        set_mtime(&path, chrono::Utc::now().timestamp() + 30);

        let mut mb = setup.mailbox();
        let select = mb.select().unwrap();

        assert_eq!(0, select.exists);
        assert!(path.is_file());
        assert_eq!(0, mb.messages(true).count());
    }

    #[test]
    fn idle_rescan_is_a_no_op_without_writes() {
        let setup = set_up();
        setup.deliver("1000.one.host", b"hello\n", 2);
        let mut mb = setup.selected();

        let cache_mtime = || {
            fs::metadata(cache::cache_path(&setup.path))
                .unwrap()
                .modified()
                .unwrap()
        };
        let before = cache_mtime();

        assert_eq!(false, mb.scan(false).unwrap());
        assert_eq!(false, mb.scan(false).unwrap());
        assert_eq!(before, cache_mtime());
    }

    #[test]
    fn uids_are_stable_across_handles() {
        let setup = set_up();
        setup.deliver("1000.one.host", b"a\n", 3);
        setup.deliver("1001.two.host", b"b\n", 2);

        let mb1 = setup.selected();
        let uids1: Vec<(Uid, String)> = mb1
            .messages(false)
            .map(|m| (m.uid, m.unique_name.to_owned()))
            .collect();
        assert_eq!(2, uids1.len());

        // A second handle (as another process would have) sees the same
        // assignment via the cache
        let mb2 = setup.selected();
        let uids2: Vec<(Uid, String)> = mb2
            .messages(false)
            .map(|m| (m.uid, m.unique_name.to_owned()))
            .collect();
        assert_eq!(uids1, uids2);

        // Carried-over messages are not recent to the second session
        assert!(mb2.messages(false).all(|m| !m.flags.contains(Flags::RECENT)));
    }

    #[test]
    fn uids_assigned_in_delivery_order() {
        let setup = set_up();
        setup.deliver("1001.newer.host", b"b\n", 2);
        setup.deliver("1000.older.host", b"a\n", 10);

        let mb = setup.selected();
        assert_eq!(
            Some("1000.older.host"),
            mb.message_by_uid(Uid::u(1)).map(|m| m.unique_name)
        );
        assert_eq!(
            Some("1001.newer.host"),
            mb.message_by_uid(Uid::u(2)).map(|m| m.unique_name)
        );
    }

    #[test]
    fn corrupt_cache_version_bumps_validity_but_keeps_messages() {
        let setup = set_up();
        setup.deliver("1000.one.host", b"a\n", 3);

        let mut mb1 = setup.mailbox();
        let select1 = mb1.select().unwrap();
        mb1.set_flags(Uid::u(1), Flags::SEEN).unwrap();
        mb1.close();

        // Clobber the version tag
        let path = cache::cache_path(&setup.path);
        let text = fs::read_to_string(&path)
            .unwrap()
            .replace("maildirbox-cache/1", "maildirbox-cache/0");
        fs::write(&path, text).unwrap();

        let mut mb2 = setup.mailbox();
        let select2 = mb2.select().unwrap();

        assert_ne!(select1.uidvalidity, select2.uidvalidity);
        let msg = mb2.messages(false).next().unwrap();
        assert_eq!("1000.one.host", msg.unique_name);
        assert!(msg.flags.contains(Flags::SEEN));
        assert_eq!(Uid::u(1), msg.uid);
    }

    #[test]
    fn reordered_cache_rows_reset_the_epoch() {
        let setup = set_up();
        setup.deliver("1000.older.host", b"a\n", 10);
        setup.deliver("1001.newer.host", b"b\n", 2);

        let mut mb1 = setup.mailbox();
        let select1 = mb1.select().unwrap();
        mb1.close();

        // Swap the UIDs in the cache, as a broken accessor might
        let loaded = match cache::load_cache("test", &setup.path).unwrap() {
            CacheState::Loaded(c) => c,
            CacheState::Missing => panic!("cache missing"),
        };
        let mut corrupt = loaded.clone();
        corrupt.messages[0].uid = loaded.messages[1].uid;
        corrupt.messages[1].uid = loaded.messages[0].uid;
        cache::store_cache(&setup.path, &corrupt).unwrap();

        // select() retries internally after the UidsReordered reset
        let mut mb2 = setup.mailbox();
        let select2 = mb2.select().unwrap();

        assert_ne!(select1.uidvalidity, select2.uidvalidity);
        assert_eq!(2, select2.exists);
        assert_eq!(
            Some("1000.older.host"),
            mb2.message_by_uid(Uid::u(1)).map(|m| m.unique_name)
        );
        assert_eq!(
            Some("1001.newer.host"),
            mb2.message_by_uid(Uid::u(2)).map(|m| m.unique_name)
        );
    }

    #[test]
    fn external_deletion_is_kept_for_reporting() {
        let setup = set_up();
        setup.deliver("1000.one.host", b"a\n", 3);
        setup.deliver("1001.two.host", b"b\n", 2);
        let mut mb = setup.selected();

        fs::remove_file(setup.path.join("cur/1000.one.host:2,")).unwrap();
        assert_eq!(true, mb.scan(true).unwrap());

        assert_eq!(1, mb.messages(false).count());
        assert_eq!(2, mb.messages(true).count());
        assert!(mb
            .message_by_uid(Uid::u(1))
            .map(|m| m.pending_removal)
            .unwrap());
    }

    #[test]
    fn external_flag_rename_is_reconciled() {
        let setup = set_up();
        setup.deliver("1000.one.host", b"a\n", 3);
        let mut mb = setup.selected();

        fs::rename(
            setup.path.join("cur/1000.one.host:2,"),
            setup.path.join("cur/1000.one.host:2,FS"),
        )
        .unwrap();
        assert_eq!(true, mb.scan(true).unwrap());

        let msg = mb.messages(false).next().unwrap();
        assert!(msg.flags.contains(Flags::FLAGGED | Flags::SEEN));
    }

    #[test]
    fn half_committed_delivery_is_recovered() {
        let setup = set_up();
        // A bare unique name in new/, as left by a crash between the
        // publish link and the flag rename
        setup.deliver("1000.half.host", b"a\n", 2);

        let mb = setup.selected();
        let msg = mb.messages(false).next().unwrap();
        assert_eq!("1000.half.host", msg.unique_name);
        assert_eq!(Uid::u(1), msg.uid);
        assert!(setup.path.join("cur/1000.half.host:2,").is_file());
    }
}
