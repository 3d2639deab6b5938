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

//! Message staging and the commit protocol.
//!
//! New message bytes are streamed into an anonymous file under `tmp/`,
//! canonicalising CRLF line endings to the LF form stored on disk while
//! counting the canonical (CRLF) size. Nothing under `new/` or `cur/` is
//! ever partially written.
//!
//! Commit publishes each staged file with two renames: a `link()` into
//! `new/` under a freshly minted unique name, then a rename appending the
//! `:2,<flags>` suffix so the message lands with its final flags. A crash
//! between the two leaves a bare unique name in `new/`, which a later scan
//! admits normally. If any message in a batch fails to publish, every
//! already-published sibling is unlinked again; there is no partial-success
//! state.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use chrono::prelude::*;
use log::{error, warn};
use tempfile::NamedTempFile;

use crate::store::filename;
use crate::store::model::*;
use crate::support::error::Error;
use crate::support::file_ops::ErrorTransforms;

use super::defs::Maildir;

const MAX_NAME_ATTEMPTS: u32 = 1000;

/// A message being staged for delivery.
///
/// Bytes written here land in the mailbox's `tmp/` under a private name.
/// Dropping the value without committing removes the staged file.
pub struct StagedMessage {
    file: NamedTempFile,
    canonical_size: u64,
    pending_cr: bool,
    flags: Flags,
    internal_date: i64,
}

impl StagedMessage {
    /// The canonical (CRLF) size of everything written so far.
    pub fn canonical_size(&self) -> u64 {
        self.canonical_size
            + if self.pending_cr { 1 } else { 0 }
    }

    /// Settle any dangling CR and sync the staged bytes to disk.
    fn finish(&mut self) -> io::Result<()> {
        if self.pending_cr {
            self.file.write_all(b"\r")?;
            self.canonical_size += 1;
            self.pending_cr = false;
        }
        self.file.flush()?;
        self.file.as_file_mut().sync_all()
    }
}

impl Write for StagedMessage {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        if src.is_empty() {
            return Ok(0);
        }

        let mut out = Vec::with_capacity(src.len() + 1);
        let mut ix = 0usize;

        if self.pending_cr {
            if b'\n' == src[0] {
                out.push(b'\n');
                ix = 1;
            } else {
                out.push(b'\r');
            }
            self.pending_cr = false;
        }

        while let Some(off) = memchr::memchr(b'\r', &src[ix..]) {
            let cr = ix + off;
            out.extend_from_slice(&src[ix..cr]);
            if cr + 1 < src.len() {
                if b'\n' == src[cr + 1] {
                    out.push(b'\n');
                    ix = cr + 2;
                } else {
                    // Lone CR, kept literally
                    out.push(b'\r');
                    ix = cr + 1;
                }
            } else {
                // Can't tell yet whether a LF follows
                self.pending_cr = true;
                ix = src.len();
            }
        }
        out.extend_from_slice(&src[ix..]);

        self.file.write_all(&out)?;
        // Each stored LF stands for a CRLF in canonical form
        self.canonical_size += out.len() as u64
            + memchr::memchr_iter(b'\n', &out).count() as u64;

        Ok(src.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Maildir {
    /// Begin staging a message for delivery into this mailbox.
    pub fn stage_message(
        &mut self,
        internal_date: DateTime<Utc>,
        flags: Flags,
    ) -> Result<StagedMessage, Error> {
        self.not_read_only()?;

        Ok(StagedMessage {
            file: NamedTempFile::new_in(self.tmp_dir())?,
            canonical_size: 0,
            pending_cr: false,
            flags: flags.persistent(),
            internal_date: internal_date.timestamp(),
        })
    }

    /// Publish a batch of staged messages, atomically per message and
    /// all-or-nothing for the batch.
    ///
    /// On success, returns the unique names assigned to the messages, in
    /// batch order; UIDs follow at the next scan. On failure, every
    /// already-published message of this batch is removed again and every
    /// staged file is dropped.
    pub fn commit_batch(
        &mut self,
        batch: Vec<StagedMessage>,
    ) -> Result<Vec<String>, Error> {
        self.not_read_only()?;

        let mut staged = Vec::with_capacity(batch.len());
        for mut message in batch {
            match message.finish() {
                Ok(()) => staged.push(message),
                Err(e) => {
                    error!(
                        "{} Unable to complete staged message: {}",
                        self.log_prefix, e
                    );
                    return Err(Error::BatchAborted);
                }
            }
        }

        let mut published: Vec<(PathBuf, String)> =
            Vec::with_capacity(staged.len());
        for message in &staged {
            match self.publish_from_path(
                message.file.path(),
                message.flags,
                message.internal_date,
            ) {
                Ok(entry) => published.push(entry),
                Err(e) => {
                    for (path, _) in &published {
                        if let Err(e) = fs::remove_file(path) {
                            warn!(
                                "{} Rollback failed to remove {}: {}",
                                self.log_prefix,
                                path.display(),
                                e
                            );
                        }
                    }
                    error!(
                        "{} Delivery batch rolled back ({} message(s)): {}",
                        self.log_prefix,
                        staged.len(),
                        e
                    );
                    return Err(match e {
                        Error::GaveUpInsertion => Error::GaveUpInsertion,
                        _ => Error::BatchAborted,
                    });
                }
            }
        }

        let mut uniques = Vec::with_capacity(published.len());
        for (_, unique) in published {
            self.just_staged.insert(unique.clone());
            uniques.push(unique);
        }
        Ok(uniques)
    }

    /// Drop a batch of staged messages without publishing anything.
    ///
    /// Idempotent in effect; the staged files are simply removed.
    pub fn rollback_batch(&mut self, batch: Vec<StagedMessage>) {
        drop(batch);
    }

    /// Stage and commit a single message from a byte stream.
    pub fn append(
        &mut self,
        internal_date: DateTime<Utc>,
        flags: Flags,
        data: &mut dyn Read,
    ) -> Result<String, Error> {
        let mut staged = self.stage_message(internal_date, flags)?;
        io::copy(data, &mut staged)?;
        self.commit_batch(vec![staged])?
            .pop()
            .ok_or(Error::BatchAborted)
    }

    /// Copy the message with the given UID into `dst`.
    ///
    /// When both mailboxes live on the same device the bytes are shared via
    /// a hard link; otherwise they are streamed through `dst`'s staging
    /// area. Either way the destination sees a normal new delivery.
    pub fn copy_to(
        &mut self,
        dst: &mut Maildir,
        uid: Uid,
    ) -> Result<String, Error> {
        self.require_selected()?;
        dst.not_read_only()?;

        let (src_path, flags, internal_date) = {
            let record = self
                .records
                .iter()
                .find(|r| Some(uid) == r.uid && !r.expunged)
                .ok_or(Error::NxMessage)?;
            let name = record.filename.as_ref().ok_or(Error::NxMessage)?;
            (
                self.cur_dir().join(name),
                record.flags.persistent(),
                record.internal_date,
            )
        };

        let src_md =
            fs::metadata(&src_path).on_not_found(Error::NxMessage)?;
        let same_device = {
            use std::os::unix::fs::MetadataExt;
            src_md.dev() == fs::metadata(dst.tmp_dir())?.dev()
        };

        let unique = if same_device {
            let (_, unique) =
                dst.publish_from_path(&src_path, flags, internal_date)?;
            unique
        } else {
            let mut staged = dst.stage_message(
                Utc.timestamp(internal_date, 0),
                flags,
            )?;
            let mut src = fs::File::open(&src_path)
                .on_not_found(Error::NxMessage)?;
            io::copy(&mut src, &mut staged)?;
            dst.commit_batch(vec![staged])?
                .pop()
                .ok_or(Error::BatchAborted)?
        };

        dst.just_staged.insert(unique.clone());
        Ok(unique)
    }

    /// Publish the file at `source` into this mailbox's `new/` under a
    /// fresh unique name, then immediately rename it to carry its flags.
    fn publish_from_path(
        &self,
        source: &Path,
        flags: Flags,
        internal_date: i64,
    ) -> Result<(PathBuf, String), Error> {
        let new_dir = self.new_dir();

        for _ in 0..MAX_NAME_ATTEMPTS {
            let unique = filename::generate_unique();
            let bare = new_dir.join(&unique);

            match fs::hard_link(source, &bare) {
                Ok(()) => (),
                Err(e) if io::ErrorKind::AlreadyExists == e.kind() => {
                    continue
                }
                Err(e) => return Err(e.into()),
            }

            let named = new_dir.join(filename::format(&unique, flags));
            if let Err(e) = fs::rename(&bare, &named) {
                let _ = fs::remove_file(&bare);
                return Err(e.into());
            }

            // Maildir conventionally carries the arrival time as the file
            // mtime; failure here only skews INTERNALDATE
            let t = nix::sys::time::TimeVal::new(
                internal_date as nix::sys::time::time_t,
                0,
            );
            if let Err(e) = nix::sys::stat::utimes(&named, &t, &t) {
                warn!(
                    "{} Unable to set delivery time on {}: {}",
                    self.log_prefix,
                    named.display(),
                    e
                );
            }

            return Ok((named, unique));
        }

        Err(Error::GaveUpInsertion)
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io::Read;

    use chrono::prelude::*;

    use super::super::test_prelude::*;

    #[test]
    fn append_assigns_next_uid_and_recent() {
        let setup = set_up();
        setup.deliver("1000.one.host", b"a\n", 3);
        let mut mb = setup.selected();

        mb.append(
            Utc::now(),
            Flags::empty(),
            &mut &b"Subject: x\r\n\r\nbody\r\n"[..],
        )
        .unwrap();

        let response = mb.poll(UpdateTypes::ALL).unwrap();
        assert_eq!(Some(2), response.exists);

        let msg = mb.message_by_uid(Uid::u(2)).unwrap();
        assert!(msg.flags.contains(Flags::RECENT));
        assert!(msg.uid > mb.message_by_uid(Uid::u(1)).unwrap().uid);
    }

    #[test]
    fn committed_message_is_stored_canonically() {
        let setup = set_up();
        let mut mb = setup.selected();

        mb.append(
            Utc::now(),
            Flags::SEEN,
            &mut &b"line1\r\nline2\r\n"[..],
        )
        .unwrap();
        mb.poll(UpdateTypes::ALL).unwrap();

        let msg = mb.messages(false).next().unwrap();
        assert!(msg.flags.contains(Flags::SEEN));
        assert_eq!(14, msg.size);

        let (size, mut reader) = mb.open_message(msg.uid, None).unwrap();
        assert_eq!(14, size);
        let mut content = String::new();
        reader.read_to_string(&mut content).unwrap();
        assert_eq!("line1\nline2\n", content);
    }

    #[test]
    fn canonicalisation_handles_split_and_lone_cr() {
        use std::io::Write;

        let setup = set_up();
        let mut mb = setup.selected();

        let mut staged =
            mb.stage_message(Utc::now(), Flags::empty()).unwrap();
        // CRLF split across two writes
        staged.write_all(b"abc\r").unwrap();
        staged.write_all(b"\ndef\rghi").unwrap();
        assert_eq!(12, staged.canonical_size());

        mb.commit_batch(vec![staged]).unwrap();
        mb.poll(UpdateTypes::ALL).unwrap();

        let msg = mb.messages(false).next().unwrap();
        assert_eq!(12, msg.size);
        let (_, mut reader) = mb.open_message(msg.uid, None).unwrap();
        let mut content = Vec::new();
        reader.read_to_end(&mut content).unwrap();
        assert_eq!(b"abc\ndef\rghi".to_vec(), content);
    }

    #[test]
    fn rollback_leaves_no_trace() {
        let setup = set_up();
        let mut mb = setup.selected();

        let mut staged =
            mb.stage_message(Utc::now(), Flags::empty()).unwrap();
        std::io::Write::write_all(&mut staged, b"discard me\n").unwrap();
        mb.rollback_batch(vec![staged]);

        assert_eq!(0, fs::read_dir(setup.path.join("tmp")).unwrap().count());
        assert_eq!(0, fs::read_dir(setup.path.join("new")).unwrap().count());
        assert!(mb.poll(UpdateTypes::ALL).unwrap().is_empty());
    }

    #[test]
    fn failed_batch_publishes_nothing() {
        let setup = set_up();
        let mut mb = setup.mailbox();

        let staged_a =
            mb.stage_message(Utc::now(), Flags::empty()).unwrap();
        let staged_b =
            mb.stage_message(Utc::now(), Flags::empty()).unwrap();

        // Break the destination so the publish link must fail
        fs::remove_dir(setup.path.join("new")).unwrap();
        assert_matches!(
            Err(Error::BatchAborted),
            mb.commit_batch(vec![staged_a, staged_b])
        );

        assert_eq!(0, fs::read_dir(setup.path.join("tmp")).unwrap().count());
        assert_eq!(0, fs::read_dir(setup.path.join("cur")).unwrap().count());
    }

    #[test]
    fn copy_shares_storage_on_the_same_device() {
        use std::os::unix::fs::MetadataExt;

        let setup = set_up();
        let dst_path = setup.root.path().join("Archive");
        fs::create_dir(&dst_path).unwrap();
        for sub in &["cur", "new", "tmp"] {
            fs::create_dir(dst_path.join(sub)).unwrap();
        }

        setup.deliver("1000.one.host", b"content\n", 3);
        let mut src = setup.selected();
        src.set_flags(Uid::u(1), Flags::SEEN).unwrap();

        let mut dst = Maildir::open(&dst_path, false).unwrap();
        dst.select().unwrap();
        src.copy_to(&mut dst, Uid::u(1)).unwrap();

        let response = dst.poll(UpdateTypes::ALL).unwrap();
        assert_eq!(Some(1), response.exists);

        let msg = dst.messages(false).next().unwrap();
        assert!(msg.flags.contains(Flags::SEEN));
        assert!(msg.flags.contains(Flags::RECENT));
        assert_eq!(src.message_by_uid(Uid::u(1)).unwrap().size, msg.size);

        // Same bytes via a hard link, not a copy
        let dst_file = dst_path
            .join("cur")
            .join(format!("{}:2,S", msg.unique_name));
        assert_eq!(2, fs::metadata(dst_file).unwrap().nlink());
    }

    #[test]
    fn copy_of_missing_message_is_nx() {
        let setup = set_up();
        let dst_path = setup.root.path().join("Other");
        fs::create_dir(&dst_path).unwrap();
        for sub in &["cur", "new", "tmp"] {
            fs::create_dir(dst_path.join(sub)).unwrap();
        }

        let mut src = setup.selected();
        let mut dst = Maildir::open(&dst_path, false).unwrap();
        assert_matches!(
            Err(Error::NxMessage),
            src.copy_to(&mut dst, Uid::u(9))
        );
    }
}
