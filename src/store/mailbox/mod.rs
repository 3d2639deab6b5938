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

//! Support for handling mailboxes.
//!
//! A `Maildir` is one open handle onto one physical Maildir directory for
//! the lifetime of one process. All interesting operations happen against a
//! reconciled in-memory view which the scan engine keeps in sync with the
//! filesystem; see the submodules:
//!
//! - `defs` declares the handle, its lifecycle state machine, and the
//!   per-message record.
//! - `scan` is the scan/reconcile engine, the heart of the crate.
//! - `deliver` implements staging, the commit protocol, and copies.
//! - `poll` computes the pending updates a session must announce.
//! - `flags` and `expunge` are the client-initiated mutations.
//! - `paths` creates, deletes, and renames mailbox directories.

mod defs;
mod deliver;
mod expunge;
mod flags;
pub mod paths;
mod poll;
mod scan;

pub use self::defs::{Lifecycle, Maildir, MessageInfo};
pub use self::deliver::StagedMessage;

#[cfg(test)]
pub(crate) mod test_prelude {
    use std::fs;
    use std::path::{Path, PathBuf};

    pub(crate) use super::defs::*;
    pub(crate) use crate::store::model::*;
    pub(crate) use crate::support::error::Error;

    /// A scratch Maildir inside a temp directory, removed on drop.
    pub(crate) struct Setup {
        pub(crate) root: tempfile::TempDir,
        pub(crate) path: PathBuf,
    }

    pub(crate) fn set_up() -> Setup {
        let root = tempfile::TempDir::new().unwrap();
        let path = root.path().join("INBOX");
        fs::create_dir(&path).unwrap();
        for sub in &["cur", "new", "tmp"] {
            fs::create_dir(path.join(sub)).unwrap();
        }
        Setup { root, path }
    }

    impl Setup {
        pub(crate) fn mailbox(&self) -> Maildir {
            Maildir::open(&self.path, false).unwrap()
        }

        pub(crate) fn selected(&self) -> Maildir {
            let mut mb = self.mailbox();
            mb.select().unwrap();
            mb
        }

        /// Drop a file into `new/` as an external delivery agent would,
        /// backdating its mtime by `age_secs` so the admission check sees
        /// it as complete.
        pub(crate) fn deliver(
            &self,
            name: &str,
            content: &[u8],
            age_secs: i64,
        ) -> PathBuf {
            let path = self.path.join("new").join(name);
            fs::write(&path, content).unwrap();
            set_mtime(&path, chrono::Utc::now().timestamp() - age_secs);
            path
        }
    }

    pub(crate) fn set_mtime(path: &Path, unix_secs: i64) {
        let t = nix::sys::time::TimeVal::new(
            unix_secs as nix::sys::time::time_t,
            0,
        );
        nix::sys::stat::utimes(path, &t, &t).unwrap();
    }
}
