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

//! A crash-consistent Maildir storage engine for IMAP servers.
//!
//! This crate maps user mailboxes onto Maildir directories, assigns and
//! persists stable message UIDs across process restarts, reconciles the
//! on-disk state with an in-memory view, and reports the minimal set of
//! changes a session must announce to its client. The only transaction
//! primitives used are ordinary filesystem operations (`rename`, `link`,
//! `unlink`, `mkdir`), so several processes can work on the same mailbox
//! concurrently without any shared memory.
//!
//! The entry point is [`store::mailbox::Maildir`], usually reached through a
//! [`store::backend::StoreRegistry`].

#[cfg(test)]
macro_rules! assert_matches {
    ($expected:pat, $actual:expr) => {
        match $actual {
            $expected => (),
            unexpected => panic!(
                "Expected {} matches {}, got {:?}",
                stringify!($expected),
                stringify!($actual),
                unexpected
            ),
        }
    };
}

pub mod store;
pub mod support;
