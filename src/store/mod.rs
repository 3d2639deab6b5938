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

//! The Maildir message store.
//!
//! Each mailbox is one Maildir directory:
//!
//! - `new/`. Delivery drop area. Files here carry a plain unique name; a
//!   delivery agent creates them elsewhere and `rename()`s them in.
//!
//! - `cur/`. Working area. Files are named `<unique-name>:2,<flags>` where
//!   `<flags>` is a sorted subset of the letters `DFRST` (Draft, Flagged,
//!   Replied, Seen, Trashed). Renaming a file within `cur/` is how flags
//!   change on disk.
//!
//! - `tmp/`. Staging area. In-progress writes happen here under private
//!   temporary names and are published by `link()`/`rename()` only once
//!   complete, so `new/` and `cur/` never contain partial files.
//!
//! Sidecar files in the mailbox root, all beginning with a dot so they can
//! never collide with a child mailbox name:
//!
//! - `.maildirbox-cache`. TOML. The UID allocation counter, the UID validity
//!   of the current epoch, and one row per known message. Replaced only via
//!   write-to-`tmp/`-then-rename. A version tag that does not match exactly
//!   causes the whole file to be treated as absent.
//!
//! - `.maildirbox-uidvalidity`. TOML. The UID validity alone, readable
//!   without parsing the cache. Same version-tag and replacement rules.
//!
//! - `.maildirbox-lock`. Exclusively-created marker serialising the
//!   scan/reconcile window across processes. See `lock`.
//!
//! The unique name assigned at delivery is immutable and never reused; the
//! flag suffix is the only part of a filename that may change. UIDs are
//! assigned to unique names in delivery order and are strictly increasing
//! within one UID validity epoch. Whenever UID continuity cannot be
//! guaranteed (lost or corrupt cache, reordered UIDs), a fresh validity is
//! minted and all UIDs are reassigned, which clients observe as a
//! `UIDVALIDITY` change.
//!
//! Cross-process concurrency relies exclusively on the atomicity of
//! `rename()`, `link()`, and `O_EXCL` creation; there are no semaphores and
//! no shared memory. The scan lock covers only the scan/reconcile window.
//! Reads of already-reconciled in-memory state and message byte streaming
//! are deliberately unlocked.

pub mod backend;
pub mod cache;
pub mod filename;
pub mod lock;
pub mod mailbox;
pub mod model;
pub mod open_cache;
pub mod uid_index;
