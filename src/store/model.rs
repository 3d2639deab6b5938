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

use std::convert::TryFrom;
use std::fmt;
use std::num::NonZeroU32;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Uniquely identifies a message within a single mailbox.
///
/// UIDs start at 1 and increase monotonically as messages are added to the
/// mailbox. Within one UID validity epoch, UIDs are never reused and never
/// change once assigned.
#[derive(
    Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct Uid(pub NonZeroU32);

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Uid({})", self.0.get())
    }
}

impl Uid {
    // Unsafe because new() isn't const for some reason
    pub const MIN: Self = unsafe { Uid(NonZeroU32::new_unchecked(1)) };
    pub const MAX: Self =
        unsafe { Uid(NonZeroU32::new_unchecked(u32::MAX)) };

    pub fn of(uid: u32) -> Option<Self> {
        NonZeroU32::new(uid).map(Uid)
    }

    pub fn next(self) -> Option<Self> {
        if Uid::MAX == self {
            None
        } else {
            Some(Uid(NonZeroU32::new(self.0.get() + 1).unwrap()))
        }
    }

    #[cfg(test)]
    pub fn u(uid: u32) -> Self {
        Uid::of(uid).unwrap()
    }
}

impl TryFrom<u32> for Uid {
    type Error = ();

    fn try_from(v: u32) -> Result<Self, ()> {
        Self::of(v).ok_or(())
    }
}

impl From<Uid> for u32 {
    fn from(u: Uid) -> u32 {
        u.0.get()
    }
}

/// The 1-based ordinal position of a message among the currently non-removed
/// messages of a mailbox.
///
/// Unlike a UID, a sequence number is only meaningful within one reconciled
/// snapshot; every reported expungement shifts the sequence numbers of all
/// later messages down by one.
#[derive(
    Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct Seqnum(pub NonZeroU32);

impl fmt::Debug for Seqnum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Seqnum({})", self.0.get())
    }
}

impl Seqnum {
    // Unsafe because new() isn't const for some reason
    pub const MIN: Self = unsafe { Seqnum(NonZeroU32::new_unchecked(1)) };

    pub fn of(seqnum: u32) -> Option<Self> {
        NonZeroU32::new(seqnum).map(Seqnum)
    }

    pub fn to_index(self) -> usize {
        self.0.get() as usize - 1
    }

    pub fn from_index(ix: usize) -> Self {
        Seqnum::of(u32::try_from(ix + 1).unwrap()).unwrap()
    }

    #[cfg(test)]
    pub fn u(seqnum: u32) -> Self {
        Seqnum::of(seqnum).unwrap()
    }
}

impl From<Seqnum> for u32 {
    fn from(s: Seqnum) -> u32 {
        s.0.get()
    }
}

bitflags! {
    /// The flags of a single message.
    ///
    /// The lower bits correspond to the standard system flags that Maildir
    /// persists as filename suffix letters. `RECENT` exists only in memory;
    /// it is never written to a filename or the cache.
    pub struct Flags: u8 {
        const ANSWERED = 1 << 0;
        const DELETED = 1 << 1;
        const DRAFT = 1 << 2;
        const FLAGGED = 1 << 3;
        const SEEN = 1 << 4;
        const RECENT = 1 << 5;
    }
}

impl Flags {
    /// The subset of flags which is persisted in filenames and survives
    /// process restarts.
    pub fn persistent(self) -> Flags {
        self & !Flags::RECENT
    }
}

impl Default for Flags {
    fn default() -> Self {
        Flags::empty()
    }
}

bitflags! {
    /// Which classes of pending updates a `poll()` caller wants reported.
    ///
    /// A class not requested is left pending for a later poll; nothing is
    /// silently discarded.
    pub struct UpdateTypes: u8 {
        /// Report (and evict) expunged messages.
        const EXPUNGE = 1 << 0;
        /// Report changed total/recent counts.
        const COUNTS = 1 << 1;
        /// Report per-message flag changes.
        const FLAGS = 1 << 2;
        const ALL = Self::EXPUNGE.bits | Self::COUNTS.bits | Self::FLAGS.bits;
    }
}

/// All information needed to produce a response to a `SELECT` or `EXAMINE`
/// command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectResponse {
    /// The number of messages that currently exist.
    /// `* exists EXISTS`
    pub exists: u32,
    /// The number of messages with the `\Recent` pseudo-flag.
    /// `* recent RECENT`
    pub recent: u32,
    /// The sequence number of the first message without the `\Seen` flag.
    /// `None` if all messages are seen.
    /// `* OK [UNSEEN unseen]`
    pub unseen: Option<Seqnum>,
    /// The probable next UID.
    /// `* OK [UIDNEXT uidnext]`
    pub uidnext: u32,
    /// The current UID validity.
    /// `* OK [UIDVALIDITY uidvalidity]`
    pub uidvalidity: u32,
    /// Whether the mailbox is read-only.
    /// `TAG OK [READ-WRITE|READ-ONLY]`
    pub read_only: bool,
}

/// Unsolicited responses that must be sent to the client after a poll.
///
/// One of these is produced per reconciliation pass, consumed immediately by
/// the reporting layer, and discarded.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PollResponse {
    /// Any messages to report as expunged, in *descending* sequence number
    /// order so that earlier entries do not renumber later ones while the
    /// client applies them:
    ///
    /// ```text
    /// * expunge[0].seqnum EXPUNGE
    /// * expunge[1].seqnum EXPUNGE
    /// ...
    /// ```
    pub expunge: Vec<(Seqnum, Uid)>,
    /// If the mailbox size has changed since last reported, the new size.
    /// `* exists EXISTS`
    pub exists: Option<u32>,
    /// If the recent count has changed since last reported, the new count.
    /// `* recent RECENT`
    pub recent: Option<u32>,
    /// Messages whose flags changed since last reported, with their new
    /// flags, to be sent as unsolicited `FETCH` responses. Sequence numbers
    /// reflect the state *after* the expungements above have been applied.
    pub fetch: Vec<(Seqnum, Flags)>,
}

impl PollResponse {
    /// Whether this response carries nothing to report.
    pub fn is_empty(&self) -> bool {
        self.expunge.is_empty()
            && self.exists.is_none()
            && self.recent.is_none()
            && self.fetch.is_empty()
    }
}

/// The `STATUS` command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusRequest {
    /// Return the number of messages.
    pub messages: bool,
    /// Return the number of \Recent messages.
    pub recent: bool,
    /// Return the next UID value.
    pub uidnext: bool,
    /// Return the UID validity.
    pub uidvalidity: bool,
    /// Return the number of not-\Seen messages.
    pub unseen: bool,
}

/// The `STATUS` response.
///
/// Fields are only set if requested in the request. Those fields' meanings
/// correspond exactly to the fields of the same name in `StatusRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusResponse {
    pub messages: Option<u32>,
    pub recent: Option<u32>,
    pub uidnext: Option<u32>,
    pub uidvalidity: Option<u32>,
    pub unseen: Option<u32>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn uid_ordering_and_next() {
        assert!(Uid::u(1) < Uid::u(2));
        assert_eq!(Some(Uid::u(2)), Uid::u(1).next());
        assert_eq!(None, Uid::MAX.next());
        assert_eq!(None, Uid::of(0));
    }

    #[test]
    fn seqnum_index_conversions() {
        assert_eq!(0, Seqnum::u(1).to_index());
        assert_eq!(Seqnum::u(3), Seqnum::from_index(2));
    }

    #[test]
    fn persistent_flags_exclude_recent() {
        let f = Flags::SEEN | Flags::RECENT;
        assert_eq!(Flags::SEEN, f.persistent());
    }
}
