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

use std::fs;
use std::io;

use crate::store::filename;
use crate::store::model::*;
use crate::support::error::Error;

use super::defs::Maildir;

impl Maildir {
    /// Replace the persistent flags of the message with the given UID.
    ///
    /// The change takes effect on disk as a single rename within `cur/`, so
    /// other accessors observe it atomically. `\Recent` is unaffected; it
    /// exists only in this session's memory.
    ///
    /// Returns the message's full new flag set.
    pub fn set_flags(&mut self, uid: Uid, flags: Flags) -> Result<Flags, Error> {
        self.require_selected()?;
        self.not_read_only()?;

        let cur_dir = self.cur_dir();
        let ix = self.record_ix_by_uid(uid).ok_or(Error::NxMessage)?;
        let record = &mut self.records[ix];

        let new_flags = flags.persistent() | (record.flags & Flags::RECENT);
        if record.flags == new_flags {
            return Ok(new_flags);
        }

        let old_name =
            record.filename.clone().ok_or(Error::NxMessage)?;
        let new_name =
            filename::format(&record.unique_name, new_flags);

        if old_name != new_name {
            match fs::rename(cur_dir.join(&old_name), cur_dir.join(&new_name))
            {
                Ok(()) => (),
                Err(e) if io::ErrorKind::NotFound == e.kind() => {
                    // Deleted or renamed under us; let the next scan sort
                    // the record out
                    return Err(Error::NxMessage);
                }
                Err(e) => return Err(e.into()),
            }
        }

        record.flags = new_flags;
        record.filename = Some(new_name.clone());
        let unique = record.unique_name.clone();
        self.index.insert(&unique, Some(uid), Some(new_name));

        Ok(new_flags)
    }

    /// Add `flags` to the message's current flags.
    pub fn add_flags(&mut self, uid: Uid, flags: Flags) -> Result<Flags, Error> {
        let current = self
            .message_by_uid(uid)
            .map(|m| m.flags)
            .ok_or(Error::NxMessage)?;
        self.set_flags(uid, current | flags)
    }

    /// Remove `flags` from the message's current flags.
    pub fn remove_flags(
        &mut self,
        uid: Uid,
        flags: Flags,
    ) -> Result<Flags, Error> {
        let current = self
            .message_by_uid(uid)
            .map(|m| m.flags)
            .ok_or(Error::NxMessage)?;
        self.set_flags(uid, current - flags)
    }
}
