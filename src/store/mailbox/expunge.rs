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

use log::warn;

use crate::store::model::Flags;
use crate::support::error::Error;

use super::defs::Maildir;

impl Maildir {
    /// Remove every message marked `\Deleted` from the mailbox.
    ///
    /// The files are unlinked immediately; the records stay in the snapshot
    /// marked for removal, and the expunge events are delivered by the next
    /// poll. A mailbox with nothing deleted makes this a no-op.
    pub fn expunge(&mut self) -> Result<(), Error> {
        self.require_selected()?;
        self.not_read_only()?;

        let cur_dir = self.cur_dir();
        for r in &mut self.records {
            if r.expunged || !r.flags.contains(Flags::DELETED) {
                continue;
            }

            if let Some(name) = &r.filename {
                match fs::remove_file(cur_dir.join(name)) {
                    Ok(()) => (),
                    // Another accessor beat us to it
                    Err(e) if io::ErrorKind::NotFound == e.kind() => (),
                    Err(e) => {
                        warn!(
                            "{} Unable to expunge cur/{}: {}",
                            self.log_prefix, name, e
                        );
                        continue;
                    }
                }
            }
            r.expunged = true;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::super::test_prelude::*;

    #[test]
    fn expunge_removes_deleted_messages_only() {
        let setup = set_up();
        setup.deliver("1000.one.host", b"a\n", 4);
        setup.deliver("1001.two.host", b"b\n", 3);
        let mut mb = setup.selected();

        mb.add_flags(Uid::u(1), Flags::DELETED).unwrap();
        mb.expunge().unwrap();

        assert!(!setup.path.join("cur/1000.one.host:2,T").exists());
        assert!(setup.path.join("cur/1001.two.host:2,").is_file());

        let response = mb.poll(UpdateTypes::ALL).unwrap();
        assert_eq!(vec![(Seqnum::u(1), Uid::u(1))], response.expunge);
        assert_eq!(Some(1), response.exists);
        assert_eq!(1, mb.messages(true).count());
    }

    #[test]
    fn expunge_with_nothing_deleted_is_a_no_op() {
        let setup = set_up();
        setup.deliver("1000.one.host", b"a\n", 3);
        let mut mb = setup.selected();

        mb.expunge().unwrap();
        mb.expunge().unwrap();

        assert!(setup.path.join("cur/1000.one.host:2,").is_file());
        assert!(mb.poll(UpdateTypes::ALL).unwrap().is_empty());
    }

    #[test]
    fn expunge_respects_read_only() {
        let setup = set_up();
        setup.deliver("1000.one.host", b"a\n", 3);
        let mut mb = Maildir::open(&setup.path, true).unwrap();
        mb.select().unwrap();

        assert_matches!(Err(Error::MailboxReadOnly), mb.expunge());
    }
}
