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

use super::defs::Maildir;
use crate::store::model::*;
use crate::support::error::Error;

impl Maildir {
    /// Rescan the mailbox and compute the updates to report to the client.
    ///
    /// Only the update classes named in `types` are reported; anything else
    /// stays pending for a later poll. Expunged records are evicted from
    /// the snapshot as they are reported, so reporting and removal are a
    /// single step from the client's point of view. A poll that finds
    /// nothing changed performs no filesystem writes.
    pub fn poll(&mut self, types: UpdateTypes) -> Result<PollResponse, Error> {
        self.require_selected()?;
        self.scan(false)?;

        let mut response = PollResponse::default();

        if types.contains(UpdateTypes::EXPUNGE) {
            // Descending, so each reported seqnum is still valid after the
            // ones before it have been applied by the client
            for ix in (0..self.records.len()).rev() {
                if !self.records[ix].expunged {
                    continue;
                }
                let record = self.records.remove(ix);
                if let Some(uid) = record.uid {
                    response.expunge.push((Seqnum::from_index(ix), uid));
                }
                self.index.remove(&record.unique_name);
                if record.saved {
                    self.scan.cache_dirty = true;
                }
            }
        }

        if types.contains(UpdateTypes::COUNTS) {
            let mut exists = 0u32;
            let mut recent = 0u32;
            for r in &mut self.records {
                if r.expunged {
                    continue;
                }
                exists += 1;
                if r.flags.contains(Flags::RECENT) {
                    recent += 1;
                }
                r.just_arrived = false;
            }

            if Some(exists) != self.reported_exists {
                response.exists = Some(exists);
                self.reported_exists = Some(exists);
            }
            if Some(recent) != self.reported_recent {
                response.recent = Some(recent);
                self.reported_recent = Some(recent);
            }
        }

        if types.contains(UpdateTypes::FLAGS) {
            for (ix, r) in self.records.iter_mut().enumerate() {
                if !r.expunged && r.flags_changed {
                    response.fetch.push((Seqnum::from_index(ix), r.flags));
                    r.flags_changed = false;
                }
            }
        }

        // Evictions leave dead rows in the cache; rewrite it now rather
        // than waiting for the next scan to notice
        self.flush_under_lock()?;

        Ok(response)
    }

    /// Answer a `STATUS` request from a freshly reconciled snapshot.
    pub fn status(
        &mut self,
        request: &StatusRequest,
    ) -> Result<StatusResponse, Error> {
        self.require_selected()?;
        self.scan(false)?;

        let live = || self.records.iter().filter(|r| !r.expunged);

        Ok(StatusResponse {
            messages: if request.messages {
                Some(live().count() as u32)
            } else {
                None
            },
            recent: if request.recent {
                Some(
                    live()
                        .filter(|r| r.flags.contains(Flags::RECENT))
                        .count() as u32,
                )
            } else {
                None
            },
            uidnext: if request.uidnext {
                Some(self.uid_next)
            } else {
                None
            },
            uidvalidity: if request.uidvalidity {
                Some(self.uid_validity)
            } else {
                None
            },
            unseen: if request.unseen {
                Some(
                    live().filter(|r| !r.flags.contains(Flags::SEEN)).count()
                        as u32,
                )
            } else {
                None
            },
        })
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use super::super::test_prelude::*;

    #[test]
    fn quiet_mailbox_polls_empty() {
        let setup = set_up();
        setup.deliver("1000.one.host", b"a\n", 3);
        let mut mb = setup.selected();

        let response = mb.poll(UpdateTypes::ALL).unwrap();
        assert!(response.is_empty());
    }

    #[test]
    fn new_arrival_reports_counts() {
        let setup = set_up();
        let mut mb = setup.selected();

        setup.deliver("1000.one.host", b"a\n", 2);
        let response = mb.poll(UpdateTypes::ALL).unwrap();

        assert_eq!(Some(1), response.exists);
        assert_eq!(Some(1), response.recent);
        assert!(response.expunge.is_empty());
        assert!(response.fetch.is_empty());

        // Reported once, not again
        assert!(mb.poll(UpdateTypes::ALL).unwrap().is_empty());
    }

    #[test]
    fn external_deletions_reported_descending_and_evicted() {
        let setup = set_up();
        setup.deliver("1000.one.host", b"a\n", 5);
        setup.deliver("1001.two.host", b"b\n", 4);
        setup.deliver("1002.three.host", b"c\n", 3);
        let mut mb = setup.selected();

        fs::remove_file(setup.path.join("cur/1000.one.host:2,")).unwrap();
        fs::remove_file(setup.path.join("cur/1002.three.host:2,")).unwrap();

        let response = mb.poll(UpdateTypes::ALL).unwrap();
        assert_eq!(
            vec![(Seqnum::u(3), Uid::u(3)), (Seqnum::u(1), Uid::u(1))],
            response.expunge
        );
        assert_eq!(Some(1), response.exists);

        // The survivor renumbers down to seqnum 1
        assert_eq!(Some(Uid::u(2)), mb.uid_for_seqnum(Seqnum::u(1)));
        assert_eq!(1, mb.messages(true).count());
    }

    #[test]
    fn external_flag_change_reported_as_fetch() {
        let setup = set_up();
        setup.deliver("1000.one.host", b"a\n", 3);
        let mut mb = setup.selected();

        fs::rename(
            setup.path.join("cur/1000.one.host:2,"),
            setup.path.join("cur/1000.one.host:2,S"),
        )
        .unwrap();

        let response = mb.poll(UpdateTypes::ALL).unwrap();
        assert_eq!(1, response.fetch.len());
        let (seqnum, flags) = response.fetch[0];
        assert_eq!(Seqnum::u(1), seqnum);
        assert!(flags.contains(Flags::SEEN));

        assert!(mb.poll(UpdateTypes::ALL).unwrap().is_empty());
    }

    #[test]
    fn unrequested_classes_stay_pending() {
        let setup = set_up();
        setup.deliver("1000.one.host", b"a\n", 3);
        let mut mb = setup.selected();

        fs::remove_file(setup.path.join("cur/1000.one.host:2,")).unwrap();

        // Ask for flags only; the expunge must not be consumed
        let response = mb.poll(UpdateTypes::FLAGS).unwrap();
        assert!(response.is_empty());

        let response = mb.poll(UpdateTypes::EXPUNGE).unwrap();
        assert_eq!(vec![(Seqnum::u(1), Uid::u(1))], response.expunge);
    }

    #[test]
    fn status_returns_only_requested_fields() {
        let setup = set_up();
        setup.deliver("1000.one.host", b"a\n", 3);
        let mut mb = setup.selected();

        let response = mb
            .status(&StatusRequest {
                messages: true,
                uidvalidity: true,
                ..StatusRequest::default()
            })
            .unwrap();

        assert_eq!(Some(1), response.messages);
        assert_eq!(Some(mb.uid_validity()), response.uidvalidity);
        assert_eq!(None, response.recent);
        assert_eq!(None, response.uidnext);
        assert_eq!(None, response.unseen);
    }
}
