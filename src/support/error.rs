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

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unsafe mailbox name")]
    UnsafeName,
    #[error("Mailbox already exists")]
    MailboxExists,
    #[error("No such mailbox")]
    NxMailbox,
    #[error("No such message")]
    NxMessage,
    #[error("Mailbox is read-only")]
    MailboxReadOnly,
    #[error("Mailbox is not selected")]
    MailboxUnselected,
    #[error("Mailbox is missing its cur/new/tmp structure")]
    MailboxCorrupt,
    #[error("Message UIDs out of order; UID validity was reset")]
    UidsReordered,
    #[error("Gave up waiting for the mailbox scan lock")]
    LockUnavailable,
    #[error("Gave up generating a unique message name")]
    GaveUpInsertion,
    #[error("Delivery batch was rolled back")]
    BatchAborted,
    #[error("Mailbox is full")]
    MailboxFull,
    #[error("Unknown mailbox storage family")]
    NxStoreFamily,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    CacheSerialise(#[from] toml::ser::Error),
}

/// Coarse classification of an `Error`, used by the protocol layer to decide
/// between giving up on the mailbox, retrying the operation once, or blaming
/// the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    /// The mailbox itself is unusable; retrying cannot help.
    Permanent,
    /// The same operation may be retried once. A fresh UID validity may
    /// already have been minted, which the protocol layer must surface.
    Temporary,
    /// The caller asked for something nonsensical in the current state.
    Client,
}

impl Error {
    pub fn severity(&self) -> Severity {
        match *self {
            Error::MailboxCorrupt | Error::NxMailbox => Severity::Permanent,
            Error::UidsReordered
            | Error::LockUnavailable
            | Error::GaveUpInsertion
            | Error::BatchAborted
            | Error::MailboxFull
            | Error::Io(_)
            | Error::CacheSerialise(_) => Severity::Temporary,
            Error::UnsafeName
            | Error::MailboxExists
            | Error::NxMessage
            | Error::MailboxReadOnly
            | Error::MailboxUnselected
            | Error::NxStoreFamily => Severity::Client,
        }
    }
}
