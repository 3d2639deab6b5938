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

//! Parsing and generation of Maildir message filenames.
//!
//! A file in `cur/` is named `<unique-name>:2,<flags>`, where `<flags>` is a
//! sorted (ASCII order) subset of `DFRST`. Files in `new/` usually carry the
//! bare unique name, but a flag suffix is tolerated there too since the
//! commit protocol publishes pre-flagged messages through `new/`.
//!
//! Unique names are minted as
//! `<secs>.M<micros>P<pid>R<rand>.<host>`
//! which keeps them sortable by delivery time while making collisions
//! between concurrent deliverers (even on different hosts sharing a
//! filesystem) practically impossible. The engine never reinterprets a
//! unique name after minting it; only uniqueness and immutability matter.

use chrono::prelude::*;
use rand::{rngs::OsRng, Rng};

use crate::store::model::Flags;

/// The separator between the unique name and the flag letters.
///
/// The `2` is the Maildir "info version"; version 1 is an obsolete
/// experimental format and nothing else was ever defined.
pub const FLAG_SEPARATOR: &str = ":2,";

/// Split a filename into its unique name and its parsed flags.
///
/// A missing flag suffix parses as no flags. Unknown flag letters are
/// ignored rather than treated as an error, since other Maildir software may
/// use lowercase letters for its own purposes.
pub fn parse(name: &str) -> (&str, Flags) {
    match name.find(FLAG_SEPARATOR) {
        Some(ix) => (
            &name[..ix],
            parse_flag_letters(&name[ix + FLAG_SEPARATOR.len()..]),
        ),
        None => (name, Flags::empty()),
    }
}

/// Return just the unique-name part of a filename.
pub fn unique_name(name: &str) -> &str {
    parse(name).0
}

fn parse_flag_letters(letters: &str) -> Flags {
    let mut flags = Flags::empty();
    for ch in letters.chars() {
        match ch {
            'D' => flags |= Flags::DRAFT,
            'F' => flags |= Flags::FLAGGED,
            'R' => flags |= Flags::ANSWERED,
            'S' => flags |= Flags::SEEN,
            'T' => flags |= Flags::DELETED,
            _ => (),
        }
    }
    flags
}

/// Render the persistent flags as their sorted letter string.
pub fn flag_letters(flags: Flags) -> String {
    let mut letters = String::new();
    // Already in ASCII order, as Maildir requires
    if flags.contains(Flags::DRAFT) {
        letters.push('D');
    }
    if flags.contains(Flags::FLAGGED) {
        letters.push('F');
    }
    if flags.contains(Flags::ANSWERED) {
        letters.push('R');
    }
    if flags.contains(Flags::SEEN) {
        letters.push('S');
    }
    if flags.contains(Flags::DELETED) {
        letters.push('T');
    }
    letters
}

/// Build the full `cur/` filename for a unique name and flag set.
pub fn format(unique: &str, flags: Flags) -> String {
    let mut name =
        String::with_capacity(unique.len() + FLAG_SEPARATOR.len() + 5);
    name.push_str(unique);
    name.push_str(FLAG_SEPARATOR);
    name.push_str(&flag_letters(flags.persistent()));
    name
}

/// Mint a fresh unique name.
///
/// Each call returns a distinct value even within the same microsecond,
/// thanks to the random component. Collisions across hosts are prevented by
/// the hostname component; collisions on one host by the PID.
pub fn generate_unique() -> String {
    let now = Utc::now();
    format!(
        "{}.M{}P{}R{:08x}.{}",
        now.timestamp(),
        now.timestamp_subsec_micros(),
        std::process::id(),
        OsRng.gen::<u32>(),
        hostname(),
    )
}

/// The local hostname with the characters Maildir reserves (`/`, `:`)
/// replaced, falling back to a fixed string if the name is unavailable.
fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .map(|s| s.replace('/', "\\057").replace(':', "\\072"))
        .unwrap_or_else(|| "localhost".to_owned())
}
