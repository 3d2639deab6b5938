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

//! Creation, deletion, and renaming of mailbox directories.

use std::fs;
use std::path::Path;
use std::time::Duration;

use log::info;

use crate::support::error::Error;
use crate::support::file_ops::ErrorTransforms;
use crate::support::safe_name::is_safe_name;

/// Create a new mailbox directory at `path`.
///
/// The parent directory must already exist. The last path component must be
/// a safe mailbox name.
pub fn create(path: &Path) -> Result<(), Error> {
    // UID validity stamps are creation timestamps in whole seconds. The
    // pause guarantees that a mailbox deleted and recreated under the same
    // name cannot end up with the validity of its predecessor.
    create_with_pause(path, Duration::from_secs(1))
}

fn create_with_pause(path: &Path, pause: Duration) -> Result<(), Error> {
    check_safe_name(path)?;

    fs::create_dir(path)
        .on_exists(Error::MailboxExists)
        .on_not_found(Error::NxMailbox)?;
    std::thread::sleep(pause);
    for sub in &["cur", "new", "tmp"] {
        fs::create_dir(path.join(sub))?;
    }

    info!("Created mailbox at {}", path.display());
    Ok(())
}

/// Whether a selectable mailbox exists at `path`.
pub fn exists(path: &Path) -> bool {
    path.join("cur").is_dir() && path.join("new").is_dir()
}

/// Delete the mailbox at `path` with everything in it.
pub fn delete(path: &Path) -> Result<(), Error> {
    if !path.is_dir() {
        return Err(Error::NxMailbox);
    }

    fs::remove_dir_all(path).on_not_found(Error::NxMailbox)?;
    info!("Deleted mailbox at {}", path.display());
    Ok(())
}

/// Rename the mailbox at `src` to `dst`.
///
/// The validity stamp travels with the directory, so clients keep their
/// cached UIDs across the rename.
pub fn rename(src: &Path, dst: &Path) -> Result<(), Error> {
    check_safe_name(dst)?;

    if !src.is_dir() {
        return Err(Error::NxMailbox);
    }
    if dst.exists() {
        return Err(Error::MailboxExists);
    }

    fs::rename(src, dst)
        .on_exists(Error::MailboxExists)
        .on_not_found(Error::NxMailbox)?;
    info!(
        "Renamed mailbox {} to {}",
        src.display(),
        dst.display()
    );
    Ok(())
}

fn check_safe_name(path: &Path) -> Result<(), Error> {
    path.file_name()
        .and_then(|n| n.to_str())
        .filter(|n| is_safe_name(n))
        .map(|_| ())
        .ok_or(Error::UnsafeName)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn create_builds_selectable_maildir() {
        let root = tempfile::TempDir::new().unwrap();
        let path = root.path().join("Archive");

        create_with_pause(&path, Duration::from_millis(1)).unwrap();
        assert!(exists(&path));
        assert!(path.join("tmp").is_dir());

        assert_matches!(
            Err(Error::MailboxExists),
            create_with_pause(&path, Duration::from_millis(1))
        );
    }

    #[test]
    fn create_rejects_unsafe_names_and_missing_parents() {
        let root = tempfile::TempDir::new().unwrap();

        assert_matches!(
            Err(Error::UnsafeName),
            create_with_pause(
                &root.path().join(".sneaky"),
                Duration::from_millis(1)
            )
        );
        assert_matches!(
            Err(Error::NxMailbox),
            create_with_pause(
                &root.path().join("no/such/parent"),
                Duration::from_millis(1)
            )
        );
    }

    #[test]
    fn delete_removes_everything_and_is_not_idempotent() {
        let root = tempfile::TempDir::new().unwrap();
        let path = root.path().join("Trash");
        create_with_pause(&path, Duration::from_millis(1)).unwrap();
        std::fs::write(path.join("cur/msg:2,"), b"x").unwrap();

        delete(&path).unwrap();
        assert!(!path.exists());
        assert_matches!(Err(Error::NxMailbox), delete(&path));
    }

    #[test]
    fn rename_moves_the_directory() {
        let root = tempfile::TempDir::new().unwrap();
        let src = root.path().join("Old");
        let dst = root.path().join("New");
        create_with_pause(&src, Duration::from_millis(1)).unwrap();

        rename(&src, &dst).unwrap();
        assert!(!src.exists());
        assert!(exists(&dst));

        assert_matches!(Err(Error::NxMailbox), rename(&src, &dst));

        create_with_pause(&src, Duration::from_millis(1)).unwrap();
        assert_matches!(Err(Error::MailboxExists), rename(&src, &dst));
    }
}
