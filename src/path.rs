// SPDX-FileCopyrightText: Copyright © 2024 ReaPack Authors
//
// SPDX-License-Identifier: MPL-2.0

//! Root-relative path arithmetic and the atomic filesystem primitives the
//! transaction engine builds on: staged `.new` files, atomic rename, and
//! recursive removal that tolerates a target that is already gone.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Suffix appended to a target path while its replacement is being staged.
const STAGING_SUFFIX: &str = ".new";

/// A path relative to an [`Installation`](crate::installation::Installation)
/// root, using forward slashes regardless of host platform.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display, derive_more::AsRef)]
#[as_ref(forward)]
pub struct RelPath(String);

impl RelPath {
    pub fn new(parts: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        let joined = parts
            .into_iter()
            .map(|p| p.as_ref().trim_matches('/').to_owned())
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join("/");

        Self(joined)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The path with the staging suffix appended to its final component.
    pub fn staging(&self) -> RelPath {
        RelPath(format!("{}{STAGING_SUFFIX}", self.0))
    }

    /// Resolve this path against an installation root.
    pub fn resolve(&self, root: &Path) -> PathBuf {
        root.join(&self.0)
    }
}

impl From<String> for RelPath {
    fn from(value: String) -> Self {
        RelPath(value.trim_matches('/').replace('\\', "/"))
    }
}

impl From<&str> for RelPath {
    fn from(value: &str) -> Self {
        RelPath::from(value.to_owned())
    }
}

/// Atomically replace `target` with `temp`, creating parent directories of
/// `target` as needed. On POSIX, `rename(2)` already replaces an existing
/// `target` atomically. On Windows, plain `rename` fails if `target` exists,
/// so a pre-existing `target` is first moved aside to `target.old` and
/// restored if the rename then fails; a leftover `.old` file after a crash
/// is safe to delete by hand (the rename that would have removed it never
/// completed).
pub fn atomic_rename(temp: &Path, target: &Path) -> Result<(), Error> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|source| Error::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    #[cfg(windows)]
    {
        rename_replacing_windows(temp, target)
    }
    #[cfg(not(windows))]
    {
        fs::rename(temp, target).map_err(|source| Error::Rename {
            from: temp.to_path_buf(),
            to: target.to_path_buf(),
            source,
        })
    }
}

#[cfg(windows)]
fn rename_replacing_windows(temp: &Path, target: &Path) -> Result<(), Error> {
    if !target.exists() {
        return fs::rename(temp, target).map_err(|source| Error::Rename {
            from: temp.to_path_buf(),
            to: target.to_path_buf(),
            source,
        });
    }

    let backup = {
        let mut name = target.as_os_str().to_owned();
        name.push(".old");
        PathBuf::from(name)
    };

    fs::rename(target, &backup).map_err(|source| Error::Rename { from: target.to_path_buf(), to: backup.clone(), source })?;

    match fs::rename(temp, target) {
        Ok(()) => {
            let _ = fs::remove_file(&backup);
            Ok(())
        }
        Err(source) => {
            let _ = fs::rename(&backup, target);
            Err(Error::Rename { from: temp.to_path_buf(), to: target.to_path_buf(), source })
        }
    }
}

/// Remove a file or directory tree, succeeding if it is already absent.
pub fn remove_recursive(path: &Path) -> Result<bool, Error> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(source) if source.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(source) => return Err(Error::Remove { path: path.to_path_buf(), source }),
    };

    let result = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    match result {
        Ok(()) => Ok(true),
        Err(source) if source.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(Error::Remove { path: path.to_path_buf(), source }),
    }
}

/// True if every component up to and including `path` exists.
pub fn exists(path: &Path) -> bool {
    path.symlink_metadata().is_ok()
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("create directory {path:?}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("rename {from:?} to {to:?}: {source}")]
    Rename { from: PathBuf, to: PathBuf, source: io::Error },
    #[error("remove {path:?}: {source}")]
    Remove { path: PathBuf, source: io::Error },
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn staging_suffix() {
        let path = RelPath::from("Scripts/foo/bar.lua");
        assert_eq!(path.staging().as_str(), "Scripts/foo/bar.lua.new");
    }

    #[test]
    fn rel_path_trims_separators() {
        let path = RelPath::new(["Scripts/", "/foo/", "bar.lua"]);
        assert_eq!(path.as_str(), "Scripts/foo/bar.lua");
    }

    #[test]
    fn remove_recursive_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(!remove_recursive(&missing).unwrap());
    }

    #[test]
    fn atomic_rename_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("src.new");
        fs::write(&temp, b"hello").unwrap();

        let target = dir.path().join("nested").join("dst");
        atomic_rename(&temp, &target).unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"hello");
        assert!(!temp.exists());
    }
}
