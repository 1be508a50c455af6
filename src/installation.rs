// SPDX-FileCopyrightText: Copyright © 2024 ReaPack Authors
//
// SPDX-License-Identifier: MPL-2.0

//! Layout of a local installation: where the registry, cached indexes and
//! package files live under the host's resource root.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::trace;

/// Whether the process has write access to the installation root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutability {
    ReadOnly,
    ReadWrite,
}

impl fmt::Display for Mutability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mutability::ReadOnly => "read-only".fmt(f),
            Mutability::ReadWrite => "read-write".fmt(f),
        }
    }
}

/// Resolves every path the transaction engine, registry and download pool
/// care about relative to the host's resource directory.
#[derive(Debug, Clone)]
pub struct Installation {
    pub root: PathBuf,
    pub mutability: Mutability,
}

impl Installation {
    /// Open an installation rooted at `root`, creating the `ReaPack/`
    /// bookkeeping directories if they don't already exist and the root is
    /// writable, and sweeping temp files a previous process left behind.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        let root = root.into();

        let mutability = if writable(&root) { Mutability::ReadWrite } else { Mutability::ReadOnly };

        trace!("installation root: {root:?} ({mutability})");

        if matches!(mutability, Mutability::ReadWrite) {
            ensure_dirs_exist(&root);
        }

        let installation = Self { root, mutability };

        if !installation.read_only() {
            clean_stale_temp_files(&installation);
        }

        installation
    }

    pub fn read_only(&self) -> bool {
        matches!(self.mutability, Mutability::ReadOnly)
    }

    fn reapack_path(&self, path: impl AsRef<Path>) -> PathBuf {
        self.root.join("ReaPack").join(path)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.reapack_path("Cache")
    }

    pub fn index_path(&self, remote: &str) -> PathBuf {
        self.cache_dir().join(format!("{remote}.xml"))
    }

    pub fn registry_path(&self) -> PathBuf {
        self.reapack_path("registry.db")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("ReaPack.ini")
    }
}

fn writable(root: &Path) -> bool {
    fs::metadata(root).map(|meta| !meta.permissions().readonly()).unwrap_or(false)
}

/// Remove stale `.tmp` files left behind by a previous process that did not
/// reach commit; called once at startup.
pub fn clean_stale_temp_files(installation: &Installation) {
    let Ok(entries) = fs::read_dir(installation.cache_dir()) else { return };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
            let _ = fs::remove_file(&path);
        }
    }
}

fn ensure_dirs_exist(root: &Path) {
    let _ = fs::create_dir_all(root.join("ReaPack").join("Cache"));
}
