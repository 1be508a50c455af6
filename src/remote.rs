// SPDX-FileCopyrightText: Copyright © 2024 ReaPack Authors
//
// SPDX-License-Identifier: MPL-2.0

//! A named, URL-addressed repository and the in-memory set of configured
//! remotes, loaded from and persisted back to [`crate::config`].

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use url::Url;

use crate::config::{AutoInstall, Config, RemoteLine};

/// A remote's name. Two names that differ only in case refer to the same
/// remote.
#[derive(Debug, Clone, derive_more::Display)]
pub struct RemoteName(String);

impl RemoteName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for RemoteName {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for RemoteName {}

impl Hash for RemoteName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_ascii_lowercase().hash(state);
    }
}

impl PartialOrd for RemoteName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RemoteName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.to_ascii_lowercase().cmp(&other.0.to_ascii_lowercase())
    }
}

/// A named source of packages.
#[derive(Debug, Clone)]
pub struct Remote {
    pub name: RemoteName,
    pub url: Url,
    pub enabled: bool,
    /// Cannot be uninstalled or overwritten on import.
    pub protected: bool,
    pub auto_install: AutoInstall,
}

impl Remote {
    pub fn resolve_auto_install(&self, global_default: bool) -> bool {
        self.auto_install.resolve(global_default)
    }
}

impl fmt::Display for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.name.fmt(f)
    }
}

/// The configured set of remotes, keyed by case-insensitive name.
#[derive(Debug, Clone, Default)]
pub struct RemoteSet {
    remotes: HashMap<String, Remote>,
}

impl RemoteSet {
    pub fn from_config(config: &Config) -> Self {
        let mut set = Self::default();
        for line in &config.remotes {
            if let Ok(url) = line.url.parse() {
                set.insert(Remote {
                    name: RemoteName::new(line.name.clone()),
                    url,
                    enabled: line.enabled,
                    protected: line.protected,
                    auto_install: line.auto_install,
                });
            }
        }
        set
    }

    pub fn to_config_lines(&self) -> Vec<RemoteLine> {
        self.remotes
            .values()
            .map(|remote| RemoteLine {
                name: remote.name.as_str().to_owned(),
                url: remote.url.to_string(),
                enabled: remote.enabled,
                auto_install: remote.auto_install,
                protected: remote.protected,
            })
            .collect()
    }

    fn key(name: &str) -> String {
        name.to_ascii_lowercase()
    }

    /// Add or replace a remote. Returns `false` without changing anything
    /// when a protected remote already holds the name: protection also
    /// covers being overwritten by an import.
    pub fn insert(&mut self, remote: Remote) -> bool {
        if self.get(remote.name.as_str()).is_some_and(|existing| existing.protected) {
            return false;
        }

        self.remotes.insert(Self::key(remote.name.as_str()), remote);
        true
    }

    pub fn get(&self, name: &str) -> Option<&Remote> {
        self.remotes.get(&Self::key(name))
    }

    /// Remove a remote. Returns `Err` without mutating anything if the
    /// remote is protected.
    pub fn remove(&mut self, name: &str) -> Result<Option<Remote>, ProtectedError> {
        if let Some(remote) = self.get(name) {
            if remote.protected {
                return Err(ProtectedError(remote.name.as_str().to_owned()));
            }
        }

        Ok(self.remotes.remove(&Self::key(name)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Remote> {
        self.remotes.values()
    }

    pub fn enabled(&self) -> impl Iterator<Item = &Remote> {
        self.iter().filter(|r| r.enabled)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("remote `{0}` is protected")]
pub struct ProtectedError(pub String);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn remote_names_are_case_insensitive() {
        assert_eq!(RemoteName::new("ReaTeam"), RemoteName::new("reateam"));
    }

    #[test]
    fn protected_remote_cannot_be_removed() {
        let mut set = RemoteSet::default();
        set.insert(Remote {
            name: RemoteName::new("Core"),
            url: "https://example.org/index.xml".parse().unwrap(),
            enabled: true,
            protected: true,
            auto_install: AutoInstall::Inherit,
        });

        let result = set.remove("core");
        assert!(result.is_err());
        assert!(set.get("Core").is_some());
    }

    #[test]
    fn protected_remote_cannot_be_overwritten() {
        let mut set = RemoteSet::default();
        set.insert(Remote {
            name: RemoteName::new("Core"),
            url: "https://example.org/index.xml".parse().unwrap(),
            enabled: true,
            protected: true,
            auto_install: AutoInstall::Inherit,
        });

        let replaced = set.insert(Remote {
            name: RemoteName::new("core"),
            url: "https://evil.example/index.xml".parse().unwrap(),
            enabled: true,
            protected: false,
            auto_install: AutoInstall::Inherit,
        });

        assert!(!replaced);
        assert_eq!(set.get("Core").unwrap().url.as_str(), "https://example.org/index.xml");
    }

    #[test]
    fn unprotected_remote_can_be_removed() {
        let mut set = RemoteSet::default();
        set.insert(Remote {
            name: RemoteName::new("Core"),
            url: "https://example.org/index.xml".parse().unwrap(),
            enabled: true,
            protected: false,
            auto_install: AutoInstall::Inherit,
        });

        let removed = set.remove("Core").unwrap();
        assert!(removed.is_some());
        assert!(set.get("Core").is_none());
    }
}
