// SPDX-FileCopyrightText: Copyright © 2024 ReaPack Authors
//
// SPDX-License-Identifier: MPL-2.0

//! The parsed content of a remote: an ordered tree of categories,
//! packages and versions. Children keep a back-reference to their parent's
//! name rather than an owning pointer, so the tree can be walked from any
//! node without a lifetime tying it to the root.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use url::Url;

use crate::path::RelPath;
use crate::version::VersionName;

pub use self::platform::Platform;

pub mod parse;
pub mod platform;

/// The kind of installable unit a [`Package`] is. Determines the install
/// root a [`Source`] with an implicit destination resolves under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackageType {
    Script,
    Extension,
    Effect,
    Data,
    Theme,
    LangPack,
    WebInterface,
}

impl PackageType {
    /// The directory under the installation root that owns this package
    /// type's files.
    pub fn install_root(&self) -> &'static str {
        match self {
            PackageType::Script => "Scripts",
            PackageType::Extension => "UserPlugins",
            PackageType::Effect => "Effects",
            PackageType::Data => "Data",
            PackageType::Theme => "ColorThemes",
            PackageType::LangPack => "LangPack",
            PackageType::WebInterface => "Data",
        }
    }

    /// Whether this type's destination is namespaced by remote and category,
    /// as scripts and effects are, or flat, as extensions and themes are.
    pub fn is_namespaced(&self) -> bool {
        matches!(self, PackageType::Script | PackageType::Effect | PackageType::Data)
    }
}

impl fmt::Display for PackageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PackageType::Script => "script",
            PackageType::Extension => "extension",
            PackageType::Effect => "effect",
            PackageType::Data => "data",
            PackageType::Theme => "theme",
            PackageType::LangPack => "langpack",
            PackageType::WebInterface => "webinterface",
        };
        f.write_str(name)
    }
}

impl FromStr for PackageType {
    type Err = UnknownPackageType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "script" => PackageType::Script,
            "extension" => PackageType::Extension,
            "effect" => PackageType::Effect,
            "data" => PackageType::Data,
            "theme" => PackageType::Theme,
            "langpack" => PackageType::LangPack,
            "webinterface" => PackageType::WebInterface,
            other => return Err(UnknownPackageType(other.to_owned())),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown package type: {0}")]
pub struct UnknownPackageType(pub String);

/// One platform-tagged download location for a [`Version`].
#[derive(Debug, Clone)]
pub struct Source {
    pub url: Url,
    pub platform: Platform,
    /// Explicit destination, relative to the package type's install root.
    pub file: Option<RelPath>,
    pub main: bool,
}

impl Source {
    /// Resolve this source's destination path, relative to the installation
    /// root, for a package belonging to `remote`/`category`/`package_name`.
    pub fn destination(&self, kind: PackageType, remote: &str, category: &str, package_name: &str) -> RelPath {
        let root = kind.install_root();

        if let Some(file) = &self.file {
            return if kind.is_namespaced() {
                RelPath::new([root, remote, category, file.as_str()])
            } else {
                RelPath::new([root, file.as_str()])
            };
        }

        let extension = self
            .url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .and_then(|last| last.rsplit_once('.'))
            .map(|(_, ext)| ext)
            .unwrap_or_default();

        let filename = if extension.is_empty() {
            package_name.to_owned()
        } else {
            format!("{package_name}.{extension}")
        };

        if kind.is_namespaced() {
            RelPath::new([root, remote, category, &filename])
        } else {
            RelPath::new([root, &filename])
        }
    }
}

/// One releasable state of a [`Package`].
#[derive(Debug, Clone)]
pub struct Version {
    pub name: VersionName,
    pub author: String,
    pub changelog: String,
    pub sources: Vec<Source>,
}

impl Version {
    /// The source matching `platform`, preferring an exact match over a
    /// generic fallback.
    pub fn source_for(&self, platform: Platform) -> Option<&Source> {
        self.sources
            .iter()
            .filter(|s| s.platform.matches(platform))
            .max_by_key(|s| !matches!(s.platform, Platform::Generic))
    }

    pub fn is_installable_on(&self, platform: Platform) -> bool {
        self.source_for(platform).is_some()
    }

    /// All destination paths this version would occupy on `platform`.
    pub fn destinations(&self, kind: PackageType, remote: &str, category: &str, package_name: &str, platform: Platform) -> Vec<RelPath> {
        self.sources
            .iter()
            .filter(|s| s.platform.matches(platform))
            .map(|s| s.destination(kind, remote, category, package_name))
            .collect()
    }
}

/// A named installable unit within a [`Category`].
#[derive(Debug, Clone)]
pub struct Package {
    pub name: String,
    pub kind: PackageType,
    /// Sorted newest-first.
    pub versions: Vec<Version>,
}

impl Package {
    pub fn latest(&self) -> Option<&Version> {
        self.versions.first()
    }

    pub fn latest_for(&self, platform: Platform) -> Option<&Version> {
        self.versions.iter().find(|v| v.is_installable_on(platform))
    }

    pub fn version(&self, name: &VersionName) -> Option<&Version> {
        self.versions.iter().find(|v| &v.name == name)
    }
}

/// An ordered group of [`Package`]s within an [`Index`].
#[derive(Debug, Clone)]
pub struct Category {
    pub name: String,
    pub packages: Vec<Package>,
}

/// The parsed content of a remote's index file.
#[derive(Debug, Clone)]
pub struct Index {
    pub name: String,
    pub categories: Vec<Category>,
}

impl Index {
    /// Iterate every (category, package) pair in document order.
    pub fn packages(&self) -> impl Iterator<Item = (&Category, &Package)> {
        self.categories.iter().flat_map(|c| c.packages.iter().map(move |p| (c, p)))
    }

    pub fn package(&self, category: &str, name: &str) -> Option<(&Category, &Package)> {
        self.packages().find(|(c, p)| c.name == category && p.name == name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn source(platform: Platform, file: Option<&str>) -> Source {
        Source {
            url: "https://example.org/a.lua".parse().unwrap(),
            platform,
            file: file.map(RelPath::from),
            main: false,
        }
    }

    #[test]
    fn implicit_destination_uses_package_name_and_url_extension() {
        let src = source(Platform::Generic, None);
        let dest = src.destination(PackageType::Script, "ReaTeam", "cat", "foo");
        assert_eq!(dest.as_str(), "Scripts/ReaTeam/cat/foo.lua");
    }

    #[test]
    fn explicit_destination_is_namespaced_for_scripts() {
        let src = source(Platform::Generic, Some("sub/foo.lua"));
        let dest = src.destination(PackageType::Script, "ReaTeam", "cat", "foo");
        assert_eq!(dest.as_str(), "Scripts/ReaTeam/cat/sub/foo.lua");
    }

    #[test]
    fn extensions_are_flat() {
        let src = source(Platform::Generic, Some("reaper_foo.so"));
        let dest = src.destination(PackageType::Extension, "ReaTeam", "cat", "foo");
        assert_eq!(dest.as_str(), "UserPlugins/reaper_foo.so");
    }

    #[test]
    fn version_selects_best_matching_source() {
        let version = Version {
            name: VersionName::parse("1.0"),
            author: "me".into(),
            changelog: String::new(),
            sources: vec![source(Platform::Generic, None), source(Platform::Linux64, Some("a.lua"))],
        };

        let selected = version.source_for(Platform::Linux64).unwrap();
        assert_eq!(selected.platform, Platform::Linux64);
    }

    #[test]
    fn version_with_no_matching_source_is_not_installable() {
        let version = Version {
            name: VersionName::parse("1.0"),
            author: "me".into(),
            changelog: String::new(),
            sources: vec![source(Platform::Win64, None)],
        };

        assert!(!version.is_installable_on(Platform::Linux64));
    }
}
