// SPDX-FileCopyrightText: Copyright © 2024 ReaPack Authors
//
// SPDX-License-Identifier: MPL-2.0

//! The `platform` attribute of a `<source>` element, and the host platform
//! it is matched against.

use std::fmt;
use std::str::FromStr;

/// A platform constraint carried by a [`Source`](super::Source).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Generic,
    Win,
    Win32,
    Win64,
    Darwin,
    Darwin32,
    Darwin64,
    Linux,
    Linux32,
    Linux64,
}

impl Platform {
    /// The platform this binary is running on.
    pub fn host() -> Self {
        match (std::env::consts::OS, std::env::consts::ARCH) {
            ("windows", "x86_64") => Platform::Win64,
            ("windows", _) => Platform::Win32,
            ("macos", "x86_64") => Platform::Darwin64,
            ("macos", _) => Platform::Darwin32,
            ("linux", "x86_64") => Platform::Linux64,
            ("linux", _) => Platform::Linux32,
            _ => Platform::Generic,
        }
    }

    /// Whether a source tagged with `self` may be installed on `host`.
    pub fn matches(&self, host: Platform) -> bool {
        match self {
            Platform::Generic => true,
            Platform::Win => matches!(host, Platform::Win32 | Platform::Win64),
            Platform::Darwin => matches!(host, Platform::Darwin32 | Platform::Darwin64),
            Platform::Linux => matches!(host, Platform::Linux32 | Platform::Linux64),
            exact => *exact == host,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Platform::Generic => "generic",
            Platform::Win => "win",
            Platform::Win32 => "win32",
            Platform::Win64 => "win64",
            Platform::Darwin => "darwin",
            Platform::Darwin32 => "darwin32",
            Platform::Darwin64 => "darwin64",
            Platform::Linux => "linux",
            Platform::Linux32 => "linux32",
            Platform::Linux64 => "linux64",
        };
        f.write_str(name)
    }
}

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "all" | "generic" => Platform::Generic,
            "win" | "windows" => Platform::Win,
            "win32" | "windows32" => Platform::Win32,
            "win64" | "windows64" => Platform::Win64,
            "darwin" | "macos" => Platform::Darwin,
            "darwin32" | "macos32" => Platform::Darwin32,
            "darwin64" | "macos64" => Platform::Darwin64,
            "linux" => Platform::Linux,
            "linux32" => Platform::Linux32,
            "linux64" => Platform::Linux64,
            other => return Err(UnknownPlatform(other.to_owned())),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown platform: {0}")]
pub struct UnknownPlatform(pub String);
