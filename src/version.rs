// SPDX-FileCopyrightText: Copyright © 2024 ReaPack Authors
//
// SPDX-License-Identifier: MPL-2.0

//! Version ordering for the package index.
//!
//! Index authors are not held to strict semver: `1.0`, `1.0.3`, `2.0rc1`
//! and `20150102` are all valid version names in the wild. [`VersionName`]
//! parses a version string into a sequence of (numeric, alphabetic) runs and
//! compares runs pairwise, which gives every pair of version strings a
//! well-defined, transitive order without rejecting anything as malformed.

use std::cmp::Ordering;
use std::fmt;

/// One comparable segment of a version string: the numeric prefix (if any)
/// plus whatever non-numeric text follows it, e.g. `"2"` -> `(2, "")`,
/// `"rc1"` -> `(0, "rc1")`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    number: u64,
    suffix: String,
}

impl Ord for Segment {
    fn cmp(&self, other: &Self) -> Ordering {
        self.number.cmp(&other.number).then_with(|| {
            // An empty suffix sorts after a non-empty one, so that plain
            // "1.0" is newer than a pre-release "1.0rc1".
            match (self.suffix.is_empty(), other.suffix.is_empty()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => self.suffix.cmp(&other.suffix),
            }
        })
    }
}

impl PartialOrd for Segment {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A totally-ordered, semver-ish version name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionName {
    raw: String,
    segments: Vec<Segment>,
}

impl VersionName {
    pub fn parse(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let segments = raw.split('.').map(parse_segment).collect();

        Self { raw, segments }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

fn parse_segment(part: &str) -> Segment {
    let digit_len = part.chars().take_while(|c| c.is_ascii_digit()).count();
    let number = part[..digit_len].parse().unwrap_or(0);
    let suffix = part[digit_len..].to_owned();

    Segment { number, suffix }
}

impl fmt::Display for VersionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.raw.fmt(f)
    }
}

impl PartialOrd for VersionName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionName {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.segments.len().max(other.segments.len());

        for i in 0..len {
            let a = self.segments.get(i).cloned().unwrap_or(Segment { number: 0, suffix: String::new() });
            let b = other.segments.get(i).cloned().unwrap_or(Segment { number: 0, suffix: String::new() });

            match a.cmp(&b) {
                Ordering::Equal => continue,
                ordering => return ordering,
            }
        }

        Ordering::Equal
    }
}
