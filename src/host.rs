// SPDX-FileCopyrightText: Copyright © 2024 ReaPack Authors
//
// SPDX-License-Identifier: MPL-2.0

//! The contract the core consumes from its embedding host: resource
//! locations, dialog/notification surfaces, and the action-registration
//! API scripts are exposed through. Out of scope: the host's own plugin
//! bootstrap and menu wiring — this module only defines what the core
//! calls, not how a real host answers.

use std::fmt;
use std::path::{Path, PathBuf};

/// One of REAPER's action-list sections a script can be registered into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    Main,
    MidiEditor,
    MidiEventListEditor,
    MediaExplorer,
}

impl Section {
    /// The section a script belongs to, derived from the first path
    /// component of its category name. Everything that isn't a recognized
    /// editor category lands in the main action list.
    pub fn from_category(category: &str) -> Self {
        let first = category.split('/').next().unwrap_or_default();

        if first.eq_ignore_ascii_case("midi editor") {
            Section::MidiEditor
        } else {
            Section::Main
        }
    }

    /// The inverse of [`Section::as_str`]; unrecognized names fall back to
    /// the main section rather than failing, since the registry may hold
    /// rows written by a newer build.
    pub fn parse(name: &str) -> Self {
        match name {
            "midieditor" => Section::MidiEditor,
            "midieventlisteditor" => Section::MidiEventListEditor,
            "mediaexplorer" => Section::MediaExplorer,
            _ => Section::Main,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Section::Main => "main",
            Section::MidiEditor => "midieditor",
            Section::MidiEventListEditor => "midieventlisteditor",
            Section::MediaExplorer => "mediaexplorer",
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Synchronous, must-not-fail utilities the core relies on for path
/// resolution and user notification, plus the one fallible call,
/// `add_remove_script`, whose failures become receipt errors.
pub trait Host {
    /// Absolute path to the host's resource root (the installation root).
    fn resource_path(&self) -> PathBuf;

    fn file_exists(&self, path: &Path) -> bool;

    fn recursive_create_directory(&self, path: &Path) -> std::io::Result<()>;

    fn show_message_box(&self, message: &str, title: &str);

    /// Register or unregister a script's entry point with the host.
    /// Returns `false` on failure; only failures while `add` is true are
    /// surfaced to the caller as a receipt error (removal failures are not
    /// actionable by the user per the install/remove contract).
    fn add_remove_script(&self, add: bool, section: Section, full_path: &Path) -> bool;

    fn named_command_lookup(&self, command_id: &str) -> Option<i32>;

    /// Register or unregister a non-script plugin hook (extensions,
    /// themes). `key` identifies the hook kind, e.g. `"API_ExtState"`.
    fn plugin_register(&self, add: bool, key: &str, value: &str) -> bool;
}
