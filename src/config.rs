// SPDX-FileCopyrightText: Copyright © 2024 ReaPack Authors
//
// SPDX-License-Identifier: MPL-2.0

//! `ReaPack.ini`: a small INI-style file with a `[general]` section for
//! install options and a `[remotes]` section listing one remote per line.
//! Keys this crate doesn't recognize are preserved byte-for-byte so a newer
//! host (or a hand-edited file) round-trips cleanly through an older build.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;

/// Tri-state auto-install setting: a remote can inherit the global default,
/// or force it on/off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoInstall {
    #[default]
    Inherit,
    On,
    Off,
}

impl AutoInstall {
    fn parse(raw: &str) -> Self {
        match raw {
            "0" => AutoInstall::Off,
            "1" => AutoInstall::On,
            _ => AutoInstall::Inherit,
        }
    }

    fn encode(self) -> &'static str {
        match self {
            AutoInstall::Off => "0",
            AutoInstall::On => "1",
            AutoInstall::Inherit => "2",
        }
    }

    pub fn resolve(self, global_default: bool) -> bool {
        match self {
            AutoInstall::On => true,
            AutoInstall::Off => false,
            AutoInstall::Inherit => global_default,
        }
    }
}

/// The `[general]` section.
#[derive(Debug, Clone, Default)]
pub struct General {
    pub auto_install: bool,
    pub first_run: bool,
    /// `key = value` pairs this crate doesn't assign a field to, preserved
    /// in their original order.
    pub unknown: Vec<(String, String)>,
}

/// One line of the `[remotes]` section:
/// `name|url|enabled|autoinstall|protected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLine {
    pub name: String,
    pub url: String,
    pub enabled: bool,
    pub auto_install: AutoInstall,
    pub protected: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub general: General,
    pub remotes: Vec<RemoteLine>,
    /// Sections this crate doesn't know about, preserved verbatim as
    /// `(name, raw lines)`.
    pub unknown_sections: Vec<(String, Vec<String>)>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            // A missing file is a clean first run, not an error.
            Err(source) if source.kind() == io::ErrorKind::NotFound => {
                let mut config = Config::default();
                config.general.first_run = true;
                return Ok(config);
            }
            Err(source) => return Err(Error::Read(source)),
        };

        Ok(parse(&raw))
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(Error::Write)?;
        }

        fs::write(path, render(self)).map_err(Error::Write)
    }
}

fn parse(raw: &str) -> Config {
    let mut config = Config::default();
    let mut section = String::new();
    let mut unknown_lines: Vec<String> = Vec::new();

    let flush_unknown = |config: &mut Config, section: &str, lines: &mut Vec<String>| {
        if !section.is_empty() && !lines.is_empty() {
            config.unknown_sections.push((section.to_owned(), std::mem::take(lines)));
        }
    };

    for line in raw.lines() {
        let trimmed = line.trim();

        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            flush_unknown(&mut config, &section, &mut unknown_lines);
            section = trimmed[1..trimmed.len() - 1].to_owned();
            continue;
        }

        if trimmed.is_empty() || trimmed.starts_with(';') || trimmed.starts_with('#') {
            continue;
        }

        match section.as_str() {
            "general" => parse_general_line(&mut config.general, trimmed),
            "remotes" => {
                if let Some(remote) = parse_remote_line(trimmed) {
                    config.remotes.push(remote);
                }
            }
            _ => unknown_lines.push(line.to_owned()),
        }
    }

    flush_unknown(&mut config, &section, &mut unknown_lines);

    config
}

fn parse_general_line(general: &mut General, line: &str) {
    let Some((key, value)) = line.split_once('=') else { return };
    let (key, value) = (key.trim(), value.trim());

    match key {
        "auto_install" => general.auto_install = value == "1" || value == "true",
        "first_run" => general.first_run = value == "1" || value == "true",
        _ => general.unknown.push((key.to_owned(), value.to_owned())),
    }
}

fn parse_remote_line(line: &str) -> Option<RemoteLine> {
    let mut fields = line.splitn(5, '|');

    let name = fields.next()?.to_owned();
    let url = fields.next()?.to_owned();
    let enabled = fields.next().map(|f| f == "1" || f == "true").unwrap_or(true);
    let auto_install = fields.next().map(AutoInstall::parse).unwrap_or_default();
    let protected = fields.next().map(|f| f == "1" || f == "true").unwrap_or(false);

    Some(RemoteLine { name, url, enabled, auto_install, protected })
}

fn render(config: &Config) -> String {
    let mut out = String::new();

    out.push_str("[general]\n");
    out.push_str(&format!("auto_install={}\n", if config.general.auto_install { "1" } else { "0" }));
    out.push_str(&format!("first_run={}\n", if config.general.first_run { "1" } else { "0" }));
    for (key, value) in &config.general.unknown {
        out.push_str(&format!("{key}={value}\n"));
    }
    out.push('\n');

    out.push_str("[remotes]\n");
    for remote in &config.remotes {
        out.push_str(&format!(
            "{}|{}|{}|{}|{}\n",
            remote.name,
            remote.url,
            if remote.enabled { "1" } else { "0" },
            remote.auto_install.encode(),
            if remote.protected { "1" } else { "0" },
        ));
    }

    for (section, lines) in &config.unknown_sections {
        out.push('\n');
        out.push_str(&format!("[{section}]\n"));
        for line in lines {
            out.push_str(line);
            out.push('\n');
        }
    }

    out
}

impl fmt::Display for AutoInstall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encode())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("read config: {0}")]
    Read(#[source] io::Error),
    #[error("write config: {0}")]
    Write(#[source] io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn missing_file_is_a_clean_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("ReaPack.ini")).unwrap();
        assert!(config.remotes.is_empty());
        assert!(config.general.first_run);
    }

    #[test]
    fn parses_remotes_section() {
        let raw = "[general]\nauto_install=1\nfirst_run=1\n\n[remotes]\nReaTeam|https://reapack.com/index.xml|1|2|1\n";
        let config = parse(raw);

        assert!(config.general.auto_install);
        assert!(config.general.first_run);
        assert_eq!(config.remotes.len(), 1);
        assert_eq!(config.remotes[0].name, "ReaTeam");
        assert!(config.remotes[0].protected);
        assert_eq!(config.remotes[0].auto_install, AutoInstall::Inherit);
    }

    #[test]
    fn unknown_keys_round_trip() {
        let raw = "[general]\nauto_install=0\nfirst_run=0\nfuture_flag=42\n\n[remotes]\n\n[plugins]\nsome=thing\n";
        let config = parse(raw);
        let rendered = render(&config);
        let reparsed = parse(&rendered);

        assert_eq!(reparsed.general.unknown, vec![("future_flag".to_owned(), "42".to_owned())]);
        assert_eq!(reparsed.unknown_sections, vec![("plugins".to_owned(), vec!["some=thing".to_owned()])]);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ReaPack.ini");

        let mut config = Config::default();
        config.general.auto_install = true;
        config.remotes.push(RemoteLine {
            name: "ReaTeam".into(),
            url: "https://reapack.com/index.xml".into(),
            enabled: true,
            auto_install: AutoInstall::On,
            protected: false,
        });

        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();

        assert_eq!(loaded.remotes, config.remotes);
        assert!(loaded.general.auto_install);
    }
}
