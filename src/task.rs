// SPDX-FileCopyrightText: Copyright © 2024 ReaPack Authors
//
// SPDX-License-Identifier: MPL-2.0

//! The three units of work a [`crate::transaction::Transaction`] schedules.
//! Each implements the same three-phase contract: `start` stages without
//! touching the registry's committed state, `commit` applies it, `rollback`
//! undoes whatever `start` staged. A task that fails `start` or `commit`
//! marks itself failed so a second `commit`/`rollback` call is a no-op —
//! this is what lets the transaction call `rollback` unconditionally on
//! every task it cancels.

use std::path::PathBuf;

use crate::download::{Download, Kind as DownloadKind};
use crate::host::Section;
use crate::index::{PackageType, Platform, Version};
use crate::installation::Installation;
use crate::path::RelPath;
use crate::registry::{self, Conflict, Entry, File, Registry};
use crate::version::VersionName;

/// What a completed task did, for folding into the transaction receipt.
#[derive(Debug, Clone)]
pub enum Outcome {
    Install { entry: Entry, old_entry: Option<Entry>, restart_needed: bool },
    Remove { entry: Entry },
    Pin { entry_id: i32, pinned: bool },
}

/// A registration the host must apply once the registry commit that made it
/// valid has landed. Only script packages register today; the section names
/// which of the host's action lists the script lands in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ticket {
    RegisterScript { full_path: PathBuf, section: Section },
    UnregisterScript { full_path: PathBuf, section: Section },
}

#[derive(Debug, Clone)]
pub struct TaskError {
    pub message: String,
    pub title: String,
}

impl TaskError {
    pub(crate) fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self { title: title.into(), message: message.into() }
    }
}

/// Why a task phase did not complete. `Task` errors are recoverable: they
/// land in the receipt and only abort the offending task. `Registry` errors
/// are fatal to the whole transaction.
#[derive(Debug)]
pub enum Failure {
    Task(Vec<TaskError>),
    Registry(registry::Error),
}

impl From<registry::Error> for Failure {
    fn from(err: registry::Error) -> Self {
        Failure::Registry(err)
    }
}

/// Everything `commit` produced: the outcome for the receipt ticket list,
/// paths removed from disk, per-file recoverable errors, and the host
/// registrations to drain after the final registry commit.
#[derive(Debug, Default)]
pub struct Committed {
    pub outcome: Option<Outcome>,
    pub removed: Vec<RelPath>,
    pub errors: Vec<TaskError>,
    pub tickets: Vec<Ticket>,
}

struct PendingFile {
    target: RelPath,
    temp_path: PathBuf,
}

/// `Install(version, pin?, oldEntry?)`.
pub struct Install {
    pub remote: String,
    pub category: String,
    pub package: String,
    pub kind: PackageType,
    pub version: VersionName,
    /// `None` preserves the old entry's pin flag (or defaults to `false`
    /// for a fresh install); `Some` forces it.
    pub pin: Option<bool>,
    pub old_entry: Option<Entry>,

    destinations: Vec<(RelPath, bool, Option<String>)>,
    old_files: Vec<File>,
    pending: Vec<PendingFile>,
    new_files: Vec<(RelPath, PathBuf)>,
    failed: bool,
    started: bool,
}

impl Install {
    pub fn new(
        remote: impl Into<String>,
        category: impl Into<String>,
        package: impl Into<String>,
        kind: PackageType,
        version: &Version,
        platform: Platform,
        pin: Option<bool>,
        old_entry: Option<Entry>,
    ) -> Self {
        let remote = remote.into();
        let category = category.into();
        let package = package.into();

        let section = Section::from_category(&category);
        let destinations = version
            .sources
            .iter()
            .filter(|source| source.platform.matches(platform))
            .map(|source| {
                let path = source.destination(kind, &remote, &category, &package);
                let section = (source.main && kind == PackageType::Script).then(|| section.to_string());
                (path, source.main, section)
            })
            .collect();

        Install {
            remote,
            category,
            package,
            kind,
            version: version.name.clone(),
            pin,
            old_entry,
            destinations,
            old_files: Vec::new(),
            pending: Vec::new(),
            new_files: Vec::new(),
            failed: false,
            started: false,
        }
    }

    fn resolved_pin(&self) -> bool {
        self.pin.unwrap_or_else(|| self.old_entry.as_ref().map(|e| e.pinned).unwrap_or(false))
    }

    fn full_name(&self) -> String {
        format!("{}/{} v{}", self.category, self.package, self.version)
    }

    /// Record intent in the registry's savepoint and return the downloads
    /// to enqueue. Conflicting destinations abort the task with one error
    /// per path, without staging any download.
    pub fn start(
        &mut self,
        registry: &Registry,
        installation: &Installation,
        version: &Version,
        platform: Platform,
    ) -> Result<Vec<Download>, Failure> {
        self.started = true;

        // Capture the outgoing version's files before `push` overwrites
        // the entry's file rows.
        if let Some(old) = &self.old_entry {
            self.old_files = registry.get_files(old.id)?;
        }

        let pushed = registry.push(
            &self.remote,
            &self.category,
            &self.package,
            self.kind,
            &self.version,
            self.resolved_pin(),
            &self.destinations,
        )?;

        if let Err(conflicts) = pushed {
            self.failed = true;
            let title = self.full_name();
            return Err(Failure::Task(conflicts.iter().map(|c| conflict_error(c, &title)).collect()));
        }

        let sources = version.sources.iter().filter(|s| s.platform.matches(platform));
        let downloads = self
            .destinations
            .iter()
            .zip(sources)
            .map(|((target, _, _), source)| {
                let temp_path = target.staging().resolve(&installation.root);
                self.pending.push(PendingFile { target: target.clone(), temp_path: temp_path.clone() });
                Download::file(source.url.clone(), temp_path)
            })
            .collect();

        Ok(downloads)
    }

    /// Feed back one of this task's downloads once the pool has run it.
    /// Has no effect once the task has failed.
    pub fn apply_download(&mut self, download: &Download) {
        if self.failed {
            return;
        }

        let DownloadKind::File { target: temp_path } = &download.kind else { return };

        let Some(pos) = self.pending.iter().position(|p| &p.temp_path == temp_path) else { return };

        match download.state {
            crate::download::State::Success => {
                let pending = self.pending.remove(pos);
                self.old_files.retain(|f| f.path != pending.target);
                self.new_files.push((pending.target, pending.temp_path));
            }
            crate::download::State::Failure(_) => self.failed = true,
            crate::download::State::Aborted | crate::download::State::Idle | crate::download::State::Running => {}
        }
    }

    /// Rename every staged file into place, remove the files the new
    /// version no longer owns, and push the entry out of the savepoint. On
    /// rename failure the task rolls back and reports it; files renamed
    /// before the failure are left in place and the receipt signals the
    /// partial state.
    pub fn commit(&mut self, registry: &Registry, installation: &Installation) -> Result<Committed, Failure> {
        if self.failed || !self.started {
            return Err(Failure::Task(vec![TaskError::new(
                self.full_name(),
                "installation did not complete staging",
            )]));
        }

        let new_files = std::mem::take(&mut self.new_files);
        for (index, (target, temp_path)) in new_files.iter().enumerate() {
            let final_path = target.resolve(&installation.root);

            if let Err(err) = crate::path::atomic_rename(temp_path, &final_path) {
                let error = TaskError::new(target.to_string(), format!("cannot rename to target: {err}"));

                // Files renamed before this one stay in place; the receipt
                // signals the partial state. The rest is still staged and
                // gets cleaned up by the rollback.
                self.new_files = new_files[index..].to_vec();
                self.rollback();
                return Err(Failure::Task(vec![error]));
            }
        }

        let mut committed = Committed::default();
        let old_was_script = self.old_entry.as_ref().is_some_and(|e| e.kind == PackageType::Script);

        for old in std::mem::take(&mut self.old_files) {
            match crate::path::remove_recursive(&old.path.resolve(&installation.root)) {
                Ok(true) => committed.removed.push(old.path.clone()),
                Ok(false) => {}
                Err(err) => committed.errors.push(TaskError::new(old.path.to_string(), err.to_string())),
            }

            if old_was_script {
                committed.tickets.push(Ticket::UnregisterScript {
                    full_path: old.path.resolve(&installation.root),
                    section: old.section.as_deref().map(Section::parse).unwrap_or(Section::Main),
                });
            }
        }

        let entry = registry
            .push(&self.remote, &self.category, &self.package, self.kind, &self.version, self.resolved_pin(), &self.destinations)?
            .map_err(|conflicts| {
                let title = self.full_name();
                Failure::Task(conflicts.iter().map(|c| conflict_error(c, &title)).collect())
            })?;

        if let Some(ticket) = self.register_ticket(installation) {
            committed.tickets.push(ticket);
        }

        committed.outcome = Some(Outcome::Install {
            entry,
            old_entry: self.old_entry.clone(),
            restart_needed: matches!(self.kind, PackageType::Extension),
        });

        Ok(committed)
    }

    /// The host registration for the new entry's main file, if this is a
    /// script package.
    fn register_ticket(&self, installation: &Installation) -> Option<Ticket> {
        if self.kind != PackageType::Script {
            return None;
        }

        let main = self.destinations.iter().find(|(_, main, _)| *main).or_else(|| match self.destinations.as_slice() {
            [only] => Some(only),
            _ => None,
        })?;

        let (path, _, section) = main;
        Some(Ticket::RegisterScript {
            full_path: path.resolve(&installation.root),
            section: section.as_deref().map(Section::parse).unwrap_or(Section::Main),
        })
    }

    /// Delete every staged `.new` file. Marks the task failed so a later
    /// `commit` call becomes a no-op.
    pub fn rollback(&mut self) {
        for pending in self.pending.drain(..) {
            let _ = crate::path::remove_recursive(&pending.temp_path);
        }
        for (_, temp_path) in self.new_files.drain(..) {
            let _ = crate::path::remove_recursive(&temp_path);
        }
        self.failed = true;
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    /// True once every staged download has resolved (success or failure).
    pub fn staging_complete(&self) -> bool {
        self.pending.is_empty()
    }
}

fn conflict_error(conflict: &Conflict, title: &str) -> TaskError {
    TaskError::new(title, format!("conflict: '{}' is already owned by {}", conflict.path, conflict.owner.package))
}

/// `Remove(entry)`.
pub struct Remove {
    pub entry: Entry,
    files: Vec<File>,
}

impl Remove {
    pub fn new(entry: Entry) -> Self {
        Remove { entry, files: Vec::new() }
    }

    /// Snapshot the entry's files and forget it inside the current
    /// savepoint. The forget frees the entry's paths for conflict checks of
    /// later tasks; a cancel before commit reverts it.
    pub fn start(&mut self, registry: &Registry) -> Result<(), registry::Error> {
        self.files = registry.get_files(self.entry.id)?;
        registry.forget(self.entry.id)
    }

    /// Remove every owned file from disk and forget the entry again — the
    /// staging-phase forget was reverted with the rest of the savepoint
    /// before the commit phase began.
    pub fn commit(&self, registry: &Registry, installation: &Installation) -> Result<Committed, registry::Error> {
        let mut committed = Committed::default();

        for file in &self.files {
            match crate::path::remove_recursive(&file.path.resolve(&installation.root)) {
                Ok(true) => committed.removed.push(file.path.clone()),
                Ok(false) => continue,
                Err(err) => {
                    committed.errors.push(TaskError::new(file.path.to_string(), err.to_string()));
                    continue;
                }
            }

            if self.entry.kind == PackageType::Script {
                committed.tickets.push(Ticket::UnregisterScript {
                    full_path: file.path.resolve(&installation.root),
                    section: file.section.as_deref().map(Section::parse).unwrap_or(Section::Main),
                });
            }
        }

        registry.forget(self.entry.id)?;
        committed.outcome = Some(Outcome::Remove { entry: self.entry.clone() });

        Ok(committed)
    }

    /// No filesystem side effects were staged; the savepoint restore undoes
    /// the registry `forget`.
    pub fn rollback(&self) {}
}

/// `Pin(entry, bool)`.
pub struct Pin {
    pub entry_id: i32,
    pub pinned: bool,
}

impl Pin {
    pub fn new(entry_id: i32, pinned: bool) -> Self {
        Pin { entry_id, pinned }
    }

    pub fn commit(&self, registry: &Registry) -> Result<Committed, registry::Error> {
        registry.set_pinned(self.entry_id, self.pinned)?;

        Ok(Committed {
            outcome: Some(Outcome::Pin { entry_id: self.entry_id, pinned: self.pinned }),
            ..Committed::default()
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::index::Source;

    fn version(name: &str, url: &str) -> Version {
        Version {
            name: VersionName::parse(name),
            author: "me".into(),
            changelog: String::new(),
            sources: vec![Source { url: url.parse().unwrap(), platform: Platform::Generic, file: None, main: true }],
        }
    }

    #[test]
    fn install_start_stages_a_download_per_matching_source() {
        let registry = Registry::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let installation = Installation::open(dir.path());

        let version = version("1.0", "https://example.org/a.lua");
        let mut task = Install::new("R", "Scripts", "p", PackageType::Script, &version, Platform::Generic, None, None);

        let downloads = task.start(&registry, &installation, &version, Platform::Generic).unwrap();
        assert_eq!(downloads.len(), 1);
        assert!(!task.staging_complete());
    }

    #[test]
    fn install_conflict_reports_one_error_and_stages_nothing() {
        let registry = Registry::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let installation = Installation::open(dir.path());

        registry
            .push("Other", "Effects", "other", PackageType::Effect, &VersionName::parse("1.0"), false, &[(RelPath::from("Effects/common/x.jsfx"), false, None)])
            .unwrap()
            .unwrap();

        let version = Version {
            name: VersionName::parse("1.0"),
            author: "me".into(),
            changelog: String::new(),
            sources: vec![Source { url: "https://example.org/x.jsfx".parse().unwrap(), platform: Platform::Generic, file: Some(RelPath::from("x.jsfx")), main: true }],
        };

        let mut task = Install::new("R", "common", "mine", PackageType::Effect, &version, Platform::Generic, None, None);
        let result = task.start(&registry, &installation, &version, Platform::Generic);

        assert!(matches!(result, Err(Failure::Task(_))));
        assert!(task.failed());
    }

    #[test]
    fn upgrade_preserves_pin_by_default() {
        let registry = Registry::open_in_memory().unwrap();
        let old = registry
            .push("R", "Scripts", "p", PackageType::Script, &VersionName::parse("1.0"), true, &[(RelPath::from("Scripts/R/p.lua"), true, None)])
            .unwrap()
            .unwrap();

        let version = version("1.1", "https://example.org/p.lua");
        let task = Install::new("R", "Scripts", "p", PackageType::Script, &version, Platform::Generic, None, Some(old));

        assert!(task.resolved_pin());
    }

    #[test]
    fn script_main_destination_carries_its_section() {
        let version = version("1.0", "https://example.org/p.lua");
        let task = Install::new("R", "MIDI Editor/Utilities", "p", PackageType::Script, &version, Platform::Generic, None, None);

        assert_eq!(task.destinations[0].2.as_deref(), Some("midieditor"));
    }

    #[test]
    fn remove_commit_deletes_files_and_forgets_again() {
        let registry = Registry::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let installation = Installation::open(dir.path());

        let entry = registry
            .push("R", "Scripts", "p", PackageType::Script, &VersionName::parse("1.0"), false, &[(RelPath::from("Scripts/R/p.lua"), true, Some("main".into()))])
            .unwrap()
            .unwrap();

        let on_disk = dir.path().join("Scripts").join("R").join("p.lua");
        std::fs::create_dir_all(on_disk.parent().unwrap()).unwrap();
        std::fs::write(&on_disk, b"x").unwrap();

        // Staging happens inside a savepoint that is restored before the
        // commit phase, the way the transaction drives it.
        registry.savepoint().unwrap();
        let mut task = Remove::new(entry.clone());
        task.start(&registry).unwrap();
        registry.restore().unwrap();

        let committed = task.commit(&registry, &installation).unwrap();

        assert!(!on_disk.exists());
        assert_eq!(committed.removed.len(), 1);
        assert_eq!(committed.tickets.len(), 1);
        assert!(registry.get_entry("R", "Scripts", "p").unwrap().is_none());
    }
}
