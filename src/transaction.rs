// SPDX-FileCopyrightText: Copyright © 2024 ReaPack Authors
//
// SPDX-License-Identifier: MPL-2.0

//! Plans, schedules, commits and rolls back a batch of tasks against one
//! [`Registry`] savepoint. A `Transaction` is single-use: build one, issue
//! `synchronize`/`install`/`uninstall` calls, call `run_tasks` once, read
//! the [`Receipt`], and drop it.
//!
//! Registry writes made while planning (conflict-check pushes, removal
//! forgets) only exist to make later conflict checks see earlier tasks'
//! claims; `run_tasks` discards them all before the commit phase re-applies
//! the ones that survived. Database errors are fatal and propagate as
//! [`Error`]; everything else accumulates in the receipt.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use itertools::Itertools;
use log::{debug, warn};
use once_cell::sync::Lazy;
use thiserror::Error;
use tokio::runtime::Runtime;

use crate::config::AutoInstall;
use crate::download::{CancelToken, Download, Pool, Transport};
use crate::host::Host;
use crate::index::{self, Index, PackageType, Platform};
use crate::installation::Installation;
use crate::path::RelPath;
use crate::registry::{Entry, Registry};
use crate::remote::RemoteSet;
use crate::task::{Committed, Failure, Install, Outcome, Pin, Remove, TaskError, Ticket};

/// How stale a cached index may be before `synchronize` refetches it.
const FRESHNESS_WINDOW: Duration = Duration::from_secs(5);

/// The bridge from this crate's synchronous orchestration-thread API to the
/// download pool's async workers: one shared multi-thread runtime whose
/// worker threads are the fixed fetch pool. `block_on` keeps the calling
/// (orchestration) thread parked until the pool drains, so callers never
/// see `.await`.
static RUNTIME: Lazy<Runtime> =
    Lazy::new(|| tokio::runtime::Builder::new_multi_thread().worker_threads(4).enable_all().build().expect("build tokio runtime"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketKind {
    Install,
    Upgrade,
    Removal,
}

#[derive(Debug, Clone)]
pub struct ReceiptTicket {
    pub kind: TicketKind,
    pub entry: Entry,
    pub old_entry: Option<Entry>,
}

/// Everything a `Transaction` produced, shown to the user in a report
/// dialog unless empty.
#[derive(Debug, Clone, Default)]
pub struct Receipt {
    pub tickets: Vec<ReceiptTicket>,
    pub removed: Vec<RelPath>,
    pub errors: Vec<TaskError>,
    pub restart_needed: bool,
    /// Set as soon as any work is queued, so the UI can show "Nothing to
    /// do!" precisely when this is still `false` at the end.
    pub enabled: bool,
    pub cancelled: bool,
}

impl Receipt {
    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty() && self.removed.is_empty() && self.errors.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("registry error: {0}")]
    Registry(#[from] crate::registry::Error),
}

enum PendingTask {
    Install(Install),
    Remove(Remove),
    Pin(Pin),
}

struct SyncRequest {
    remote: String,
    auto_install: AutoInstall,
}

/// Owns the registry savepoint, staged tasks and download pool for one
/// batch of work.
pub struct Transaction<'a, H: Host> {
    registry: &'a Registry,
    installation: &'a Installation,
    remotes: &'a mut RemoteSet,
    host: &'a H,
    pool: Pool,
    /// The `[general] auto_install` flag, the last fallback of the
    /// tri-state resolution in [`Transaction::synchronize`].
    auto_install_default: bool,
    tasks: Vec<PendingTask>,
    sync_requests: Vec<SyncRequest>,
    /// Downloads staged by `install`, tagged with the owning task's index
    /// into `tasks` so `run_tasks` can route results back after the pool
    /// drains.
    queued_downloads: Vec<(usize, Download)>,
    inhibited: Vec<String>,
    progress: Option<Arc<dyn Fn(f64) + Send + Sync>>,
    receipt: Receipt,
}

impl<'a, H: Host> Transaction<'a, H> {
    pub fn new(
        registry: &'a Registry,
        installation: &'a Installation,
        remotes: &'a mut RemoteSet,
        host: &'a H,
        auto_install_default: bool,
    ) -> Result<Self, Error> {
        Self::with_transport(registry, installation, remotes, host, auto_install_default, Transport::live())
    }

    /// Like [`Transaction::new`] but fetching through the given transport
    /// instead of the shared live client.
    pub fn with_transport(
        registry: &'a Registry,
        installation: &'a Installation,
        remotes: &'a mut RemoteSet,
        host: &'a H,
        auto_install_default: bool,
        transport: Transport,
    ) -> Result<Self, Error> {
        registry.savepoint()?;

        Ok(Transaction {
            registry,
            installation,
            remotes,
            host,
            pool: Pool::new(transport),
            auto_install_default,
            tasks: Vec::new(),
            sync_requests: Vec::new(),
            queued_downloads: Vec::new(),
            inhibited: Vec::new(),
            progress: None,
            receipt: Receipt::default(),
        })
    }

    /// Receive the mean completion fraction of the running downloads after
    /// every chunk. Called from pool worker threads.
    pub fn on_progress(&mut self, callback: impl Fn(f64) + Send + Sync + 'static) {
        self.progress = Some(Arc::new(callback));
    }

    /// A handle that interrupts this transaction's downloads from another
    /// thread (or from the progress callback) while `run_tasks` is blocked
    /// on the pool.
    pub fn cancel_token(&self) -> CancelToken {
        self.pool.cancel_token()
    }

    pub fn is_cancelled(&self) -> bool {
        self.pool.is_cancelled()
    }

    /// Queue every package of `remote` for synchronization. The index is
    /// fetched once per distinct remote named across every `synchronize`
    /// call in this transaction, no matter how many times it's queued.
    ///
    /// `auto_install` controls whether packages with no registry entry are
    /// installed: `Inherit` falls through to the remote's configured
    /// tri-state, which falls through to the global default.
    pub fn synchronize(&mut self, remote: &str, auto_install: AutoInstall) {
        let Some(configured) = self.remotes.get(remote) else { return };
        if !configured.enabled {
            return;
        }

        // Show the report dialog (or "nothing to do") even if no task runs.
        self.receipt.enabled = true;

        self.sync_requests.push(SyncRequest { remote: configured.name.as_str().to_owned(), auto_install });
    }

    /// Stage an install of a specific version, bypassing freshness and
    /// auto-install checks. Used by synchronize's own expansion and by an
    /// explicit about-page install.
    pub fn install(
        &mut self,
        remote: &str,
        category: &str,
        package: &str,
        kind: PackageType,
        version: &index::Version,
        pin: Option<bool>,
    ) -> Result<(), Error> {
        self.receipt.enabled = true;

        let platform = Platform::host();
        let old_entry = self.registry.get_entry(remote, category, package)?;

        let mut task = Install::new(remote, category, package, kind, version, platform, pin, old_entry);

        match task.start(self.registry, self.installation, version, platform) {
            Ok(downloads) => {
                for download in &downloads {
                    if let crate::download::Kind::File { target } = &download.kind {
                        if let Some(parent) = target.parent() {
                            let _ = self.host.recursive_create_directory(parent);
                        }
                    }
                }

                self.queued_downloads.extend(downloads.into_iter().map(|d| (self.tasks.len(), d)));
                self.tasks.push(PendingTask::Install(task));
                Ok(())
            }
            Err(Failure::Task(errors)) => {
                self.receipt.errors.extend(errors);
                Ok(())
            }
            Err(Failure::Registry(err)) => Err(err.into()),
        }
    }

    /// Inhibit further registration from `remote`, drop its cached index,
    /// and queue Remove tasks for everything it owns. A protected remote is
    /// rejected outright: nothing is queued, the registry is untouched.
    pub fn uninstall(&mut self, remote: &str) -> Result<(), Error> {
        let Some(configured) = self.remotes.get(remote) else { return Ok(()) };
        if configured.protected {
            return Ok(());
        }
        let remote = configured.name.as_str().to_owned();

        self.inhibit(&remote);

        let index_path = self.installation.index_path(&remote);
        if let Err(err) = crate::path::remove_recursive(&index_path) {
            self.add_error(TaskError::new(remote.clone(), err.to_string()));
        }

        for entry in self.registry.get_entries(&remote)? {
            self.receipt.enabled = true;

            let mut task = Remove::new(entry);
            task.start(self.registry)?;
            self.tasks.push(PendingTask::Remove(task));
        }

        Ok(())
    }

    pub fn pin(&mut self, entry_id: i32, pinned: bool) {
        self.receipt.enabled = true;
        self.tasks.push(PendingTask::Pin(Pin::new(entry_id, pinned)));
    }

    /// Resolve queued `synchronize` calls against freshly fetched indexes,
    /// run every staged download, then commit or roll back depending on
    /// whether any task failed. Always ends with a fresh savepoint open so
    /// further work (or a subsequent `run_tasks`) has one to restore to.
    pub fn run_tasks(&mut self) -> Result<Receipt, Error> {
        match self.try_run() {
            Ok(receipt) => Ok(receipt),
            Err(err) => {
                // Fatal database error: undo whatever was staged and
                // surface the one error.
                self.cancel();
                Err(err)
            }
        }
    }

    fn try_run(&mut self) -> Result<Receipt, Error> {
        self.expand_sync_requests()?;

        // Discard every staging-phase registry write; the commit phase
        // re-applies the ones that survived. Conflict detection relied on
        // these writes being visible task-by-task until this point.
        self.registry.restore()?;
        self.registry.savepoint()?;

        let staged: Vec<(usize, Download)> = self.queued_downloads.drain(..).collect();
        let (owners, downloads): (Vec<usize>, Vec<Download>) = staged.into_iter().unzip();

        if !downloads.is_empty() {
            let results = self.run_pool(downloads);

            for (owner, download) in owners.into_iter().zip(results) {
                if let Some(PendingTask::Install(task)) = self.tasks.get_mut(owner) {
                    task.apply_download(&download);
                }
            }
        }

        if self.pool.is_cancelled() {
            return Ok(self.cancel());
        }

        self.finish()?;
        Ok(std::mem::take(&mut self.receipt))
    }

    /// Cancel every in-flight and pending download, roll back every task,
    /// and discard all registry writes made since the transaction opened.
    pub fn cancel(&mut self) -> Receipt {
        debug!("cancelling transaction");
        self.pool.cancel();

        for task in &mut self.tasks {
            match task {
                PendingTask::Install(task) => task.rollback(),
                PendingTask::Remove(task) => task.rollback(),
                PendingTask::Pin(_) => {}
            }
        }

        if let Err(err) = self.registry.restore().and_then(|()| self.registry.savepoint()) {
            warn!("failed to restore registry savepoint: {err}");
        }

        self.tasks.clear();
        self.queued_downloads.clear();

        let mut receipt = std::mem::take(&mut self.receipt);
        receipt.cancelled = true;
        receipt
    }

    fn run_pool(&self, downloads: Vec<Download>) -> Vec<Download> {
        let progress = self.progress.clone();

        RUNTIME.block_on(self.pool.run(downloads, move |fraction| {
            if let Some(callback) = &progress {
                callback(fraction);
            }
        }))
    }

    fn add_error(&mut self, error: TaskError) {
        self.receipt.enabled = true;
        self.receipt.errors.push(error);
    }

    fn is_inhibited(&self, remote: &str) -> bool {
        self.inhibited.iter().any(|r| r.eq_ignore_ascii_case(remote))
    }

    /// Prevents `remote`'s pending synchronize requests from expanding and
    /// its register tickets from reaching the host. Unregistration is not
    /// affected.
    fn inhibit(&mut self, remote: &str) {
        self.sync_requests.retain(|r| !r.remote.eq_ignore_ascii_case(remote));
        self.inhibited.push(remote.to_owned());
    }

    /// Commit every surviving task in acceptance order, persist the
    /// registry, then drain host registrations so the host never sees a
    /// partial state.
    fn finish(&mut self) -> Result<(), Error> {
        let tasks = std::mem::take(&mut self.tasks);
        let mut host_tickets: Vec<Ticket> = Vec::new();

        debug!("committing {} tasks", tasks.len());

        for task in tasks {
            match task {
                PendingTask::Install(mut task) => {
                    if task.failed() || !task.staging_complete() {
                        task.rollback();
                        continue;
                    }

                    let upgrade = task.old_entry.as_ref().is_some_and(|old| old.version < task.version);
                    let inhibited = self.is_inhibited(&task.remote);

                    match task.commit(self.registry, self.installation) {
                        Ok(committed) => {
                            self.absorb(committed, upgrade, inhibited, &mut host_tickets);
                        }
                        Err(Failure::Task(errors)) => self.receipt.errors.extend(errors),
                        Err(Failure::Registry(err)) => return Err(err.into()),
                    }
                }
                PendingTask::Remove(task) => {
                    let committed = task.commit(self.registry, self.installation)?;
                    self.absorb(committed, false, false, &mut host_tickets);
                }
                PendingTask::Pin(task) => {
                    let committed = task.commit(self.registry)?;
                    self.absorb(committed, false, false, &mut host_tickets);
                }
            }
        }

        self.registry.commit()?;
        self.registry.savepoint()?;

        self.drain_host_tickets(host_tickets);

        Ok(())
    }

    /// Fold one task's commit results into the receipt and the host ticket
    /// queue. Register tickets are dropped for inhibited remotes;
    /// unregister tickets always drain.
    fn absorb(&mut self, committed: Committed, upgrade: bool, inhibited: bool, host_tickets: &mut Vec<Ticket>) {
        self.receipt.removed.extend(committed.removed);
        self.receipt.errors.extend(committed.errors);

        for ticket in committed.tickets {
            if inhibited && matches!(ticket, Ticket::RegisterScript { .. }) {
                continue;
            }
            host_tickets.push(ticket);
        }

        match committed.outcome {
            Some(Outcome::Install { entry, old_entry, restart_needed }) => {
                self.receipt.restart_needed |= restart_needed;
                self.receipt.tickets.push(ReceiptTicket {
                    kind: if upgrade { TicketKind::Upgrade } else { TicketKind::Install },
                    entry,
                    old_entry,
                });
            }
            Some(Outcome::Remove { entry }) => {
                self.receipt.tickets.push(ReceiptTicket { kind: TicketKind::Removal, entry, old_entry: None });
            }
            Some(Outcome::Pin { .. }) | None => {}
        }
    }

    fn drain_host_tickets(&mut self, tickets: Vec<Ticket>) {
        for ticket in tickets {
            match ticket {
                Ticket::RegisterScript { full_path, section } => {
                    if !self.host.add_remove_script(true, section, &full_path) {
                        self.add_error(TaskError::new(
                            full_path.display().to_string(),
                            "script could not be registered in the host",
                        ));
                    }
                }
                Ticket::UnregisterScript { full_path, section } => {
                    self.host.add_remove_script(false, section, &full_path);
                }
            }
        }
    }

    fn expand_sync_requests(&mut self) -> Result<(), Error> {
        let requests = std::mem::take(&mut self.sync_requests);
        let platform = Platform::host();

        let mut indexes: HashMap<String, Index> = HashMap::new();
        for name in requests.iter().map(|r| r.remote.clone()).unique() {
            match self.fetch_index(&name) {
                Ok(index) => {
                    indexes.insert(name, index);
                }
                Err(error) => self.add_error(error),
            }
        }

        for request in requests {
            let Some(index) = indexes.get(&request.remote) else { continue };
            let Some(configured) = self.remotes.get(&request.remote) else { continue };
            let install_missing = request.auto_install.resolve(configured.resolve_auto_install(self.auto_install_default));

            for (category, package) in index.packages() {
                let Some(latest) = package.latest_for(platform) else { continue };
                let existing = self.registry.get_entry(&request.remote, &category.name, &package.name)?;

                match &existing {
                    None => {
                        if !install_missing {
                            continue;
                        }
                    }
                    Some(entry) => {
                        let up_to_date = entry.version == latest.name
                            && latest
                                .destinations(package.kind, &request.remote, &category.name, &package.name, platform)
                                .iter()
                                .all(|d| self.host.file_exists(&d.resolve(&self.installation.root)));

                        if up_to_date {
                            continue;
                        }
                    }
                }

                self.install(&request.remote, &category.name, &package.name, package.kind, latest, None)?;
            }
        }

        Ok(())
    }

    /// Fetch and parse `remote`'s index, reusing the on-disk cache if it is
    /// newer than [`FRESHNESS_WINDOW`]. Failures are per-remote and do not
    /// affect other remotes.
    fn fetch_index(&self, remote: &str) -> Result<Index, TaskError> {
        let cache_path = self.installation.index_path(remote);

        let age = std::fs::metadata(&cache_path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok());

        if age.is_some_and(|age| age < FRESHNESS_WINDOW) {
            let bytes = std::fs::read(&cache_path).map_err(|err| TaskError::new(remote, err.to_string()))?;
            return index::parse::parse(&bytes).map_err(|err| TaskError::new(remote, err.to_string()));
        }

        let configured = self.remotes.get(remote).ok_or_else(|| TaskError::new(remote, "unknown repository"))?;

        debug!("fetching index for {remote} from {}", configured.url);
        let download = Download::memory(configured.url.clone()).with_no_cache();
        let fetched = self
            .run_pool(vec![download])
            .into_iter()
            .next()
            .ok_or_else(|| TaskError::new(remote, "download queue returned nothing"))?;

        let bytes = match fetched.state {
            crate::download::State::Success => fetched.contents.unwrap_or_default(),
            crate::download::State::Failure(message) => return Err(TaskError::new(remote, message)),
            _ => return Err(TaskError::new(remote, "index download was cancelled")),
        };

        let index = index::parse::parse(&bytes).map_err(|err| TaskError::new(remote, err.to_string()))?;

        std::fs::write(&cache_path, &bytes).map_err(|err| {
            warn!("could not cache index for {remote}: {err}");
            TaskError::new(remote, err.to_string())
        })?;

        Ok(index)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::AutoInstall;
    use crate::download::transport::test::Fake;
    use crate::host::{test::RecordingHost, Section};
    use crate::index::Source;
    use crate::path::RelPath;
    use crate::remote::{Remote, RemoteName};
    use crate::version::VersionName;

    fn remote_set(name: &str, url: &str, protected: bool) -> RemoteSet {
        let mut set = RemoteSet::default();
        set.insert(Remote {
            name: RemoteName::new(name),
            url: url.parse().unwrap(),
            enabled: true,
            protected,
            auto_install: AutoInstall::Inherit,
        });
        set
    }

    fn script_index(remote: &str, category: &str, package: &str, versions: &[(&str, &str)]) -> String {
        let versions = versions
            .iter()
            .map(|(name, url)| {
                format!(
                    r#"<version name="{name}" author="me"><source platform="generic" main="true">{url}</source></version>"#
                )
            })
            .collect::<String>();

        format!(
            r#"<index version="1" name="{remote}"><category name="{category}"><reapack name="{package}" type="script">{versions}</reapack></category></index>"#
        )
    }

    fn version(name: &str, url: &str) -> index::Version {
        index::Version {
            name: VersionName::parse(name),
            author: "me".into(),
            changelog: String::new(),
            sources: vec![Source { url: url.parse().unwrap(), platform: Platform::Generic, file: None, main: true }],
        }
    }

    struct Fixture {
        registry: Registry,
        installation: Installation,
        remotes: RemoteSet,
        host: RecordingHost,
        _dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new(remotes: RemoteSet) -> Self {
            let dir = tempfile::tempdir().unwrap();
            Self {
                registry: Registry::open_in_memory().unwrap(),
                installation: Installation::open(dir.path()),
                remotes,
                host: RecordingHost::new(dir.path().to_path_buf()),
                _dir: dir,
            }
        }

        fn root(&self) -> &std::path::Path {
            &self.installation.root
        }

        fn transaction(&mut self, transport: Transport) -> Transaction<'_, RecordingHost> {
            Transaction::with_transport(&self.registry, &self.installation, &mut self.remotes, &self.host, false, transport)
                .unwrap()
        }
    }

    /// No `.new` or `.part` staging file anywhere under the root.
    fn assert_no_staging_leftovers(root: &std::path::Path) {
        let mut stack = vec![root.to_path_buf()];

        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else { continue };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    let name = path.file_name().unwrap().to_string_lossy().into_owned();
                    assert!(!name.ends_with(".new") && !name.ends_with(".part"), "staging leftover: {path:?}");
                }
            }
        }
    }

    #[test]
    fn fresh_install_of_one_script() {
        let mut fx = Fixture::new(remote_set("R", "https://example.org/index.xml", false));
        let transport = Fake::builder()
            .respond("https://example.org/index.xml", script_index("R", "Tools", "hello", &[("1.0", "https://example.org/hello.lua")]))
            .respond("https://example.org/hello.lua", *b"print(1)")
            .build();

        let receipt = {
            let mut tx = fx.transaction(transport);
            tx.synchronize("R", AutoInstall::On);
            tx.run_tasks().unwrap()
        };

        let installed = fx.root().join("Scripts").join("R").join("Tools").join("hello.lua");
        assert_eq!(std::fs::read(&installed).unwrap(), b"print(1)");
        assert_no_staging_leftovers(fx.root());

        let entry = fx.registry.get_entry("R", "Tools", "hello").unwrap().unwrap();
        assert_eq!(entry.version.as_str(), "1.0");

        assert_eq!(receipt.tickets.len(), 1);
        assert_eq!(receipt.tickets[0].kind, TicketKind::Install);
        assert!(receipt.enabled);

        let calls = fx.host.script_calls.borrow();
        assert_eq!(calls.as_slice(), &[(true, Section::Main, installed)]);
    }

    #[test]
    fn upgrade_keeps_pin() {
        let mut fx = Fixture::new(remote_set("R", "https://example.org/index.xml", false));
        fx.registry
            .push(
                "R",
                "Tools",
                "hello",
                PackageType::Script,
                &VersionName::parse("1.0"),
                true,
                &[(RelPath::from("Scripts/R/Tools/hello.lua"), true, Some("main".into()))],
            )
            .unwrap()
            .unwrap();

        let transport = Fake::builder()
            .respond(
                "https://example.org/index.xml",
                script_index("R", "Tools", "hello", &[("1.1", "https://example.org/hello-1.1.lua"), ("1.0", "https://example.org/hello.lua")]),
            )
            .respond("https://example.org/hello-1.1.lua", *b"print(2)")
            .build();

        let receipt = {
            let mut tx = fx.transaction(transport);
            tx.synchronize("R", AutoInstall::Inherit);
            tx.run_tasks().unwrap()
        };

        let entry = fx.registry.get_entry("R", "Tools", "hello").unwrap().unwrap();
        assert_eq!(entry.version.as_str(), "1.1");
        assert!(entry.pinned);

        assert_eq!(receipt.tickets.len(), 1);
        assert_eq!(receipt.tickets[0].kind, TicketKind::Upgrade);
    }

    #[test]
    fn conflict_aborts_one_task_and_leaves_the_owner_alone() {
        let mut fx = Fixture::new(remote_set("R2", "https://example.org/r2.xml", false));
        fx.registry
            .push(
                "R1",
                "Extensions",
                "reaper_x",
                PackageType::Extension,
                &VersionName::parse("1.0"),
                false,
                &[(RelPath::from("UserPlugins/reaper_x.so"), false, None)],
            )
            .unwrap()
            .unwrap();

        let owned = fx.root().join("UserPlugins").join("reaper_x.so");
        std::fs::create_dir_all(owned.parent().unwrap()).unwrap();
        std::fs::write(&owned, b"original").unwrap();

        let transport = Fake::builder().respond("https://example.org/reaper_x.so", *b"intruder").build();

        let receipt = {
            let mut tx = fx.transaction(transport);
            let version = index::Version {
                name: VersionName::parse("1.0"),
                author: "me".into(),
                changelog: String::new(),
                sources: vec![Source {
                    url: "https://example.org/reaper_x.so".parse().unwrap(),
                    platform: Platform::Generic,
                    file: Some(RelPath::from("reaper_x.so")),
                    main: false,
                }],
            };
            tx.install("R2", "Extensions", "reaper_x", PackageType::Extension, &version, None).unwrap();
            tx.run_tasks().unwrap()
        };

        assert_eq!(receipt.errors.len(), 1);
        assert!(receipt.errors[0].message.contains("reaper_x.so"));
        assert!(receipt.tickets.is_empty());

        // The first owner's file and registry row are untouched.
        assert_eq!(std::fs::read(&owned).unwrap(), b"original");
        let owner = fx.registry.owner_of(&RelPath::from("UserPlugins/reaper_x.so")).unwrap().unwrap();
        assert_eq!(owner.remote, "R1");
    }

    #[test]
    fn cancel_mid_download_leaves_no_trace() {
        let mut fx = Fixture::new(remote_set("R", "https://example.org/index.xml", false));
        let transport = Fake::builder()
            .respond("https://example.org/a.lua", *b"a")
            .respond("https://example.org/b.lua", *b"b")
            .respond("https://example.org/c.lua", *b"c")
            .build();

        let receipt = {
            let mut tx = fx.transaction(transport);

            for (package, url) in [("a", "https://example.org/a.lua"), ("b", "https://example.org/b.lua"), ("c", "https://example.org/c.lua")] {
                let version = version("1.0", url);
                tx.install("R", "Tools", package, PackageType::Script, &version, None).unwrap();
            }

            // The first chunk of the first download to run cancels the rest.
            let token = tx.cancel_token();
            tx.on_progress(move |_| token.cancel());

            tx.run_tasks().unwrap()
        };

        assert!(receipt.cancelled);
        assert_no_staging_leftovers(fx.root());
        for package in ["a", "b", "c"] {
            assert!(!fx.root().join("Scripts").join("R").join("Tools").join(format!("{package}.lua")).exists());
            assert!(fx.registry.get_entry("R", "Tools", package).unwrap().is_none());
        }
    }

    #[test]
    fn uninstall_of_protected_remote_is_rejected() {
        let mut fx = Fixture::new(remote_set("R", "https://example.org/index.xml", true));

        let receipt = {
            let mut tx = fx.transaction(Fake::builder().build());
            tx.uninstall("R").unwrap();
            tx.run_tasks().unwrap()
        };

        assert!(!receipt.enabled);
        assert!(receipt.errors.is_empty());
    }

    #[test]
    fn uninstall_removes_files_and_suppresses_registration() {
        let mut fx = Fixture::new(remote_set("R", "https://example.org/index.xml", false));
        fx.registry
            .push(
                "R",
                "Tools",
                "hello",
                PackageType::Script,
                &VersionName::parse("1.0"),
                false,
                &[(RelPath::from("Scripts/R/Tools/hello.lua"), true, Some("main".into()))],
            )
            .unwrap()
            .unwrap();

        let on_disk = fx.root().join("Scripts").join("R").join("Tools").join("hello.lua");
        std::fs::create_dir_all(on_disk.parent().unwrap()).unwrap();
        std::fs::write(&on_disk, b"x").unwrap();

        let receipt = {
            let mut tx = fx.transaction(Fake::builder().build());
            tx.uninstall("R").unwrap();
            tx.run_tasks().unwrap()
        };

        assert!(!on_disk.exists());
        assert!(fx.registry.get_entry("R", "Tools", "hello").unwrap().is_none());
        assert_eq!(receipt.removed, vec![RelPath::from("Scripts/R/Tools/hello.lua")]);

        // Only the unregistration reached the host.
        let calls = fx.host.script_calls.borrow();
        assert_eq!(calls.len(), 1);
        assert!(!calls[0].0);
    }

    #[test]
    fn synchronize_is_a_no_op_when_everything_is_current() {
        let mut fx = Fixture::new(remote_set("R", "https://example.org/index.xml", false));
        fx.registry
            .push(
                "R",
                "Tools",
                "hello",
                PackageType::Script,
                &VersionName::parse("1.0"),
                false,
                &[(RelPath::from("Scripts/R/Tools/hello.lua"), true, Some("main".into()))],
            )
            .unwrap()
            .unwrap();

        let on_disk = fx.root().join("Scripts").join("R").join("Tools").join("hello.lua");
        std::fs::create_dir_all(on_disk.parent().unwrap()).unwrap();
        std::fs::write(&on_disk, b"print(1)").unwrap();

        let transport = Fake::builder()
            .respond("https://example.org/index.xml", script_index("R", "Tools", "hello", &[("1.0", "https://example.org/hello.lua")]))
            .build();

        let receipt = {
            let mut tx = fx.transaction(transport);
            tx.synchronize("R", AutoInstall::Inherit);
            tx.run_tasks().unwrap()
        };

        assert!(receipt.is_empty());
        assert!(receipt.enabled);
        assert!(fx.host.script_calls.borrow().is_empty());
    }

    #[test]
    fn pin_marks_the_entry_without_touching_files() {
        let mut fx = Fixture::new(remote_set("R", "https://example.org/index.xml", false));
        let entry = fx
            .registry
            .push(
                "R",
                "Tools",
                "hello",
                PackageType::Script,
                &VersionName::parse("1.0"),
                false,
                &[(RelPath::from("Scripts/R/Tools/hello.lua"), true, Some("main".into()))],
            )
            .unwrap()
            .unwrap();

        let receipt = {
            let mut tx = fx.transaction(Fake::builder().build());
            tx.pin(entry.id, true);
            tx.run_tasks().unwrap()
        };

        assert!(receipt.enabled);
        assert!(fx.registry.get_entry_by_id(entry.id).unwrap().unwrap().pinned);
        assert!(fx.host.script_calls.borrow().is_empty());
    }

    #[test]
    fn index_failure_is_reported_per_remote() {
        let mut fx = Fixture::new(remote_set("R", "https://example.org/index.xml", false));
        let transport = Fake::builder().fail("https://example.org/index.xml").build();

        let receipt = {
            let mut tx = fx.transaction(transport);
            tx.synchronize("R", AutoInstall::On);
            tx.run_tasks().unwrap()
        };

        assert_eq!(receipt.errors.len(), 1);
        assert_eq!(receipt.errors[0].title, "R");
        assert!(receipt.enabled);
    }
}
