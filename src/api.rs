// SPDX-FileCopyrightText: Copyright © 2024 ReaPack Authors
//
// SPDX-License-Identifier: MPL-2.0

//! The read-through surface the host's scripting bridge calls. Every
//! function here is a direct query against the [`Registry`] and the
//! configured [`RemoteSet`] except [`process_queue`], the only one that
//! opens a [`Transaction`].

use std::cmp::Ordering;

use crate::config::{AutoInstall, Config};
use crate::host::Host;
use crate::index::{Index, PackageType};
use crate::installation::Installation;
use crate::path::RelPath;
use crate::registry::{Entry, Error as RegistryError, File, Registry};
use crate::remote::{Remote, RemoteSet};
use crate::transaction::{self, Receipt, Transaction};
use crate::version::VersionName;

/// One row of a package-browser listing: an index entry joined against
/// whatever the registry knows about it, if anything.
#[derive(Debug, Clone)]
pub struct PackageListing<'a> {
    pub remote: &'a str,
    pub category: &'a str,
    pub package: &'a str,
    pub kind: PackageType,
    pub latest_version: &'a VersionName,
    pub installed: Option<Entry>,
}

/// List every package across `indexes`, joined against `registry` for
/// install state. `indexes` pairs each already-fetched [`Index`] with the
/// name of the remote it came from; fetching and caching indexes is the
/// caller's responsibility, the same as `synchronize` does internally.
pub fn browse_packages<'a>(registry: &Registry, indexes: &'a [(String, Index)]) -> Vec<PackageListing<'a>> {
    let mut rows = Vec::new();

    for (remote, index) in indexes {
        for (category, package) in index.packages() {
            let Some(latest) = package.latest() else { continue };
            let installed = registry.get_entry(remote, &category.name, &package.name).ok().flatten();

            rows.push(PackageListing {
                remote,
                category: &category.name,
                package: &package.name,
                kind: package.kind,
                latest_version: &latest.name,
                installed,
            });
        }
    }

    rows
}

/// Total order between two version strings, per [`VersionName`].
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    VersionName::parse(a).cmp(&VersionName::parse(b))
}

/// Synchronize `remotes_to_sync` and commit whatever work results. The
/// only API call that opens a [`Transaction`]. When everything was already
/// current, notifies the user through the host instead of returning a
/// report worth showing.
pub fn process_queue<H: Host>(
    registry: &Registry,
    installation: &Installation,
    remotes: &mut RemoteSet,
    host: &H,
    config: &Config,
    remotes_to_sync: &[String],
) -> Result<Receipt, transaction::Error> {
    let mut tx = Transaction::new(registry, installation, remotes, host, config.general.auto_install)?;

    for remote in remotes_to_sync {
        tx.synchronize(remote, AutoInstall::Inherit);
    }

    let receipt = tx.run_tasks()?;

    if receipt.enabled && receipt.is_empty() && !receipt.cancelled {
        host.show_message_box("Nothing to do!", "ReaPack");
    }

    Ok(receipt)
}

/// The installed entry and its owned files, or `None` if not installed.
pub fn about_installed_package(registry: &Registry, remote: &str, category: &str, package: &str) -> Result<Option<(Entry, Vec<File>)>, RegistryError> {
    let Some(entry) = registry.get_entry(remote, category, package)? else { return Ok(None) };
    let files = registry.get_files(entry.id)?;
    Ok(Some((entry, files)))
}

/// Every path an installed entry owns.
pub fn enum_owned_files(registry: &Registry, entry_id: i32) -> Result<Vec<RelPath>, RegistryError> {
    Ok(registry.get_files(entry_id)?.into_iter().map(|f| f.path).collect())
}

/// The installed entry by id, if any.
pub fn get_entry_info(registry: &Registry, entry_id: i32) -> Result<Option<Entry>, RegistryError> {
    registry.get_entry_by_id(entry_id)
}

/// The entry that owns `path`, if any.
pub fn get_owner(registry: &Registry, path: &RelPath) -> Result<Option<Entry>, RegistryError> {
    registry.owner_of(path)
}

/// The configured remote by name, if any.
pub fn about_repository<'a>(remotes: &'a RemoteSet, name: &str) -> Option<&'a Remote> {
    remotes.get(name)
}

/// The same lookup as [`about_repository`], kept as a distinct call because
/// the scripting bridge exposes it with its own return shape rather than
/// the full `Remote`.
pub fn get_repository_info(remotes: &RemoteSet, name: &str) -> Option<(String, bool, AutoInstall)> {
    remotes.get(name).map(|remote| (remote.url.to_string(), remote.enabled, remote.auto_install))
}

/// Add a new remote or replace the configured one with the same name.
/// Returns `false` when the name is held by a protected remote.
pub fn add_set_repository(remotes: &mut RemoteSet, remote: Remote) -> bool {
    remotes.insert(remote)
}
