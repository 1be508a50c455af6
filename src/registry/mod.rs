// SPDX-FileCopyrightText: Copyright © 2024 ReaPack Authors
//
// SPDX-License-Identifier: MPL-2.0

//! The durable store of installed packages: which (remote, category,
//! package) triples are installed at which version, which files each one
//! owns, and the pinned flag. Writes made between [`Registry::savepoint`]
//! and [`Registry::restore`]/[`Registry::commit`] can be discarded as a
//! unit, which is how the transaction engine keeps conflict-detection
//! writes from leaking into the database when a task aborts.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use diesel::prelude::*;
use diesel::{Connection as _, ConnectionError, QueryableByName, SqliteConnection};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::trace;
use thiserror::Error;

use crate::index::{PackageType, UnknownPackageType};
use crate::path::RelPath;
use crate::version::VersionName;

mod schema;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("src/registry/migrations");

/// The name used for the single, reused savepoint a [`Registry`] exposes.
/// Nothing in this crate nests savepoints, so one fixed name is enough and
/// keeps the SQL readable in a trace log.
const SAVEPOINT: &str = "reapack";

#[derive(Clone)]
struct Connection(Arc<Mutex<SqliteConnection>>);

impl Connection {
    fn new(conn: SqliteConnection) -> Self {
        Self(Arc::new(Mutex::new(conn)))
    }

    fn exec<T>(&self, f: impl FnOnce(&mut SqliteConnection) -> T) -> T {
        let mut guard = self.0.lock().expect("registry connection mutex poisoned");
        f(&mut guard)
    }

    /// Run `f` under a private savepoint so its statements apply or revert
    /// as a unit. A plain `BEGIN` would fail here: the caller usually holds
    /// the registry's outer savepoint already, and sqlite rejects nested
    /// `BEGIN`s.
    fn write_tx<T>(
        &self,
        f: impl FnOnce(&mut SqliteConnection) -> Result<T, diesel::result::Error>,
    ) -> Result<T, diesel::result::Error> {
        self.exec(|conn| {
            diesel::sql_query("SAVEPOINT write_guard").execute(conn)?;

            match f(conn) {
                Ok(value) => {
                    diesel::sql_query("RELEASE SAVEPOINT write_guard").execute(conn)?;
                    Ok(value)
                }
                Err(err) => {
                    let _ = diesel::sql_query("ROLLBACK TO SAVEPOINT write_guard").execute(conn);
                    let _ = diesel::sql_query("RELEASE SAVEPOINT write_guard").execute(conn);
                    Err(err)
                }
            }
        })
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").finish()
    }
}

/// The installed state of one (remote, category, package) triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub id: i32,
    pub remote: String,
    pub category: String,
    pub package: String,
    pub kind: PackageType,
    pub version: VersionName,
    pub pinned: bool,
}

/// A file an [`Entry`] owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    pub entry_id: i32,
    pub path: RelPath,
    pub main: bool,
    pub section: Option<String>,
}

/// A destination path already owned by another entry, reported by
/// [`Registry::push`] instead of overwriting it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub path: RelPath,
    pub owner: Entry,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown package type stored in registry: {0}")]
    UnknownPackageType(#[from] UnknownPackageType),
    #[error(transparent)]
    Diesel(#[from] diesel::result::Error),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("registry migration failed: {0}")]
    Migration(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

pub struct Registry {
    conn: Connection,
}

impl Registry {
    /// Open (creating if necessary) the registry database at `path` and
    /// bring its schema up to date. `path` may be `:memory:` for tests.
    pub fn open(path: &Path) -> Result<Self, Error> {
        trace!("opening registry at {path:?}");

        let url = path.to_string_lossy();
        let mut conn = SqliteConnection::establish(&url)?;

        diesel::sql_query("PRAGMA foreign_keys = ON").execute(&mut conn)?;
        conn.run_pending_migrations(MIGRATIONS).map_err(Error::Migration)?;

        Ok(Registry { conn: Connection::new(conn) })
    }

    /// Open an in-memory registry, for tests and for a read-only
    /// installation where nothing should touch disk.
    pub fn open_in_memory() -> Result<Self, Error> {
        Self::open(Path::new(":memory:"))
    }

    /// Open a nested write boundary. Writes made after this call can be
    /// undone as a unit with [`Registry::restore`] without affecting
    /// whatever the caller did before calling `savepoint`.
    pub fn savepoint(&self) -> Result<(), Error> {
        self.conn.exec(|conn| diesel::sql_query(format!("SAVEPOINT {SAVEPOINT}")).execute(conn))?;
        Ok(())
    }

    /// Discard every write made since the last [`Registry::savepoint`] and
    /// close it. Rolling back alone would leave the savepoint open and keep
    /// later writes from ever reaching disk.
    pub fn restore(&self) -> Result<(), Error> {
        self.conn.exec(|conn| {
            diesel::sql_query(format!("ROLLBACK TO SAVEPOINT {SAVEPOINT}")).execute(conn)?;
            diesel::sql_query(format!("RELEASE SAVEPOINT {SAVEPOINT}")).execute(conn)
        })?;
        Ok(())
    }

    /// Persist every write made since the last [`Registry::savepoint`] and
    /// close it.
    pub fn commit(&self) -> Result<(), Error> {
        self.conn.exec(|conn| diesel::sql_query(format!("RELEASE SAVEPOINT {SAVEPOINT}")).execute(conn))?;
        Ok(())
    }

    pub fn get_entry(&self, remote: &str, category: &str, package: &str) -> Result<Option<Entry>, Error> {
        use schema::entries::dsl;

        self.conn.exec(|conn| {
            dsl::entries
                .filter(dsl::remote.eq(remote))
                .filter(dsl::category.eq(category))
                .filter(dsl::package.eq(package))
                .select(model::Entry::as_select())
                .first(conn)
                .optional()
        })?
        .map(map_entry)
        .transpose()
    }

    pub fn get_entry_by_id(&self, id: i32) -> Result<Option<Entry>, Error> {
        use schema::entries::dsl;

        self.conn
            .exec(|conn| dsl::entries.find(id).select(model::Entry::as_select()).first(conn).optional())?
            .map(map_entry)
            .transpose()
    }

    pub fn get_entries(&self, remote: &str) -> Result<Vec<Entry>, Error> {
        use schema::entries::dsl;

        self.conn
            .exec(|conn| dsl::entries.filter(dsl::remote.eq(remote)).select(model::Entry::as_select()).load(conn))?
            .into_iter()
            .map(map_entry)
            .collect()
    }

    pub fn get_files(&self, entry_id: i32) -> Result<Vec<File>, Error> {
        use schema::files::dsl;

        let rows: Vec<model::File> = self.conn.exec(|conn| {
            dsl::files.filter(dsl::entry_id.eq(entry_id)).select(model::File::as_select()).load(conn)
        })?;

        Ok(rows.into_iter().map(map_file).collect())
    }

    /// The file to register as a script's entry point: the one flagged
    /// `main`, or the entry's sole file if it owns exactly one.
    pub fn get_main_file(&self, entry_id: i32) -> Result<Option<RelPath>, Error> {
        let files = self.get_files(entry_id)?;

        if let Some(file) = files.iter().find(|f| f.main) {
            return Ok(Some(file.path.clone()));
        }

        match files.as_slice() {
            [only] => Ok(Some(only.path.clone())),
            _ => Ok(None),
        }
    }

    /// Record `(remote, category, package)` as installed at `version`,
    /// owning `destinations`. Fails without writing anything if any
    /// destination is already owned by a different (remote, category,
    /// package) triple. `pinned` carries the pin flag the task computed
    /// (preserved from the old entry on upgrade, or explicit on a fresh
    /// install).
    #[allow(clippy::too_many_arguments)]
    pub fn push(
        &self,
        remote: &str,
        category: &str,
        package: &str,
        kind: PackageType,
        version: &VersionName,
        pinned: bool,
        destinations: &[(RelPath, bool, Option<String>)],
    ) -> Result<Result<Entry, Vec<Conflict>>, Error> {
        Ok(self.conn.write_tx(|conn| -> Result<Result<Entry, Vec<Conflict>>, diesel::result::Error> {
            use schema::entries::dsl as e;
            use schema::files::dsl as f;

            let existing_id: Option<i32> = e::entries
                .filter(e::remote.eq(remote))
                .filter(e::category.eq(category))
                .filter(e::package.eq(package))
                .select(e::id)
                .first(conn)
                .optional()?;

            let mut conflicts = Vec::new();
            for (path, _, _) in destinations {
                let owner: Option<model::Entry> = f::files
                    .inner_join(e::entries.on(f::entry_id.eq(e::id)))
                    .filter(f::path.eq(path.as_str()))
                    .filter(e::id.ne(existing_id.unwrap_or(-1)))
                    .select(model::Entry::as_select())
                    .first(conn)
                    .optional()?;

                if let Some(owner) = owner {
                    let owner = map_entry(owner).map_err(|_| diesel::result::Error::RollbackTransaction)?;
                    conflicts.push(Conflict { path: path.clone(), owner });
                }
            }

            if !conflicts.is_empty() {
                return Ok(Err(conflicts));
            }

            let entry_id = if let Some(id) = existing_id {
                diesel::update(e::entries.find(id))
                    .set((e::kind.eq(kind.to_string()), e::version.eq(version.as_str()), e::pinned.eq(pinned)))
                    .execute(conn)?;
                diesel::delete(f::files.filter(f::entry_id.eq(id))).execute(conn)?;
                id
            } else {
                diesel::insert_into(e::entries)
                    .values((
                        e::remote.eq(remote),
                        e::category.eq(category),
                        e::package.eq(package),
                        e::kind.eq(kind.to_string()),
                        e::version.eq(version.as_str()),
                        e::pinned.eq(pinned),
                    ))
                    .execute(conn)?;

                last_insert_id(conn)?
            };

            let rows = destinations
                .iter()
                .map(|(path, main, section)| {
                    (f::entry_id.eq(entry_id), f::path.eq(path.as_str()), f::main.eq(*main), f::section.eq(section.clone()))
                })
                .collect::<Vec<_>>();

            diesel::insert_into(f::files).values(rows).execute(conn)?;

            Ok(Ok(Entry {
                id: entry_id,
                remote: remote.to_owned(),
                category: category.to_owned(),
                package: package.to_owned(),
                kind,
                version: version.clone(),
                pinned,
            }))
        })?)
    }

    /// Delete an entry and every file row it owns.
    pub fn forget(&self, entry_id: i32) -> Result<(), Error> {
        use schema::entries::dsl;

        self.conn.write_tx(|conn| diesel::delete(dsl::entries.find(entry_id)).execute(conn))?;
        Ok(())
    }

    /// The entry that owns `path`, if any.
    pub fn owner_of(&self, path: &RelPath) -> Result<Option<Entry>, Error> {
        use schema::entries::dsl as e;
        use schema::files::dsl as f;

        self.conn
            .exec(|conn| {
                f::files
                    .inner_join(e::entries.on(f::entry_id.eq(e::id)))
                    .filter(f::path.eq(path.as_str()))
                    .select(model::Entry::as_select())
                    .first(conn)
                    .optional()
            })?
            .map(map_entry)
            .transpose()
    }

    pub fn set_pinned(&self, entry_id: i32, pinned: bool) -> Result<(), Error> {
        use schema::entries::dsl;

        self.conn.exec(|conn| diesel::update(dsl::entries.find(entry_id)).set(dsl::pinned.eq(pinned)).execute(conn))?;
        Ok(())
    }
}

#[derive(QueryableByName)]
struct LastInsertId {
    #[diesel(sql_type = diesel::sql_types::Integer)]
    id: i32,
}

fn last_insert_id(conn: &mut SqliteConnection) -> Result<i32, diesel::result::Error> {
    diesel::sql_query("SELECT last_insert_rowid() AS id").get_result::<LastInsertId>(conn).map(|row| row.id)
}

fn map_entry(row: model::Entry) -> Result<Entry, Error> {
    Ok(Entry {
        id: row.id,
        remote: row.remote,
        category: row.category,
        package: row.package,
        kind: row.kind.parse()?,
        version: VersionName::parse(row.version),
        pinned: row.pinned,
    })
}

fn map_file(row: model::File) -> File {
    File { entry_id: row.entry_id, path: RelPath::from(row.path), main: row.main, section: row.section }
}

mod model {
    use diesel::prelude::*;

    pub use super::schema::{entries, files};

    #[derive(Queryable, Selectable)]
    #[diesel(table_name = entries)]
    pub struct Entry {
        pub id: i32,
        pub remote: String,
        pub category: String,
        pub package: String,
        pub kind: String,
        pub version: String,
        pub pinned: bool,
    }

    #[derive(Queryable, Selectable)]
    #[diesel(table_name = files)]
    pub struct File {
        pub entry_id: i32,
        pub path: String,
        pub main: bool,
        pub section: Option<String>,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn dest(path: &str) -> (RelPath, bool, Option<String>) {
        (RelPath::from(path), false, None)
    }

    #[test]
    fn push_then_get_entry_round_trips() {
        let registry = Registry::open_in_memory().unwrap();

        let entry = registry
            .push("ReaTeam", "Scripts", "hello", PackageType::Script, &VersionName::parse("1.0"), false, &[dest("Scripts/ReaTeam/Scripts/hello.lua")])
            .unwrap()
            .unwrap();

        let fetched = registry.get_entry("ReaTeam", "Scripts", "hello").unwrap().unwrap();
        assert_eq!(fetched.id, entry.id);
        assert_eq!(fetched.version.as_str(), "1.0");

        let files = registry.get_files(entry.id).unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn push_rejects_conflicting_path() {
        let registry = Registry::open_in_memory().unwrap();

        registry
            .push("R1", "Effects", "a", PackageType::Effect, &VersionName::parse("1.0"), false, &[dest("Effects/common/x.jsfx")])
            .unwrap()
            .unwrap();

        let result = registry
            .push("R2", "Effects", "b", PackageType::Effect, &VersionName::parse("1.0"), false, &[dest("Effects/common/x.jsfx")])
            .unwrap();

        let conflicts = result.unwrap_err();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].owner.remote, "R1");
    }

    #[test]
    fn savepoint_restore_discards_writes() {
        let registry = Registry::open_in_memory().unwrap();

        registry.savepoint().unwrap();
        registry
            .push("R", "Scripts", "p", PackageType::Script, &VersionName::parse("1.0"), false, &[dest("Scripts/R/p.lua")])
            .unwrap()
            .unwrap();
        registry.restore().unwrap();

        assert!(registry.get_entry("R", "Scripts", "p").unwrap().is_none());
    }

    #[test]
    fn savepoint_commit_persists_writes() {
        let registry = Registry::open_in_memory().unwrap();

        registry.savepoint().unwrap();
        registry
            .push("R", "Scripts", "p", PackageType::Script, &VersionName::parse("1.0"), false, &[dest("Scripts/R/p.lua")])
            .unwrap()
            .unwrap();
        registry.commit().unwrap();

        assert!(registry.get_entry("R", "Scripts", "p").unwrap().is_some());
    }

    #[test]
    fn forget_removes_entry_and_files() {
        let registry = Registry::open_in_memory().unwrap();

        let entry = registry
            .push("R", "Scripts", "p", PackageType::Script, &VersionName::parse("1.0"), false, &[dest("Scripts/R/p.lua")])
            .unwrap()
            .unwrap();

        registry.forget(entry.id).unwrap();

        assert!(registry.get_entry("R", "Scripts", "p").unwrap().is_none());
        assert!(registry.get_files(entry.id).unwrap().is_empty());
    }

    #[test]
    fn upgrade_preserves_pin_when_caller_passes_it_through() {
        let registry = Registry::open_in_memory().unwrap();

        let first = registry
            .push("R", "Scripts", "p", PackageType::Script, &VersionName::parse("1.0"), true, &[dest("Scripts/R/p.lua")])
            .unwrap()
            .unwrap();
        assert!(first.pinned);

        let upgraded = registry
            .push("R", "Scripts", "p", PackageType::Script, &VersionName::parse("1.1"), first.pinned, &[dest("Scripts/R/p.lua")])
            .unwrap()
            .unwrap();

        assert_eq!(upgraded.id, first.id);
        assert!(upgraded.pinned);
        assert_eq!(upgraded.version.as_str(), "1.1");
    }

    #[test]
    fn owner_of_finds_the_entry_holding_a_path() {
        let registry = Registry::open_in_memory().unwrap();

        let entry = registry
            .push("R", "Effects", "p", PackageType::Effect, &VersionName::parse("1.0"), false, &[dest("Effects/R/p/x.jsfx")])
            .unwrap()
            .unwrap();

        let owner = registry.owner_of(&RelPath::from("Effects/R/p/x.jsfx")).unwrap().unwrap();
        assert_eq!(owner.id, entry.id);
        assert!(registry.owner_of(&RelPath::from("Effects/nowhere.jsfx")).unwrap().is_none());
    }

    #[test]
    fn main_file_falls_back_to_sole_file() {
        let registry = Registry::open_in_memory().unwrap();

        let entry = registry
            .push("R", "Scripts", "p", PackageType::Script, &VersionName::parse("1.0"), false, &[dest("Scripts/R/p.lua")])
            .unwrap()
            .unwrap();

        assert_eq!(registry.get_main_file(entry.id).unwrap().unwrap().as_str(), "Scripts/R/p.lua");
    }
}
