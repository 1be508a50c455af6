// SPDX-FileCopyrightText: Copyright © 2024 ReaPack Authors
//
// SPDX-License-Identifier: MPL-2.0

//! Transaction engine, local registry, download pool and index model for a
//! REAPER-style package manager, independent of any particular host.
//!
//! The pieces compose bottom-up: [`path`] and [`version`] are leaf
//! utilities; [`index`] parses a remote's offerings on top of them;
//! [`registry`] is the durable record of what's installed; [`download`] is
//! the concurrent fetcher; [`task`] and [`transaction`] tie all of it
//! together into the unit the host actually drives. [`host`] is the
//! contract a host implements to receive registration callbacks; [`api`]
//! is the thin read-through surface a scripting bridge calls.

pub mod api;
pub mod config;
pub mod download;
pub mod host;
pub mod index;
pub mod installation;
pub mod path;
pub mod registry;
pub mod remote;
pub mod task;
pub mod transaction;
pub mod version;

pub use config::Config;
pub use download::{CancelToken, Download, Pool, Transport};
pub use host::{Host, Section};
pub use index::Index;
pub use installation::Installation;
pub use registry::{Entry, Registry};
pub use remote::{Remote, RemoteSet};
pub use transaction::{Receipt, Transaction};
pub use version::VersionName;
