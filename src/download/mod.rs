// SPDX-FileCopyrightText: Copyright © 2024 ReaPack Authors
//
// SPDX-License-Identifier: MPL-2.0

//! A bounded concurrent fetcher. A [`Pool`] runs a batch of [`Download`]s
//! to completion, reusing one [`Transport`] across every worker and
//! reporting the arithmetic mean of their individual progress fractions
//! back to the caller. Cancellation is cooperative: [`Pool::cancel`] sets
//! a flag every in-flight fetch observes at its next chunk.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::stream::{self, StreamExt};
use log::debug;
use url::Url;

pub use self::transport::Transport;

pub mod transport;

/// Default worker count.
pub const DEFAULT_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Idle,
    Running,
    Success,
    Failure(String),
    Aborted,
}

/// Where a [`Download`]'s body ends up.
#[derive(Debug, Clone)]
pub enum Kind {
    /// Accumulated into an in-memory buffer, read back via [`Download::contents`].
    Memory,
    /// Streamed to `target` through a sibling `.part` file, atomically
    /// renamed into place on success.
    File { target: PathBuf },
}

/// One fetch, tracked through its whole lifecycle by a [`Pool`].
#[derive(Debug, Clone)]
pub struct Download {
    pub url: Url,
    pub kind: Kind,
    pub no_cache: bool,
    pub state: State,
    pub contents: Option<Vec<u8>>,
}

impl Download {
    pub fn memory(url: Url) -> Self {
        Self { url, kind: Kind::Memory, no_cache: false, state: State::Idle, contents: None }
    }

    pub fn file(url: Url, target: PathBuf) -> Self {
        Self { url, kind: Kind::File { target }, no_cache: false, state: State::Idle, contents: None }
    }

    pub fn with_no_cache(mut self) -> Self {
        self.no_cache = true;
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self.state, State::Success)
    }

    fn part_path(target: &std::path::Path) -> PathBuf {
        let mut part = target.as_os_str().to_owned();
        part.push(".part");
        PathBuf::from(part)
    }
}

/// A cloneable handle that requests cooperative cancellation of the pool
/// it came from. Each in-flight fetch observes it at its next chunk, so a
/// progress callback (or another thread) can interrupt a blocked
/// [`Pool::run`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A bounded worker pool sharing one [`Transport`].
#[derive(Debug, Clone)]
pub struct Pool {
    transport: Transport,
    concurrency: usize,
    cancelled: CancelToken,
}

impl Pool {
    pub fn new(transport: Transport) -> Self {
        Self::with_concurrency(transport, DEFAULT_CONCURRENCY)
    }

    pub fn with_concurrency(transport: Transport, concurrency: usize) -> Self {
        Self { transport, concurrency: concurrency.max(1), cancelled: CancelToken::default() }
    }

    /// Signal every in-flight fetch to abort at its next chunk and discard
    /// anything still pending. A pool is single-use after this: start a new
    /// one for further work.
    pub fn cancel(&self) {
        self.cancelled.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancelled.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_cancelled()
    }

    /// Run every download to a terminal state, bounded to this pool's
    /// worker count. Returns once the queue is empty and every in-flight
    /// fetch has terminated. `on_progress` receives the arithmetic mean
    /// completion fraction across currently running fetches after every
    /// chunk.
    pub async fn run(&self, downloads: Vec<Download>, on_progress: impl Fn(f64) + Send + Sync + 'static) -> Vec<Download> {
        if downloads.is_empty() {
            return downloads;
        }

        let progress: Arc<Mutex<HashMap<usize, f64>>> = Arc::new(Mutex::new(HashMap::new()));
        let on_progress = Arc::new(on_progress);
        let transport = self.transport.clone();
        let cancelled = self.cancelled.clone();

        let mut results = stream::iter(downloads.into_iter().enumerate())
            .map(|(index, download)| {
                let transport = transport.clone();
                let cancelled = cancelled.clone();
                let progress = progress.clone();
                let on_progress = on_progress.clone();

                async move {
                    if cancelled.is_cancelled() {
                        return (index, Download { state: State::Aborted, ..download });
                    }

                    let result = run_one(&transport, &cancelled, download, index, &progress, on_progress.as_ref()).await;
                    progress.lock().expect("progress mutex poisoned").remove(&index);
                    (index, result)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .await;

        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, download)| download).collect()
    }
}

async fn run_one(
    transport: &Transport,
    cancelled: &CancelToken,
    mut download: Download,
    index: usize,
    progress: &Arc<Mutex<HashMap<usize, f64>>>,
    on_progress: &(dyn Fn(f64) + Send + Sync),
) -> Download {
    download.state = State::Running;

    let url = download.url.clone();
    let no_cache = download.no_cache;
    debug!("fetching {url}");

    let part_path = match &download.kind {
        Kind::File { target } => Some(Download::part_path(target)),
        Kind::Memory => None,
    };

    let report = |current: u64, total: u64| {
        let fraction = if total > 0 { current as f64 / total as f64 } else { 0.0 };
        let mean = {
            let mut guard = progress.lock().expect("progress mutex poisoned");
            guard.insert(index, fraction);
            guard.values().sum::<f64>() / guard.len() as f64
        };
        on_progress(mean);
    };

    let fetch = transport.fetch(&url, no_cache, cancelled, report).await;

    match fetch {
        Ok(body) => match &download.kind {
            Kind::Memory => {
                download.contents = Some(body);
                download.state = State::Success;
            }
            Kind::File { target } => {
                let part = part_path.expect("file download has a part path");

                match tokio::task::spawn_blocking({
                    let part = part.clone();
                    move || std::fs::write(&part, &body)
                })
                .await
                .expect("join spawn_blocking")
                {
                    Ok(()) => match crate::path::atomic_rename(&part, target) {
                        Ok(()) => download.state = State::Success,
                        Err(err) => {
                            let _ = crate::path::remove_recursive(&part);
                            download.state = State::Failure(err.to_string());
                        }
                    },
                    Err(err) => download.state = State::Failure(err.to_string()),
                }
            }
        },
        Err(transport::Error::Aborted) => {
            if let Some(part) = &part_path {
                let _ = crate::path::remove_recursive(part);
            }
            download.state = State::Aborted;
        }
        Err(err) => {
            if let Some(part) = &part_path {
                let _ = crate::path::remove_recursive(part);
            }
            download.state = State::Failure(err.to_string());
        }
    }

    download
}
