// SPDX-FileCopyrightText: Copyright © 2024 ReaPack Authors
//
// SPDX-License-Identifier: MPL-2.0

//! The HTTP client a [`super::Pool`] fetches through. A real `Transport` is
//! backed by a single shared [`reqwest::Client`] so every worker reuses its
//! connection pool, DNS cache and TLS session cache; tests use a canned
//! [`test::Fake`] instead so they don't need network access.

use std::time::Duration;

use once_cell::sync::Lazy;
use reqwest::header::{HeaderValue, CACHE_CONTROL};
use reqwest::redirect::Policy;
use thiserror::Error;
use url::Url;

use super::CancelToken;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const LOW_SPEED_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_REDIRECTS: usize = 5;

static CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::ClientBuilder::new()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(CONNECT_TIMEOUT)
        .redirect(Policy::limited(MAX_REDIRECTS))
        .build()
        .expect("build reqwest client")
});

#[derive(Debug, Error)]
pub enum Error {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("server returned {0}")]
    Status(reqwest::StatusCode),
    #[error("no data received for {0:?}")]
    LowSpeedTimeout(Duration),
    #[error("aborted")]
    Aborted,
}

/// Shared HTTP transport for the download pool.
#[derive(Debug, Clone)]
pub enum Transport {
    Live(reqwest::Client),
    #[cfg(test)]
    Test(test::Fake),
}

impl Transport {
    /// The process-wide shared client, reused by every `Pool`.
    pub fn live() -> Self {
        Transport::Live(CLIENT.clone())
    }

    /// Fetch `url`, calling `on_chunk(received, total)` as bytes arrive and
    /// checking `cancelled` between chunks so a long download can be
    /// interrupted mid-stream. `total` is `0` when the server doesn't send
    /// `Content-Length`.
    pub(crate) async fn fetch(
        &self,
        url: &Url,
        no_cache: bool,
        cancelled: &CancelToken,
        on_chunk: impl FnMut(u64, u64),
    ) -> Result<Vec<u8>, Error> {
        match self {
            Transport::Live(client) => fetch_live(client, url, no_cache, cancelled, on_chunk).await,
            #[cfg(test)]
            Transport::Test(fake) => fake.fetch(url, cancelled, on_chunk),
        }
    }
}

async fn fetch_live(
    client: &reqwest::Client,
    url: &Url,
    no_cache: bool,
    cancelled: &CancelToken,
    mut on_chunk: impl FnMut(u64, u64),
) -> Result<Vec<u8>, Error> {
    use futures_util::StreamExt;

    let mut request = client.get(url.clone());
    if no_cache {
        request = request.header(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    }

    let response = request.send().await?;
    let response = response.error_for_status().map_err(|err| match err.status() {
        Some(status) => Error::Status(status),
        None => Error::Request(err),
    })?;

    let total = response.content_length().unwrap_or(0);
    let mut received = 0u64;
    let mut body = Vec::with_capacity(total as usize);
    let mut stream = response.bytes_stream();

    loop {
        if cancelled.is_cancelled() {
            return Err(Error::Aborted);
        }

        let next = match tokio::time::timeout(LOW_SPEED_TIMEOUT, stream.next()).await {
            Ok(next) => next,
            Err(_) => return Err(Error::LowSpeedTimeout(LOW_SPEED_TIMEOUT)),
        };

        let Some(chunk) = next else { break };
        let chunk = chunk?;

        received += chunk.len() as u64;
        body.extend_from_slice(&chunk);
        on_chunk(received, total);
    }

    Ok(body)
}
