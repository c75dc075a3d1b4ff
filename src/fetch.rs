//! Outbound HTTPS fetching with per-call deadlines.
//!
//! Every network call the verifier makes goes through here so that
//! cancellation propagates when the deadline elapses. No retries; callers
//! decide what a failure means.

use std::time::Duration;

use serde::de::DeserializeOwned;
use thiserror::Error;
use url::Url;

/// Failures from a timed fetch.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Deadline elapsed before the response completed.
    #[error("Request to {0} timed out")]
    Timeout(String),

    /// Transport-level failure (DNS, TLS, connect, read).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Non-2xx status from the upstream.
    #[error("HTTP {code}: {status_text}")]
    HttpStatus {
        /// Status code
        code: u16,
        /// Canonical reason phrase
        status_text: String,
    },
}

/// Build the HTTPS-only client shared by all verifier fetches.
///
/// The client-level timeout is a backstop; the effective deadline is the
/// per-call one passed to [`fetch_with_timeout`].
#[must_use]
pub fn build_client(deadline: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .https_only(true)
        .timeout(deadline)
        .build()
        .unwrap_or_default()
}

/// GET `url` with a hard deadline.
///
/// The in-flight request is dropped (and thereby cancelled) when the
/// deadline elapses.
///
/// # Errors
///
/// [`FetchError::Timeout`] on deadline, [`FetchError::Network`] on transport
/// failure.
pub async fn fetch_with_timeout(
    client: &reqwest::Client,
    url: &Url,
    deadline: Duration,
) -> Result<reqwest::Response, FetchError> {
    let fut = client.get(url.clone()).send();
    match tokio::time::timeout(deadline, fut).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => Err(FetchError::Network(e)),
        Err(_) => Err(FetchError::Timeout(url.to_string())),
    }
}

/// GET `url`, require a 2xx status, and deserialize the JSON body.
///
/// # Errors
///
/// [`FetchError::HttpStatus`] on non-2xx; otherwise as
/// [`fetch_with_timeout`]. Body parse failures surface as
/// [`FetchError::Network`].
pub async fn fetch_json_with_timeout<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &Url,
    deadline: Duration,
) -> Result<T, FetchError> {
    let response = fetch_with_timeout(client, url, deadline).await?;

    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::HttpStatus {
            code: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("unknown").to_string(),
        });
    }

    let body_fut = response.json::<T>();
    match tokio::time::timeout(deadline, body_fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(FetchError::Network(e)),
        Err(_) => Err(FetchError::Timeout(url.to_string())),
    }
}
