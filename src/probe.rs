use std::{fmt, time::Duration};

use async_trait::async_trait;
use reqwest::{
    Url,
    header::{ACCEPT, HeaderMap, HeaderValue, ORIGIN, RANGE, REFERER, USER_AGENT},
};

use crate::{classify::is_manifest, config::ProbePolicy};

pub mod http;
#[cfg(test)]
pub mod stub;

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// One way of checking whether a stream URL is playable
#[async_trait]
pub trait Prober: Send + Sync {
    /// Performs a single bounded attempt. Never mutates the channel being checked.
    async fn probe(&self, url: &Url, headers: &HeaderMap, timeout: Duration) -> ProbeOutcome;
}

/// Result of a single probe attempt, consumed right away by the classifier
#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    Http(HttpResponse),
    Decode(DecodeReport),
    Failed(ProbeFailure),
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    /// Raw `Access-Control-Allow-Origin` value
    pub allow_origin: Option<String>,
    pub content_type: Option<String>,
    /// Where the response was served from after any followed redirect
    pub final_url: Url,
    /// Only read for successful manifest candidates
    pub body: Option<String>,
}

impl HttpResponse {
    #[must_use]
    pub fn is_manifest(&self, requested: &Url) -> bool {
        is_manifest(requested, self.content_type.as_deref())
            || is_manifest(&self.final_url, None)
    }
}

#[derive(Debug, Clone)]
pub struct DecodeReport {
    pub exited_ok: bool,
    pub diagnostics: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    Aborted,
    Connect,
    Transport,
    Spawn,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Timeout => "timeout",
            Self::Aborted => "aborted",
            Self::Connect => "connect",
            Self::Transport => "transport",
            Self::Spawn => "spawn",
        })
    }
}

/// A probe that never produced a response
#[derive(Debug, Clone)]
pub struct ProbeFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ProbeFailure {
    pub fn new(kind: FailureKind, message: impl ToString) -> Self {
        Self {
            kind,
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn timeout(after: Duration) -> Self {
        Self::new(FailureKind::Timeout, format!("no response after {after:?}"))
    }

    #[must_use]
    pub fn aborted() -> Self {
        Self::new(FailureKind::Aborted, "probe cancelled")
    }
}

/// Headers a browser page served from the expected origin would send.
///
/// Manifests are requested whole; anything else only asks for the first `range_bytes`.
#[must_use]
pub fn request_headers(policy: &ProbePolicy, url: &Url) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));

    let origin = policy.primary_origin().trim_end_matches('/');
    if let Ok(value) = HeaderValue::from_str(origin) {
        headers.insert(ORIGIN, value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("{origin}/")) {
        headers.insert(REFERER, value);
    }

    if policy.range_bytes > 0 && !is_manifest(url, None) {
        if let Ok(value) = HeaderValue::from_str(&format!("bytes=0-{}", policy.range_bytes - 1)) {
            headers.insert(RANGE, value);
        }
    }

    headers
}
