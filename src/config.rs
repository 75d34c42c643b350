use std::time::Duration;

use anyhow::{Result, ensure};
use clap::ValueEnum;
use reqwest::header::HeaderValue;

pub const DEFAULT_PLAYLIST_URL: &str = "https://iptv-org.github.io/iptv/index.m3u";
pub const DEFAULT_ORIGIN: &str = "https://nelabuzov.github.io";

/// Redirects left unfollowed, plus the statuses a browser player can never recover from
pub const DEFAULT_FAIL_STATUSES: [u16; 10] = [301, 302, 303, 307, 308, 403, 404, 410, 451, 503];

/// What an unresolved (timeout / network error) probe becomes once retries are exhausted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum InconclusivePolicy {
    AssumeWorking,
    #[default]
    AssumeBroken,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum RedirectMode {
    /// Report 3xx responses as-is so they can be classified
    Manual,
    /// Follow redirects and classify the final response
    #[default]
    Follow,
}

/// Which probe executor checks the channels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Strategy {
    /// Browser-accurate HTTP probing (status, CORS, manifest following)
    #[default]
    Http,
    /// Decode a few seconds of the stream with ffmpeg
    Decode,
}

/// Process-wide probing policy. Built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct ProbePolicy {
    pub timeout: Duration,
    pub retries: u32,
    pub retry_delay: Duration,
    pub concurrency: usize,
    /// Front-end origins accepted in `Access-Control-Allow-Origin`. The first one is sent as `Origin`.
    pub origins: Vec<String>,
    pub fail_statuses: Vec<u16>,
    pub inconclusive: InconclusivePolicy,
    pub redirect_mode: RedirectMode,
    /// Size of the byte range requested for non-manifest resources, `0` disables ranged requests
    pub range_bytes: u64,
    pub progress_every: usize,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retries: 1,
            retry_delay: Duration::from_secs(1),
            concurrency: 50,
            origins: vec![DEFAULT_ORIGIN.to_string()],
            fail_statuses: DEFAULT_FAIL_STATUSES.to_vec(),
            inconclusive: InconclusivePolicy::default(),
            redirect_mode: RedirectMode::default(),
            range_bytes: 1024,
            progress_every: 100,
        }
    }
}

impl ProbePolicy {
    /// # Errors
    /// Errors when a knob is out of range or an origin cannot be sent as a header
    pub fn validate(&self) -> Result<()> {
        ensure!(self.concurrency >= 1, "Concurrency must be at least 1");
        ensure!(!self.timeout.is_zero(), "Probe timeout must be greater than 0");
        ensure!(self.progress_every >= 1, "Progress interval must be at least 1");
        ensure!(
            !self.origins.is_empty(),
            "At least one expected origin is required"
        );
        for origin in &self.origins {
            ensure!(
                HeaderValue::from_str(origin).is_ok(),
                "Origin {origin:?} is not a valid header value"
            );
        }

        Ok(())
    }

    #[must_use]
    pub fn primary_origin(&self) -> &str {
        self.origins.first().map_or(DEFAULT_ORIGIN, String::as_str)
    }

    #[must_use]
    pub fn is_fail_status(&self, status: u16) -> bool {
        self.fail_statuses.contains(&status)
    }
}
