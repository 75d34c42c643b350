use std::time::Duration;

use reqwest::{
    header::{HeaderMap, HeaderValue},
    redirect,
};
use rlimit::Resource;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RedirectMode;

/// Redirect hops a browser would still follow before giving up
const MAX_REDIRECTS: usize = 10;

/// Truncates a string to a maximum length, adding `...` to the end if it was truncated.
///
/// This function will continuously try to reduce length if string is being
/// truncated in the middle of a UTF codepoint
///
/// # Arguments
/// * `string` - The string to truncate
/// * `max_length` - The maximum length of the string, at least 3
#[must_use]
pub fn truncate_string(string: &impl ToString, max_length: usize) -> String {
    let string = string.to_string();
    if string.len() <= max_length {
        return string;
    }

    let mut end = max_length.saturating_sub(3);
    while !string.is_char_boundary(end) {
        end -= 1;
    }

    format!("{}...", &string[..end])
}

/// Every in-flight probe holds a socket (or an ffmpeg process), warn when the limit can't cover them
pub fn warn_ulimit(concurrency: usize) {
    let Ok((limit, _)) = rlimit::getrlimit(Resource::NOFILE) else {
        return;
    };

    let needed = u64::try_from(concurrency).unwrap_or(u64::MAX).saturating_mul(4);
    if limit < needed {
        warn!(
            "Your file limit ({limit}) is low for {concurrency} parallel probes and may cause connection errors. Consider raising it via `ulimit -n {needed}` or lowering --parallelism"
        );
    }
}

/// Client used to download the source playlist, identifies itself honestly
///
/// # Errors
/// Errors when the TLS backend cannot be initialised
pub fn init_http_client() -> reqwest::Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert(
        "User-Agent",
        HeaderValue::from_static(concat!(
            env!("CARGO_PKG_NAME"),
            "/",
            env!("CARGO_PKG_VERSION"),
            " (+",
            env!("CARGO_PKG_REPOSITORY"),
            ")"
        )),
    );

    reqwest::Client::builder()
        .default_headers(headers)
        .connect_timeout(Duration::from_secs(10))
        .build()
}

/// Client used for probing. Browser headers are set per request.
///
/// # Errors
/// Errors when the TLS backend cannot be initialised
pub fn init_probe_client(
    redirect_mode: RedirectMode,
    concurrency: usize,
) -> reqwest::Result<reqwest::Client> {
    let policy = match redirect_mode {
        RedirectMode::Manual => redirect::Policy::none(),
        RedirectMode::Follow => redirect::Policy::limited(MAX_REDIRECTS),
    };

    reqwest::Client::builder()
        .redirect(policy)
        .pool_max_idle_per_host(concurrency.min(32))
        .tcp_keepalive(Duration::from_secs(10))
        .build()
}

/// Spawn a task that watches for CTRL + C signal and cancels a [`CancellationToken`] when caught
pub fn spawn_ct_watcher(ct: CancellationToken) {
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Caught CTRL+C signal! Finishing with the channels probed so far");
        ct.cancel();
    });
}
