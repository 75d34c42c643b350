use std::{io::ErrorKind, process::Stdio, time::Duration};

use async_trait::async_trait;
use reqwest::{
    Url,
    header::{HeaderMap, RANGE, USER_AGENT},
};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::probe::{DecodeReport, FailureKind, ProbeFailure, ProbeOutcome, Prober};

/// Checks if ffmpeg is installed / available in PATH
pub async fn is_installed() -> bool {
    debug!("Checking for ffmpeg installation");
    tokio::process::Command::new("ffmpeg")
        .arg("-version")
        .stderr(Stdio::null())
        .stdout(Stdio::null())
        .status()
        .await
        .is_ok_and(|s| s.success())
}

/// Decodes the first seconds of a stream with ffmpeg and reports its diagnostics.
///
/// Less browser-accurate than HTTP probing (no CORS), but accepts streams that only a
/// native player can read.
pub struct DecodeProber {
    sample: Duration,
    ct: CancellationToken,
}

impl DecodeProber {
    #[must_use]
    pub const fn new(sample: Duration, ct: CancellationToken) -> Self {
        Self { sample, ct }
    }

    fn args(&self, url: &Url, headers: &HeaderMap) -> Vec<String> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-nostdin".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
        ];

        if let Some(ua) = headers.get(USER_AGENT).and_then(|v| v.to_str().ok()) {
            args.extend(["-user_agent".to_string(), ua.to_string()]);
        }
        let extra = header_block(headers);
        if !extra.is_empty() {
            args.extend(["-headers".to_string(), extra]);
        }

        args.extend([
            "-i".to_string(),
            url.to_string(),
            "-t".to_string(),
            self.sample.as_secs().max(1).to_string(),
            "-c".to_string(),
            "copy".to_string(),
            "-f".to_string(),
            "null".to_string(),
            "-".to_string(),
        ]);
        args
    }
}

/// CRLF-separated header lines for `-headers`. User-Agent has its own flag and ffmpeg does its own ranging.
fn header_block(headers: &HeaderMap) -> String {
    headers
        .iter()
        .filter(|(name, _)| **name != USER_AGENT && **name != RANGE)
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| format!("{}: {v}\r\n", name.as_str()))
        })
        .collect()
}

#[async_trait]
impl Prober for DecodeProber {
    #[instrument(skip(self, headers))]
    async fn probe(&self, url: &Url, headers: &HeaderMap, timeout: Duration) -> ProbeOutcome {
        let child = match tokio::process::Command::new("ffmpeg")
            .args(self.args(url, headers))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return ProbeOutcome::Failed(ProbeFailure::new(
                    FailureKind::Spawn,
                    "`ffmpeg` is not installed or available in PATH!",
                ));
            }
            Err(e) => return ProbeOutcome::Failed(ProbeFailure::new(FailureKind::Spawn, e)),
        };

        // Dropping the wait future kills the child
        select! {
            biased;
            () = self.ct.cancelled() => ProbeOutcome::Failed(ProbeFailure::aborted()),
            res = tokio::time::timeout(timeout, child.wait_with_output()) => match res {
                Err(_) => ProbeOutcome::Failed(ProbeFailure::timeout(timeout)),
                Ok(Err(e)) => ProbeOutcome::Failed(ProbeFailure::new(FailureKind::Spawn, e)),
                Ok(Ok(out)) => ProbeOutcome::Decode(DecodeReport {
                    exited_ok: out.status.success(),
                    diagnostics: String::from_utf8_lossy(&out.stderr).into_owned(),
                }),
            }
        }
    }
}
