use reqwest::Url;

use crate::{
    config::{InconclusivePolicy, ProbePolicy},
    probe::{DecodeReport, HttpResponse, ProbeOutcome},
};

pub const NO_CORS: &str = "no-cors";

/// Lowercased decoder diagnostics that mean the stream is definitely unusable
pub const FATAL_DECODE_PATTERNS: &[&str] = &[
    "connection refused",
    "forbidden",
    "not found",
    "http error",
    "server returned",
    "invalid data found",
    "no route to host",
    "name or service not known",
    "failed to resolve hostname",
    "unsupported protocol",
];

const TIMEOUT_DECODE_PATTERNS: &[&str] = &["timed out", "timeout"];

/// Stage-level verdict of one probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    /// Definitive rejection, never retried
    Fail(String),
    /// Transport trouble that says nothing about the stream itself
    Inconclusive(String),
}

impl Verdict {
    /// Turns a final verdict into the persisted `working` flag
    #[must_use]
    pub const fn resolve(&self, policy: InconclusivePolicy) -> bool {
        match self {
            Self::Pass => true,
            Self::Fail(_) => false,
            Self::Inconclusive(_) => matches!(policy, InconclusivePolicy::AssumeWorking),
        }
    }

    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Pass => None,
            Self::Fail(r) | Self::Inconclusive(r) => Some(r),
        }
    }
}

#[must_use]
pub fn classify(outcome: &ProbeOutcome, policy: &ProbePolicy) -> Verdict {
    match outcome {
        ProbeOutcome::Failed(failure) => {
            Verdict::Inconclusive(format!("{}: {}", failure.kind, failure.message))
        }
        ProbeOutcome::Http(response) => classify_http(response, policy),
        ProbeOutcome::Decode(report) => classify_decode(report),
    }
}

fn classify_http(response: &HttpResponse, policy: &ProbePolicy) -> Verdict {
    if policy.is_fail_status(response.status) {
        return Verdict::Fail(format!("blocked:status:{}", response.status));
    }

    if !cors_allows(response.allow_origin.as_deref(), &policy.origins) {
        return Verdict::Fail(NO_CORS.to_string());
    }

    Verdict::Pass
}

fn classify_decode(report: &DecodeReport) -> Verdict {
    if report.exited_ok {
        return Verdict::Pass;
    }

    let lowered = report.diagnostics.to_lowercase();
    let last_line = report
        .diagnostics
        .lines()
        .map(str::trim)
        .rfind(|l| !l.is_empty())
        .unwrap_or_default();

    if TIMEOUT_DECODE_PATTERNS.iter().any(|p| lowered.contains(p)) {
        return Verdict::Inconclusive(format!("decode:{last_line}"));
    }
    if FATAL_DECODE_PATTERNS.iter().any(|p| lowered.contains(p)) {
        return Verdict::Fail(format!("decode:{last_line}"));
    }

    // Empty or unrecognised diagnostics, the decoder usually managed to read the stream
    Verdict::Pass
}

/// Returns whether an `Access-Control-Allow-Origin` value lets any of `origins` read the response
#[must_use]
pub fn cors_allows(allow_origin: Option<&str>, origins: &[String]) -> bool {
    let Some(value) = allow_origin.map(str::trim) else {
        return false;
    };
    if value == "*" {
        return true;
    }

    let value = value.trim_end_matches('/').to_lowercase();
    origins.iter().any(|origin| {
        let origin = origin.trim_end_matches('/').to_lowercase();
        !origin.is_empty() && value.contains(&origin)
    })
}

/// HLS manifests are recognised by a `.m3u8` path or an mpegurl content type
#[must_use]
pub fn is_manifest(url: &Url, content_type: Option<&str>) -> bool {
    url.path().to_lowercase().ends_with(".m3u8")
        || content_type.is_some_and(|ct| ct.to_lowercase().contains("mpegurl"))
}
