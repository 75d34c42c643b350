use reqwest::Url;
use tracing::debug;

use crate::{
    classify::{Verdict, classify},
    config::ProbePolicy,
    manifest,
    probe::{ProbeOutcome, Prober, request_headers},
};

/// Checks one channel: the playlist-level URL first, then the first child of an HLS manifest.
///
/// The child is only probed when the first stage passed. A manifest without any child passes.
pub async fn check_channel(prober: &dyn Prober, policy: &ProbePolicy, url: &Url) -> Verdict {
    let outcome = prober
        .probe(url, &request_headers(policy, url), policy.timeout)
        .await;
    let verdict = classify(&outcome, policy);
    if verdict != Verdict::Pass {
        return verdict;
    }

    let ProbeOutcome::Http(response) = &outcome else {
        return verdict;
    };
    if !response.is_manifest(url) {
        return verdict;
    }
    let Some(child) = response
        .body
        .as_deref()
        .and_then(|body| manifest::follow(body, &response.final_url))
    else {
        debug!("{url} has no followable child, skipping second stage");
        return verdict;
    };

    debug!("Following {url} to {child}");
    let outcome = prober
        .probe(&child, &request_headers(policy, &child), policy.timeout)
        .await;
    match classify(&outcome, policy) {
        Verdict::Pass => Verdict::Pass,
        Verdict::Fail(reason) => Verdict::Fail(format!("child:{reason}")),
        Verdict::Inconclusive(reason) => Verdict::Inconclusive(format!("child:{reason}")),
    }
}
