use std::{
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures_util::FutureExt as _;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Url;
use tokio::{select, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    check::check_channel, classify::Verdict, config::ProbePolicy, playlist::ChannelRecord,
    probe::Prober, util::truncate_string,
};

const DISPLAY_NAME_LENGTH: usize = 60;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeSummary {
    pub total: usize,
    pub working: usize,
    pub broken: usize,
    /// Left unprobed because the run was cancelled
    pub skipped: usize,
}

struct Target {
    name: String,
    url: String,
}

/// State shared by every worker of one run
struct Pool {
    targets: Vec<Target>,
    cursor: AtomicUsize,
    completed: AtomicUsize,
    prober: Arc<dyn Prober>,
    policy: Arc<ProbePolicy>,
    ct: CancellationToken,
    pb: ProgressBar,
}

/// Probes every channel with at most `policy.concurrency` probes in flight and records the
/// verdicts in place. Channels keep their order; those not probed before cancellation stay `None`.
pub async fn probe_all(
    channels: &mut [ChannelRecord],
    prober: Arc<dyn Prober>,
    policy: Arc<ProbePolicy>,
    ct: CancellationToken,
) -> ProbeSummary {
    let total = channels.len();
    let workers = policy.concurrency.min(total);
    info!("Probing {total} channels with {workers} workers");

    let pool = Arc::new(Pool {
        targets: channels
            .iter()
            .map(|c| Target {
                name: c.name.clone(),
                url: c.url.clone(),
            })
            .collect(),
        cursor: AtomicUsize::new(0),
        completed: AtomicUsize::new(0),
        prober,
        policy,
        ct,
        pb: progress_bar(total),
    });

    let mut tasks = JoinSet::new();
    for _ in 0..workers {
        let pool = pool.clone();
        tasks.spawn(async move { pool.work().await });
    }

    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(verdicts) => {
                for (index, working) in verdicts {
                    channels[index].working = Some(working);
                }
            }
            Err(e) => error!("Probe worker crashed: {e}"),
        }
    }
    pool.pb.finish_and_clear();

    let working = channels.iter().filter(|c| c.working == Some(true)).count();
    let broken = channels.iter().filter(|c| c.working == Some(false)).count();
    ProbeSummary {
        total,
        working,
        broken,
        skipped: total - working - broken,
    }
}

fn progress_bar(total: usize) -> ProgressBar {
    let pb = ProgressBar::new(total as u64);
    if let Ok(style) = ProgressStyle::with_template(
        "[{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} channels ({eta})",
    ) {
        pb.set_style(style);
    }
    pb
}

impl Pool {
    /// Claims channels off the shared cursor until none are left
    async fn work(&self) -> Vec<(usize, bool)> {
        let mut verdicts = Vec::new();

        while !self.ct.is_cancelled() {
            let index = self.cursor.fetch_add(1, Ordering::Relaxed);
            let Some(target) = self.targets.get(index) else {
                break;
            };

            let verdict = self.check_with_retries(&target.url).await;
            // An aborted probe says nothing about the channel
            if self.ct.is_cancelled() {
                break;
            }

            let working = verdict.resolve(self.policy.inconclusive);
            self.report(target, &verdict, working);
            verdicts.push((index, working));
        }

        verdicts
    }

    async fn check_with_retries(&self, url: &str) -> Verdict {
        let Ok(url) = Url::parse(url) else {
            return Verdict::Fail("invalid-url".to_string());
        };

        let mut attempt = 0;
        loop {
            let verdict = AssertUnwindSafe(check_channel(&*self.prober, &self.policy, &url))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Verdict::Inconclusive("panicked".to_string()));

            match verdict {
                Verdict::Inconclusive(reason) if attempt < self.policy.retries => {
                    attempt += 1;
                    debug!("Retrying {url} ({attempt}/{}): {reason}", self.policy.retries);

                    select! {
                        () = self.ct.cancelled() => return Verdict::Inconclusive(reason),
                        () = tokio::time::sleep(backoff(self.policy.retry_delay, attempt)) => {}
                    }
                }
                verdict => return verdict,
            }
        }
    }

    fn report(&self, target: &Target, verdict: &Verdict, working: bool) {
        let name = truncate_string(&target.name, DISPLAY_NAME_LENGTH);
        let done = self.completed.fetch_add(1, Ordering::Relaxed) + 1;

        self.pb.suspend(|| {
            match (working, verdict.reason()) {
                (true, None) => info!("✅ {name}"),
                (true, Some(reason)) => info!("✅ {name} (⚠️ {reason})"),
                (false, reason) => info!("❌ {name} {{{}}}", reason.unwrap_or_default()),
            }

            if done % self.policy.progress_every == 0 {
                info!("Probed {done}/{} channels", self.targets.len());
            }
        });
        self.pb.inc(1);
    }
}

/// Linear backoff, saturating instead of overflowing for huge delays
const fn backoff(delay: Duration, attempt: u32) -> Duration {
    delay.saturating_mul(attempt)
}
