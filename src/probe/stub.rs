//! Scripted [`Prober`] for tests

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use reqwest::{Url, header::HeaderMap};

use crate::probe::{FailureKind, HttpResponse, ProbeFailure, ProbeOutcome, Prober};

pub fn http_response(
    url: &str,
    status: u16,
    allow_origin: Option<&str>,
    body: Option<&str>,
) -> ProbeOutcome {
    ProbeOutcome::Http(HttpResponse {
        status,
        allow_origin: allow_origin.map(ToString::to_string),
        content_type: None,
        final_url: Url::parse(url).unwrap(),
        body: body.map(ToString::to_string),
    })
}

/// Answers each URL with its queued outcomes in order, repeating the last one.
/// Unknown URLs fail to connect.
#[derive(Default)]
pub struct StubProber {
    responses: Mutex<HashMap<String, VecDeque<ProbeOutcome>>>,
    panics: HashSet<String>,
    delay: Duration,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl StubProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, url: &str, outcome: ProbeOutcome) -> Self {
        self.responses
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(outcome);
        self
    }

    pub fn panic_on(mut self, url: &str) -> Self {
        self.panics.insert(url.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == url).count()
    }

    /// Highest number of probes observed in flight at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_outcome(&self, url: &str) -> ProbeOutcome {
        let mut responses = self.responses.lock().unwrap();
        match responses.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap(),
            None => ProbeOutcome::Failed(ProbeFailure::new(
                FailureKind::Connect,
                format!("no stub for {url}"),
            )),
        }
    }
}

#[async_trait]
impl Prober for StubProber {
    async fn probe(&self, url: &Url, _headers: &HeaderMap, _timeout: Duration) -> ProbeOutcome {
        self.calls.lock().unwrap().push(url.to_string());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        assert!(!self.panics.contains(url.as_str()), "stub panic for {url}");
        self.next_outcome(url.as_str())
    }
}
