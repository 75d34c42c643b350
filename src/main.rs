#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::cargo)]
#![warn(clippy::perf)]
#![warn(clippy::complexity)]
#![warn(clippy::style)]
#![allow(clippy::multiple_crate_versions)]

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result, ensure};
use clap::Parser;
use config::{
    DEFAULT_FAIL_STATUSES, DEFAULT_ORIGIN, DEFAULT_PLAYLIST_URL, InconclusivePolicy, ProbePolicy,
    RedirectMode, Strategy,
};
use ffmpeg::DecodeProber;
use probe::{Prober, http::HttpProber};
use scheduler::probe_all;
use sink::write_channels;
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, instrument, warn};
use util::{init_http_client, init_probe_client, spawn_ct_watcher, warn_ulimit};

pub mod check;
pub mod classify;
pub mod config;
pub mod ffmpeg;
pub mod manifest;
pub mod playlist;
pub mod probe;
pub mod scheduler;
pub mod sink;
pub mod util;

/// Checks which channels of an IPTV playlist a browser can play and writes the verdicts as JSON
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Playlist URL or local file path to check
    #[arg(env = "PLAYLIST_URL", default_value = DEFAULT_PLAYLIST_URL)]
    source: String,

    /// Where the JSON verdicts are written
    #[arg(short, long, env = "OUTPUT_PATH", default_value = "data/channels.json")]
    output: PathBuf,

    /// The amount of parallel probes
    #[arg(short, long, env = "CONCURRENCY", default_value_t = 50)]
    parallelism: usize,

    /// Time allowed for a single probe, in milliseconds
    #[arg(short, long, env = "TIMEOUT_MS", default_value_t = 10_000, value_parser = clap::value_parser!(u64).range(1..))]
    timeout_ms: u64,

    /// Extra attempts for channels whose probe timed out or hit a network error
    #[arg(short, long, env = "RETRIES", default_value_t = 1)]
    retries: u32,

    /// Base delay between attempts, multiplied by the attempt number
    #[arg(long, env = "RETRY_DELAY_MS", default_value_t = 1_000)]
    retry_delay_ms: u64,

    /// Origin(s) of the playback front end, matched against `Access-Control-Allow-Origin`
    #[arg(long, env = "EXPECTED_ORIGIN", value_delimiter = ',', default_value = DEFAULT_ORIGIN)]
    origin: Vec<String>,

    /// HTTP statuses that mark a channel as broken
    #[arg(long, env = "FAIL_STATUSES", value_delimiter = ',', default_values_t = DEFAULT_FAIL_STATUSES)]
    fail_status: Vec<u16>,

    /// Leave out channels without a `tvg-id`
    #[arg(long, env = "REQUIRE_TVG_ID")]
    require_tvg_id: bool,

    /// What to make of channels that stayed unreachable after every retry
    #[arg(long, env = "INCONCLUSIVE_POLICY", value_enum, default_value_t = InconclusivePolicy::AssumeBroken)]
    inconclusive: InconclusivePolicy,

    /// Whether redirects are followed or reported as-is
    #[arg(long, env = "REDIRECT_MODE", value_enum, default_value_t = RedirectMode::Follow)]
    redirect: RedirectMode,

    /// How channels are probed
    #[arg(long, env = "PROBE_STRATEGY", value_enum, default_value_t = Strategy::Http)]
    strategy: Strategy,

    /// Seconds of stream decoded per channel with `--strategy decode`
    #[arg(long, env = "DECODE_SECONDS", default_value_t = 3, value_parser = clap::value_parser!(u64).range(1..))]
    decode_seconds: u64,

    /// Bytes requested from non-manifest resources, 0 requests them whole
    #[arg(long, env = "RANGE_BYTES", default_value_t = 1024)]
    range_bytes: u64,

    /// Log a progress line every N probed channels
    #[arg(long, env = "PROGRESS_EVERY", default_value_t = 100)]
    progress_every: usize,

    /// Only probe the first N channels
    #[arg(long, env = "CHANNEL_LIMIT")]
    limit: Option<usize>,

    /// Log debug output
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn policy(&self) -> ProbePolicy {
        ProbePolicy {
            timeout: Duration::from_millis(self.timeout_ms),
            retries: self.retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            concurrency: self.parallelism,
            origins: self.origin.clone(),
            fail_statuses: self.fail_status.clone(),
            inconclusive: self.inconclusive,
            redirect_mode: self.redirect,
            range_bytes: self.range_bytes,
            progress_every: self.progress_every,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .init();

    run(args).await.inspect_err(|e| error!("{e:#}"))
}

async fn run(args: Args) -> Result<()> {
    let policy = args.policy();
    policy.validate().context("Invalid configuration")?;
    let policy = Arc::new(policy);
    warn_ulimit(policy.concurrency);

    let text = load_playlist(&args.source).await?;
    let mut channels = playlist::parse(&text, args.require_tvg_id);
    info!("Found {} channels", channels.len());
    if let Some(limit) = args.limit {
        channels.truncate(limit);
        info!("Probing only the first {} channels", channels.len());
    }

    let ct = CancellationToken::new();
    spawn_ct_watcher(ct.clone());

    let prober: Arc<dyn Prober> = match args.strategy {
        Strategy::Http => {
            let client = init_probe_client(policy.redirect_mode, policy.concurrency)
                .context("Building probe HTTP client")?;
            Arc::new(HttpProber::new(client, ct.clone()))
        }
        Strategy::Decode => {
            ensure!(ffmpeg::is_installed().await, "ffmpeg is not installed!");
            Arc::new(DecodeProber::new(
                Duration::from_secs(args.decode_seconds),
                ct.clone(),
            ))
        }
    };

    let summary = probe_all(&mut channels, prober, policy, ct).await;
    if summary.skipped > 0 {
        warn!(
            "{} channels were not probed and are written without a verdict",
            summary.skipped
        );
    }

    write_channels(&args.output, &channels).await?;
    info!(
        "Wrote {} channels ({} working, {} broken) to {}",
        summary.total,
        summary.working,
        summary.broken,
        args.output.display()
    );

    Ok(())
}

/// Downloads the playlist, or reads it from disk when `source` isn't an HTTP(S) URL
#[instrument]
async fn load_playlist(source: &str) -> Result<String> {
    let lowered = source.to_lowercase();
    if !(lowered.starts_with("http://") || lowered.starts_with("https://")) {
        return tokio::fs::read_to_string(source)
            .await
            .with_context(|| format!("Reading playlist file {source}"));
    }

    info!("Downloading playlist");
    let client = init_http_client().context("Building HTTP client")?;
    let res = client
        .get(source)
        .send()
        .await
        .context("Fetching playlist")?;
    ensure!(
        res.status().is_success(),
        "Playlist request failed with HTTP {}",
        res.status()
    );

    res.text().await.context("Decoding playlist")
}
