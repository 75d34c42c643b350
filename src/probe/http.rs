use std::time::Duration;

use async_trait::async_trait;
use reqwest::{
    Url,
    header::{ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE, HeaderMap, HeaderName, RANGE},
};
use tokio::select;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::{
    classify::is_manifest,
    probe::{FailureKind, HttpResponse, ProbeFailure, ProbeOutcome, Prober},
};

/// Manifests larger than this are truncated, the first child is always near the top
pub const MANIFEST_BODY_LIMIT: usize = 512 * 1024;

/// Probes a stream with a single GET, the way the front end's player would
pub struct HttpProber {
    client: reqwest::Client,
    ct: CancellationToken,
}

impl HttpProber {
    /// `client` decides the redirect mode, see [`crate::util::init_probe_client`]
    #[must_use]
    pub const fn new(client: reqwest::Client, ct: CancellationToken) -> Self {
        Self { client, ct }
    }

    async fn send(&self, url: &Url, headers: &HeaderMap) -> reqwest::Result<reqwest::Response> {
        self.client
            .get(url.clone())
            .headers(headers.clone())
            .send()
            .await
    }

    async fn fetch(&self, url: &Url, headers: &HeaderMap) -> reqwest::Result<HttpResponse> {
        let mut res = self.send(url, headers).await?;

        // Manifests known only by content type went out ranged, the follower needs them whole
        if headers.contains_key(RANGE) && serves_manifest(url, &res) {
            debug!("{url} turned out to be a manifest, requesting it whole");
            let mut whole = headers.clone();
            whole.remove(RANGE);
            res = self.send(url, &whole).await?;
        }

        let allow_origin = header_str(&res, ACCESS_CONTROL_ALLOW_ORIGIN);
        let content_type = header_str(&res, CONTENT_TYPE);
        let status = res.status();
        let final_url = res.url().clone();

        let body = if serves_manifest(url, &res) {
            Some(read_capped(res, MANIFEST_BODY_LIMIT).await?)
        } else {
            None
        };

        Ok(HttpResponse {
            status: status.as_u16(),
            allow_origin,
            content_type,
            final_url,
            body,
        })
    }
}

fn header_str(res: &reqwest::Response, name: HeaderName) -> Option<String> {
    res.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
}

/// A successful response whose body the manifest follower needs
fn serves_manifest(requested: &Url, res: &reqwest::Response) -> bool {
    res.status().is_success()
        && (is_manifest(requested, header_str(res, CONTENT_TYPE).as_deref())
            || is_manifest(res.url(), None))
}

#[async_trait]
impl Prober for HttpProber {
    #[instrument(skip(self, headers))]
    async fn probe(&self, url: &Url, headers: &HeaderMap, timeout: Duration) -> ProbeOutcome {
        select! {
            biased;
            () = self.ct.cancelled() => ProbeOutcome::Failed(ProbeFailure::aborted()),
            res = tokio::time::timeout(timeout, self.fetch(url, headers)) => match res {
                Err(_) => ProbeOutcome::Failed(ProbeFailure::timeout(timeout)),
                Ok(Ok(response)) => {
                    debug!("HTTP {} from {}", response.status, response.final_url);
                    ProbeOutcome::Http(response)
                }
                Ok(Err(e)) => ProbeOutcome::Failed(failure_from(&e)),
            }
        }
    }
}

async fn read_capped(res: reqwest::Response, limit: usize) -> reqwest::Result<String> {
    let mut stream = res.bytes_stream();
    let mut buf = Vec::new();

    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
        if buf.len() >= limit {
            buf.truncate(limit);
            break;
        }
    }

    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn failure_from(e: &reqwest::Error) -> ProbeFailure {
    let kind = if e.is_timeout() {
        FailureKind::Timeout
    } else if e.is_connect() {
        FailureKind::Connect
    } else {
        FailureKind::Transport
    };

    // reqwest's Display omits the underlying cause
    let mut message = e.to_string();
    let mut source = std::error::Error::source(e);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }

    ProbeFailure::new(kind, message)
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::TcpListener,
    };

    use std::sync::{Arc, Mutex};

    use indoc::indoc;

    use super::*;
    use crate::{
        check::check_channel,
        classify::{NO_CORS, Verdict},
        config::{ProbePolicy, RedirectMode},
    };

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// What the test server saw of a request
    struct Request {
        target: String,
        headers: Vec<String>,
    }

    impl Request {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers.iter().find_map(|line| {
                let (key, value) = line.split_once(':')?;
                key.eq_ignore_ascii_case(name).then(|| value.trim())
            })
        }
    }

    /// Answers every connection with whatever `route` makes of the request head
    async fn serve_with(
        route: impl Fn(&Request) -> String + Send + 'static,
    ) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut lines = Vec::new();
                {
                    let mut reader = BufReader::new(&mut stream);
                    let mut line = String::new();
                    loop {
                        line.clear();
                        let read = reader.read_line(&mut line).await.unwrap_or(0);
                        if read == 0 || line == "\r\n" {
                            break;
                        }
                        lines.push(line.trim_end().to_string());
                    }
                }

                let target = lines
                    .first()
                    .and_then(|l| l.split_whitespace().nth(1))
                    .unwrap_or_default()
                    .to_string();
                let headers = lines.into_iter().skip(1).collect();
                let response = route(&Request { target, headers });

                stream.write_all(response.as_bytes()).await.ok();
                stream.shutdown().await.ok();
            }
        });

        addr
    }

    async fn serve(response: String) -> std::net::SocketAddr {
        serve_with(move |_| response.clone()).await
    }

    fn reply(status: &str, headers: &[&str], body: &str) -> String {
        let mut head = format!("HTTP/1.1 {status}\r\n");
        for h in headers {
            head.push_str(h);
            head.push_str("\r\n");
        }
        format!(
            "{head}Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    fn client(mode: RedirectMode) -> reqwest::Client {
        let redirect = match mode {
            RedirectMode::Manual => reqwest::redirect::Policy::none(),
            RedirectMode::Follow => reqwest::redirect::Policy::default(),
        };
        reqwest::Client::builder()
            .no_proxy()
            .redirect(redirect)
            .build()
            .unwrap()
    }

    fn prober(mode: RedirectMode) -> HttpProber {
        HttpProber::new(client(mode), CancellationToken::new())
    }

    #[tokio::test]
    async fn reads_status_cors_and_manifest_body() {
        let addr = serve(reply(
            "200 OK",
            &[
                "Access-Control-Allow-Origin: *",
                "Content-Type: application/vnd.apple.mpegurl",
            ],
            "#EXTM3U\n#EXTINF:4,\nseg.ts\n",
        ))
        .await;
        let url = Url::parse(&format!("http://{addr}/live/index.m3u8")).unwrap();

        let outcome = prober(RedirectMode::Follow)
            .probe(&url, &HeaderMap::new(), TIMEOUT)
            .await;

        let ProbeOutcome::Http(response) = outcome else {
            panic!("expected a response, got {outcome:?}");
        };
        assert_eq!(response.status, 200);
        assert_eq!(response.allow_origin.as_deref(), Some("*"));
        assert_eq!(response.final_url, url);
        assert!(response.body.unwrap().contains("seg.ts"));
    }

    #[tokio::test]
    async fn skips_body_of_failed_or_non_manifest_responses() {
        let addr = serve(reply("403 Forbidden", &[], "denied")).await;
        let url = Url::parse(&format!("http://{addr}/live/index.m3u8")).unwrap();

        let outcome = prober(RedirectMode::Follow)
            .probe(&url, &HeaderMap::new(), TIMEOUT)
            .await;

        let ProbeOutcome::Http(response) = outcome else {
            panic!("expected a response, got {outcome:?}");
        };
        assert_eq!(response.status, 403);
        assert_eq!(response.allow_origin, None);
        assert_eq!(response.body, None);
    }

    #[tokio::test]
    async fn manual_mode_reports_redirects() {
        let addr = serve(reply(
            "302 Found",
            &["Location: http://elsewhere.invalid/live.m3u8"],
            "",
        ))
        .await;
        let url = Url::parse(&format!("http://{addr}/live.m3u8")).unwrap();

        let outcome = prober(RedirectMode::Manual)
            .probe(&url, &HeaderMap::new(), TIMEOUT)
            .await;

        assert!(matches!(outcome, ProbeOutcome::Http(HttpResponse { status: 302, .. })));
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        let url = Url::parse(&format!("http://{addr}/slow.ts")).unwrap();

        let outcome = prober(RedirectMode::Follow)
            .probe(&url, &HeaderMap::new(), Duration::from_millis(200))
            .await;

        assert!(matches!(
            outcome,
            ProbeOutcome::Failed(ProbeFailure {
                kind: FailureKind::Timeout,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn closed_port_is_a_connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let url = Url::parse(&format!("http://{addr}/gone.ts")).unwrap();

        let outcome = prober(RedirectMode::Follow)
            .probe(&url, &HeaderMap::new(), TIMEOUT)
            .await;

        assert!(matches!(
            outcome,
            ProbeOutcome::Failed(ProbeFailure {
                kind: FailureKind::Connect,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn cancellation_aborts_the_probe() {
        let ct = CancellationToken::new();
        ct.cancel();
        let prober = HttpProber::new(client(RedirectMode::Follow), ct);
        let url = Url::parse("http://127.0.0.1:9/never.ts").unwrap();

        let outcome = prober.probe(&url, &HeaderMap::new(), TIMEOUT).await;

        assert!(matches!(
            outcome,
            ProbeOutcome::Failed(ProbeFailure {
                kind: FailureKind::Aborted,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn follow_mode_reports_the_final_response() {
        let addr = serve_with(|req| match req.target.as_str() {
            "/old.m3u8" => reply(
                "302 Found",
                &["Location: /live/new.m3u8", "Access-Control-Allow-Origin: *"],
                "",
            ),
            "/live/new.m3u8" => reply(
                "200 OK",
                &["Content-Type: application/vnd.apple.mpegurl"],
                "#EXTM3U\n#EXTINF:4,\nseg.ts\n",
            ),
            _ => reply("404 Not Found", &[], ""),
        })
        .await;
        let url = Url::parse(&format!("http://{addr}/old.m3u8")).unwrap();
        let prober = prober(RedirectMode::Follow);

        let outcome = prober.probe(&url, &HeaderMap::new(), TIMEOUT).await;

        let ProbeOutcome::Http(response) = outcome else {
            panic!("expected a response, got {outcome:?}");
        };
        assert_eq!(response.status, 200);
        assert_eq!(response.final_url.path(), "/live/new.m3u8");
        // The redirect allowed every origin, the stream itself does not
        assert_eq!(response.allow_origin, None);

        assert_eq!(
            check_channel(&prober, &ProbePolicy::default(), &url).await,
            Verdict::Fail(NO_CORS.to_string())
        );
    }

    const VARIANT: &str = "variant_720p_main_stream.m3u8";

    /// A master manifest whose only variant URI straddles the first 1024 bytes
    fn long_master() -> String {
        const HEAD: &str = "#EXTM3U\n#EXT-X-VERSION:3\n";
        const STREAM_INF: &str = "#EXT-X-STREAM-INF:BANDWIDTH=2560000,RESOLUTION=1280x720\n";
        let padding = 1010 - HEAD.len() - STREAM_INF.len() - "# \n".len();
        format!("{HEAD}# {}\n{STREAM_INF}{VARIANT}\n", "x".repeat(padding))
    }

    #[tokio::test]
    async fn content_type_manifest_is_followed_whole() {
        let master = long_master();
        assert!(master.len() > 1024 && !master[..1024].contains(VARIANT));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let addr = {
            let seen = seen.clone();
            serve_with(move |req| {
                seen.lock().unwrap().push(req.target.clone());
                let cors = "Access-Control-Allow-Origin: *";
                let mpegurl = "Content-Type: application/vnd.apple.mpegurl";

                match req.target.as_str() {
                    "/play?id=7" => match req.header("range") {
                        Some(range) => {
                            let end: usize = range.trim_start_matches("bytes=0-").parse().unwrap();
                            let end = end.min(master.len() - 1);
                            let content_range =
                                format!("Content-Range: bytes 0-{end}/{}", master.len());
                            reply(
                                "206 Partial Content",
                                &[cors, mpegurl, &content_range],
                                &master[..=end],
                            )
                        }
                        None => reply("200 OK", &[cors, mpegurl], &master),
                    },
                    target if target == format!("/{VARIANT}") => reply(
                        "200 OK",
                        &[cors, mpegurl],
                        indoc! {"
                            #EXTM3U
                            #EXT-X-TARGETDURATION:4
                            #EXTINF:4.0,
                            seg-1.ts
                        "},
                    ),
                    _ => reply("404 Not Found", &[], ""),
                }
            })
            .await
        };
        let url = Url::parse(&format!("http://{addr}/play?id=7")).unwrap();

        let verdict = check_channel(
            &prober(RedirectMode::Follow),
            &ProbePolicy::default(),
            &url,
        )
        .await;

        assert_eq!(verdict, Verdict::Pass);
        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                "/play?id=7".to_string(),
                "/play?id=7".to_string(),
                format!("/{VARIANT}")
            ]
        );
    }
}
