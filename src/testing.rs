use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use streamsave_core::core::events::{DownloadState, EventBus};
use streamsave_core::models::download::{DownloadItem, EpisodeId, EpisodeMetadata, ExtractorLink};

use crate::core::http_client::{Headers, HttpClient, HttpResponse};
use crate::core::notifier::{TransferNotifier, TransferUpdate};
use crate::core::registry::DownloadRegistry;
use crate::core::transfer::{Transfer, TransferContext};
use crate::storage::persistence::MemoryStore;

pub fn link(url: &str) -> ExtractorLink {
    ExtractorLink {
        source: "test".into(),
        name: "test".into(),
        url: url.into(),
        referer: String::new(),
        quality: 0,
        is_m3u8: url.contains(".m3u8"),
        headers: HashMap::new(),
        keepalive: None,
    }
}

pub fn sample_item(id: EpisodeId, urls: &[&str]) -> DownloadItem {
    DownloadItem {
        source: "test".into(),
        folder: Some("Show".into()),
        ep: EpisodeMetadata {
            id,
            name: format!("Show {}", id),
            season: None,
            episode: None,
            poster: None,
            source: "test".into(),
        },
        links: urls.iter().map(|u| link(u)).collect(),
    }
}

#[derive(Clone)]
pub struct Route {
    body: Vec<u8>,
    chunk: usize,
    delay: Duration,
    fail_times: usize,
    broken: bool,
    supports_range: bool,
    content_type: Option<String>,
    fail_after: Option<usize>,
}

impl Route {
    pub fn bytes(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            chunk: 64 * 1024,
            delay: Duration::ZERO,
            fail_times: 0,
            broken: false,
            supports_range: true,
            content_type: None,
            fail_after: None,
        }
    }

    pub fn chunk(mut self, size: usize) -> Self {
        self.chunk = size.max(1);
        self
    }

    /// Delay before every body chunk.
    pub fn delay_ms(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }

    /// The first `n` requests fail before any response.
    pub fn fail_times(mut self, n: usize) -> Self {
        self.fail_times = n;
        self
    }

    pub fn broken(mut self) -> Self {
        self.broken = true;
        self
    }

    pub fn no_range(mut self) -> Self {
        self.supports_range = false;
        self
    }

    pub fn content_type(mut self, value: &str) -> Self {
        self.content_type = Some(value.into());
        self
    }

    /// The body stream errors after `n` bytes.
    pub fn fail_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub url: String,
    pub headers: Headers,
    pub range_start: Option<u64>,
}

/// Scripted HTTP capability keyed by exact URL.
#[derive(Default)]
pub struct FakeHttp {
    routes: Mutex<HashMap<String, Route>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl FakeHttp {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, url: &str, route: Route) {
        self.routes.lock().unwrap().insert(url.to_string(), route);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, url: &str) -> usize {
        self.requests.lock().unwrap().iter().filter(|r| r.url == url).count()
    }
}

#[async_trait]
impl HttpClient for FakeHttp {
    async fn get(
        &self,
        url: &str,
        headers: &Headers,
        range_start: Option<u64>,
    ) -> anyhow::Result<HttpResponse> {
        self.requests.lock().unwrap().push(RecordedRequest {
            url: url.to_string(),
            headers: headers.clone(),
            range_start,
        });

        let route = {
            let mut routes = self.routes.lock().unwrap();
            let route = routes
                .get_mut(url)
                .ok_or_else(|| anyhow!("HTTP 404 for {}", url))?;
            if route.broken {
                anyhow::bail!("connection refused: {}", url);
            }
            if route.fail_times > 0 {
                route.fail_times -= 1;
                anyhow::bail!("connection reset: {}", url);
            }
            route.clone()
        };

        let start = match range_start {
            Some(s) if s > 0 && route.supports_range => s as usize,
            _ => 0,
        };
        let status = if start > 0 { 206 } else { 200 };
        let body = route.body.get(start..).unwrap_or_default().to_vec();
        let content_length = Some(body.len() as u64);

        let mut items: Vec<anyhow::Result<Bytes>> = Vec::new();
        let mut sent = 0usize;
        for piece in body.chunks(route.chunk) {
            if let Some(limit) = route.fail_after {
                if sent >= limit {
                    items.push(Err(anyhow!("connection reset mid-body")));
                    break;
                }
            }
            sent += piece.len();
            items.push(Ok(Bytes::copy_from_slice(piece)));
        }
        let delay = route.delay;
        let stream = futures::stream::iter(items)
            .then(move |item| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                item
            })
            .boxed();

        Ok(HttpResponse {
            status,
            content_length,
            content_type: route.content_type.clone(),
            body: stream,
        })
    }
}

/// Distinct, index-tagged segment payloads.
pub fn segment_body(index: usize, size: usize) -> Vec<u8> {
    (0..size).map(|i| (index * 31 + i) as u8).collect()
}

pub fn media_playlist(segments: &[String], extra_tags: &str) -> String {
    let mut text = String::from(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n#EXT-X-MEDIA-SEQUENCE:0\n",
    );
    text.push_str(extra_tags);
    for uri in segments {
        text.push_str("#EXTINF:10.0,\n");
        text.push_str(uri);
        text.push('\n');
    }
    text.push_str("#EXT-X-ENDLIST\n");
    text
}

/// Serves `count` segments under `base` plus a playlist. Returns the
/// playlist URL and the segment bodies.
pub fn serve_hls(http: &FakeHttp, base: &str, count: usize, size: usize) -> (String, Vec<Vec<u8>>) {
    let names: Vec<String> = (0..count).map(|i| format!("seg{}.ts", i)).collect();
    let bodies: Vec<Vec<u8>> = (0..count).map(|i| segment_body(i, size)).collect();
    for (name, body) in names.iter().zip(&bodies) {
        http.serve(&format!("{}/{}", base, name), Route::bytes(body.clone()));
    }
    let playlist_url = format!("{}/index.m3u8", base);
    http.serve(&playlist_url, Route::bytes(media_playlist(&names, "")));
    (playlist_url, bodies)
}

#[derive(Default)]
pub struct RecordingNotifier {
    updates: Mutex<Vec<TransferUpdate>>,
    failures: Option<Arc<AtomicUsize>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts calls and returns an error from every one of them.
    pub fn failing(calls: Arc<AtomicUsize>) -> Self {
        Self {
            updates: Mutex::new(Vec::new()),
            failures: Some(calls),
        }
    }

    pub fn count(&self) -> usize {
        self.updates.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<TransferUpdate> {
        self.updates.lock().unwrap().last().cloned()
    }

    pub fn states(&self) -> Vec<DownloadState> {
        self.updates.lock().unwrap().iter().map(|u| u.state).collect()
    }
}

impl TransferNotifier for RecordingNotifier {
    fn render(&self, update: &TransferUpdate) -> anyhow::Result<()> {
        if let Some(calls) = &self.failures {
            calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("renderer exploded");
        }
        self.updates.lock().unwrap().push(update.clone());
        Ok(())
    }
}

pub fn test_context(notify_interval: Duration) -> (TransferContext, Arc<RecordingNotifier>) {
    let notifier = Arc::new(RecordingNotifier::new());
    let ctx = TransferContext {
        bus: Arc::new(EventBus::new()),
        registry: Arc::new(DownloadRegistry::new(3)),
        store: Arc::new(MemoryStore::new()),
        notifier: notifier.clone(),
        notify_interval,
    };
    (ctx, notifier)
}

/// Polls until `cond` holds, panicking after two seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

pub async fn wait_for_bytes(transfer: &Transfer) {
    wait_until(|| transfer.bytes_downloaded() > 0).await;
}
