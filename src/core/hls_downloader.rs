use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use m3u8_rs::{parse_master_playlist, parse_media_playlist, MasterPlaylist, MediaPlaylist, VariantStream};
use tokio::io::{AsyncWriteExt, BufWriter};

use streamsave_core::core::events::DownloadState;
use streamsave_core::models::download::{ExtractorLink, FileRecord};

use crate::core::direct_downloader::delete_partial;
use crate::core::http_client::{link_headers, Headers, HttpClient};
use crate::core::outcome::DownloadOutcome;
use crate::core::transfer::Transfer;
use crate::storage::provider::{Destination, OutputStream, StorageProvider};

const SEGMENT_TIMEOUT: Duration = Duration::from_secs(60);
const PLAYLIST_ATTEMPTS: u32 = 3;
const DEFAULT_MAX_HEIGHT: u32 = 720;
const WRITE_BUFFER: usize = 256 * 1024;

struct Segment {
    index: usize,
    url: String,
}

struct ResolvedPlaylist {
    url: String,
    playlist: MediaPlaylist,
}

pub struct HlsDownloader {
    http: Arc<dyn HttpClient>,
    storage: Arc<dyn StorageProvider>,
    parallelism: usize,
    segment_retries: u32,
    retry_base: Duration,
}

impl HlsDownloader {
    pub fn new(
        http: Arc<dyn HttpClient>,
        storage: Arc<dyn StorageProvider>,
        parallelism: usize,
        segment_retries: u32,
    ) -> Self {
        Self {
            http,
            storage,
            parallelism: parallelism.max(1),
            segment_retries,
            retry_base: Duration::from_millis(500),
        }
    }

    pub fn with_retry_delay(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }

    pub async fn download(
        &self,
        transfer: &Transfer,
        link: &ExtractorLink,
        dest: &Destination,
        start_index: usize,
    ) -> anyhow::Result<DownloadOutcome> {
        let headers = link_headers(&link.headers, &link.referer);
        let max_height = if link.quality > 0 {
            link.quality
        } else {
            DEFAULT_MAX_HEIGHT
        };

        let resolved = match self.resolve_playlist(&link.url, &headers, max_height).await {
            Ok(Some(r)) => r,
            Ok(None) => {
                tracing::warn!("[hls] {} is neither a master nor a media playlist", link.url);
                transfer.fail();
                return Ok(DownloadOutcome::WrongContent);
            }
            Err(e) => {
                tracing::warn!("[hls] playlist fetch failed for {}: {}", link.url, e);
                transfer.fail();
                return Ok(DownloadOutcome::Connection);
            }
        };

        let encryption = match self.fetch_encryption_info(&resolved, &headers).await {
            Ok(enc) => enc,
            Err(e) => {
                tracing::warn!("[hls] key fetch failed: {}", e);
                transfer.fail();
                return Ok(DownloadOutcome::Connection);
            }
        };

        let segments: Vec<Segment> = resolved
            .playlist
            .segments
            .iter()
            .enumerate()
            .map(|(index, seg)| Segment {
                index,
                url: resolve_url(&resolved.url, &seg.uri),
            })
            .collect();
        let total = segments.len();
        let media_sequence = resolved.playlist.media_sequence;

        let relative = dest.relative_path(self.storage.as_ref());
        let (start, existing) = self.resume_point(transfer, &relative, start_index, total).await;
        if start != start_index {
            tracing::debug!(
                "[hls] {} starts at segment {} (asked for {})",
                relative,
                start,
                start_index
            );
        }

        let stream = match self
            .storage
            .open(dest.folder.as_deref(), &dest.name, start > 0)
            .await
        {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("[hls] {}", e);
                transfer.fail();
                return Ok(DownloadOutcome::from_storage_error(&e));
            }
        };

        transfer.set_segments(total, start, existing);
        transfer.set_bytes_downloaded(existing);
        transfer.save_record(FileRecord {
            total_bytes: 0,
            relative_path: relative.clone(),
            display_name: dest.name.clone(),
            extra_info: Some(start.to_string()),
            base_path: self.storage.base_path(),
            watermark_bytes: None,
        });
        transfer.begin();

        let mut out = BufWriter::with_capacity(WRITE_BUFFER, stream);
        let mut next = start;
        let mut written = existing;
        while next < total {
            if transfer.checkpoint().await == DownloadState::Stopped {
                return Ok(self.stopped(transfer, out, &relative).await);
            }

            let end = (next + self.parallelism).min(total);
            let fetched = self.fetch_group(transfer, &segments[next..end], &headers).await;

            let mut failure = None;
            for (index, result) in fetched {
                let data = match result {
                    Ok(data) if failure.is_none() && index == next => data,
                    Ok(_) => continue,
                    Err(e) => {
                        failure.get_or_insert((index, e));
                        continue;
                    }
                };
                let data = match &encryption {
                    Some(enc) => match decrypt_segment(enc, data, index, media_sequence) {
                        Ok(plain) => plain,
                        Err(e) => {
                            failure.get_or_insert((index, e));
                            continue;
                        }
                    },
                    None => data,
                };
                if let Err(e) = out.write_all(&data).await {
                    return Err(self.io_fault(transfer, &relative, e));
                }
                written += data.len() as u64;
                next = index + 1;
            }

            if let Err(e) = out.flush().await {
                return Err(self.io_fault(transfer, &relative, e));
            }
            transfer.segment_written(next, written);
            transfer.persist_watermark();

            if let Some((index, e)) = failure {
                if transfer.state() == DownloadState::Stopped {
                    tracing::debug!("[hls] segment {} of {} failed after stop: {}", index, relative, e);
                    return Ok(self.stopped(transfer, out, &relative).await);
                }
                tracing::warn!(
                    "[hls] segment {} of {} failed, kept {} segments: {}",
                    index,
                    relative,
                    next,
                    e
                );
                transfer.fail();
                return Ok(DownloadOutcome::Connection);
            }
        }

        if transfer.state() == DownloadState::Stopped {
            return Ok(self.stopped(transfer, out, &relative).await);
        }
        transfer.finish();
        tracing::info!("[hls] finished {} ({} segments)", relative, total);
        Ok(DownloadOutcome::Done)
    }

    /// Clamps the requested start to what the stored record for this
    /// destination proves was written. Returns the start and the bytes
    /// already on disk. Anything past the recorded length is cut off; a
    /// file shorter than the record restarts from zero.
    async fn resume_point(
        &self,
        transfer: &Transfer,
        relative: &str,
        requested: usize,
        total: usize,
    ) -> (usize, u64) {
        if requested == 0 {
            return (0, 0);
        }
        let Some(record) = transfer
            .stored_record()
            .filter(|r| r.relative_path == relative)
        else {
            return (0, 0);
        };
        let (Some(watermark), Some(bytes)) = (record.watermark(), record.watermark_bytes) else {
            return (0, 0);
        };
        if requested < watermark || watermark == 0 || watermark > total {
            return (0, 0);
        }

        match self.storage.file_length(relative).await {
            Ok(Some(len)) if len == bytes => (watermark, bytes),
            Ok(Some(len)) if len > bytes => {
                tracing::info!(
                    "[hls] dropping {} unrecorded bytes from {}",
                    len - bytes,
                    relative
                );
                match self.storage.truncate(relative, bytes).await {
                    Ok(()) => (watermark, bytes),
                    Err(e) => {
                        tracing::warn!("[hls] cannot trim {}: {}", relative, e);
                        (0, 0)
                    }
                }
            }
            _ => (0, 0),
        }
    }

    async fn resolve_playlist(
        &self,
        url: &str,
        headers: &Headers,
        max_height: u32,
    ) -> anyhow::Result<Option<ResolvedPlaylist>> {
        let text = self.fetch_with_retry(url, headers, PLAYLIST_ATTEMPTS).await?;

        if let Ok((_, master)) = parse_master_playlist(&text) {
            if let Some(variant) = select_best_variant(&master, max_height) {
                let variant_url = resolve_url(url, &variant.uri);
                tracing::debug!("[hls] using variant {}", variant_url);
                let text = self
                    .fetch_with_retry(&variant_url, headers, PLAYLIST_ATTEMPTS)
                    .await?;
                return Ok(parse_media_playlist(&text)
                    .ok()
                    .map(|(_, playlist)| ResolvedPlaylist {
                        url: variant_url,
                        playlist,
                    }));
            }
        }

        Ok(parse_media_playlist(&text)
            .ok()
            .map(|(_, playlist)| ResolvedPlaylist {
                url: url.to_string(),
                playlist,
            }))
    }

    async fn fetch_encryption_info(
        &self,
        resolved: &ResolvedPlaylist,
        headers: &Headers,
    ) -> anyhow::Result<Option<EncryptionInfo>> {
        for segment in &resolved.playlist.segments {
            if let Some(key) = &segment.key {
                if matches!(key.method, m3u8_rs::KeyMethod::AES128) {
                    if let Some(uri) = &key.uri {
                        let key_url = resolve_url(&resolved.url, uri);
                        let key_bytes = self
                            .fetch_with_retry(&key_url, headers, PLAYLIST_ATTEMPTS)
                            .await?;
                        let iv = key.iv.as_ref().map(|iv_str| parse_hex_iv(iv_str));
                        return Ok(Some(EncryptionInfo { key_bytes, iv }));
                    }
                }
            }
        }
        Ok(None)
    }

    async fn fetch_with_retry(
        &self,
        url: &str,
        headers: &Headers,
        attempts: u32,
    ) -> anyhow::Result<Vec<u8>> {
        fetch_with_retry(self.http.as_ref(), url, headers, attempts, self.retry_base).await
    }

    // Keyed by index so iteration is ascending whatever the completion order.
    async fn fetch_group(
        &self,
        transfer: &Transfer,
        group: &[Segment],
        headers: &Headers,
    ) -> BTreeMap<usize, anyhow::Result<Vec<u8>>> {
        let mut tasks: FuturesUnordered<_> = group
            .iter()
            .map(|seg| {
                let http = self.http.clone();
                let url = seg.url.clone();
                let headers = headers.clone();
                let attempts = self.segment_retries + 1;
                let base = self.retry_base;
                let index = seg.index;
                let handle = tokio::spawn(async move {
                    fetch_with_retry(http.as_ref(), &url, &headers, attempts, base).await
                });
                async move {
                    let result = match handle.await {
                        Ok(r) => r,
                        Err(e) => Err(anyhow::anyhow!("segment task failed: {}", e)),
                    };
                    (index, result)
                }
            })
            .collect();

        let mut results = BTreeMap::new();
        while let Some((index, result)) = tasks.next().await {
            if let Ok(data) = &result {
                transfer.segment_fetched(data.len() as u64);
            }
            results.insert(index, result);
        }
        results
    }

    async fn stopped(
        &self,
        transfer: &Transfer,
        out: BufWriter<OutputStream>,
        relative: &str,
    ) -> DownloadOutcome {
        drop(out);
        delete_partial(self.storage.as_ref(), relative).await;
        transfer.discard();
        tracing::info!("[hls] stopped {}", relative);
        DownloadOutcome::Stopped
    }

    fn io_fault(&self, transfer: &Transfer, relative: &str, e: std::io::Error) -> anyhow::Error {
        tracing::error!("[hls] write to {} failed: {}", relative, e);
        transfer.persist_watermark();
        transfer.fail();
        anyhow::anyhow!(e).context(format!("writing {}", relative))
    }
}

async fn fetch_with_retry(
    http: &dyn HttpClient,
    url: &str,
    headers: &Headers,
    attempts: u32,
    retry_base: Duration,
) -> anyhow::Result<Vec<u8>> {
    let attempts = attempts.max(1);
    let mut last_err = None;
    for attempt in 0..attempts {
        match tokio::time::timeout(SEGMENT_TIMEOUT, http.get_bytes(url, headers)).await {
            Ok(Ok(data)) => return Ok(data),
            Ok(Err(e)) => last_err = Some(e),
            Err(_) => last_err = Some(anyhow::anyhow!("timed out fetching {}", url)),
        }
        if attempt < attempts - 1 {
            let base = retry_base.as_millis() as u64 * (attempt as u64 + 1);
            let jitter = rand::random::<u64>() % (base / 2 + 1);
            tokio::time::sleep(Duration::from_millis(base + jitter)).await;
        }
    }
    Err(last_err.unwrap_or_else(|| {
        anyhow::anyhow!("fetching {} failed after {} attempts", url, attempts)
    }))
}

struct EncryptionInfo {
    key_bytes: Vec<u8>,
    iv: Option<[u8; 16]>,
}

fn decrypt_segment(
    enc: &EncryptionInfo,
    mut data: Vec<u8>,
    index: usize,
    media_sequence: u64,
) -> anyhow::Result<Vec<u8>> {
    use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
    type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

    let iv = compute_iv(enc, index, media_sequence);
    let decryptor = Aes128CbcDec::new_from_slices(&enc.key_bytes, &iv)
        .map_err(|e| anyhow::anyhow!("AES init: {:?}", e))?;
    let len = decryptor
        .decrypt_padded_mut::<Pkcs7>(&mut data)
        .map_err(|e| anyhow::anyhow!("AES decrypt: {:?}", e))?
        .len();
    data.truncate(len);
    Ok(data)
}

fn select_best_variant(master: &MasterPlaylist, max_height: u32) -> Option<&VariantStream> {
    let mut sorted: Vec<&VariantStream> = master
        .variants
        .iter()
        .filter(|v| !v.is_i_frame)
        .collect();

    if sorted.is_empty() {
        return None;
    }

    sorted.sort_by_key(|v| v.resolution.as_ref().map(|r| r.height).unwrap_or(0));

    let max_h = max_height as u64;
    let mut best: Option<&VariantStream> = None;
    for v in &sorted {
        if v.resolution
            .as_ref()
            .map(|r| r.height <= max_h)
            .unwrap_or(true)
        {
            best = Some(*v);
        }
    }

    best.or_else(|| sorted.first().copied())
}

fn resolve_url(base: &str, relative: &str) -> String {
    if relative.starts_with("http://") || relative.starts_with("https://") {
        return relative.to_string();
    }

    let (base_path, query) = match base.find('?') {
        Some(pos) => (&base[..pos], Some(&base[pos..])),
        None => (base, None),
    };

    let resolved = if let Some(pos) = base_path.rfind('/') {
        format!("{}/{}", &base_path[..pos], relative)
    } else {
        relative.to_string()
    };

    match query {
        Some(q) if !relative.contains('?') => format!("{}{}", resolved, q),
        _ => resolved,
    }
}

fn compute_iv(encryption: &EncryptionInfo, segment_index: usize, media_sequence: u64) -> [u8; 16] {
    if let Some(iv) = &encryption.iv {
        return *iv;
    }
    let seq = media_sequence + segment_index as u64;
    let mut iv = [0u8; 16];
    iv[8..16].copy_from_slice(&seq.to_be_bytes());
    iv
}

fn parse_hex_iv(iv_str: &str) -> [u8; 16] {
    let hex = iv_str.trim_start_matches("0x").trim_start_matches("0X");
    let mut result = [0u8; 16];
    let padded = format!("{:0>32}", hex);
    for (i, byte) in result.iter_mut().enumerate() {
        *byte = padded
            .get(i * 2..i * 2 + 2)
            .and_then(|pair| u8::from_str_radix(pair, 16).ok())
            .unwrap_or(0);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transfer::{TransferContext, TransferKind};
    use crate::storage::persistence::DownloadStore;
    use crate::storage::provider::DirectStorage;
    use crate::testing::{link, media_playlist, segment_body, serve_hls, test_context, wait_until, FakeHttp, Route};
    use m3u8_rs::Resolution;
    use streamsave_core::core::events::DownloadAction;

    const BASE: &str = "https://cdn.test/show";

    struct Fixture {
        _dir: tempfile::TempDir,
        root: std::path::PathBuf,
        http: Arc<FakeHttp>,
        storage: Arc<DirectStorage>,
        ctx: TransferContext,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let (ctx, _) = test_context(Duration::ZERO);
        Fixture {
            storage: Arc::new(DirectStorage::new(&root)),
            root,
            _dir: dir,
            http: FakeHttp::new(),
            ctx,
        }
    }

    impl Fixture {
        fn downloader(&self, parallelism: usize) -> HlsDownloader {
            HlsDownloader::new(self.http.clone(), self.storage.clone(), parallelism, 0)
                .with_retry_delay(Duration::from_millis(1))
        }

        fn transfer(&self, id: i64) -> Transfer {
            Transfer::open(&self.ctx, id, "E1.ts", TransferKind::Hls).unwrap()
        }

        fn file(&self) -> Option<Vec<u8>> {
            std::fs::read(self.root.join("Show/E1.ts")).ok()
        }
    }

    fn dest() -> Destination {
        Destination::new(Some("Show".into()), "E1.ts")
    }

    #[tokio::test]
    async fn writes_segments_in_index_order() {
        let f = fixture();
        let (url, bodies) = serve_hls(&f.http, BASE, 7, 500);
        // Earlier segments in each group finish last.
        for (i, body) in bodies.iter().enumerate() {
            let delay = (3 - (i % 3) as u64) * 15;
            f.http.serve(&format!("{}/seg{}.ts", BASE, i), Route::bytes(body.clone()).delay_ms(delay));
        }
        let transfer = f.transfer(1);

        let outcome = f.downloader(3).download(&transfer, &link(&url), &dest(), 0).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::Done);
        assert_eq!(f.file().unwrap(), bodies.concat());
        assert_eq!(transfer.segments_written(), 7);
        assert_eq!(f.ctx.store.file_record(1).unwrap().watermark(), Some(7));
    }

    #[tokio::test]
    async fn failed_segment_keeps_ordered_prefix() {
        let f = fixture();
        let (url, bodies) = serve_hls(&f.http, BASE, 10, 400);
        f.http.serve(&format!("{}/seg4.ts", BASE), Route::bytes(Vec::new()).broken());
        let transfer = f.transfer(1);

        let outcome = f.downloader(3).download(&transfer, &link(&url), &dest(), 0).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::Connection);
        assert_eq!(transfer.state(), DownloadState::Failed);
        assert_eq!(f.file().unwrap(), bodies[..4].concat());
        assert_eq!(f.ctx.store.file_record(1).unwrap().watermark(), Some(4));
        assert!(transfer.segments_written() <= transfer.segments_fetched());
        assert_eq!(f.http.requests_for(&format!("{}/seg6.ts", BASE)), 0);
    }

    fn seed_partial(f: &Fixture, content: &[u8], watermark: usize, watermark_bytes: Option<u64>) {
        std::fs::create_dir_all(f.root.join("Show")).unwrap();
        std::fs::write(f.root.join("Show/E1.ts"), content).unwrap();
        f.ctx
            .store
            .set_file_record(
                1,
                &FileRecord {
                    total_bytes: 0,
                    relative_path: "Show/E1.ts".into(),
                    display_name: "E1.ts".into(),
                    extra_info: Some(watermark.to_string()),
                    base_path: None,
                    watermark_bytes,
                },
            )
            .unwrap();
    }

    #[tokio::test]
    async fn resumes_from_recorded_watermark() {
        let f = fixture();
        let (url, bodies) = serve_hls(&f.http, BASE, 10, 300);
        seed_partial(&f, &bodies[..4].concat(), 4, Some(1_200));
        let transfer = f.transfer(1);

        let outcome = f.downloader(3).download(&transfer, &link(&url), &dest(), 4).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::Done);
        assert_eq!(f.file().unwrap(), bodies.concat());
        for i in 0..4 {
            assert_eq!(f.http.requests_for(&format!("{}/seg{}.ts", BASE, i)), 0);
        }
        assert_eq!(f.http.requests_for(&format!("{}/seg4.ts", BASE)), 1);
    }

    #[tokio::test]
    async fn resume_cuts_bytes_written_past_the_watermark() {
        let f = fixture();
        let (url, bodies) = serve_hls(&f.http, BASE, 10, 300);
        let mut partial = bodies[..4].concat();
        partial.extend_from_slice(&bodies[4][..170]);
        seed_partial(&f, &partial, 4, Some(1_200));
        let transfer = f.transfer(1);

        let outcome = f.downloader(3).download(&transfer, &link(&url), &dest(), 4).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::Done);
        assert_eq!(f.file().unwrap(), bodies.concat());
        assert_eq!(f.http.requests_for(&format!("{}/seg0.ts", BASE)), 0);
        let record = f.ctx.store.file_record(1).unwrap();
        assert_eq!(record.watermark(), Some(10));
        assert_eq!(record.watermark_bytes, Some(3_000));
    }

    #[tokio::test]
    async fn file_shorter_than_record_restarts_from_zero() {
        let f = fixture();
        let (url, bodies) = serve_hls(&f.http, BASE, 6, 300);
        seed_partial(&f, &bodies[..2].concat(), 4, Some(1_200));
        let transfer = f.transfer(1);

        let outcome = f.downloader(3).download(&transfer, &link(&url), &dest(), 4).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::Done);
        assert_eq!(f.file().unwrap(), bodies.concat());
        assert_eq!(f.http.requests_for(&format!("{}/seg0.ts", BASE)), 1);
    }

    #[tokio::test]
    async fn record_without_byte_length_restarts_from_zero() {
        let f = fixture();
        let (url, bodies) = serve_hls(&f.http, BASE, 6, 300);
        seed_partial(&f, &bodies[..4].concat(), 4, None);
        let transfer = f.transfer(1);

        let outcome = f.downloader(3).download(&transfer, &link(&url), &dest(), 4).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::Done);
        assert_eq!(f.file().unwrap(), bodies.concat());
        assert_eq!(f.http.requests_for(&format!("{}/seg0.ts", BASE)), 1);
    }

    #[tokio::test]
    async fn start_without_record_is_forced_to_zero() {
        let f = fixture();
        let (url, bodies) = serve_hls(&f.http, BASE, 6, 200);
        let transfer = f.transfer(1);

        let outcome = f.downloader(2).download(&transfer, &link(&url), &dest(), 5).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::Done);
        assert_eq!(f.file().unwrap(), bodies.concat());
        assert_eq!(f.http.requests_for(&format!("{}/seg0.ts", BASE)), 1);
    }

    #[tokio::test]
    async fn segment_retry_recovers_transient_failure() {
        let f = fixture();
        let (url, bodies) = serve_hls(&f.http, BASE, 3, 100);
        f.http.serve(&format!("{}/seg1.ts", BASE), Route::bytes(bodies[1].clone()).fail_times(2));
        let transfer = f.transfer(1);

        let downloader = HlsDownloader::new(f.http.clone(), f.storage.clone(), 3, 3)
            .with_retry_delay(Duration::from_millis(1));
        let outcome = downloader.download(&transfer, &link(&url), &dest(), 0).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::Done);
        assert_eq!(f.http.requests_for(&format!("{}/seg1.ts", BASE)), 3);
        assert_eq!(f.file().unwrap(), bodies.concat());
    }

    #[tokio::test]
    async fn one_retry_means_two_attempts() {
        let f = fixture();
        let (url, bodies) = serve_hls(&f.http, BASE, 2, 100);
        f.http.serve(&format!("{}/seg0.ts", BASE), Route::bytes(bodies[0].clone()).fail_times(1));
        let transfer = f.transfer(1);

        let downloader = HlsDownloader::new(f.http.clone(), f.storage.clone(), 2, 1)
            .with_retry_delay(Duration::from_millis(1));
        let outcome = downloader.download(&transfer, &link(&url), &dest(), 0).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::Done);
        assert_eq!(f.http.requests_for(&format!("{}/seg0.ts", BASE)), 2);
    }

    #[tokio::test]
    async fn master_playlist_picks_variant_within_quality() {
        let f = fixture();
        let (_, bodies) = serve_hls(&f.http, "https://cdn.test/show/720", 2, 100);
        let master = "#EXTM3U\n\
            #EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360\n\
            360/index.m3u8\n\
            #EXT-X-STREAM-INF:BANDWIDTH=2500000,RESOLUTION=1280x720\n\
            720/index.m3u8\n\
            #EXT-X-STREAM-INF:BANDWIDTH=5000000,RESOLUTION=1920x1080\n\
            1080/index.m3u8\n";
        let master_url = format!("{}/master.m3u8", BASE);
        f.http.serve(&master_url, Route::bytes(master));
        let transfer = f.transfer(1);

        let mut l = link(&master_url);
        l.quality = 720;
        let outcome = f.downloader(2).download(&transfer, &l, &dest(), 0).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::Done);
        assert_eq!(f.file().unwrap(), bodies.concat());
    }

    #[tokio::test]
    async fn aes_segments_are_decrypted() {
        use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
        type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

        let f = fixture();
        let key = [7u8; 16];
        let plain: Vec<Vec<u8>> = (0..3).map(|i| segment_body(i, 100)).collect();
        let names: Vec<String> = (0..3).map(|i| format!("enc{}.ts", i)).collect();
        for (i, body) in plain.iter().enumerate() {
            let mut iv = [0u8; 16];
            iv[8..16].copy_from_slice(&(i as u64).to_be_bytes());
            let mut buf = body.clone();
            buf.resize(body.len() + 16, 0);
            let cipher = Aes128CbcEnc::new_from_slices(&key, &iv)
                .unwrap()
                .encrypt_padded_mut::<Pkcs7>(&mut buf, body.len())
                .unwrap()
                .to_vec();
            f.http.serve(&format!("{}/{}", BASE, names[i]), Route::bytes(cipher));
        }
        f.http.serve(&format!("{}/key.bin", BASE), Route::bytes(key.to_vec()));
        let playlist_url = format!("{}/enc.m3u8", BASE);
        f.http.serve(
            &playlist_url,
            Route::bytes(media_playlist(&names, "#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"\n")),
        );
        let transfer = f.transfer(1);

        let outcome = f.downloader(3).download(&transfer, &link(&playlist_url), &dest(), 0).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::Done);
        assert_eq!(f.file().unwrap(), plain.concat());
    }

    #[tokio::test]
    async fn unparsable_playlist_is_wrong_content() {
        let f = fixture();
        let url = format!("{}/broken.m3u8", BASE);
        f.http.serve(&url, Route::bytes(b"<html>nope</html>".to_vec()));
        let transfer = f.transfer(1);
        let outcome = f.downloader(3).download(&transfer, &link(&url), &dest(), 0).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::WrongContent);
        assert!(f.file().is_none());
    }

    #[tokio::test]
    async fn stop_between_groups_deletes_file() {
        let f = fixture();
        let (url, bodies) = serve_hls(&f.http, BASE, 12, 100);
        for (i, body) in bodies.iter().enumerate() {
            f.http.serve(&format!("{}/seg{}.ts", BASE, i), Route::bytes(body.clone()).delay_ms(10));
        }
        let transfer = Arc::new(f.transfer(9));
        let downloader = Arc::new(f.downloader(2));
        let task = {
            let transfer = transfer.clone();
            let downloader = downloader.clone();
            let url = url.clone();
            tokio::spawn(async move { downloader.download(&transfer, &link(&url), &dest(), 0).await })
        };
        wait_until(|| transfer.segments_written() >= 2).await;
        f.ctx.bus.send_action(9, DownloadAction::Stop);

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome, DownloadOutcome::Stopped);
        assert!(f.file().is_none());
        assert!(f.ctx.store.file_record(9).is_none());
        assert_eq!(transfer.bytes_downloaded(), 0);
    }

    #[tokio::test]
    async fn stop_is_kept_when_a_segment_then_fails() {
        let f = fixture();
        let (url, bodies) = serve_hls(&f.http, BASE, 6, 100);
        f.http.serve(
            &format!("{}/seg1.ts", BASE),
            Route::bytes(bodies[1].clone()).delay_ms(150).fail_after(0),
        );
        let transfer = Arc::new(f.transfer(6));
        let downloader = Arc::new(f.downloader(3));
        let task = {
            let transfer = transfer.clone();
            let downloader = downloader.clone();
            let url = url.clone();
            tokio::spawn(async move { downloader.download(&transfer, &link(&url), &dest(), 0).await })
        };
        wait_until(|| transfer.segments_fetched() >= 2).await;
        f.ctx.bus.send_action(6, DownloadAction::Stop);

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome, DownloadOutcome::Stopped);
        assert!(f.file().is_none());
        assert!(f.ctx.store.file_record(6).is_none());
        assert_eq!(f.ctx.registry.status(6), None);
        assert_eq!(f.http.requests_for(&format!("{}/seg3.ts", BASE)), 0);
    }

    #[tokio::test]
    async fn pause_holds_watermark_without_refetching() {
        let f = fixture();
        let (url, bodies) = serve_hls(&f.http, BASE, 8, 100);
        for (i, body) in bodies.iter().enumerate() {
            f.http.serve(&format!("{}/seg{}.ts", BASE, i), Route::bytes(body.clone()).delay_ms(10));
        }
        let transfer = Arc::new(f.transfer(4));
        let downloader = Arc::new(f.downloader(2));
        let task = {
            let transfer = transfer.clone();
            let downloader = downloader.clone();
            let url = url.clone();
            tokio::spawn(async move { downloader.download(&transfer, &link(&url), &dest(), 0).await })
        };
        wait_until(|| transfer.segments_written() >= 2).await;
        f.ctx.bus.send_action(4, DownloadAction::Pause);
        tokio::time::sleep(Duration::from_millis(40)).await;
        let held = transfer.segments_written();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(transfer.segments_written(), held);

        f.ctx.bus.send_action(4, DownloadAction::Resume);
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome, DownloadOutcome::Done);
        assert_eq!(f.file().unwrap(), bodies.concat());
        for i in 0..8 {
            assert_eq!(f.http.requests_for(&format!("{}/seg{}.ts", BASE, i)), 1);
        }
    }

    #[test]
    fn resolve_url_absolute_passthrough() {
        assert_eq!(
            resolve_url("https://cdn.example.com/path/master.m3u8", "https://other.com/video.ts"),
            "https://other.com/video.ts"
        );
    }

    #[test]
    fn resolve_url_relative() {
        assert_eq!(
            resolve_url("https://cdn.example.com/path/master.m3u8", "segment0.ts"),
            "https://cdn.example.com/path/segment0.ts"
        );
    }

    #[test]
    fn resolve_url_propagates_query() {
        assert_eq!(
            resolve_url("https://cdn.example.com/path/master.m3u8?token=abc", "segment0.ts"),
            "https://cdn.example.com/path/segment0.ts?token=abc"
        );
    }

    #[test]
    fn resolve_url_relative_with_own_query_skips_base_query() {
        assert_eq!(
            resolve_url(
                "https://cdn.example.com/path/master.m3u8?token=abc",
                "segment0.ts?key=123"
            ),
            "https://cdn.example.com/path/segment0.ts?key=123"
        );
    }

    fn variant(uri: &str, height: u64, is_i_frame: bool) -> VariantStream {
        VariantStream {
            uri: uri.into(),
            bandwidth: height * 3000,
            is_i_frame,
            resolution: Some(Resolution {
                width: height * 16 / 9,
                height,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn select_best_variant_respects_max_height() {
        let master = MasterPlaylist {
            variants: vec![
                variant("360.m3u8", 360, false),
                variant("720.m3u8", 720, false),
                variant("1080.m3u8", 1080, false),
            ],
            ..Default::default()
        };
        assert_eq!(select_best_variant(&master, 720).unwrap().uri, "720.m3u8");
        assert_eq!(select_best_variant(&master, 1080).unwrap().uri, "1080.m3u8");
    }

    #[test]
    fn select_best_variant_skips_iframe_and_falls_back_to_lowest() {
        let master = MasterPlaylist {
            variants: vec![
                variant("iframe.m3u8", 180, true),
                variant("1080.m3u8", 1080, false),
                variant("4k.m3u8", 2160, false),
            ],
            ..Default::default()
        };
        assert_eq!(select_best_variant(&master, 360).unwrap().uri, "1080.m3u8");
        let empty = MasterPlaylist::default();
        assert!(select_best_variant(&empty, 720).is_none());
    }

    #[test]
    fn parse_hex_iv_pads_short_values() {
        let mut expected = [0u8; 16];
        expected[15] = 0xFF;
        assert_eq!(parse_hex_iv("0xFF"), expected);
        assert_eq!(parse_hex_iv("FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF"), [0xFF; 16]);
    }

    #[test]
    fn compute_iv_prefers_explicit_then_sequence() {
        let explicit = EncryptionInfo {
            key_bytes: vec![0u8; 16],
            iv: Some([0xAB; 16]),
        };
        assert_eq!(compute_iv(&explicit, 5, 100), [0xAB; 16]);

        let derived = EncryptionInfo {
            key_bytes: vec![0u8; 16],
            iv: None,
        };
        let mut expected = [0u8; 16];
        expected[8..16].copy_from_slice(&103u64.to_be_bytes());
        assert_eq!(compute_iv(&derived, 3, 100), expected);
    }
}
