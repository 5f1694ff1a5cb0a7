use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures::StreamExt;
use tokio::io::{AsyncWriteExt, BufWriter};

use streamsave_core::core::events::DownloadState;
use streamsave_core::models::download::{ExtractorLink, FileRecord};

use crate::core::filename::is_video_name;
use crate::core::http_client::{link_headers, HttpClient};
use crate::core::outcome::DownloadOutcome;
use crate::core::transfer::Transfer;
use crate::storage::provider::{Destination, OutputStream, StorageProvider};

pub const CHUNK_TIMEOUT: Duration = Duration::from_secs(45);
const WRITE_BUFFER: usize = 256 * 1024;

enum Ending {
    Complete,
    Stopped,
    Network(anyhow::Error),
    Io(std::io::Error),
}

pub struct DirectDownloader {
    http: Arc<dyn HttpClient>,
    storage: Arc<dyn StorageProvider>,
    min_video_bytes: u64,
    chunk_timeout: Duration,
}

impl DirectDownloader {
    pub fn new(
        http: Arc<dyn HttpClient>,
        storage: Arc<dyn StorageProvider>,
        min_video_bytes: u64,
    ) -> Self {
        Self {
            http,
            storage,
            min_video_bytes,
            chunk_timeout: CHUNK_TIMEOUT,
        }
    }

    pub fn with_chunk_timeout(mut self, timeout: Duration) -> Self {
        self.chunk_timeout = timeout;
        self
    }

    pub async fn download(
        &self,
        transfer: &Transfer,
        link: &ExtractorLink,
        dest: &Destination,
        resume: bool,
    ) -> anyhow::Result<DownloadOutcome> {
        if link.is_torrent() {
            tracing::warn!("[direct] torrent links are not supported: {}", link.url);
            transfer.fail();
            return Ok(DownloadOutcome::Unsupported);
        }

        let relative = dest.relative_path(self.storage.as_ref());
        let mut offset = 0;
        if resume {
            match self.storage.file_length(&relative).await {
                Ok(len) => offset = len.unwrap_or(0),
                Err(e) => {
                    tracing::warn!("[direct] cannot inspect {}: {}", relative, e);
                    transfer.fail();
                    return Ok(DownloadOutcome::from_storage_error(&e));
                }
            }
        }

        let headers = link_headers(&link.headers, &link.referer);
        let range = (offset > 0).then_some(offset);
        let response = match self.http.get(&link.url, &headers, range).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("[direct] request failed for {}: {}", link.url, e);
                transfer.fail();
                return Ok(DownloadOutcome::Connection);
            }
        };

        if offset > 0 && response.status != 206 {
            tracing::info!(
                "[direct] server ignored range for {}, restarting from zero",
                relative
            );
            offset = 0;
        }

        if response
            .content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("text/html"))
        {
            tracing::warn!("[direct] got HTML instead of media from {}", link.url);
            transfer.fail();
            return Ok(DownloadOutcome::WrongContent);
        }

        let total = response.content_length.map(|len| offset + len);
        if let Some(total) = total {
            if is_video_name(&dest.name) && total < self.min_video_bytes {
                tracing::warn!(
                    "[direct] {} is only {} bytes, refusing to save",
                    relative,
                    total
                );
                transfer.fail();
                return Ok(DownloadOutcome::TooSmall);
            }
        }

        let stream = match self
            .storage
            .open(dest.folder.as_deref(), &dest.name, offset > 0)
            .await
        {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("[direct] {}", e);
                transfer.fail();
                return Ok(DownloadOutcome::from_storage_error(&e));
            }
        };

        transfer.set_total_bytes(total);
        transfer.set_bytes_downloaded(offset);
        transfer.save_record(FileRecord {
            total_bytes: total.unwrap_or(0) as i64,
            relative_path: relative.clone(),
            display_name: dest.name.clone(),
            extra_info: None,
            base_path: self.storage.base_path(),
            watermark_bytes: None,
        });
        transfer.begin();

        let mut out = BufWriter::with_capacity(WRITE_BUFFER, stream);
        let mut body = response.body;
        let ending = loop {
            if transfer.checkpoint().await == DownloadState::Stopped {
                break Ending::Stopped;
            }
            match tokio::time::timeout(self.chunk_timeout, body.next()).await {
                Ok(Some(Ok(chunk))) => {
                    if let Err(e) = out.write_all(&chunk).await {
                        break Ending::Io(e);
                    }
                    transfer.add_bytes(chunk.len() as u64);
                }
                Ok(Some(Err(e))) => break Ending::Network(e),
                Ok(None) => break Ending::Complete,
                Err(_) => {
                    break Ending::Network(anyhow!(
                        "no data received for {} seconds",
                        self.chunk_timeout.as_secs()
                    ))
                }
            }
        };

        match ending {
            Ending::Complete => {
                if let Err(e) = out.flush().await {
                    return Err(self.io_fault(transfer, &relative, e));
                }
                if transfer.state() == DownloadState::Stopped {
                    return Ok(self.stopped(transfer, out, &relative).await);
                }
                transfer.finish();
                tracing::info!(
                    "[direct] finished {} ({} bytes)",
                    relative,
                    transfer.bytes_downloaded()
                );
                Ok(DownloadOutcome::Done)
            }
            Ending::Stopped => Ok(self.stopped(transfer, out, &relative).await),
            Ending::Network(e) => {
                if transfer.state() == DownloadState::Stopped {
                    tracing::debug!("[direct] {} failed after stop: {}", relative, e);
                    return Ok(self.stopped(transfer, out, &relative).await);
                }
                if let Err(flush_err) = out.flush().await {
                    tracing::warn!("[direct] flush after network error failed: {}", flush_err);
                }
                tracing::warn!("[direct] {} interrupted: {}", relative, e);
                transfer.fail();
                Ok(DownloadOutcome::Connection)
            }
            Ending::Io(e) => {
                if let Err(flush_err) = out.flush().await {
                    tracing::warn!("[direct] flush after write error failed: {}", flush_err);
                }
                Err(self.io_fault(transfer, &relative, e))
            }
        }
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
        tracing::info!("[direct] stopped {}", relative);
        DownloadOutcome::Stopped
    }

    fn io_fault(&self, transfer: &Transfer, relative: &str, e: std::io::Error) -> anyhow::Error {
        tracing::error!("[direct] write to {} failed: {}", relative, e);
        transfer.fail();
        anyhow!(e).context(format!("writing {}", relative))
    }
}

pub(crate) async fn delete_partial(storage: &dyn StorageProvider, relative: &str) {
    match storage.delete(relative).await {
        Ok(_) => {}
        Err(e) => tracing::warn!("[storage] could not delete {}: {}", relative, e),
    }
}
