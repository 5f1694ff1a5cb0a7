use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use streamsave_core::core::events::{
    DeleteEvent, DownloadAction, DownloadState, EventBus, ProgressEvent, StatusEvent,
};
use streamsave_core::models::download::{
    DownloadItem, EpisodeId, ExtractorLink, FileRecord, QueueRecord, ResumePackage,
};
use streamsave_core::models::settings::AppSettings;

use crate::core::direct_downloader::{delete_partial, DirectDownloader};
use crate::core::filename::destination_name;
use crate::core::hls_downloader::HlsDownloader;
use crate::core::http_client::HttpClient;
use crate::core::notifier::TransferNotifier;
use crate::core::outcome::DownloadOutcome;
use crate::core::registry::{Admission, DownloadRegistry};
use crate::core::transfer::{Transfer, TransferContext, TransferKind};
use crate::storage::persistence::{DownloadStore, KeyValueStore};
use crate::storage::provider::{Destination, StorageProvider};

pub const MAX_LINK_ATTEMPTS: usize = 2;

pub trait QueueScheduler: Send + Sync {
    fn request_queue_check(&self);
}

pub struct ChannelScheduler {
    tx: mpsc::UnboundedSender<()>,
}

impl ChannelScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl QueueScheduler for ChannelScheduler {
    fn request_queue_check(&self) {
        let _ = self.tx.send(());
    }
}

/// Keeps an extractor session warm while one of its links is downloading.
/// The task is cancelled when the attempt ends, whatever the outcome.
#[async_trait]
pub trait LinkKeepalive: Send + Sync {
    async fn run(&self, link: &ExtractorLink, token: &str);
}

pub struct EngineDeps {
    pub http: Arc<dyn HttpClient>,
    pub storage: Arc<dyn StorageProvider>,
    pub store: Arc<dyn KeyValueStore>,
    pub notifier: Arc<dyn TransferNotifier>,
    pub scheduler: Arc<dyn QueueScheduler>,
    pub keepalive: Option<Arc<dyn LinkKeepalive>>,
    pub settings: AppSettings,
}

struct EngineInner {
    ctx: TransferContext,
    storage: Arc<dyn StorageProvider>,
    scheduler: Arc<dyn QueueScheduler>,
    keepalive: Option<Arc<dyn LinkKeepalive>>,
    direct: DirectDownloader,
    hls: HlsDownloader,
}

/// Frees the admission slot and asks for another queue check, even when
/// the run unwinds.
struct ActiveSlot {
    inner: Arc<EngineInner>,
    id: EpisodeId,
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.inner.ctx.registry.finish(self.id);
        self.inner.scheduler.request_queue_check();
    }
}

#[derive(Clone)]
pub struct DownloadEngine {
    inner: Arc<EngineInner>,
}

impl DownloadEngine {
    pub fn new(deps: EngineDeps) -> Self {
        let advanced = &deps.settings.advanced;
        let ctx = TransferContext {
            bus: Arc::new(EventBus::new()),
            registry: Arc::new(DownloadRegistry::new(
                advanced.max_concurrent_downloads as usize,
            )),
            store: deps.store,
            notifier: deps.notifier,
            notify_interval: Duration::from_millis(advanced.notify_interval_ms),
        };
        let direct = DirectDownloader::new(
            deps.http.clone(),
            deps.storage.clone(),
            deps.settings.download.min_video_bytes,
        );
        let hls = HlsDownloader::new(
            deps.http,
            deps.storage.clone(),
            advanced.parallelism(),
            advanced.segment_retries,
        );
        Self {
            inner: Arc::new(EngineInner {
                ctx,
                storage: deps.storage,
                scheduler: deps.scheduler,
                keepalive: deps.keepalive,
                direct,
                hls,
            }),
        }
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.inner.ctx.bus.clone()
    }

    pub fn registry(&self) -> Arc<DownloadRegistry> {
        self.inner.ctx.registry.clone()
    }

    pub fn enqueue(&self, item: DownloadItem) -> bool {
        self.enqueue_package(ResumePackage::new(item))
    }

    pub fn enqueue_package(&self, pkg: ResumePackage) -> bool {
        let id = pkg.id();
        let registry = &self.inner.ctx.registry;
        if !registry.enqueue(pkg) {
            tracing::debug!("[queue] {} is already queued", id);
            return false;
        }
        tracing::info!("[queue] queued {}", id);
        self.persist_queue();
        if !registry.is_active(id) {
            self.inner.ctx.bus.status.publish(&StatusEvent {
                id,
                state: DownloadState::Pending,
            });
        }
        self.inner.scheduler.request_queue_check();
        true
    }

    fn persist_queue(&self) {
        let records: Vec<QueueRecord> = self
            .inner
            .ctx
            .registry
            .queued()
            .into_iter()
            .enumerate()
            .map(|(index, pkg)| QueueRecord { index, pkg })
            .collect();
        if let Err(e) = self.inner.ctx.store.set_queue_snapshot(&records) {
            tracing::warn!("[queue] could not persist queue: {}", e);
        }
    }

    pub fn process_queue(&self) -> bool {
        match self.inner.ctx.registry.admit() {
            Admission::Idle => false,
            Admission::AlreadyActive(pkg) => {
                let id = pkg.id();
                tracing::info!("[queue] {} is still active, resuming it instead", id);
                self.persist_queue();
                self.inner.ctx.bus.send_action(id, DownloadAction::Resume);
                true
            }
            Admission::Start(pkg) => {
                tracing::info!("[queue] admitted {}", pkg.id());
                self.persist_queue();
                let engine = self.clone();
                tokio::spawn(async move { engine.run_admitted(pkg).await });
                true
            }
        }
    }

    async fn run_admitted(self, pkg: ResumePackage) {
        let id = pkg.id();
        let _slot = ActiveSlot {
            inner: self.inner.clone(),
            id,
        };
        if let Err(e) = self.run_package(pkg).await {
            tracing::error!("[queue] {} aborted: {:#}", id, e);
            self.publish_failed(id);
        }
    }

    async fn run_package(&self, pkg: ResumePackage) -> anyhow::Result<bool> {
        let id = pkg.id();
        let store = &self.inner.ctx.store;
        let first = pkg.link_index.unwrap_or(0);
        let continuing = pkg.link_index.is_some();

        for (index, link) in pkg.item.links.iter().enumerate().skip(first) {
            if index > first && self.stopped_between_attempts(id) {
                return Ok(false);
            }
            let checkpoint = ResumePackage {
                item: pkg.item.clone(),
                link_index: Some(index),
            };
            if let Err(e) = store.set_resume_package(&checkpoint) {
                tracing::warn!("[queue] could not persist checkpoint for {}: {}", id, e);
            }

            let dest = Destination::new(
                pkg.item.folder.clone(),
                destination_name(&pkg.item.ep, link),
            );
            let inherits = (continuing || index > first) && self.partial_record(id, &dest).is_some();

            for attempt in 0..MAX_LINK_ATTEMPTS {
                if attempt > 0 && self.stopped_between_attempts(id) {
                    return Ok(false);
                }
                let resume = attempt > 0 || inherits;
                let outcome = self.run_link(id, link, &dest, resume).await?;
                tracing::debug!(
                    "[queue] {} link {} attempt {}: {:?} ({})",
                    id,
                    index,
                    attempt + 1,
                    outcome,
                    outcome.code()
                );
                if outcome.is_success() {
                    if let Err(e) = store.remove_resume_package(id) {
                        tracing::warn!("[queue] could not remove checkpoint for {}: {}", id, e);
                    }
                    return Ok(true);
                }
                if !outcome.is_retryable() {
                    break;
                }
            }
            tracing::warn!("[queue] {} giving up on link {} ({})", id, index, link.url);
        }

        tracing::warn!("[queue] {} failed on every link", id);
        self.publish_failed(id);
        Ok(false)
    }

    async fn run_link(
        &self,
        id: EpisodeId,
        link: &ExtractorLink,
        dest: &Destination,
        resume: bool,
    ) -> anyhow::Result<DownloadOutcome> {
        let kind = if link.is_m3u8 {
            TransferKind::Hls
        } else {
            TransferKind::ByteRange
        };
        let transfer = Transfer::open(&self.inner.ctx, id, dest.name.clone(), kind)?;
        let _keepalive = self.start_keepalive(link);

        let result = match kind {
            TransferKind::Hls => {
                let start = if resume {
                    self.partial_record(id, dest)
                        .and_then(|r| r.watermark())
                        .unwrap_or(0)
                } else {
                    0
                };
                self.inner.hls.download(&transfer, link, dest, start).await
            }
            TransferKind::ByteRange => {
                self.inner.direct.download(&transfer, link, dest, resume).await
            }
        };

        let result = if transfer.state() == DownloadState::Stopped
            && !matches!(result, Ok(DownloadOutcome::Stopped))
        {
            if let Err(e) = &result {
                tracing::warn!("[queue] {} stopped, dropping error: {:#}", id, e);
            }
            let storage = self.inner.storage.as_ref();
            delete_partial(storage, &dest.relative_path(storage)).await;
            transfer.discard();
            Ok(DownloadOutcome::Stopped)
        } else {
            result
        };
        transfer.close();
        result
    }

    fn stopped_between_attempts(&self, id: EpisodeId) -> bool {
        if self.inner.ctx.store.resume_package(id).is_some() {
            return false;
        }
        tracing::info!("[queue] {} was stopped between attempts", id);
        true
    }

    fn partial_record(&self, id: EpisodeId, dest: &Destination) -> Option<FileRecord> {
        let relative = dest.relative_path(self.inner.storage.as_ref());
        self.inner
            .ctx
            .store
            .file_record(id)
            .filter(|r| r.relative_path == relative)
    }

    fn start_keepalive(&self, link: &ExtractorLink) -> Option<DropGuard> {
        let keepalive = self.inner.keepalive.clone()?;
        let token = link.keepalive.clone()?;
        let cancel = CancellationToken::new();
        let guard = cancel.clone().drop_guard();
        let link = link.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = keepalive.run(&link, &token) => {}
            }
        });
        Some(guard)
    }

    fn publish_failed(&self, id: EpisodeId) {
        self.inner.ctx.registry.set_status(id, DownloadState::Failed);
        self.inner.ctx.bus.status.publish(&StatusEvent {
            id,
            state: DownloadState::Failed,
        });
    }

    pub fn pause(&self, id: EpisodeId) {
        self.inner.ctx.bus.send_action(id, DownloadAction::Pause);
    }

    /// Resumes an open transfer, or re-queues the item from its persisted
    /// checkpoint. Returns false when there is nothing to resume.
    pub fn resume(&self, id: EpisodeId) -> bool {
        let registry = &self.inner.ctx.registry;
        if registry.has_transfer(id) {
            self.inner.ctx.bus.send_action(id, DownloadAction::Resume);
            return true;
        }
        if registry.is_queued(id) {
            return false;
        }
        match self.inner.ctx.store.resume_package(id) {
            Some(pkg) => self.enqueue_package(pkg),
            None => false,
        }
    }

    /// Stops an open transfer (which deletes its own partial file), or drops
    /// a queued item together with any unfinished file it left behind.
    pub async fn stop(&self, id: EpisodeId) {
        let registry = &self.inner.ctx.registry;
        if registry.remove_queued(id).is_some() {
            self.persist_queue();
        }
        if registry.has_transfer(id) {
            self.inner.ctx.bus.send_action(id, DownloadAction::Stop);
            return;
        }

        let store = &self.inner.ctx.store;
        if store.resume_package(id).is_some() {
            if let Some(record) = store.file_record(id) {
                if let Err(e) = self.inner.storage.delete(&record.relative_path).await {
                    tracing::warn!("[queue] could not delete {}: {}", record.relative_path, e);
                }
                if let Err(e) = store.remove_file_record(id) {
                    tracing::warn!("[queue] could not remove record for {}: {}", id, e);
                }
            }
            if let Err(e) = store.remove_resume_package(id) {
                tracing::warn!("[queue] could not remove checkpoint for {}: {}", id, e);
            }
        }
        registry.clear_status(id);
    }

    /// Removes everything known about `id`: the transfer, the stored file,
    /// its record and checkpoint. Returns whether a record existed.
    pub async fn delete(&self, id: EpisodeId) -> anyhow::Result<bool> {
        self.stop(id).await;

        let store = &self.inner.ctx.store;
        let record = store.file_record(id);
        if let Some(record) = &record {
            self.inner.storage.delete(&record.relative_path).await?;
        }
        store.remove_file_record(id)?;
        store.remove_resume_package(id)?;
        self.inner.ctx.registry.clear_status(id);

        let bus = &self.inner.ctx.bus;
        bus.deletes.publish(&DeleteEvent { id });
        bus.progress.publish(&ProgressEvent {
            id,
            bytes_downloaded: 0,
            total_bytes: None,
            segments: None,
        });
        tracing::info!("[queue] deleted {}", id);
        Ok(record.is_some())
    }

    pub fn status(&self, id: EpisodeId) -> Option<DownloadState> {
        self.inner.ctx.registry.status(id)
    }

    pub fn file_record(&self, id: EpisodeId) -> Option<FileRecord> {
        self.inner.ctx.store.file_record(id)
    }

    pub fn set_max_concurrent(&self, max: usize) {
        self.inner.ctx.registry.set_max_concurrent(max);
        self.inner.scheduler.request_queue_check();
    }

    pub fn restore(&self) -> usize {
        let store = &self.inner.ctx.store;
        let registry = &self.inner.ctx.registry;
        let mut restored = 0;

        let mut ids = store.resume_package_ids();
        ids.sort();
        for id in ids {
            if registry.is_active(id) {
                continue;
            }
            if let Some(pkg) = store.resume_package(id) {
                if registry.enqueue(pkg) {
                    restored += 1;
                }
            }
        }

        let mut snapshot = store.queue_snapshot();
        snapshot.sort_by_key(|r| r.index);
        for record in snapshot {
            if registry.enqueue(record.pkg) {
                restored += 1;
            }
        }

        self.persist_queue();
        if restored > 0 {
            tracing::info!("[queue] restored {} item(s)", restored);
            self.inner.scheduler.request_queue_check();
        }
        restored
    }

    pub async fn drive(&self, mut rx: mpsc::UnboundedReceiver<()>) {
        while rx.recv().await.is_some() {
            while self.process_queue() {}
        }
    }
}
