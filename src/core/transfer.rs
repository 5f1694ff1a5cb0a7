use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use streamsave_core::core::events::{
    DeleteEvent, DownloadAction, DownloadState, EventBus, ProgressEvent, SegmentProgress,
    StatusEvent, Subscription,
};
use streamsave_core::models::download::{EpisodeId, FileRecord};

use crate::core::notifier::{TransferNotifier, TransferUpdate};
use crate::core::registry::DownloadRegistry;
use crate::storage::persistence::{DownloadStore, KeyValueStore};

#[derive(Clone)]
pub struct TransferContext {
    pub bus: Arc<EventBus>,
    pub registry: Arc<DownloadRegistry>,
    pub store: Arc<dyn KeyValueStore>,
    pub notifier: Arc<dyn TransferNotifier>,
    pub notify_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    ByteRange,
    Hls,
}

#[derive(Default)]
struct Progress {
    bytes_downloaded: u64,
    total_bytes: Option<u64>,
    segments_total: usize,
    segments_fetched: usize,
    segments_written: usize,
    written_bytes: Option<u64>,
    last_notified: Option<Instant>,
    record: Option<FileRecord>,
}

struct Shared {
    id: EpisodeId,
    display_name: String,
    kind: TransferKind,
    ctx: TransferContext,
    state: watch::Sender<DownloadState>,
    progress: Mutex<Progress>,
}

/// Live state machine for one transfer attempt.
///
/// `Pending -> Downloading -> {Paused <-> Downloading} -> {Done | Stopped | Failed}`.
/// Pause/Resume/Stop arrive on the bus's action topic at any time and are
/// applied idempotently; terminal states absorb everything.
///
/// Dropping a transfer releases its action subscription and its claim on
/// the id. [`Transfer::close`] additionally flushes the file record.
pub struct Transfer {
    shared: Arc<Shared>,
    _actions: Subscription,
}

impl Transfer {
    pub fn open(
        ctx: &TransferContext,
        id: EpisodeId,
        display_name: impl Into<String>,
        kind: TransferKind,
    ) -> anyhow::Result<Self> {
        if !ctx.registry.claim_transfer(id) {
            anyhow::bail!("a transfer for episode {} is already open", id);
        }

        let (state, _) = watch::channel(DownloadState::Pending);
        let shared = Arc::new(Shared {
            id,
            display_name: display_name.into(),
            kind,
            ctx: ctx.clone(),
            state,
            progress: Mutex::new(Progress::default()),
        });

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let actions = ctx.bus.actions.subscribe(move |event| {
            if let Some(shared) = weak.upgrade() {
                if event.id == shared.id {
                    shared.apply_action(event.action);
                }
            }
        });

        ctx.registry.set_status(id, DownloadState::Pending);
        shared.notify(true);

        Ok(Self {
            shared,
            _actions: actions,
        })
    }

    pub fn id(&self) -> EpisodeId {
        self.shared.id
    }

    pub fn kind(&self) -> TransferKind {
        self.shared.kind
    }

    pub fn state(&self) -> DownloadState {
        *self.shared.state.borrow()
    }

    pub fn begin(&self) {
        if self.state() == DownloadState::Pending {
            self.shared.transition(DownloadState::Downloading);
        }
    }

    pub fn finish(&self) -> bool {
        self.shared.transition(DownloadState::Done)
    }

    pub fn fail(&self) -> bool {
        self.shared.transition(DownloadState::Failed)
    }

    pub fn apply_action(&self, action: DownloadAction) {
        self.shared.apply_action(action);
    }

    /// Chunk/group boundary check: blocks while paused and returns the
    /// state that ended the wait.
    pub async fn checkpoint(&self) -> DownloadState {
        let mut rx = self.shared.state.subscribe();
        let result = rx.wait_for(|s| *s != DownloadState::Paused).await;
        match result {
            Ok(state) => *state,
            Err(_) => DownloadState::Stopped,
        }
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.shared.lock().bytes_downloaded
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.shared.lock().total_bytes
    }

    pub fn segments_written(&self) -> usize {
        self.shared.lock().segments_written
    }

    pub fn segments_fetched(&self) -> usize {
        self.shared.lock().segments_fetched
    }

    pub fn set_total_bytes(&self, total: Option<u64>) {
        self.shared.lock().total_bytes = total;
        self.shared.notify(false);
    }

    pub fn set_bytes_downloaded(&self, bytes: u64) {
        self.shared.lock().bytes_downloaded = bytes;
        self.shared.notify(false);
    }

    pub fn add_bytes(&self, n: u64) {
        self.shared.lock().bytes_downloaded += n;
        self.shared.notify(false);
    }

    /// Known segment count plus the resume point; both counters start there.
    /// `written_bytes` is the file length at that point.
    pub fn set_segments(&self, total: usize, start: usize, written_bytes: u64) {
        {
            let mut p = self.shared.lock();
            p.segments_total = total;
            p.segments_fetched = start;
            p.segments_written = start;
            p.written_bytes = Some(written_bytes);
        }
        self.shared.notify(false);
    }

    pub fn segment_fetched(&self, bytes: u64) {
        {
            let mut p = self.shared.lock();
            p.segments_fetched += 1;
            p.bytes_downloaded += bytes;
        }
        self.shared.notify(false);
    }

    /// Advances the write watermark, with `written_bytes` on disk behind it.
    /// Never moves backwards or past the fetched count; a capped watermark
    /// loses its byte length.
    pub fn segment_written(&self, watermark: usize, written_bytes: u64) {
        {
            let mut p = self.shared.lock();
            let capped = watermark.min(p.segments_fetched).min(p.segments_total);
            if capped > p.segments_written {
                p.segments_written = capped;
                p.written_bytes = (capped == watermark).then_some(written_bytes);
            } else if capped == watermark && watermark == p.segments_written {
                p.written_bytes = Some(written_bytes);
            }
        }
        self.shared.notify(false);
    }

    pub fn save_record(&self, record: FileRecord) {
        self.shared.lock().record = Some(record);
        self.shared.persist_record();
    }

    pub fn persist_watermark(&self) {
        self.shared.persist_record();
    }

    pub fn stored_record(&self) -> Option<FileRecord> {
        self.shared.ctx.store.file_record(self.shared.id)
    }

    pub fn discard(&self) {
        {
            let mut p = self.shared.lock();
            p.bytes_downloaded = 0;
            p.segments_fetched = 0;
            p.segments_written = 0;
            p.written_bytes = None;
            p.record = None;
        }
        let id = self.shared.id;
        let store = &self.shared.ctx.store;
        if let Err(e) = store.remove_file_record(id) {
            tracing::warn!("[transfer] could not remove file record for {}: {}", id, e);
        }
        if let Err(e) = store.remove_resume_package(id) {
            tracing::warn!("[transfer] could not remove resume package for {}: {}", id, e);
        }
        self.shared.ctx.bus.deletes.publish(&DeleteEvent { id });
        self.shared.notify(true);
    }

    pub fn close(self) {
        if self.state() != DownloadState::Stopped {
            self.shared.persist_record();
        }
        self.shared.notify(true);
    }
}

impl Drop for Transfer {
    fn drop(&mut self) {
        self.shared.ctx.registry.release_transfer(self.shared.id);
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self, to: DownloadState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if current.is_terminal() || *current == to {
                return false;
            }
            *current = to;
            true
        });
        if changed {
            tracing::debug!("[transfer] {} -> {:?}", self.id, to);
            if to == DownloadState::Stopped {
                self.ctx.registry.clear_status(self.id);
            } else {
                self.ctx.registry.set_status(self.id, to);
            }
            self.notify(true);
        }
        changed
    }

    fn apply_action(&self, action: DownloadAction) {
        let current = *self.state.borrow();
        match action {
            DownloadAction::Pause => {
                if matches!(current, DownloadState::Pending | DownloadState::Downloading) {
                    self.transition(DownloadState::Paused);
                }
            }
            DownloadAction::Resume => {
                if current == DownloadState::Paused {
                    self.transition(DownloadState::Downloading);
                }
            }
            DownloadAction::Stop => {
                if self.transition(DownloadState::Stopped) {
                    if let Err(e) = self.ctx.store.remove_resume_package(self.id) {
                        tracing::warn!("[transfer] could not remove resume package for {}: {}", self.id, e);
                    }
                }
            }
        }
    }

    fn persist_record(&self) {
        let record = {
            let p = self.lock();
            let Some(mut record) = p.record.clone() else {
                return;
            };
            if let Some(total) = p.total_bytes {
                record.total_bytes = total as i64;
            }
            if self.kind == TransferKind::Hls {
                record.extra_info = Some(p.segments_written.to_string());
                record.watermark_bytes = p.written_bytes;
            }
            record
        };
        if let Err(e) = self.ctx.store.set_file_record(self.id, &record) {
            tracing::warn!("[transfer] could not persist file record for {}: {}", self.id, e);
        }
    }

    /// Single reporting path. Byte updates are throttled to one per
    /// `notify_interval`; state transitions always go through.
    fn notify(&self, force: bool) {
        let state = *self.state.borrow();
        let update = {
            let mut p = self.lock();
            if !force {
                if let Some(last) = p.last_notified {
                    if last.elapsed() < self.ctx.notify_interval {
                        return;
                    }
                }
            }
            p.last_notified = Some(Instant::now());

            if self.kind == TransferKind::Hls && p.segments_fetched > 0 && p.segments_total > 0 {
                let estimate = (p.bytes_downloaded as u128 * p.segments_total as u128
                    / p.segments_fetched as u128) as u64;
                p.total_bytes = Some(p.total_bytes.unwrap_or(0).max(estimate));
            }

            TransferUpdate {
                id: self.id,
                display_name: self.display_name.clone(),
                state,
                bytes_downloaded: p.bytes_downloaded,
                total_bytes: p.total_bytes,
                segments: (self.kind == TransferKind::Hls).then_some(SegmentProgress {
                    fetched: p.segments_fetched,
                    written: p.segments_written,
                    total: p.segments_total,
                }),
            }
        };

        self.ctx.bus.progress.publish(&ProgressEvent {
            id: self.id,
            bytes_downloaded: update.bytes_downloaded,
            total_bytes: update.total_bytes,
            segments: update.segments,
        });
        self.ctx.bus.status.publish(&StatusEvent { id: self.id, state });

        match catch_unwind(AssertUnwindSafe(|| self.ctx.notifier.render(&update))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("[transfer] notifier failed for {}: {}", self.id, e),
            Err(_) => tracing::error!("[transfer] notifier panicked for {}", self.id),
        }
    }
}
