use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use streamsave_core::core::events::DownloadState;
use streamsave_core::models::download::{EpisodeId, ResumePackage};

#[derive(Debug)]
pub enum Admission {
    Idle,
    Start(ResumePackage),
    AlreadyActive(ResumePackage),
}

struct RegistryInner {
    queue: VecDeque<ResumePackage>,
    active: HashSet<EpisodeId>,
    statuses: HashMap<EpisodeId, DownloadState>,
    open_transfers: HashSet<EpisodeId>,
    max_concurrent: usize,
}

/// Owns the pending queue, the active-id set, the per-id status map and the
/// set of ids with an open transfer. Every accessor takes the lock once.
pub struct DownloadRegistry {
    inner: Mutex<RegistryInner>,
}

impl DownloadRegistry {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                queue: VecDeque::new(),
                active: HashSet::new(),
                statuses: HashMap::new(),
                open_transfers: HashSet::new(),
                max_concurrent: max_concurrent.max(1),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn max_concurrent(&self) -> usize {
        self.lock().max_concurrent
    }

    pub fn set_max_concurrent(&self, max: usize) {
        self.lock().max_concurrent = max.max(1);
    }

    pub fn enqueue(&self, pkg: ResumePackage) -> bool {
        let mut inner = self.lock();
        let id = pkg.id();
        if inner.queue.iter().any(|p| p.id() == id) {
            return false;
        }
        if !inner.active.contains(&id) {
            inner.statuses.insert(id, DownloadState::Pending);
        }
        inner.queue.push_back(pkg);
        true
    }

    pub fn remove_queued(&self, id: EpisodeId) -> Option<ResumePackage> {
        let mut inner = self.lock();
        let pos = inner.queue.iter().position(|p| p.id() == id)?;
        inner.queue.remove(pos)
    }

    pub fn queued(&self) -> Vec<ResumePackage> {
        self.lock().queue.iter().cloned().collect()
    }

    pub fn is_queued(&self, id: EpisodeId) -> bool {
        self.lock().queue.iter().any(|p| p.id() == id)
    }

    pub fn admit(&self) -> Admission {
        let mut inner = self.lock();
        if inner.active.len() >= inner.max_concurrent {
            return Admission::Idle;
        }
        let Some(pkg) = inner.queue.pop_front() else {
            return Admission::Idle;
        };
        let id = pkg.id();
        if inner.active.contains(&id) {
            return Admission::AlreadyActive(pkg);
        }
        inner.active.insert(id);
        Admission::Start(pkg)
    }

    pub fn finish(&self, id: EpisodeId) {
        self.lock().active.remove(&id);
    }

    pub fn is_active(&self, id: EpisodeId) -> bool {
        self.lock().active.contains(&id)
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn claim_transfer(&self, id: EpisodeId) -> bool {
        self.lock().open_transfers.insert(id)
    }

    pub fn release_transfer(&self, id: EpisodeId) {
        self.lock().open_transfers.remove(&id);
    }

    pub fn has_transfer(&self, id: EpisodeId) -> bool {
        self.lock().open_transfers.contains(&id)
    }

    pub fn set_status(&self, id: EpisodeId, state: DownloadState) {
        self.lock().statuses.insert(id, state);
    }

    pub fn clear_status(&self, id: EpisodeId) {
        self.lock().statuses.remove(&id);
    }

    pub fn status(&self, id: EpisodeId) -> Option<DownloadState> {
        self.lock().statuses.get(&id).copied()
    }
}
