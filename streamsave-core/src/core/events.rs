use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use serde::Serialize;
use uuid::Uuid;

use crate::models::download::EpisodeId;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum DownloadState {
    Pending,
    Downloading,
    Paused,
    Done,
    Stopped,
    Failed,
}

impl DownloadState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Stopped | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum DownloadAction {
    Pause,
    Resume,
    Stop,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusEvent {
    pub id: EpisodeId,
    pub state: DownloadState,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProgressEvent {
    pub id: EpisodeId,
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    pub segments: Option<SegmentProgress>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct SegmentProgress {
    pub fetched: usize,
    pub written: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ActionEvent {
    pub id: EpisodeId,
    pub action: DownloadAction,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeleteEvent {
    pub id: EpisodeId,
}

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A typed publish/subscribe channel. Handlers run synchronously on the
/// publishing thread; there is no ordering guarantee between subscribers.
pub struct Topic<T> {
    handlers: Arc<RwLock<HashMap<Uuid, Handler<T>>>>,
}

impl<T: 'static> Topic<T> {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let key = Uuid::new_v4();
        write(&self.handlers).insert(key, Arc::new(handler));

        let weak: Weak<RwLock<HashMap<Uuid, Handler<T>>>> = Arc::downgrade(&self.handlers);
        Subscription {
            key,
            release: Some(Box::new(move || {
                if let Some(handlers) = weak.upgrade() {
                    write(&handlers).remove(&key);
                }
            })),
        }
    }

    pub fn publish(&self, event: &T) {
        // Snapshot so handlers may subscribe/unsubscribe/publish re-entrantly.
        let snapshot: Vec<Handler<T>> = read(&self.handlers).values().cloned().collect();
        for handler in snapshot {
            handler(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        read(&self.handlers).len()
    }
}

impl<T: 'static> Default for Topic<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn read<V>(lock: &RwLock<V>) -> RwLockReadGuard<'_, V> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<V>(lock: &RwLock<V>) -> RwLockWriteGuard<'_, V> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle for a registered handler. Dropping it unsubscribes.
pub struct Subscription {
    key: Uuid,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn key(&self) -> Uuid {
        self.key
    }

    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("key", &self.key).finish()
    }
}

#[derive(Default)]
pub struct EventBus {
    pub status: Topic<StatusEvent>,
    pub progress: Topic<ProgressEvent>,
    pub actions: Topic<ActionEvent>,
    pub deletes: Topic<DeleteEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send_action(&self, id: EpisodeId, action: DownloadAction) {
        self.actions.publish(&ActionEvent { id, action });
    }
}
