use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use streamsave_core::models::download::{EpisodeId, FileRecord, QueueRecord, ResumePackage};

/// Per-id resume checkpoints.
pub const RESUME_PACKAGES: &str = "download_resume_packages";
/// Per-id completed or partial file records.
pub const FILE_RECORDS: &str = "download_info";
/// Whole-queue snapshot, stored under [`QUEUE_KEY`].
pub const QUEUE: &str = "download_queue";
pub const QUEUE_KEY: &str = "snapshot";

/// Namespaced key-value store. Implementations must be cheap to call from
/// async code; they are invoked while transfers run.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, namespace: &str, key: &str) -> Option<Value>;
    fn set(&self, namespace: &str, key: &str, value: Value) -> anyhow::Result<()>;
    fn remove(&self, namespace: &str, key: &str) -> anyhow::Result<()>;
    fn keys(&self, namespace: &str) -> Vec<String>;
}

type Namespaces = BTreeMap<String, BTreeMap<String, Value>>;

#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<Namespaces>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock(data: &Mutex<Namespaces>) -> std::sync::MutexGuard<'_, Namespaces> {
    data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl KeyValueStore for MemoryStore {
    fn get(&self, namespace: &str, key: &str) -> Option<Value> {
        lock(&self.data).get(namespace)?.get(key).cloned()
    }

    fn set(&self, namespace: &str, key: &str, value: Value) -> anyhow::Result<()> {
        lock(&self.data)
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, namespace: &str, key: &str) -> anyhow::Result<()> {
        if let Some(ns) = lock(&self.data).get_mut(namespace) {
            ns.remove(key);
        }
        Ok(())
    }

    fn keys(&self, namespace: &str) -> Vec<String> {
        lock(&self.data)
            .get(namespace)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// One JSON document on disk, rewritten after every mutation.
pub struct JsonFileStore {
    path: PathBuf,
    data: Mutex<Namespaces>,
}

impl JsonFileStore {
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let data = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!("[store] {} is corrupt, starting empty: {}", path.display(), e);
                    Namespaces::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Namespaces::new(),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    fn save(&self, data: &Namespaces) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(data)?)?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("writing {}", self.path.display()))?;
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, namespace: &str, key: &str) -> Option<Value> {
        lock(&self.data).get(namespace)?.get(key).cloned()
    }

    fn set(&self, namespace: &str, key: &str, value: Value) -> anyhow::Result<()> {
        let mut data = lock(&self.data);
        data.entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
        self.save(&data)
    }

    fn remove(&self, namespace: &str, key: &str) -> anyhow::Result<()> {
        let mut data = lock(&self.data);
        let removed = data
            .get_mut(namespace)
            .and_then(|ns| ns.remove(key))
            .is_some();
        if removed {
            self.save(&data)?;
        }
        Ok(())
    }

    fn keys(&self, namespace: &str) -> Vec<String> {
        lock(&self.data)
            .get(namespace)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default()
    }
}

fn get_typed<T: DeserializeOwned, S: KeyValueStore + ?Sized>(
    store: &S,
    namespace: &str,
    key: &str,
) -> Option<T> {
    let value = store.get(namespace, key)?;
    match serde_json::from_value(value) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("[store] dropping unreadable {}/{}: {}", namespace, key, e);
            None
        }
    }
}

fn set_typed<T: Serialize, S: KeyValueStore + ?Sized>(
    store: &S,
    namespace: &str,
    key: &str,
    value: &T,
) -> anyhow::Result<()> {
    store.set(namespace, key, serde_json::to_value(value)?)
}

/// Typed access to the three download namespaces.
pub trait DownloadStore {
    fn resume_package(&self, id: EpisodeId) -> Option<ResumePackage>;
    fn set_resume_package(&self, pkg: &ResumePackage) -> anyhow::Result<()>;
    fn remove_resume_package(&self, id: EpisodeId) -> anyhow::Result<()>;
    fn resume_package_ids(&self) -> Vec<EpisodeId>;
    fn file_record(&self, id: EpisodeId) -> Option<FileRecord>;
    fn set_file_record(&self, id: EpisodeId, record: &FileRecord) -> anyhow::Result<()>;
    fn remove_file_record(&self, id: EpisodeId) -> anyhow::Result<()>;
    fn queue_snapshot(&self) -> Vec<QueueRecord>;
    fn set_queue_snapshot(&self, records: &[QueueRecord]) -> anyhow::Result<()>;
}

impl<S: KeyValueStore + ?Sized> DownloadStore for S {
    fn resume_package(&self, id: EpisodeId) -> Option<ResumePackage> {
        get_typed(self, RESUME_PACKAGES, &id.to_string())
    }

    fn set_resume_package(&self, pkg: &ResumePackage) -> anyhow::Result<()> {
        set_typed(self, RESUME_PACKAGES, &pkg.id().to_string(), pkg)
    }

    fn remove_resume_package(&self, id: EpisodeId) -> anyhow::Result<()> {
        self.remove(RESUME_PACKAGES, &id.to_string())
    }

    fn resume_package_ids(&self) -> Vec<EpisodeId> {
        self.keys(RESUME_PACKAGES)
            .iter()
            .filter_map(|k| k.parse().ok())
            .collect()
    }

    fn file_record(&self, id: EpisodeId) -> Option<FileRecord> {
        get_typed(self, FILE_RECORDS, &id.to_string())
    }

    fn set_file_record(&self, id: EpisodeId, record: &FileRecord) -> anyhow::Result<()> {
        set_typed(self, FILE_RECORDS, &id.to_string(), record)
    }

    fn remove_file_record(&self, id: EpisodeId) -> anyhow::Result<()> {
        self.remove(FILE_RECORDS, &id.to_string())
    }

    fn queue_snapshot(&self) -> Vec<QueueRecord> {
        get_typed(self, QUEUE, QUEUE_KEY).unwrap_or_default()
    }

    fn set_queue_snapshot(&self, records: &[QueueRecord]) -> anyhow::Result<()> {
        set_typed(self, QUEUE, QUEUE_KEY, &records)
    }
}
