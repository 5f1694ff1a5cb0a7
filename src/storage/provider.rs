use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWrite;

use streamsave_core::fs_paths::AppPaths;
use streamsave_core::models::settings::{DownloadSettings, StorageBackendKind};

use crate::core::filename::sanitize_path_component;

pub type OutputStream = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("could not create {path}: {source}")]
    Create {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid storage path: {0}")]
    InvalidPath(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Abstract destination for downloaded media. Paths are logical: a folder
/// relative to the backend root plus a file name.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Opens `folder/name` for writing. `append` keeps existing bytes and
    /// positions at the end; otherwise the file is truncated.
    async fn open(
        &self,
        folder: Option<&str>,
        name: &str,
        append: bool,
    ) -> Result<OutputStream, StorageError>;

    async fn file_length(&self, relative_path: &str) -> Result<Option<u64>, StorageError>;

    /// Returns whether a file was removed.
    async fn delete(&self, relative_path: &str) -> Result<bool, StorageError>;

    /// Cuts an existing file down to `len` bytes.
    async fn truncate(&self, relative_path: &str, len: u64) -> Result<(), StorageError>;

    /// Base path recorded alongside file records, if the backend exposes one.
    fn base_path(&self) -> Option<String>;

    fn relative_path(&self, folder: Option<&str>, name: &str) -> String {
        match folder.map(|f| f.trim_matches('/')).filter(|f| !f.is_empty()) {
            Some(folder) => format!("{}/{}", folder, name),
            None => name.to_string(),
        }
    }
}

/// Logical target of one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub folder: Option<String>,
    pub name: String,
}

impl Destination {
    pub fn new(folder: Option<String>, name: impl Into<String>) -> Self {
        Self {
            folder,
            name: name.into(),
        }
    }

    pub fn relative_path(&self, storage: &dyn StorageProvider) -> String {
        storage.relative_path(self.folder.as_deref(), &self.name)
    }
}

fn checked_join(root: &Path, relative: &str) -> Result<PathBuf, StorageError> {
    let rel = Path::new(relative);
    if rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(StorageError::InvalidPath(relative.to_string()));
    }
    Ok(root.join(rel))
}

async fn open_file(path: &Path, append: bool) -> Result<OutputStream, StorageError> {
    let display = path.display().to_string();
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| StorageError::Create {
                path: display.clone(),
                source,
            })?;
    }
    let file = if append {
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|source| StorageError::Open {
                path: display,
                source,
            })?
    } else {
        tokio::fs::File::create(path)
            .await
            .map_err(|source| StorageError::Create {
                path: display,
                source,
            })?
    };
    Ok(Box::new(file))
}

async fn length_of(path: &Path) -> Result<Option<u64>, StorageError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn set_len(path: &Path, len: u64) -> Result<(), StorageError> {
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map_err(|source| StorageError::Open {
            path: path.display().to_string(),
            source,
        })?;
    file.set_len(len).await?;
    file.sync_all().await?;
    Ok(())
}

async fn remove(path: &Path) -> Result<bool, StorageError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Writes straight into a user-visible directory.
pub struct DirectStorage {
    root: PathBuf,
}

impl DirectStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn ensure_root(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
            StorageError::Unavailable(format!("{}: {}", self.root.display(), e))
        })
    }
}

#[async_trait]
impl StorageProvider for DirectStorage {
    async fn open(
        &self,
        folder: Option<&str>,
        name: &str,
        append: bool,
    ) -> Result<OutputStream, StorageError> {
        self.ensure_root().await?;
        let path = checked_join(&self.root, &self.relative_path(folder, name))?;
        open_file(&path, append).await
    }

    async fn file_length(&self, relative_path: &str) -> Result<Option<u64>, StorageError> {
        length_of(&checked_join(&self.root, relative_path)?).await
    }

    async fn delete(&self, relative_path: &str) -> Result<bool, StorageError> {
        remove(&checked_join(&self.root, relative_path)?).await
    }

    async fn truncate(&self, relative_path: &str, len: u64) -> Result<(), StorageError> {
        set_len(&checked_join(&self.root, relative_path)?, len).await
    }

    fn base_path(&self) -> Option<String> {
        Some(self.root.to_string_lossy().to_string())
    }
}

/// App-owned media store. Folder names are normalized per segment and no
/// base path is exposed, so records stay valid if the store moves.
pub struct ManagedStorage {
    root: PathBuf,
}

impl ManagedStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl StorageProvider for ManagedStorage {
    async fn open(
        &self,
        folder: Option<&str>,
        name: &str,
        append: bool,
    ) -> Result<OutputStream, StorageError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StorageError::Unavailable(format!("media store: {}", e)))?;
        let path = checked_join(&self.root, &self.relative_path(folder, name))?;
        open_file(&path, append).await
    }

    async fn file_length(&self, relative_path: &str) -> Result<Option<u64>, StorageError> {
        length_of(&checked_join(&self.root, relative_path)?).await
    }

    async fn delete(&self, relative_path: &str) -> Result<bool, StorageError> {
        remove(&checked_join(&self.root, relative_path)?).await
    }

    async fn truncate(&self, relative_path: &str, len: u64) -> Result<(), StorageError> {
        set_len(&checked_join(&self.root, relative_path)?, len).await
    }

    fn base_path(&self) -> Option<String> {
        None
    }

    fn relative_path(&self, folder: Option<&str>, name: &str) -> String {
        let mut parts: Vec<String> = folder
            .unwrap_or_default()
            .split('/')
            .map(sanitize_path_component)
            .filter(|p| !p.is_empty() && p != "." && p != "..")
            .collect();
        parts.push(name.to_string());
        parts.join("/")
    }
}

pub fn storage_for(settings: &DownloadSettings, paths: &dyn AppPaths) -> Arc<dyn StorageProvider> {
    match settings.storage_backend {
        StorageBackendKind::Direct => Arc::new(DirectStorage::new(&settings.default_output_dir)),
        StorageBackendKind::Managed => Arc::new(ManagedStorage::new(paths.media_dir())),
    }
}
