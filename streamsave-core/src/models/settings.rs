use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    pub schema_version: u32,
    #[serde(default)]
    pub download: DownloadSettings,
    #[serde(default)]
    pub advanced: AdvancedSettings,
    #[serde(default)]
    pub proxy: ProxySettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    /// Plain filesystem under `default_output_dir`.
    #[default]
    Direct,
    /// App-owned media directory; callers never see a base path.
    Managed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSettings {
    #[serde(default = "default_output_dir")]
    pub default_output_dir: PathBuf,
    #[serde(default)]
    pub storage_backend: StorageBackendKind,
    #[serde(default = "default_min_video_bytes")]
    pub min_video_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancedSettings {
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: u32,
    #[serde(default = "default_hls_parallelism")]
    pub hls_parallelism: u32,
    #[serde(default = "default_segment_retries")]
    pub segment_retries: u32,
    #[serde(default = "default_notify_interval_ms")]
    pub notify_interval_ms: u64,
}

impl AdvancedSettings {
    pub fn parallelism(&self) -> usize {
        self.hls_parallelism.max(1) as usize
    }
}

fn default_output_dir() -> PathBuf {
    dirs::download_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_min_video_bytes() -> u64 {
    5_000_000
}

fn default_max_concurrent_downloads() -> u32 {
    3
}

fn default_hls_parallelism() -> u32 {
    3
}

fn default_segment_retries() -> u32 {
    3
}

fn default_notify_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProxySettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_proxy_type")]
    pub proxy_type: String,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_proxy_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

fn default_proxy_type() -> String {
    "http".into()
}

fn default_proxy_port() -> u16 {
    8080
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            default_output_dir: default_output_dir(),
            storage_backend: StorageBackendKind::default(),
            min_video_bytes: default_min_video_bytes(),
        }
    }
}

impl Default for AdvancedSettings {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: default_max_concurrent_downloads(),
            hls_parallelism: default_hls_parallelism(),
            segment_retries: default_segment_retries(),
            notify_interval_ms: default_notify_interval_ms(),
        }
    }
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            schema_version: 1,
            download: DownloadSettings::default(),
            advanced: AdvancedSettings::default(),
            proxy: ProxySettings::default(),
        }
    }
}
