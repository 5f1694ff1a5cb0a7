use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Primary key for everything tracked per playable unit.
pub type EpisodeId = i64;

/// One candidate source for an episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractorLink {
    pub source: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub referer: String,
    /// Vertical resolution when known, 0 otherwise.
    #[serde(default)]
    pub quality: u32,
    #[serde(default)]
    pub is_m3u8: bool,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Opaque token handed to the keepalive task while this link is in use.
    #[serde(default)]
    pub keepalive: Option<String>,
}

impl ExtractorLink {
    pub fn is_torrent(&self) -> bool {
        let url = self.url.trim().to_ascii_lowercase();
        if url.starts_with("magnet:") {
            return true;
        }
        let path = url.split(['?', '#']).next().unwrap_or_default();
        path.ends_with(".torrent")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeMetadata {
    pub id: EpisodeId,
    pub name: String,
    #[serde(default)]
    pub season: Option<u32>,
    #[serde(default)]
    pub episode: Option<u32>,
    #[serde(default)]
    pub poster: Option<String>,
    #[serde(default)]
    pub source: String,
}

/// What to download: an episode plus its ordered candidate links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadItem {
    pub source: String,
    /// Logical folder relative to the storage root.
    #[serde(default)]
    pub folder: Option<String>,
    pub ep: EpisodeMetadata,
    pub links: Vec<ExtractorLink>,
}

impl DownloadItem {
    pub fn id(&self) -> EpisodeId {
        self.ep.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumePackage {
    pub item: DownloadItem,
    /// Link currently or last being attempted; `None` for a fresh item.
    #[serde(default)]
    pub link_index: Option<usize>,
}

impl ResumePackage {
    pub fn new(item: DownloadItem) -> Self {
        Self {
            item,
            link_index: None,
        }
    }

    pub fn id(&self) -> EpisodeId {
        self.item.id()
    }
}

/// Where a downloaded (or partially downloaded) episode lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub total_bytes: i64,
    pub relative_path: String,
    pub display_name: String,
    /// HLS write watermark, as text.
    #[serde(default)]
    pub extra_info: Option<String>,
    #[serde(default)]
    pub base_path: Option<String>,
    /// Bytes on disk when the HLS watermark was persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark_bytes: Option<u64>,
}

impl FileRecord {
    pub fn watermark(&self) -> Option<usize> {
        self.extra_info.as_deref().and_then(|s| s.trim().parse().ok())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueRecord {
    pub index: usize,
    pub pkg: ResumePackage,
}
