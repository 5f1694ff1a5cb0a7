use serde::Serialize;

use streamsave_core::core::events::{DownloadState, SegmentProgress};
use streamsave_core::models::download::EpisodeId;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TransferUpdate {
    pub id: EpisodeId,
    pub display_name: String,
    pub state: DownloadState,
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    pub segments: Option<SegmentProgress>,
}

impl TransferUpdate {
    pub fn percent(&self) -> Option<f64> {
        match self.total_bytes {
            Some(total) if total > 0 => {
                Some((self.bytes_downloaded as f64 / total as f64 * 100.0).min(100.0))
            }
            _ => None,
        }
    }

    pub fn display_string(&self) -> String {
        let mb = |b: u64| b as f64 / 1_000_000.0;
        match self.state {
            DownloadState::Pending => format!("{}: Queued", self.display_name),
            DownloadState::Downloading => match (self.percent(), self.segments) {
                (Some(p), Some(seg)) => format!(
                    "{}: {:.1}% ({}/{} segments, {:.1} MB)",
                    self.display_name,
                    p,
                    seg.written,
                    seg.total,
                    mb(self.bytes_downloaded)
                ),
                (Some(p), None) => format!(
                    "{}: {:.1}% ({:.1} / {:.1} MB)",
                    self.display_name,
                    p,
                    mb(self.bytes_downloaded),
                    mb(self.total_bytes.unwrap_or_default())
                ),
                (None, _) => format!(
                    "{}: {:.1} MB",
                    self.display_name,
                    mb(self.bytes_downloaded)
                ),
            },
            DownloadState::Paused => format!("{}: Paused", self.display_name),
            DownloadState::Done => format!("{}: Completed", self.display_name),
            DownloadState::Stopped => format!("{}: Stopped", self.display_name),
            DownloadState::Failed => format!("{}: Failed", self.display_name),
        }
    }
}

/// Renders platform notifications. Errors are logged by the caller and
/// never interrupt the transfer.
pub trait TransferNotifier: Send + Sync {
    fn render(&self, update: &TransferUpdate) -> anyhow::Result<()>;
}

pub struct LogNotifier;

impl TransferNotifier for LogNotifier {
    fn render(&self, update: &TransferUpdate) -> anyhow::Result<()> {
        tracing::info!("{}", update.display_string());
        Ok(())
    }
}

pub struct NoopNotifier;

impl TransferNotifier for NoopNotifier {
    fn render(&self, _update: &TransferUpdate) -> anyhow::Result<()> {
        Ok(())
    }
}
