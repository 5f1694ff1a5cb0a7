use serde::Serialize;

use crate::storage::provider::StorageError;

/// Result of one transfer attempt. Success covers deliberate stops, so
/// callers can tell cancellation apart from failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DownloadOutcome {
    Done,
    Stopped,
    CreateFile,
    OpenFile,
    TooSmall,
    WrongContent,
    Connection,
    StorageUnavailable,
    Unsupported,
}

impl DownloadOutcome {
    pub fn code(self) -> i32 {
        match self {
            Self::Done => 1,
            Self::Stopped => 2,
            Self::CreateFile => -2,
            Self::OpenFile => -3,
            Self::TooSmall => -4,
            Self::WrongContent => -5,
            Self::Connection => -6,
            Self::StorageUnavailable => -9,
            Self::Unsupported => -10,
        }
    }

    pub fn is_success(self) -> bool {
        self.code() > 0
    }

    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::CreateFile
                | Self::OpenFile
                | Self::TooSmall
                | Self::WrongContent
                | Self::Connection
        )
    }

    pub fn from_storage_error(err: &StorageError) -> Self {
        match err {
            StorageError::Unavailable(_) => Self::StorageUnavailable,
            StorageError::Open { .. } => Self::OpenFile,
            StorageError::Create { .. } | StorageError::InvalidPath(_) | StorageError::Io(_) => {
                Self::CreateFile
            }
        }
    }
}
