use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use uuid::Uuid;

use super::error::DownloadError;
use super::metadata::format_speed;

/// Stable handle for one logical download request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct DownloadId(Uuid);

impl DownloadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DownloadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DownloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DownloadState {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DownloadState::Completed | DownloadState::Failed | DownloadState::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    percentage: f64,
    pub bytes_per_second: f64,
    pub speed: String,
}

impl DownloadProgress {
    pub fn new(bytes_downloaded: u64, total_bytes: Option<u64>, bytes_per_second: f64) -> Self {
        let total_bytes = total_bytes.filter(|total| *total > 0);
        Self {
            bytes_downloaded,
            total_bytes,
            percentage: percentage(bytes_downloaded, total_bytes),
            bytes_per_second,
            speed: format_speed(bytes_per_second),
        }
    }

    /// 0.0 to 100.0; exactly 100.0 only once every expected byte arrived.
    pub fn percentage(&self) -> f64 {
        self.percentage
    }

    pub fn is_indeterminate(&self) -> bool {
        self.total_bytes.is_none()
    }

    pub fn is_complete(&self) -> bool {
        self.total_bytes
            .is_some_and(|total| self.bytes_downloaded >= total)
    }
}

fn percentage(bytes: u64, total: Option<u64>) -> f64 {
    match total {
        Some(total) if bytes >= total => 100.0,
        Some(total) => {
            let pct = bytes as f64 / total as f64 * 100.0;
            if pct >= 100.0 {
                99.99
            } else {
                pct
            }
        }
        None => 0.0,
    }
}

/// Snapshot of a tracked download.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadInfo {
    pub id: DownloadId,
    pub url: String,
    pub file_name: String,
    pub final_path: PathBuf,
    pub temp_path: PathBuf,
    pub expected_size: Option<u64>,
    pub state: DownloadState,
    pub last_progress: Option<DownloadProgress>,
}

#[derive(Debug)]
pub enum FinishOutcome {
    Completed { path: PathBuf, size: u64 },
    Failed { error: DownloadError },
    Cancelled,
}

impl FinishOutcome {
    pub fn state(&self) -> DownloadState {
        match self {
            FinishOutcome::Completed { .. } => DownloadState::Completed,
            FinishOutcome::Failed { .. } => DownloadState::Failed,
            FinishOutcome::Cancelled => DownloadState::Cancelled,
        }
    }
}

/// Terminal signal for one download, handed back to the owning thread.
#[derive(Debug)]
pub struct DownloadFinished {
    pub id: DownloadId,
    pub file_name: String,
    pub outcome: FinishOutcome,
}
