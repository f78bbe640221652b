pub mod core;
pub mod models;
pub mod storage;

pub use crate::core::{DepotContext, ModelStatus, Settings, SettingsManager};
pub use crate::models::{
    DownloadError, DownloadFinished, DownloadId, DownloadManager, DownloadProgress,
    DownloadRequest, FinishOutcome, ModelCatalog,
};
pub use crate::storage::{ChunkedTransfer, FileStatCache, ProgressThrottler};
