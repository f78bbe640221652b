mod catalog;
mod download;
mod error;
mod metadata;
mod progress;
mod service;

pub use catalog::{
    file_name_from_uri, resolve_model_dir, temp_path_for, KnownModel, ModelCatalog, TEMP_SUFFIX,
};
pub use download::{
    notification_channel, EventReceiver, EventSender, HttpConfig, HttpTransport, TransferId,
    TransferRequest, Transport, TransportEvent, TransportStatus,
};
pub use error::DownloadError;
pub use metadata::{format_bytes, format_speed, parse_size_label};
pub use progress::{
    DownloadFinished, DownloadId, DownloadInfo, DownloadProgress, DownloadState, FinishOutcome,
};
pub use service::{DownloadManager, DownloadRequest, ManagerConfig, ProgressCallback};
