use std::io;

use thiserror::Error;

use super::progress::DownloadId;
use crate::storage::TransferError;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("unknown model {0:?} and no download url given")]
    UnknownModel(String),
    #[error("a model name or a download url is required")]
    MissingSource,
    #[error("cannot derive a file name from {0:?}")]
    InvalidUrl(String),
    #[error("{0} is already being downloaded")]
    AlreadyActive(String),
    #[error("transport rejected the download: {0}")]
    EnqueueFailure(String),
    #[error("network failure: {0}")]
    NetworkFailure(String),
    #[error("finalize failed: {0}")]
    Finalize(#[from] TransferError),
    #[error("download {0} is not active")]
    NotActive(DownloadId),
    #[error("download {0} cannot be {1} in its current state")]
    InvalidState(DownloadId, &'static str),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl DownloadError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
