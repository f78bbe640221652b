mod stat_cache;
mod throttle;
mod transfer;

pub use stat_cache::{CacheConfig, FileInfo, FileStat, FileStatCache, FsProbe, StatProbe};
pub use throttle::{ProgressThrottler, ThrottleConfig};
pub use transfer::{
    ChunkedTransfer, TransferConfig, TransferError, TransferJob, TransferMode, TransferOutcome,
};
