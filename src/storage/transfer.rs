use std::{
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    thread,
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

const MIB: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("source file not found: {0}")]
    NotFound(PathBuf),
    #[error("source file is empty: {0}")]
    EmptySource(PathBuf),
    #[error("size mismatch for {path}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("transfer cancelled")]
    Cancelled,
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl TransferError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct TransferConfig {
    pub block_size: usize,
    pub yield_every: usize,
    pub verify: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            block_size: MIB,
            yield_every: 5,
            verify: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Move,
    Copy,
}

#[derive(Debug, Clone)]
pub struct TransferJob {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub mode: TransferMode,
    pub expected_size: Option<u64>,
    pub checksum: Option<String>,
}

impl TransferJob {
    pub fn moving(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            mode: TransferMode::Move,
            expected_size: None,
            checksum: None,
        }
    }

    pub fn copying(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            mode: TransferMode::Copy,
            ..Self::moving(source, destination)
        }
    }

    #[must_use]
    pub fn with_expected_size(mut self, expected: Option<u64>) -> Self {
        self.expected_size = expected;
        self
    }

    #[must_use]
    pub fn with_checksum(mut self, checksum: Option<String>) -> Self {
        self.checksum = checksum;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub destination: PathBuf,
    pub bytes_transferred: u64,
    pub checksum: String,
    pub source_removed: bool,
}

/// Streams one file into another in fixed-size blocks.
///
/// The destination is only ever complete or absent after a call returns: any
/// failure removes what was written, and a move deletes the source only after
/// the destination passed verification.
#[derive(Debug, Clone, Default)]
pub struct ChunkedTransfer {
    config: TransferConfig,
}

impl ChunkedTransfer {
    pub fn new(config: TransferConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn move_or_copy<F>(
        &self,
        job: &TransferJob,
        cancel: Option<&AtomicBool>,
        mut on_progress: F,
    ) -> Result<TransferOutcome, TransferError>
    where
        F: FnMut(f64),
    {
        let source_size = source_size(&job.source)?;
        if let Some(expected) = job.expected_size {
            if expected != source_size {
                return Err(TransferError::SizeMismatch {
                    path: job.source.clone(),
                    expected,
                    actual: source_size,
                });
            }
        }

        debug!(
            "transfer_start: {} -> {} ({} bytes, {:?})",
            job.source.display(),
            job.destination.display(),
            source_size,
            job.mode
        );

        let result = self
            .stream(job, source_size, cancel, &mut on_progress)
            .and_then(|(written, checksum)| self.verify(job, source_size, written, checksum));

        let (bytes_transferred, checksum) = match result {
            Ok(done) => done,
            Err(error) => {
                discard_partial(&job.destination);
                return Err(error);
            }
        };

        let mut source_removed = false;
        if job.mode == TransferMode::Move {
            match fs::remove_file(&job.source) {
                Ok(()) => source_removed = true,
                Err(error) => warn!(
                    "transfer_source_cleanup_failed: {} {error}",
                    job.source.display()
                ),
            }
        }

        Ok(TransferOutcome {
            destination: job.destination.clone(),
            bytes_transferred,
            checksum,
            source_removed,
        })
    }

    fn stream<F>(
        &self,
        job: &TransferJob,
        source_size: u64,
        cancel: Option<&AtomicBool>,
        on_progress: &mut F,
    ) -> Result<(u64, String), TransferError>
    where
        F: FnMut(f64),
    {
        let mut reader = File::open(&job.source)
            .map_err(|e| TransferError::io(format!("open {}", job.source.display()), e))?;
        if let Some(parent) = job.destination.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| TransferError::io("create destination directory", e))?;
        }
        let mut writer = File::create(&job.destination)
            .map_err(|e| TransferError::io(format!("create {}", job.destination.display()), e))?;

        let block_size = self.config.block_size.max(1);
        let yield_every = self.config.yield_every.max(1);
        let mut buffer = vec![0u8; block_size];
        let mut hasher = Sha256::new();
        let mut transferred = 0u64;
        let mut blocks = 0usize;

        loop {
            if cancel.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
                return Err(TransferError::Cancelled);
            }

            let read = read_block(&mut reader, &mut buffer)
                .map_err(|e| TransferError::io("read source block", e))?;
            if read == 0 {
                break;
            }
            writer
                .write_all(&buffer[..read])
                .map_err(|e| TransferError::io("write destination block", e))?;
            hasher.update(&buffer[..read]);

            transferred += read as u64;
            blocks += 1;
            on_progress((transferred as f64 / source_size as f64).min(1.0));

            if blocks % yield_every == 0 {
                thread::yield_now();
            }
        }

        writer
            .flush()
            .and_then(|_| writer.sync_all())
            .map_err(|e| TransferError::io("flush destination", e))?;
        drop(writer);

        Ok((transferred, format!("{:x}", hasher.finalize())))
    }

    /// SHA-256 of `path`, read in the same blocks a transfer uses.
    pub fn checksum(&self, path: &Path) -> Result<String, TransferError> {
        let mut reader = File::open(path)
            .map_err(|e| TransferError::io(format!("open {}", path.display()), e))?;
        let mut buffer = vec![0u8; self.config.block_size.max(1)];
        let mut hasher = Sha256::new();
        loop {
            let read = read_block(&mut reader, &mut buffer)
                .map_err(|e| TransferError::io("read block for hashing", e))?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    fn verify(
        &self,
        job: &TransferJob,
        source_size: u64,
        written: u64,
        checksum: String,
    ) -> Result<(u64, String), TransferError> {
        if self.config.verify {
            let actual = fs::metadata(&job.destination)
                .map(|meta| meta.len())
                .map_err(|e| TransferError::io("stat destination", e))?;
            if actual != source_size {
                return Err(TransferError::SizeMismatch {
                    path: job.destination.clone(),
                    expected: source_size,
                    actual,
                });
            }
        }

        if let Some(expected) = &job.checksum {
            if !expected.eq_ignore_ascii_case(&checksum) {
                return Err(TransferError::ChecksumMismatch {
                    expected: expected.clone(),
                    actual: checksum,
                });
            }
        }

        Ok((written, checksum))
    }
}

fn source_size(path: &Path) -> Result<u64, TransferError> {
    let meta = match fs::metadata(path) {
        Ok(meta) if meta.is_file() => meta,
        Ok(_) => return Err(TransferError::NotFound(path.to_path_buf())),
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            return Err(TransferError::NotFound(path.to_path_buf()))
        }
        Err(error) => return Err(TransferError::io(format!("stat {}", path.display()), error)),
    };
    if meta.len() == 0 {
        return Err(TransferError::EmptySource(path.to_path_buf()));
    }
    Ok(meta.len())
}

/// Fills `buffer` unless the reader runs dry first.
fn read_block<R: Read>(reader: &mut R, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(error),
        }
    }
    Ok(filled)
}

fn discard_partial(path: &Path) {
    if path.exists() {
        if let Err(error) = fs::remove_file(path) {
            warn!("transfer_partial_cleanup_failed: {} {error}", path.display());
        }
    }
}
