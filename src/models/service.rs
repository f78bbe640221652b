use std::{
    collections::{HashMap, HashSet},
    fmt, fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::storage::{
    ChunkedTransfer, FileStatCache, ProgressThrottler, ThrottleConfig, TransferConfig,
    TransferError, TransferJob, TransferOutcome,
};

use super::{
    catalog::{file_name_from_uri, temp_path_for, KnownModel, ModelCatalog, TEMP_SUFFIX},
    download::{
        notification_channel, EventReceiver, HttpConfig, HttpTransport, TransferId,
        TransferRequest, Transport, TransportEvent, TransportStatus,
    },
    error::DownloadError,
    progress::{
        DownloadFinished, DownloadId, DownloadInfo, DownloadProgress, DownloadState, FinishOutcome,
    },
};

pub type ProgressCallback = Box<dyn FnMut(&DownloadProgress) + Send>;

/// What to download. At least one of `model` and `url` must be set.
#[derive(Default)]
pub struct DownloadRequest {
    pub model: Option<String>,
    pub url: Option<String>,
    on_progress: Option<ProgressCallback>,
}

impl DownloadRequest {
    pub fn model(name: impl Into<String>) -> Self {
        Self {
            model: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    #[must_use]
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&DownloadProgress) + Send + 'static,
    {
        self.on_progress = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for DownloadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadRequest")
            .field("model", &self.model)
            .field("url", &self.url)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub models_dir: PathBuf,
    pub transfer: TransferConfig,
    pub throttle: ThrottleConfig,
}

impl ManagerConfig {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
            transfer: TransferConfig::default(),
            throttle: ThrottleConfig::default(),
        }
    }
}

struct DownloadTask {
    info: DownloadInfo,
    /// `None` once the transport is done and finalize runs.
    transfer_id: Option<TransferId>,
    exact_size: Option<u64>,
    checksum: Option<String>,
    subscriber: Option<ProgressCallback>,
    throttler: ProgressThrottler,
    finalize_cancel: Option<Arc<AtomicBool>>,
    started_at: Instant,
}

impl DownloadTask {
    fn emit(&mut self, progress: DownloadProgress) {
        if let Some(callback) = self.subscriber.as_mut() {
            callback(&progress);
        }
        self.info.last_progress = Some(progress);
    }

    fn bytes_per_second(&self, bytes: u64) -> f64 {
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            bytes as f64 / elapsed
        } else {
            0.0
        }
    }
}

struct FinalizeReport {
    id: DownloadId,
    result: Result<TransferOutcome, TransferError>,
}

/// A cancelled download whose worker has not stopped yet. Its file name stays
/// reserved until then, since the worker may still write or delete the temp file.
struct Abandoned {
    file_name: String,
    final_path: PathBuf,
    temp_path: PathBuf,
}

/// Owns every in-flight download and drives it from enqueue to a terminal state.
///
/// All state lives on the thread that owns the manager. Transports and
/// finalize workers only talk back through channels, which
/// [`process_events`](Self::process_events) and
/// [`wait_for_events`](Self::wait_for_events) drain.
pub struct DownloadManager {
    config: ManagerConfig,
    catalog: ModelCatalog,
    transport: Box<dyn Transport>,
    events: EventReceiver,
    finalize_tx: Sender<FinalizeReport>,
    finalize_rx: Receiver<FinalizeReport>,
    tasks: HashMap<DownloadId, DownloadTask>,
    by_transfer: HashMap<TransferId, DownloadId>,
    /// Cancelled transfers waiting for their terminal notification.
    draining: HashMap<TransferId, Abandoned>,
    /// Cancelled downloads whose finalize worker is still running.
    abandoned: HashMap<DownloadId, Abandoned>,
    cache: Arc<FileStatCache>,
    transfer: ChunkedTransfer,
}

impl DownloadManager {
    pub fn new(
        config: ManagerConfig,
        catalog: ModelCatalog,
        transport: Box<dyn Transport>,
        events: EventReceiver,
        cache: Arc<FileStatCache>,
    ) -> Self {
        let (finalize_tx, finalize_rx) = unbounded();
        let transfer = ChunkedTransfer::new(config.transfer.clone());
        Self {
            config,
            catalog,
            transport,
            events,
            finalize_tx,
            finalize_rx,
            tasks: HashMap::new(),
            by_transfer: HashMap::new(),
            draining: HashMap::new(),
            abandoned: HashMap::new(),
            cache,
            transfer,
        }
    }

    /// Manager backed by [`HttpTransport`].
    pub fn with_http(
        config: ManagerConfig,
        catalog: ModelCatalog,
        http: HttpConfig,
        cache: Arc<FileStatCache>,
    ) -> Self {
        let (sender, receiver) = notification_channel();
        let transport = HttpTransport::new(http, sender);
        Self::new(config, catalog, Box::new(transport), receiver, cache)
    }

    pub fn models_dir(&self) -> &Path {
        &self.config.models_dir
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub fn cache(&self) -> &Arc<FileStatCache> {
        &self.cache
    }

    /// Enqueues a download and returns at once; the fetch runs in the background.
    pub fn start(&mut self, request: DownloadRequest) -> Result<DownloadId, DownloadError> {
        let DownloadRequest {
            model,
            url,
            on_progress,
        } = request;

        let known: Option<KnownModel> = match (&model, &url) {
            (Some(name), _) => self.catalog.find(name).cloned(),
            (None, Some(url)) => self.catalog.find_by_uri(url).cloned(),
            (None, None) => return Err(DownloadError::MissingSource),
        };
        let expected_size = known.as_ref().and_then(KnownModel::expected_size);
        let exact_size = known.as_ref().and_then(|model| model.size_bytes).filter(|size| *size > 0);
        let checksum = known.as_ref().and_then(|model| model.checksum.clone());

        let (file_name, url) = match (known, model, url) {
            (Some(known), _, Some(url)) => (known.name, url),
            (Some(known), _, None) => (known.name, known.uri),
            (None, Some(name), Some(url)) => (name, url),
            (None, Some(name), None) => return Err(DownloadError::UnknownModel(name)),
            (None, None, Some(url)) => match file_name_from_uri(&url) {
                Some(name) => (name, url),
                None => return Err(DownloadError::InvalidUrl(url)),
            },
            (None, None, None) => return Err(DownloadError::MissingSource),
        };
        if !is_plain_file_name(&file_name) {
            return Err(DownloadError::InvalidUrl(file_name));
        }

        if self.is_reserved(&file_name) {
            return Err(DownloadError::AlreadyActive(file_name));
        }

        fs::create_dir_all(&self.config.models_dir)
            .map_err(|err| DownloadError::io("create models dir", err))?;
        let final_path = self.config.models_dir.join(&file_name);
        let temp_path = temp_path_for(&final_path);

        let transfer_id = self
            .transport
            .enqueue(TransferRequest {
                url: url.clone(),
                destination: temp_path.clone(),
                expected_size,
                exact_size,
            })
            .map_err(|err| match err {
                DownloadError::EnqueueFailure(_) => err,
                other => DownloadError::EnqueueFailure(other.to_string()),
            })?;

        let id = DownloadId::new();
        info!("download_start: {id} {file_name} via {transfer_id}");
        self.by_transfer.insert(transfer_id, id);
        self.tasks.insert(
            id,
            DownloadTask {
                info: DownloadInfo {
                    id,
                    url,
                    file_name,
                    final_path,
                    temp_path,
                    expected_size,
                    state: DownloadState::Queued,
                    last_progress: None,
                },
                transfer_id: Some(transfer_id),
                exact_size,
                checksum,
                subscriber: on_progress,
                throttler: ProgressThrottler::new(self.config.throttle.clone()),
                finalize_cancel: None,
                started_at: Instant::now(),
            },
        );
        Ok(id)
    }

    /// Stops tracking `id` and asks the transport or the finalize worker to stop.
    /// Returns false for unknown or already finished downloads.
    ///
    /// The file name cannot be started again until the stopped worker has
    /// reported back through [`process_events`](Self::process_events).
    pub fn cancel(&mut self, id: DownloadId) -> bool {
        let Some(task) = self.tasks.remove(&id) else {
            return false;
        };
        let paths = Abandoned {
            file_name: task.info.file_name.clone(),
            final_path: task.info.final_path.clone(),
            temp_path: task.info.temp_path.clone(),
        };

        if let Some(transfer_id) = task.transfer_id {
            self.by_transfer.remove(&transfer_id);
            self.draining.insert(transfer_id, paths);
            self.transport.cancel(transfer_id);
        } else if let Some(flag) = task.finalize_cancel {
            flag.store(true, Ordering::SeqCst);
            self.abandoned.insert(id, paths);
        }
        self.cache.invalidate(&task.info.temp_path);
        info!("download_cancel: {id} {}", task.info.file_name);
        true
    }

    pub fn pause(&mut self, id: DownloadId) -> Result<(), DownloadError> {
        let task = self.tasks.get_mut(&id).ok_or(DownloadError::NotActive(id))?;
        if task.info.state == DownloadState::Paused {
            return Ok(());
        }
        let Some(transfer_id) = task.transfer_id else {
            return Err(DownloadError::InvalidState(id, "paused"));
        };
        if !self.transport.pause(transfer_id) {
            return Err(DownloadError::InvalidState(id, "paused"));
        }
        task.info.state = DownloadState::Paused;
        info!("download_pause: {id}");
        Ok(())
    }

    /// Resumes a paused download. A new transport id is re-keyed to the same
    /// [`DownloadId`], so callers never see it.
    pub fn resume(&mut self, id: DownloadId) -> Result<(), DownloadError> {
        let task = self.tasks.get_mut(&id).ok_or(DownloadError::NotActive(id))?;
        let (DownloadState::Paused, Some(old_id)) = (task.info.state, task.transfer_id) else {
            return Err(DownloadError::InvalidState(id, "resumed"));
        };

        let new_id = self.transport.resume(old_id)?;
        if new_id != old_id {
            self.by_transfer.remove(&old_id);
            self.by_transfer.insert(new_id, id);
            debug!("download_rekey: {id} {old_id} -> {new_id}");
        }
        task.transfer_id = Some(new_id);
        task.info.state = DownloadState::Queued;
        task.throttler.reset();
        task.started_at = Instant::now();
        info!("download_resume: {id}");
        Ok(())
    }

    pub fn get(&self, id: DownloadId) -> Option<DownloadInfo> {
        self.tasks.get(&id).map(|task| task.info.clone())
    }

    /// Snapshot of every tracked download.
    pub fn active_downloads(&self) -> Vec<DownloadInfo> {
        self.tasks.values().map(|task| task.info.clone()).collect()
    }

    /// True while a download of `file_name` runs or a cancelled one still winds down.
    pub fn is_reserved(&self, file_name: &str) -> bool {
        self.tasks
            .values()
            .any(|task| task.info.file_name == file_name)
            || self
                .draining
                .values()
                .chain(self.abandoned.values())
                .any(|paths| paths.file_name == file_name)
    }

    /// Applies every pending notification without blocking.
    pub fn process_events(&mut self) -> Vec<DownloadFinished> {
        let mut finished = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            finished.extend(self.apply_event(event));
        }
        while let Ok(report) = self.finalize_rx.try_recv() {
            finished.extend(self.apply_report(report));
        }
        finished
    }

    /// Blocks up to `timeout` for a notification, then drains the rest.
    pub fn wait_for_events(&mut self, timeout: Duration) -> Vec<DownloadFinished> {
        let events = self.events.clone();
        let reports = self.finalize_rx.clone();
        let mut finished = Vec::new();

        select! {
            recv(events) -> event => {
                if let Ok(event) = event {
                    finished.extend(self.apply_event(event));
                }
            }
            recv(reports) -> report => {
                if let Ok(report) = report {
                    finished.extend(self.apply_report(report));
                }
            }
            default(timeout) => {}
        }

        finished.extend(self.process_events());
        finished
    }

    /// Deletes `.temp` files in the model directory that no download owns.
    pub fn sweep_temp_files(&self) -> usize {
        let owned: HashSet<&Path> = self
            .tasks
            .values()
            .map(|task| task.info.temp_path.as_path())
            .chain(
                self.draining
                    .values()
                    .chain(self.abandoned.values())
                    .map(|paths| paths.temp_path.as_path()),
            )
            .collect();

        let Ok(entries) = fs::read_dir(&self.config.models_dir) else {
            return 0;
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_temp = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(TEMP_SUFFIX));
            if !is_temp || !path.is_file() || owned.contains(path.as_path()) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    self.cache.invalidate(&path);
                    removed += 1;
                }
                Err(error) => warn!("sweep_failed: {} {error}", path.display()),
            }
        }
        if removed > 0 {
            info!("sweep_temp_files: removed {removed}");
        }
        removed
    }

    /// Drops all tracking. Transfers already running are left alone.
    pub fn dispose(self) {
        if !self.tasks.is_empty() {
            warn!(
                "download_dispose: dropping {} tracked downloads",
                self.tasks.len()
            );
        }
    }

    fn apply_event(&mut self, event: TransportEvent) -> Option<DownloadFinished> {
        let Some(&id) = self.by_transfer.get(&event.transfer_id) else {
            self.settle_cancelled(&event);
            return None;
        };

        match event.status {
            TransportStatus::Running => {
                let task = self.tasks.get_mut(&id)?;
                if task.info.state != DownloadState::Paused {
                    task.info.state = DownloadState::Running;
                }
                report_progress(task, &event);
                None
            }
            TransportStatus::Paused => {
                let task = self.tasks.get_mut(&id)?;
                task.info.state = DownloadState::Paused;
                None
            }
            TransportStatus::Complete => {
                self.by_transfer.remove(&event.transfer_id);
                self.begin_finalize(id, &event)
            }
            TransportStatus::Failed(message) => {
                self.by_transfer.remove(&event.transfer_id);
                let task = self.tasks.remove(&id)?;
                let _ = fs::remove_file(&task.info.temp_path);
                self.cache.invalidate(&task.info.temp_path);
                warn!("download_failed: {id} {message}");
                Some(DownloadFinished {
                    id,
                    file_name: task.info.file_name,
                    outcome: FinishOutcome::Failed {
                        error: DownloadError::NetworkFailure(message),
                    },
                })
            }
            TransportStatus::Cancelled => {
                self.by_transfer.remove(&event.transfer_id);
                let task = self.tasks.remove(&id)?;
                let _ = fs::remove_file(&task.info.temp_path);
                self.cache.invalidate(&task.info.temp_path);
                info!("download_cancelled: {id}");
                Some(DownloadFinished {
                    id,
                    file_name: task.info.file_name,
                    outcome: FinishOutcome::Cancelled,
                })
            }
        }
    }

    /// Releases a cancelled transfer once its worker reported its last word.
    fn settle_cancelled(&mut self, event: &TransportEvent) {
        let terminal = matches!(
            event.status,
            TransportStatus::Complete | TransportStatus::Failed(_) | TransportStatus::Cancelled
        );
        if !terminal {
            debug!("download_event_ignored: {}", event.transfer_id);
            return;
        }
        let Some(paths) = self.draining.remove(&event.transfer_id) else {
            debug!("download_event_ignored: {}", event.transfer_id);
            return;
        };
        let _ = fs::remove_file(&paths.temp_path);
        self.cache.invalidate(&paths.temp_path);
        debug!(
            "download_released: {} {}",
            paths.file_name, event.transfer_id
        );
    }

    fn begin_finalize(&mut self, id: DownloadId, event: &TransportEvent) -> Option<DownloadFinished> {
        let task = self.tasks.get_mut(&id)?;
        task.transfer_id = None;
        task.info.state = DownloadState::Running;

        let expected = event.bytes.or(event.total).or(task.exact_size);
        let job = TransferJob::moving(&task.info.temp_path, &task.info.final_path)
            .with_expected_size(expected)
            .with_checksum(task.checksum.clone());
        let cancel = Arc::new(AtomicBool::new(false));
        task.finalize_cancel = Some(cancel.clone());

        let transfer = self.transfer.clone();
        let reports = self.finalize_tx.clone();
        debug!("finalize_start: {id} expecting {expected:?} bytes");
        let spawned = thread::Builder::new()
            .name(format!("model-depot-finalize-{id}"))
            .spawn(move || {
                let result = transfer.move_or_copy(&job, Some(&cancel), |_| {});
                let _ = reports.send(FinalizeReport { id, result });
            });

        match spawned {
            Ok(_) => None,
            Err(error) => {
                let task = self.tasks.remove(&id)?;
                warn!("finalize_spawn_failed: {id} {error}");
                Some(DownloadFinished {
                    id,
                    file_name: task.info.file_name,
                    outcome: FinishOutcome::Failed {
                        error: DownloadError::io("spawn finalize worker", error),
                    },
                })
            }
        }
    }

    fn apply_report(&mut self, report: FinalizeReport) -> Option<DownloadFinished> {
        let FinalizeReport { id, result } = report;

        let Some(mut task) = self.tasks.remove(&id) else {
            if let Some(paths) = self.abandoned.remove(&id) {
                if result.is_ok() {
                    let _ = fs::remove_file(&paths.final_path);
                }
                let _ = fs::remove_file(&paths.temp_path);
                self.cache.invalidate(&paths.final_path);
                self.cache.invalidate(&paths.temp_path);
                debug!("finalize_discarded: {id}");
            }
            return None;
        };

        self.cache.invalidate(&task.info.final_path);
        self.cache.invalidate(&task.info.temp_path);

        let outcome = match result {
            Ok(outcome) => {
                if !outcome.source_removed {
                    let _ = fs::remove_file(&task.info.temp_path);
                }
                let size = outcome.bytes_transferred;
                let speed = task.bytes_per_second(size);
                task.emit(DownloadProgress::new(size, Some(size), speed));
                info!(
                    "download_complete: {id} {} ({size} bytes)",
                    outcome.destination.display()
                );
                FinishOutcome::Completed {
                    path: outcome.destination,
                    size,
                }
            }
            Err(error) => {
                let _ = fs::remove_file(&task.info.temp_path);
                warn!("finalize_failed: {id} {error}");
                FinishOutcome::Failed {
                    error: DownloadError::Finalize(error),
                }
            }
        };

        Some(DownloadFinished {
            id,
            file_name: task.info.file_name,
            outcome,
        })
    }
}

/// Turns a transport notification into a throttled progress update.
fn report_progress(task: &mut DownloadTask, event: &TransportEvent) {
    let total = event.total.or(task.info.expected_size).filter(|total| *total > 0);
    let bytes = match (event.bytes, total) {
        (Some(bytes), _) => bytes,
        (None, Some(total)) => (event.percent.clamp(0.0, 100.0) / 100.0 * total as f64) as u64,
        (None, None) => 0,
    };
    // 100% is reserved for the update after a successful finalize
    let bytes = match total {
        Some(total) if bytes >= total => total.saturating_sub(1),
        _ => bytes,
    };

    let progress = DownloadProgress::new(bytes, total, task.bytes_per_second(bytes));
    if task.throttler.admit(bytes, total.unwrap_or(0)) {
        task.emit(progress);
    } else {
        task.info.last_progress = Some(progress);
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && Path::new(name).file_name().and_then(|n| n.to_str()) == Some(name)
        && name != ".."
}
