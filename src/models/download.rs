use std::{
    collections::HashMap,
    fmt,
    fs::{self, File},
    io::{Read, Write},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::error::DownloadError;

/// Identifier issued by a [`Transport`]. A resumed transfer may get a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transfer-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportStatus {
    Running,
    Paused,
    Complete,
    Failed(String),
    Cancelled,
}

/// Status notification sent from a transfer worker to the owning manager.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub transfer_id: TransferId,
    pub status: TransportStatus,
    /// Coarse completion, 0.0 to 100.0.
    pub percent: f64,
    pub bytes: Option<u64>,
    pub total: Option<u64>,
}

impl TransportEvent {
    pub fn new(transfer_id: TransferId, status: TransportStatus) -> Self {
        Self {
            transfer_id,
            status,
            percent: 0.0,
            bytes: None,
            total: None,
        }
    }

    #[must_use]
    pub fn with_bytes(mut self, bytes: u64, total: Option<u64>) -> Self {
        self.bytes = Some(bytes);
        self.total = total.filter(|total| *total > 0);
        self.percent = match self.total {
            Some(total) => (bytes as f64 / total as f64 * 100.0).min(100.0),
            None => 0.0,
        };
        self
    }

    #[must_use]
    pub fn with_percent(mut self, percent: f64) -> Self {
        self.percent = percent.clamp(0.0, 100.0);
        self
    }
}

pub type EventSender = Sender<TransportEvent>;
pub type EventReceiver = Receiver<TransportEvent>;

/// The channel a transport reports on. The receiving half belongs to the
/// download manager, the sending half to the transport.
pub fn notification_channel() -> (EventSender, EventReceiver) {
    unbounded()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub url: String,
    pub destination: PathBuf,
    /// Rough size for progress when the server sends no length.
    pub expected_size: Option<u64>,
    /// Byte count the body must reach when the server sends no length.
    pub exact_size: Option<u64>,
}

/// Background fetch mechanism driven by the download manager.
///
/// Every enqueued transfer ends with exactly one `Complete`, `Failed` or
/// `Cancelled` notification, also after [`cancel`](Transport::cancel). No
/// file of a transfer is touched after its terminal notification was sent.
pub trait Transport: Send {
    fn enqueue(&self, request: TransferRequest) -> Result<TransferId, DownloadError>;

    /// Best-effort; the worker stops at its next checkpoint.
    fn cancel(&self, id: TransferId);

    /// Returns false when the transfer cannot be paused.
    fn pause(&self, id: TransferId) -> bool;

    fn resume(&self, id: TransferId) -> Result<TransferId, DownloadError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct HttpConfig {
    pub user_agent: String,
    pub connect_timeout: Duration,
    pub read_chunk_size: usize,
    pub report_every_bytes: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("model-depot/", env!("CARGO_PKG_VERSION")).into(),
            connect_timeout: Duration::from_secs(30),
            read_chunk_size: 64 * 1024,
            report_every_bytes: 256 * 1024,
        }
    }
}

struct TransferSlot {
    request: TransferRequest,
    cancelled: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    /// The worker stopped on pause and will not run again for this id.
    parked: bool,
    worker: Option<JoinHandle<()>>,
}

/// Streams each transfer into its destination file on a dedicated thread.
///
/// Pausing stops the worker; resuming starts the download again from the
/// first byte under a new [`TransferId`].
pub struct HttpTransport {
    config: HttpConfig,
    events: EventSender,
    next_id: AtomicU64,
    slots: Arc<Mutex<HashMap<TransferId, TransferSlot>>>,
}

impl HttpTransport {
    pub fn new(config: HttpConfig, events: EventSender) -> Self {
        Self {
            config,
            events,
            next_id: AtomicU64::new(1),
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn active_transfers(&self) -> usize {
        self.slots.lock().len()
    }

    fn spawn(
        &self,
        request: TransferRequest,
        previous: Option<JoinHandle<()>>,
    ) -> Result<TransferId, DownloadError> {
        if request.url.trim().is_empty() {
            return Err(DownloadError::EnqueueFailure("empty url".into()));
        }

        let id = TransferId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let cancelled = Arc::new(AtomicBool::new(false));
        let paused = Arc::new(AtomicBool::new(false));
        let worker = Worker {
            id,
            request: request.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            cancelled: cancelled.clone(),
            paused: paused.clone(),
            slots: self.slots.clone(),
        };

        // the slot must exist before the worker can look it up on exit
        let mut slots = self.slots.lock();
        let handle = thread::Builder::new()
            .name(format!("model-depot-{id}"))
            .spawn(move || {
                if let Some(previous) = previous {
                    let _ = previous.join();
                }
                worker.run();
            })
            .map_err(|e| DownloadError::EnqueueFailure(e.to_string()))?;
        slots.insert(
            id,
            TransferSlot {
                request,
                cancelled,
                paused,
                parked: false,
                worker: Some(handle),
            },
        );
        Ok(id)
    }
}

impl Transport for HttpTransport {
    fn enqueue(&self, request: TransferRequest) -> Result<TransferId, DownloadError> {
        let id = self.spawn(request, None)?;
        debug!("http_enqueue: {id}");
        Ok(id)
    }

    fn cancel(&self, id: TransferId) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get(&id) else {
            return;
        };
        slot.cancelled.store(true, Ordering::SeqCst);
        if !slot.parked {
            // the running worker reports the cancellation itself
            return;
        }
        if let Some(slot) = slots.remove(&id) {
            let _ = fs::remove_file(&slot.request.destination);
            drop(slots);
            info!("http_cancelled: {id} while paused");
            let _ = self.events.send(TransportEvent::new(id, TransportStatus::Cancelled));
        }
    }

    fn pause(&self, id: TransferId) -> bool {
        match self.slots.lock().get(&id) {
            Some(slot) => {
                slot.paused.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    fn resume(&self, id: TransferId) -> Result<TransferId, DownloadError> {
        let slot = {
            let mut slots = self.slots.lock();
            match slots.get(&id) {
                Some(slot) if slot.paused.load(Ordering::SeqCst) => slots.remove(&id),
                _ => None,
            }
        };
        let Some(mut slot) = slot else {
            return Err(DownloadError::EnqueueFailure(format!(
                "{id} is not paused"
            )));
        };
        let new_id = self.spawn(slot.request.clone(), slot.worker.take())?;
        info!("http_resume: {id} -> {new_id}");
        Ok(new_id)
    }
}

enum Stop {
    Cancelled,
    Paused,
}

struct Worker {
    id: TransferId,
    request: TransferRequest,
    config: HttpConfig,
    events: EventSender,
    cancelled: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    slots: Arc<Mutex<HashMap<TransferId, TransferSlot>>>,
}

impl Worker {
    fn run(self) {
        let _ = self.events.send(
            TransportEvent::new(self.id, TransportStatus::Running)
                .with_bytes(0, self.request.expected_size),
        );

        let mut outcome = self.download();

        // settle against cancel() under the slot lock so exactly one side
        // deletes the file and reports the end of this transfer
        let mut slots = self.slots.lock();
        if matches!(outcome, Ok(Err(Stop::Paused))) && self.cancelled.load(Ordering::SeqCst) {
            outcome = Ok(Err(Stop::Cancelled));
        }
        match slots.get_mut(&self.id) {
            Some(slot) if matches!(outcome, Ok(Err(Stop::Paused))) => slot.parked = true,
            _ => {
                slots.remove(&self.id);
            }
        }
        if matches!(outcome, Ok(Err(Stop::Cancelled))) {
            let _ = fs::remove_file(&self.request.destination);
        }
        drop(slots);

        let event = match outcome {
            Ok(Ok((bytes, total))) => {
                info!("http_complete: {} {} bytes", self.id, bytes);
                TransportEvent::new(self.id, TransportStatus::Complete).with_bytes(bytes, total)
            }
            Ok(Err(Stop::Paused)) => {
                info!("http_paused: {}", self.id);
                TransportEvent::new(self.id, TransportStatus::Paused)
            }
            Ok(Err(Stop::Cancelled)) => {
                info!("http_cancelled: {}", self.id);
                TransportEvent::new(self.id, TransportStatus::Cancelled)
            }
            Err(error) => {
                warn!("http_failed: {} {error:#}", self.id);
                TransportEvent::new(self.id, TransportStatus::Failed(format!("{error:#}")))
            }
        };

        let _ = self.events.send(event);
    }

    fn stopped(&self) -> Option<Stop> {
        if self.cancelled.load(Ordering::SeqCst) {
            Some(Stop::Cancelled)
        } else if self.paused.load(Ordering::SeqCst) {
            Some(Stop::Paused)
        } else {
            None
        }
    }

    fn download(&self) -> Result<Result<(u64, Option<u64>), Stop>> {
        let client = Client::builder()
            .user_agent(self.config.user_agent.clone())
            .connect_timeout(self.config.connect_timeout)
            .timeout(None)
            .build()
            .context("create http client")?;

        let mut response = client
            .get(&self.request.url)
            .send()
            .with_context(|| format!("request {}", self.request.url))?
            .error_for_status()
            .with_context(|| format!("download {}", self.request.url))?;

        let content_length = response.content_length().filter(|len| *len > 0);
        let required = content_length.or(self.request.exact_size);
        let total = required.or(self.request.expected_size);

        if let Some(parent) = self.request.destination.parent() {
            fs::create_dir_all(parent).context("create download directory")?;
        }
        let mut file = File::create(&self.request.destination).context("create temp file")?;
        let mut buffer = vec![0u8; self.config.read_chunk_size.max(1)];
        let mut downloaded = 0u64;
        let mut reported = 0u64;

        loop {
            if let Some(stop) = self.stopped() {
                return Ok(Err(stop));
            }
            let read = response.read(&mut buffer).context("read download chunk")?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read])
                .context("write download chunk")?;
            downloaded += read as u64;

            if downloaded - reported >= self.config.report_every_bytes {
                reported = downloaded;
                let _ = self.events.send(
                    TransportEvent::new(self.id, TransportStatus::Running)
                        .with_bytes(downloaded, total),
                );
            }
        }

        file.flush()
            .and_then(|_| file.sync_all())
            .context("flush temp file")?;

        if let Some(expected) = short_read(downloaded, required) {
            return Err(anyhow!(
                "connection closed after {downloaded} of {expected} bytes"
            ));
        }
        Ok(Ok((downloaded, required.or(Some(downloaded)))))
    }
}

/// The size a finished body fell short of. Only a server length or an exact
/// catalog size counts; size estimates never fail a download.
fn short_read(downloaded: u64, required: Option<u64>) -> Option<u64> {
    required.filter(|expected| downloaded < *expected)
}
