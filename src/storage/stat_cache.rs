use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    pub default_ttl: Duration,
    pub quick_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(5 * 60),
            quick_ttl: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStat {
    pub modified: Option<OffsetDateTime>,
    pub accessed: Option<OffsetDateTime>,
    pub changed: Option<OffsetDateTime>,
}

impl FileStat {
    pub fn from_metadata(meta: &fs::Metadata) -> Self {
        Self {
            modified: meta.modified().ok().map(OffsetDateTime::from),
            accessed: meta.accessed().ok().map(OffsetDateTime::from),
            changed: changed_at(meta),
        }
    }
}

#[cfg(unix)]
fn changed_at(meta: &fs::Metadata) -> Option<OffsetDateTime> {
    use std::os::unix::fs::MetadataExt;
    OffsetDateTime::from_unix_timestamp(meta.ctime())
        .ok()
        .map(|at| at + time::Duration::nanoseconds(meta.ctime_nsec()))
}

#[cfg(not(unix))]
fn changed_at(meta: &fs::Metadata) -> Option<OffsetDateTime> {
    meta.created().ok().map(OffsetDateTime::from)
}

/// Everything known about one path, captured at a single point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub exists: bool,
    pub size: u64,
    pub stat: Option<FileStat>,
}

impl FileInfo {
    pub const MISSING: FileInfo = FileInfo {
        exists: false,
        size: 0,
        stat: None,
    };
}

/// Storage backend queried on cache misses.
pub trait StatProbe: Send + Sync {
    fn snapshot(&self, path: &Path) -> io::Result<FileInfo>;

    fn exists(&self, path: &Path) -> io::Result<bool> {
        self.snapshot(path).map(|info| info.exists)
    }

    fn size(&self, path: &Path) -> io::Result<u64> {
        self.snapshot(path).map(|info| info.size)
    }

    fn stat(&self, path: &Path) -> io::Result<Option<FileStat>> {
        self.snapshot(path).map(|info| info.stat)
    }
}

impl<T: StatProbe + ?Sized> StatProbe for Arc<T> {
    fn snapshot(&self, path: &Path) -> io::Result<FileInfo> {
        (**self).snapshot(path)
    }

    fn exists(&self, path: &Path) -> io::Result<bool> {
        (**self).exists(path)
    }

    fn size(&self, path: &Path) -> io::Result<u64> {
        (**self).size(path)
    }

    fn stat(&self, path: &Path) -> io::Result<Option<FileStat>> {
        (**self).stat(path)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FsProbe;

impl StatProbe for FsProbe {
    fn snapshot(&self, path: &Path) -> io::Result<FileInfo> {
        match fs::metadata(path) {
            Ok(meta) => Ok(FileInfo {
                exists: true,
                size: meta.len(),
                stat: Some(FileStat::from_metadata(&meta)),
            }),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(FileInfo::MISSING),
            Err(error) => Err(error),
        }
    }

    fn exists(&self, path: &Path) -> io::Result<bool> {
        path.try_exists()
    }

    fn size(&self, path: &Path) -> io::Result<u64> {
        match fs::metadata(path) {
            Ok(meta) => Ok(meta.len()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(error) => Err(error),
        }
    }

    fn stat(&self, path: &Path) -> io::Result<Option<FileStat>> {
        match fs::metadata(path) {
            Ok(meta) => Ok(Some(FileStat::from_metadata(&meta))),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Stamped<T> {
    value: T,
    at: Instant,
}

impl<T: Copy> Stamped<T> {
    fn fresh(&self, ttl: Duration, now: Instant) -> Option<T> {
        (now.saturating_duration_since(self.at) <= ttl).then_some(self.value)
    }
}

#[derive(Debug, Default, Clone)]
struct CacheEntry {
    exists: Option<Stamped<bool>>,
    size: Option<Stamped<u64>>,
    stat: Option<Stamped<Option<FileStat>>>,
}

impl CacheEntry {
    fn newest(&self) -> Option<Instant> {
        [
            self.exists.map(|s| s.at),
            self.size.map(|s| s.at),
            self.stat.map(|s| s.at),
        ]
        .into_iter()
        .flatten()
        .max()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Field {
    Exists,
    Size,
    Stat,
    All,
}

#[derive(Debug, Clone, Copy)]
enum Probed {
    Exists(bool),
    Size(u64),
    Stat(Option<FileStat>),
    All(FileInfo),
}

#[derive(Default)]
struct Flight {
    result: Mutex<Option<Probed>>,
    ready: Condvar,
    /// Set when the path was invalidated while the probe ran.
    stale: AtomicBool,
}

enum Role {
    Leader(Arc<Flight>),
    Follower(Arc<Flight>),
}

/// TTL cache over exists / size / stat probes.
///
/// Misses for the same path and field are coalesced: one caller probes storage
/// while the others wait for its result. Invalidating a path detaches its
/// running probes, so their results are never stored and later callers probe
/// again.
pub struct FileStatCache {
    config: CacheConfig,
    probe: Box<dyn StatProbe>,
    entries: Mutex<HashMap<PathBuf, CacheEntry>>,
    flights: Mutex<HashMap<(PathBuf, Field), Arc<Flight>>>,
}

impl Default for FileStatCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl std::fmt::Debug for FileStatCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStatCache")
            .field("config", &self.config)
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}

impl FileStatCache {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_probe(config, FsProbe)
    }

    pub fn with_probe(config: CacheConfig, probe: impl StatProbe + 'static) -> Self {
        Self {
            config,
            probe: Box::new(probe),
            entries: Mutex::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.exists_within(path, self.config.default_ttl)
    }

    pub fn exists_quick(&self, path: impl AsRef<Path>) -> bool {
        self.exists_within(path, self.config.quick_ttl)
    }

    pub fn exists_within(&self, path: impl AsRef<Path>, ttl: Duration) -> bool {
        let path = path.as_ref();
        let cached = self.read(path, |entry, now| {
            entry.exists.and_then(|s| s.fresh(ttl, now))
        });
        match cached {
            Some(exists) => exists,
            None => match self.fetch(path, Field::Exists) {
                Probed::Exists(exists) => exists,
                _ => false,
            },
        }
    }

    pub fn size(&self, path: impl AsRef<Path>) -> u64 {
        self.size_within(path, self.config.default_ttl)
    }

    pub fn size_quick(&self, path: impl AsRef<Path>) -> u64 {
        self.size_within(path, self.config.quick_ttl)
    }

    pub fn size_within(&self, path: impl AsRef<Path>, ttl: Duration) -> u64 {
        let path = path.as_ref();
        let cached = self.read(path, |entry, now| entry.size.and_then(|s| s.fresh(ttl, now)));
        match cached {
            Some(size) => size,
            None => match self.fetch(path, Field::Size) {
                Probed::Size(size) => size,
                _ => 0,
            },
        }
    }

    pub fn stat(&self, path: impl AsRef<Path>) -> Option<FileStat> {
        self.stat_within(path, self.config.default_ttl)
    }

    pub fn stat_within(&self, path: impl AsRef<Path>, ttl: Duration) -> Option<FileStat> {
        let path = path.as_ref();
        let cached = self.read(path, |entry, now| entry.stat.and_then(|s| s.fresh(ttl, now)));
        match cached {
            Some(stat) => stat,
            None => match self.fetch(path, Field::Stat) {
                Probed::Stat(stat) => stat,
                _ => None,
            },
        }
    }

    pub fn info(&self, path: impl AsRef<Path>) -> FileInfo {
        self.info_within(path, self.config.default_ttl)
    }

    /// Returns all three fields from one snapshot. A single stale or missing
    /// field triggers a combined probe that replaces the whole entry.
    pub fn info_within(&self, path: impl AsRef<Path>, ttl: Duration) -> FileInfo {
        let path = path.as_ref();
        let cached = self.read(path, |entry, now| {
            Some(FileInfo {
                exists: entry.exists?.fresh(ttl, now)?,
                size: entry.size?.fresh(ttl, now)?,
                stat: entry.stat?.fresh(ttl, now)?,
            })
        });
        match cached {
            Some(info) => info,
            None => match self.fetch(path, Field::All) {
                Probed::All(info) => info,
                _ => FileInfo::MISSING,
            },
        }
    }

    pub fn invalidate(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let detached = self.detach_flights(|key| key == path);
        let removed = self.entries.lock().remove(path).is_some();
        if removed || detached > 0 {
            debug!("stat_cache_invalidate: {}", path.display());
        }
        removed
    }

    pub fn invalidate_pattern(&self, pattern: &str) -> usize {
        self.detach_flights(|key| key.to_string_lossy().contains(pattern));
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|path, _| !path.to_string_lossy().contains(pattern));
        let removed = before - entries.len();
        debug!("stat_cache_invalidate_pattern: {pattern:?} removed={removed}");
        removed
    }

    pub fn cleanup_expired(&self) -> usize {
        let ttl = self.config.default_ttl;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| {
            entry
                .newest()
                .is_some_and(|at| now.saturating_duration_since(at) <= ttl)
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.detach_flights(|_| true);
        self.entries.lock().clear();
    }

    /// Marks matching in-flight probes stale and forgets them, so new misses
    /// start their own probe instead of joining an outdated one.
    fn detach_flights(&self, matches: impl Fn(&Path) -> bool) -> usize {
        let mut flights = self.flights.lock();
        let before = flights.len();
        flights.retain(|(key, _), flight| {
            if matches(key.as_path()) {
                flight.stale.store(true, Ordering::SeqCst);
                false
            } else {
                true
            }
        });
        before - flights.len()
    }

    fn read<T>(&self, path: &Path, pick: impl FnOnce(&CacheEntry, Instant) -> Option<T>) -> Option<T> {
        let entries = self.entries.lock();
        entries.get(path).and_then(|entry| pick(entry, Instant::now()))
    }

    fn fetch(&self, path: &Path, field: Field) -> Probed {
        let role = {
            let mut flights = self.flights.lock();
            let key = (path.to_path_buf(), field);
            match flights.get(&key) {
                Some(flight) => Role::Follower(flight.clone()),
                None => {
                    let flight = Arc::new(Flight::default());
                    flights.insert(key, flight.clone());
                    Role::Leader(flight)
                }
            }
        };

        match role {
            Role::Follower(flight) => {
                let mut result = flight.result.lock();
                while result.is_none() {
                    flight.ready.wait(&mut result);
                }
                (*result).unwrap_or(Probed::All(FileInfo::MISSING))
            }
            Role::Leader(flight) => {
                let probed = self.probe_field(path, field);
                self.store(path, probed, &flight.stale);
                *flight.result.lock() = Some(probed);
                flight.ready.notify_all();

                let key = (path.to_path_buf(), field);
                let mut flights = self.flights.lock();
                if flights
                    .get(&key)
                    .is_some_and(|current| Arc::ptr_eq(current, &flight))
                {
                    flights.remove(&key);
                }
                probed
            }
        }
    }

    fn probe_field(&self, path: &Path, field: Field) -> Probed {
        let outcome = match field {
            Field::Exists => self.probe.exists(path).map(Probed::Exists),
            Field::Size => self.probe.size(path).map(Probed::Size),
            Field::Stat => self.probe.stat(path).map(Probed::Stat),
            Field::All => self.probe.snapshot(path).map(Probed::All),
        };
        outcome.unwrap_or_else(|error| {
            debug!("stat_cache_probe_failed: {} {error}", path.display());
            match field {
                Field::Exists => Probed::Exists(false),
                Field::Size => Probed::Size(0),
                Field::Stat => Probed::Stat(None),
                Field::All => Probed::All(FileInfo::MISSING),
            }
        })
    }

    fn store(&self, path: &Path, probed: Probed, stale: &AtomicBool) {
        let at = Instant::now();
        let mut entries = self.entries.lock();
        // checked under the entries lock; invalidation flags before it removes
        if stale.load(Ordering::SeqCst) {
            debug!("stat_cache_stale_probe_dropped: {}", path.display());
            return;
        }
        let entry = entries.entry(path.to_path_buf()).or_default();
        match probed {
            Probed::Exists(value) => entry.exists = Some(Stamped { value, at }),
            Probed::Size(value) => entry.size = Some(Stamped { value, at }),
            Probed::Stat(value) => entry.stat = Some(Stamped { value, at }),
            Probed::All(info) => {
                *entry = CacheEntry {
                    exists: Some(Stamped {
                        value: info.exists,
                        at,
                    }),
                    size: Some(Stamped {
                        value: info.size,
                        at,
                    }),
                    stat: Some(Stamped {
                        value: info.stat,
                        at,
                    }),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use tempfile::tempdir;

    #[derive(Default)]
    struct CountingProbe {
        delay: Duration,
        exists: AtomicUsize,
        size: AtomicUsize,
        snapshots: AtomicUsize,
    }

    impl StatProbe for CountingProbe {
        fn snapshot(&self, path: &Path) -> io::Result<FileInfo> {
            self.snapshots.fetch_add(1, Ordering::SeqCst);
            FsProbe.snapshot(path)
        }

        fn exists(&self, path: &Path) -> io::Result<bool> {
            self.exists.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            FsProbe.exists(path)
        }

        fn size(&self, path: &Path) -> io::Result<u64> {
            self.size.fetch_add(1, Ordering::SeqCst);
            FsProbe.size(path)
        }
    }

    struct DeniedProbe;

    impl StatProbe for DeniedProbe {
        fn snapshot(&self, _path: &Path) -> io::Result<FileInfo> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"))
        }
    }

    fn counting_cache(config: CacheConfig) -> (FileStatCache, Arc<CountingProbe>) {
        let probe = Arc::new(CountingProbe::default());
        (FileStatCache::with_probe(config, probe.clone()), probe)
    }

    #[test]
    fn repeated_exists_within_ttl_probes_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.bin");
        fs::write(&path, b"abc").unwrap();
        let (cache, probe) = counting_cache(CacheConfig::default());

        assert!(cache.exists(&path));
        assert!(cache.exists(&path));
        assert_eq!(probe.exists.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn expiry_forces_second_probe() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.bin");
        let (cache, probe) = counting_cache(CacheConfig::default());
        let ttl = Duration::from_millis(30);

        assert!(!cache.exists_within(&path, ttl));
        fs::write(&path, b"abc").unwrap();
        assert!(!cache.exists_within(&path, ttl));
        thread::sleep(Duration::from_millis(60));
        assert!(cache.exists_within(&path, ttl));
        assert_eq!(probe.exists.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn invalidate_forces_fresh_probe() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.bin");
        let (cache, probe) = counting_cache(CacheConfig::default());

        assert!(!cache.exists(&path));
        fs::write(&path, b"abc").unwrap();
        assert!(cache.invalidate(&path));
        assert!(cache.exists(&path));
        assert_eq!(probe.exists.load(Ordering::SeqCst), 2);
        assert!(!cache.invalidate(dir.path().join("never-seen")));
    }

    /// Reads storage first and only then stalls, like a slow network volume.
    struct LaggingProbe {
        lag: Duration,
        read: crossbeam_channel::Sender<bool>,
    }

    impl StatProbe for LaggingProbe {
        fn snapshot(&self, path: &Path) -> io::Result<FileInfo> {
            FsProbe.snapshot(path)
        }

        fn exists(&self, path: &Path) -> io::Result<bool> {
            let exists = FsProbe.exists(path)?;
            let _ = self.read.send(exists);
            thread::sleep(self.lag);
            Ok(exists)
        }
    }

    #[test]
    fn invalidate_detaches_probe_already_in_flight() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.bin");
        let (read_tx, read_rx) = crossbeam_channel::unbounded();
        let cache = Arc::new(FileStatCache::with_probe(
            CacheConfig::default(),
            LaggingProbe {
                lag: Duration::from_millis(300),
                read: read_tx,
            },
        ));

        let early = {
            let cache = cache.clone();
            let path = path.clone();
            thread::spawn(move || cache.exists(&path))
        };
        // the early probe has seen the file missing and is still running
        assert!(!read_rx.recv_timeout(Duration::from_secs(5)).unwrap());

        fs::write(&path, b"abc").unwrap();
        cache.invalidate(&path);
        assert!(cache.exists(&path));

        assert!(!early.join().unwrap());
        assert!(cache.exists(&path));
        assert!(cache.info(&path).exists);
    }

    #[test]
    fn single_field_refresh_keeps_other_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.bin");
        fs::write(&path, b"abcd").unwrap();
        let (cache, probe) = counting_cache(CacheConfig::default());

        assert_eq!(cache.size(&path), 4);
        assert!(cache.exists(&path));
        assert_eq!(cache.size(&path), 4);
        assert_eq!(probe.size.load(Ordering::SeqCst), 1);
        assert_eq!(probe.exists.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn info_uses_one_combined_probe() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.bin");
        fs::write(&path, vec![0u8; 128]).unwrap();
        let (cache, probe) = counting_cache(CacheConfig::default());

        // exists alone does not satisfy info
        cache.exists(&path);
        let info = cache.info(&path);
        assert!(info.exists);
        assert_eq!(info.size, 128);
        assert!(info.stat.and_then(|stat| stat.modified).is_some());
        assert_eq!(probe.snapshots.load(Ordering::SeqCst), 1);

        // every field is now fresh
        assert_eq!(cache.info(&path), info);
        assert_eq!(cache.size(&path), 128);
        assert_eq!(probe.snapshots.load(Ordering::SeqCst), 1);
        assert_eq!(probe.size.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn concurrent_misses_share_one_probe() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.bin");
        fs::write(&path, b"abc").unwrap();
        let probe = Arc::new(CountingProbe {
            delay: Duration::from_millis(50),
            ..CountingProbe::default()
        });
        let cache = Arc::new(FileStatCache::with_probe(
            CacheConfig::default(),
            probe.clone(),
        ));

        let barrier = Arc::new(Barrier::new(6));
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let cache = cache.clone();
                let path = path.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    cache.exists(&path)
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert_eq!(probe.exists.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn probe_errors_read_as_missing() {
        let cache = FileStatCache::with_probe(CacheConfig::default(), DeniedProbe);
        assert!(!cache.exists("/locked/model.bin"));
        assert_eq!(cache.size("/locked/model.bin"), 0);
        assert_eq!(cache.info("/locked/model.bin"), FileInfo::MISSING);
    }

    #[test]
    fn pattern_invalidation_and_expiry_sweep() {
        let config = CacheConfig {
            default_ttl: Duration::from_millis(40),
            quick_ttl: Duration::from_millis(10),
        };
        let cache = FileStatCache::new(config);
        cache.exists("/data/models/a.bin");
        cache.exists("/data/models/b.bin");
        cache.exists("/data/other/c.bin");
        assert_eq!(cache.len(), 3);

        assert_eq!(cache.invalidate_pattern("/models/"), 2);
        assert_eq!(cache.len(), 1);

        assert_eq!(cache.cleanup_expired(), 0);
        thread::sleep(Duration::from_millis(60));
        cache.size("/data/fresh.bin");
        assert_eq!(cache.cleanup_expired(), 1);
        assert_eq!(cache.len(), 1);
    }
}
