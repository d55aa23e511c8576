use std::{
    fs,
    io::{self, Write as _},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info};

use crate::{codec, ArchiveError, Exchange, Result, Signature};

/// Options for a recording [`ArchiveStore`].
#[derive(Debug, Clone, Default)]
pub struct ArchiveOptions {
    /// Upper bound on the recorded bytes (headers and bodies). `None` means unbounded.
    pub max_bytes: Option<usize>,
}

impl ArchiveOptions {
    /// Sets the maximum number of bytes the archive may hold.
    pub fn max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }
}

/// The outcome of [`ArchiveStore::record`].
#[derive(Debug, Clone)]
pub enum Recorded {
    /// The exchange was appended.
    Inserted(Arc<Exchange>),
    /// An exchange with the same signature was already recorded and is kept.
    Duplicate(Arc<Exchange>),
}

impl Recorded {
    pub fn exchange(&self) -> &Arc<Exchange> {
        match self {
            Self::Inserted(exchange) | Self::Duplicate(exchange) => exchange,
        }
    }
}

/// An ordered collection of exchanges with exact and loose indexes.
#[derive(Debug, Default, Clone)]
pub struct Archive {
    exchanges: Vec<Arc<Exchange>>,
    /// Signature -> position.
    exact: FxHashMap<Signature, usize>,
    /// Loosened signature -> position of the earliest exchange with that key.
    loose: FxHashMap<Signature, usize>,
    size: usize,
}

impl Archive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads an archive file. Any format error fails the whole load.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ArchiveError::NotFound(path.to_path_buf()),
            _ => ArchiveError::Io(e),
        })?;

        let archive = Self::decode(Bytes::from(data))?;
        info!(path = %path.display(), exchanges = archive.len(), "loaded archive");

        Ok(archive)
    }

    /// Decodes an archive from its file contents.
    pub fn decode(data: Bytes) -> Result<Self> {
        let mut archive = Self::new();
        for exchange in codec::decode(data)? {
            archive.insert(exchange);
        }

        Ok(archive)
    }

    /// Encodes the archive into its file contents.
    pub fn encode(&self) -> Bytes {
        codec::encode(self.exchanges.iter().map(AsRef::as_ref))
    }

    /// Writes the archive to `path` atomically: the data goes to a temporary file in the same
    /// directory, which is synced and then renamed over `path`. On failure the previous file,
    /// if any, is left untouched.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut tmp = tempfile::NamedTempFile::new_in(parent_dir(path))?;
        tmp.write_all(&self.encode())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| ArchiveError::Io(e.error))?;

        info!(path = %path.display(), exchanges = self.len(), "persisted archive");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }

    /// Approximate size of the recorded headers and bodies, in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Iterates over the exchanges in recording order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Exchange>> {
        self.exchanges.iter()
    }

    /// Looks up a request. Exact matches win; otherwise the earliest exchange whose signature
    /// only differs in query parameter order is returned.
    pub fn get(&self, signature: &Signature) -> Option<&Arc<Exchange>> {
        let idx = match self.exact.get(signature) {
            Some(idx) => *idx,
            None => *self.loose.get(&signature.loosened())?,
        };

        self.exchanges.get(idx)
    }

    /// Appends an exchange unless one with the same signature exists.
    pub fn insert(&mut self, exchange: Exchange) -> Recorded {
        if let Some(idx) = self.exact.get(&exchange.signature) {
            return Recorded::Duplicate(Arc::clone(&self.exchanges[*idx]));
        }

        let idx = self.exchanges.len();
        self.size += exchange.size_hint();
        self.loose.entry(exchange.signature.loosened()).or_insert(idx);
        self.exact.insert(exchange.signature.clone(), idx);

        let exchange = Arc::new(exchange);
        self.exchanges.push(Arc::clone(&exchange));

        Recorded::Inserted(exchange)
    }

    /// The host names (without ports) present in the archive.
    pub fn hostnames(&self) -> FxHashSet<String> {
        self.exchanges
            .iter()
            .map(|e| strip_port(e.signature.host()).to_string())
            .collect()
    }

    /// Returns the recorded signature closest to `signature`: same host and the longest common
    /// path prefix, earliest first on ties. Used for diagnostics on lookup misses.
    pub fn closest(&self, signature: &Signature) -> Option<&Signature> {
        let target = signature.path_and_query();

        let mut best: Option<(usize, &Signature)> = None;
        for exchange in &self.exchanges {
            let candidate = &exchange.signature;
            if candidate.host() != signature.host() {
                continue;
            }

            let common = common_prefix(&candidate.path_and_query(), &target);
            if best.map_or(true, |(len, _)| common > len) {
                best = Some((common, candidate));
            }
        }

        best.map(|(_, sig)| sig)
    }
}

enum Inner {
    /// Loaded for replay. Never changes, read without locking.
    Frozen(Archive),
    /// Being recorded. Writes are serialized by the lock.
    Recording(RwLock<Archive>),
}

/// The archive shared by every connection of a run.
pub struct ArchiveStore {
    inner: Inner,
    options: ArchiveOptions,
    persisted: AtomicBool,
}

impl std::fmt::Debug for ArchiveStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveStore")
            .field("recording", &self.is_recording())
            .field("len", &self.len())
            .field("options", &self.options)
            .finish()
    }
}

impl ArchiveStore {
    /// Creates a read-only store for replay.
    pub fn frozen(archive: Archive) -> Self {
        Self {
            inner: Inner::Frozen(archive),
            options: ArchiveOptions::default(),
            persisted: AtomicBool::new(false),
        }
    }

    /// Creates an empty store for recording.
    pub fn recording(options: ArchiveOptions) -> Self {
        Self {
            inner: Inner::Recording(RwLock::new(Archive::new())),
            options,
            persisted: AtomicBool::new(false),
        }
    }

    /// Loads an archive file into a read-only store.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::frozen(Archive::load(path)?))
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.inner, Inner::Recording(_))
    }

    pub fn len(&self) -> usize {
        self.with_archive(Archive::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up a request. See [`Archive::get`] for the matching rules.
    pub fn lookup(&self, signature: &Signature) -> Option<Arc<Exchange>> {
        self.with_archive(|archive| archive.get(signature).cloned())
    }

    /// Records an exchange. Fails on a frozen store, after [`ArchiveStore::persist`], or when the
    /// size limit would be exceeded.
    pub fn record(&self, exchange: Exchange) -> Result<Recorded> {
        let Inner::Recording(lock) = &self.inner else {
            return Err(ArchiveError::ReadOnly);
        };

        let mut archive = lock.write();
        if self.persisted.load(Ordering::Acquire) {
            return Err(ArchiveError::AlreadyPersisted);
        }

        if let Some(limit) = self.options.max_bytes {
            if archive.size() + exchange.size_hint() > limit {
                return Err(ArchiveError::CapacityExceeded { limit });
            }
        }

        let recorded = archive.insert(exchange);
        match &recorded {
            Recorded::Inserted(e) => debug!(signature = %e.signature, "recorded exchange"),
            Recorded::Duplicate(e) => debug!(signature = %e.signature, "already recorded"),
        }

        Ok(recorded)
    }

    /// Writes the recording to `path`. Can only succeed once per store.
    pub fn persist(&self, path: impl AsRef<Path>) -> Result<()> {
        let Inner::Recording(lock) = &self.inner else {
            return Err(ArchiveError::ReadOnly);
        };

        // Holding the write lock keeps concurrent `record` calls out until the flag is set.
        let archive = lock.write();
        if self.persisted.swap(true, Ordering::AcqRel) {
            return Err(ArchiveError::AlreadyPersisted);
        }

        if let Err(e) = archive.write_to(path) {
            self.persisted.store(false, Ordering::Release);
            return Err(e);
        }

        Ok(())
    }

    /// Host names present in the archive.
    pub fn hostnames(&self) -> FxHashSet<String> {
        self.with_archive(Archive::hostnames)
    }

    /// See [`Archive::closest`].
    pub fn closest(&self, signature: &Signature) -> Option<Signature> {
        self.with_archive(|archive| archive.closest(signature).cloned())
    }

    fn with_archive<T>(&self, f: impl FnOnce(&Archive) -> T) -> T {
        match &self.inner {
            Inner::Frozen(archive) => f(archive),
            Inner::Recording(lock) => f(&lock.read()),
        }
    }
}

/// Checks that an archive can be written to `path` before a recording run starts serving
/// traffic.
pub fn check_writable(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let not_writable = |source| ArchiveError::NotWritable { path: path.to_path_buf(), source };

    if let Ok(meta) = fs::metadata(path) {
        if meta.is_dir() {
            return Err(not_writable(io::Error::new(io::ErrorKind::Other, "is a directory")));
        }
        if meta.permissions().readonly() {
            return Err(not_writable(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "file is read-only",
            )));
        }
    }

    tempfile::NamedTempFile::new_in(parent_dir(path)).map_err(not_writable)?;
    Ok(())
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host.split_once(']').map_or(host, |(addr, _)| &addr[1..]);
    }

    match host.rsplit_once(':') {
        Some((name, _)) if !name.contains(':') => name,
        _ => host,
    }
}

fn common_prefix(a: &str, b: &str) -> usize {
    a.bytes().zip(b.bytes()).take_while(|(x, y)| x == y).count()
}
