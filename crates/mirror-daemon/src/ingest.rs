//! Ingestion: turns source files into encrypted blobs and index entries.
//!
//! [`Ingestor`] does the per-file work and is safe to run on any thread.
//! [`Pipeline`] is the single control loop that consumes watcher events and
//! owns the path → identity tracker; nothing else touches the tracker, so it
//! needs no lock.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::SystemTime;

use anyhow::{Context, Result, anyhow, bail};
use mirror_core::{FileKey, FileRecord, Identity, IdentityHasher, MetadataStore, relative_name, transform};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{MirrorConfig, SettlePolicy};
use crate::watcher::{FsEvent, FsEventKind};

/// Prefix of in-progress blobs in the destination directory.
pub const TEMP_PREFIX: &str = ".ingest-";

/// Outcome of ingesting one file.
#[derive(Debug, Clone)]
pub enum Ingested {
    /// New identity, encrypted under a fresh key and published
    Published(FileRecord),
    /// Identity already live; its record, key and blob were left as they are
    Unchanged(FileRecord),
}

impl Ingested {
    pub fn record(&self) -> &FileRecord {
        match self {
            Ingested::Published(record) | Ingested::Unchanged(record) => record,
        }
    }

    pub fn into_record(self) -> FileRecord {
        match self {
            Ingested::Published(record) | Ingested::Unchanged(record) => record,
        }
    }
}

/// Per-file ingestion. Cheap to clone.
#[derive(Clone)]
pub struct Ingestor {
    source: PathBuf,
    destination: PathBuf,
    store: Arc<MetadataStore>,
    settle: SettlePolicy,
}

impl Ingestor {
    pub fn new(config: &MirrorConfig, store: Arc<MetadataStore>) -> Self {
        Self {
            source: config.source.clone(),
            destination: config.destination.clone(),
            store,
            settle: config.settle,
        }
    }

    pub fn blob_path(&self, identity: &Identity) -> PathBuf {
        self.destination.join(identity.as_str())
    }

    /// Encrypt `path` into the destination and publish its record.
    ///
    /// The content is hashed first. If that identity is already live nothing
    /// is written: a published identity keeps its key and blob for as long
    /// as it lives. Otherwise the content is encrypted into a temporary file
    /// under a fresh key and renamed to `<destination>/<identity>`. On
    /// failure nothing is published and no file exists under the final name.
    pub fn ingest(&self, path: &Path) -> Result<Ingested> {
        let name = relative_name(&self.source, path)
            .ok_or_else(|| anyhow!("path {:?} is outside source directory", path))?;

        let mut input = File::open(path).context("open input file")?;
        let metadata = input.metadata().context("retrieve file info")?;
        if metadata.is_dir() {
            bail!("{:?} is a directory", path);
        }

        let identity =
            Identity::compute(&name, BufReader::new(&input)).context("hash input file")?;
        if let Some(existing) = self.store.get(&identity) {
            return Ok(Ingested::Unchanged(existing));
        }
        input.seek(SeekFrom::Start(0)).context("rewind input file")?;

        let key = FileKey::generate().context("generate random key")?;

        let mut output = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&self.destination)
            .context("create output file")?;

        let mut reader = HashingReader {
            inner: input,
            hasher: IdentityHasher::new(&name),
        };
        let size = {
            let mut writer = BufWriter::new(output.as_file_mut());
            let size = transform(&key, &mut reader, &mut writer).context("encrypt file")?;
            writer.flush().context("flush output file")?;
            size
        };
        output.as_file().sync_all().context("sync output file")?;

        // Named after what was actually encrypted, in case the file changed
        // between the two reads
        let identity = reader.hasher.finish();
        if let Some(existing) = self.store.get(&identity) {
            return Ok(Ingested::Unchanged(existing));
        }
        output
            .persist(self.blob_path(&identity))
            .map_err(|e| e.error)
            .context("publish output file")?;

        let record = FileRecord::new(path.to_path_buf(), name, identity.clone(), key, size);
        self.store.put(identity, record.clone());

        Ok(Ingested::Published(record))
    }

    /// Drop a record and its blob. A blob that is already gone is fine.
    pub fn retire(&self, identity: &Identity) -> Result<()> {
        self.store.delete(identity);
        match fs::remove_file(self.blob_path(identity)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("remove encrypted file"),
        }
    }

    /// Delete blobs no live record maps to, plus leftover temporaries.
    ///
    /// The index is memory-only, so blobs from a previous run can never be
    /// decrypted again. Files with unrelated names are left alone.
    pub fn prune_stale(&self) -> Result<usize> {
        let mut removed = 0;

        for entry in fs::read_dir(&self.destination).context("read destination directory")? {
            let entry = entry.context("read destination entry")?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };

            let stale = match Identity::parse(name) {
                Ok(identity) => !self.store.contains(&identity),
                Err(_) => name.starts_with(TEMP_PREFIX),
            };
            if !stale || !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }

            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    debug!("Pruned stale blob {}", name);
                    removed += 1;
                }
                Err(e) => warn!("Failed to prune stale blob {}: {}", name, e),
            }
        }

        Ok(removed)
    }

    /// Block until `path` stops changing, per the settle policy.
    ///
    /// Returns false if it was still changing after the last poll, or as
    /// soon as it is found missing. The caller ingests anyway; a later event
    /// will pick up the final content.
    pub fn wait_for_settle(&self, path: &Path) -> bool {
        if self.settle.is_disabled() {
            return true;
        }

        let Some(mut last) = observe(path) else {
            return false;
        };
        for _ in 0..self.settle.attempts {
            thread::sleep(self.settle.interval);
            let Some(current) = observe(path) else {
                return false;
            };
            if current == last {
                return true;
            }
            last = current;
        }
        false
    }
}

fn observe(path: &Path) -> Option<(u64, Option<SystemTime>)> {
    let metadata = fs::metadata(path).ok()?;
    Some((metadata.len(), metadata.modified().ok()))
}

/// Feeds everything read through the identity hash.
struct HashingReader<R> {
    inner: R,
    hasher: IdentityHasher,
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// Fold a burst of events into one event per path, in order of each path's
/// last occurrence, keeping the net effect.
pub fn coalesce(events: Vec<FsEvent>) -> Vec<FsEvent> {
    let mut slots: Vec<Option<FsEvent>> = Vec::with_capacity(events.len());
    let mut index: HashMap<PathBuf, usize> = HashMap::new();

    for event in events {
        let previous = index
            .get(&event.path)
            .and_then(|&i| slots[i].take())
            .map(|e| e.kind);
        let kind = match previous {
            Some(prev) => merge(prev, event.kind),
            None => event.kind,
        };
        index.insert(event.path.clone(), slots.len());
        slots.push(Some(FsEvent {
            kind,
            path: event.path,
        }));
    }

    slots.into_iter().flatten().collect()
}

fn merge(prev: FsEventKind, next: FsEventKind) -> FsEventKind {
    use FsEventKind::*;
    match (prev, next) {
        (_, Removed) => Removed,
        (Modified, Modified) => Modified,
        _ => Created,
    }
}

/// The ingestion control loop.
pub struct Pipeline {
    ingestor: Ingestor,
    /// source path → identity currently representing it
    tracker: HashMap<PathBuf, Identity>,
}

impl Pipeline {
    pub fn new(ingestor: Ingestor) -> Self {
        Self {
            ingestor,
            tracker: HashMap::new(),
        }
    }

    pub fn tracked(&self, path: &Path) -> Option<&Identity> {
        self.tracker.get(path)
    }

    pub fn tracked_count(&self) -> usize {
        self.tracker.len()
    }

    /// Ingest everything found by the startup scan.
    pub async fn seed(&mut self, files: Vec<PathBuf>) {
        for path in files {
            match self.ingest_blocking(path.clone(), false).await {
                Ok(ingested) => {
                    let record = ingested.into_record();
                    info!(path = %record.relative_name, hash = %record.identity, "file created");
                    self.tracker.insert(path, record.identity);
                }
                Err(e) => error!("create file {:?}: {:#}", path, e),
            }
        }
    }

    /// Consume events until cancelled or the watcher goes away.
    pub async fn run(mut self, mut events: mpsc::Receiver<FsEvent>, cancel: CancellationToken) {
        info!("Ingestion loop started ({} files tracked)", self.tracker.len());

        loop {
            let first = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let mut batch = vec![first];
            while let Ok(event) = events.try_recv() {
                batch.push(event);
            }

            for event in coalesce(batch) {
                if cancel.is_cancelled() {
                    break;
                }
                self.handle(event).await;
            }
        }

        info!("Ingestion loop stopped");
    }

    /// Apply one event. Failures are logged and the event dropped.
    pub async fn handle(&mut self, event: FsEvent) {
        match event.kind {
            FsEventKind::Created | FsEventKind::Modified => {
                if event.path.is_dir() {
                    debug!("Skipping directory {:?}", event.path);
                    return;
                }
                self.upsert(event.path, event.kind).await;
            }
            FsEventKind::Removed => self.remove(event.path).await,
        }
    }

    async fn upsert(&mut self, path: PathBuf, kind: FsEventKind) {
        let action = match kind {
            FsEventKind::Created => "create",
            _ => "update",
        };

        let ingested = match self.ingest_blocking(path.clone(), true).await {
            Ok(ingested) => ingested,
            Err(e) if !path.exists() => {
                debug!("{} file {:?}: gone before it could be read ({:#})", action, path, e);
                return;
            }
            Err(e) => {
                error!("{} file {:?}: {:#}", action, path, e);
                return;
            }
        };

        let record = ingested.record();
        let previous = self.tracker.insert(path.clone(), record.identity.clone());
        match previous {
            Some(prev) if prev == record.identity => {
                if let Ingested::Unchanged(_) = &ingested {
                    debug!("{:?} unchanged, keeping {}", path, prev);
                    return;
                }
            }
            Some(prev) => self.retire_logged(&prev),
            None if kind == FsEventKind::Modified => {
                debug!("No previous version tracked for {:?}", path);
            }
            None => {}
        }

        if kind == FsEventKind::Created {
            info!(path = %record.relative_name, hash = %record.identity, "file created");
        } else {
            info!(path = %record.relative_name, hash = %record.identity, "file updated");
        }
    }

    async fn remove(&mut self, path: PathBuf) {
        if let Some(identity) = self.tracker.remove(&path) {
            self.retire_logged(&identity);
            info!(path = ?path, hash = %identity, "file deleted");
            return;
        }

        // A directory removed or moved out of the tree takes its files along
        let nested: Vec<PathBuf> = self
            .tracker
            .keys()
            .filter(|p| p.starts_with(&path))
            .cloned()
            .collect();

        if nested.is_empty() {
            debug!("Trying to delete untracked path {:?}", path);
            return;
        }

        for file in nested {
            if let Some(identity) = self.tracker.remove(&file) {
                self.retire_logged(&identity);
                info!(path = ?file, hash = %identity, "file deleted");
            }
        }
    }

    fn retire_logged(&self, identity: &Identity) {
        if let Err(e) = self.ingestor.retire(identity) {
            warn!("retire {}: {:#}", identity, e);
        }
    }

    async fn ingest_blocking(&self, path: PathBuf, settle: bool) -> Result<Ingested> {
        let ingestor = self.ingestor.clone();
        tokio::task::spawn_blocking(move || {
            if settle && !ingestor.wait_for_settle(&path) {
                debug!("{:?} still changing, ingesting anyway", path);
            }
            ingestor.ingest(&path)
        })
        .await
        .context("ingestion task failed")?
    }
}
