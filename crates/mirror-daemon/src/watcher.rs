//! Filesystem watcher for the source tree.
//!
//! Watches each directory non-recursively and keeps recursion up to date by
//! hand: new directories are registered as they appear and released when
//! they go away. Raw notifications are normalized into [`FsEvent`]s.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::scan::scan;

/// Raw notifications buffered between the platform callback and `run`.
pub const RAW_QUEUE_CAPACITY: usize = 4096;

/// Normalized change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub kind: FsEventKind,
    pub path: PathBuf,
}

/// Type of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEventKind {
    Created,
    Modified,
    Removed,
}

impl FsEvent {
    pub fn created(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: FsEventKind::Created,
            path: path.into(),
        }
    }

    pub fn modified(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: FsEventKind::Modified,
            path: path.into(),
        }
    }

    pub fn removed(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: FsEventKind::Removed,
            path: path.into(),
        }
    }
}

pub struct FsWatcher {
    /// Platform watcher handle (must keep alive)
    watcher: RecommendedWatcher,
    /// Raw notifications from the platform callback
    raw_rx: mpsc::Receiver<notify::Result<Event>>,
    /// Notifications dropped because the raw queue was full
    dropped: Arc<AtomicUsize>,
    /// Directories currently registered
    watched: HashSet<PathBuf>,
}

impl FsWatcher {
    pub fn new() -> Result<Self> {
        // The notifier thread must never block: overflow is counted and
        // repaired by a rescan in `run`
        let (raw_tx, raw_rx) = mpsc::channel(RAW_QUEUE_CAPACITY);
        let dropped = Arc::new(AtomicUsize::new(0));
        let overflow = Arc::clone(&dropped);

        let watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            // Closed means the watcher is shutting down
            if let Err(TrySendError::Full(_)) = raw_tx.try_send(result) {
                overflow.fetch_add(1, Ordering::Relaxed);
            }
        })
        .context("initiate new filesystem watcher")?;

        Ok(Self {
            watcher,
            raw_rx,
            dropped,
            watched: HashSet::new(),
        })
    }

    /// Start observing a single directory.
    pub fn watch_dir(&mut self, dir: &Path) -> Result<()> {
        if self.watched.contains(dir) {
            return Ok(());
        }
        self.watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("add directory to watch: {:?}", dir))?;
        self.watched.insert(dir.to_path_buf());
        debug!("Watching directory {:?}", dir);
        Ok(())
    }

    /// Stop observing `dir` and anything registered beneath it. Unknown
    /// paths are ignored.
    pub fn unwatch_dir(&mut self, dir: &Path) {
        let nested: Vec<PathBuf> = self
            .watched
            .iter()
            .filter(|p| p.starts_with(dir))
            .cloned()
            .collect();

        for path in nested {
            // The platform may already have dropped the watch with the directory
            let _ = self.watcher.unwatch(&path);
            self.watched.remove(&path);
            debug!("Stopped watching directory {:?}", path);
        }
    }

    pub fn is_watching(&self, dir: &Path) -> bool {
        self.watched.contains(dir)
    }

    pub fn watched_count(&self) -> usize {
        self.watched.len()
    }

    /// Forward normalized events until cancelled or the receiver goes away.
    pub async fn run(mut self, events: mpsc::Sender<FsEvent>, cancel: CancellationToken) {
        info!("File watcher started ({} directories)", self.watched.len());

        loop {
            let raw = tokio::select! {
                _ = cancel.cancelled() => break,
                raw = self.raw_rx.recv() => raw,
            };

            let event = match raw {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    error!("Watcher error: {}", e);
                    continue;
                }
                None => break,
            };

            let mut batch = self.normalize(event);

            let dropped = self.dropped.swap(0, Ordering::Relaxed);
            if dropped > 0 {
                warn!(
                    "Dropped {} filesystem notifications, rescanning {} watched directories",
                    dropped,
                    self.watched.len()
                );
                batch.extend(self.rescan());
            }

            for fs_event in batch {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = events.send(fs_event) => {
                        if sent.is_err() {
                            debug!("Event receiver dropped, stopping watcher");
                            return;
                        }
                    }
                }
            }
        }

        info!("File watcher stopped");
    }

    /// Re-announce every file in the watched directories after notifications
    /// were lost, and pick up directories whose creation went unseen.
    ///
    /// Unchanged files cost one hash each downstream. Deletions that were
    /// lost are not recovered here.
    pub fn rescan(&mut self) -> Vec<FsEvent> {
        let mut out = Vec::new();
        let dirs: Vec<PathBuf> = self.watched.iter().cloned().collect();

        for dir in dirs {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    debug!("Rescan of {:?} failed: {}", dir, e);
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    if !self.watched.contains(&path) {
                        self.appeared(path, &mut out);
                    }
                } else if path.is_file() {
                    out.push(FsEvent::created(path));
                }
            }
        }

        out
    }

    /// Turn one raw notification into zero or more events, registering and
    /// releasing directory watches along the way.
    pub fn normalize(&mut self, event: Event) -> Vec<FsEvent> {
        let mut out = Vec::new();

        match event.kind {
            EventKind::Create(CreateKind::File) => {
                out.extend(event.paths.into_iter().map(FsEvent::created));
            }
            EventKind::Create(_) => {
                for path in event.paths {
                    self.appeared(path, &mut out);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                for path in event.paths {
                    self.disappeared(path, &mut out);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                for path in event.paths {
                    self.appeared(path, &mut out);
                }
            }
            // inotify reports the same rename as From and To as well
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {}
            EventKind::Modify(ModifyKind::Name(_)) => {
                for path in event.paths {
                    if path.exists() {
                        self.appeared(path, &mut out);
                    } else {
                        self.disappeared(path, &mut out);
                    }
                }
            }
            EventKind::Modify(ModifyKind::Metadata(_)) => {}
            EventKind::Modify(_) | EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
                out.extend(
                    event
                        .paths
                        .into_iter()
                        .filter(|p| !p.is_dir())
                        .map(FsEvent::modified),
                );
            }
            EventKind::Remove(_) => {
                for path in event.paths {
                    self.disappeared(path, &mut out);
                }
            }
            _ => {}
        }

        out
    }

    fn appeared(&mut self, path: PathBuf, out: &mut Vec<FsEvent>) {
        if !path.is_dir() {
            out.push(FsEvent::created(path));
            return;
        }

        // Files can land before the watch exists, and a directory moved into
        // the tree arrives with its content
        let found = scan(&path);
        for dir in &found.dirs {
            if let Err(e) = self.watch_dir(dir) {
                warn!("{:#}", e);
            }
        }
        out.extend(found.files.into_iter().map(FsEvent::created));
    }

    fn disappeared(&mut self, path: PathBuf, out: &mut Vec<FsEvent>) {
        // Can't stat a removed path, so release any watch it may have had
        self.unwatch_dir(&path);
        out.push(FsEvent::removed(path));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::RemoveKind;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn raw(kind: EventKind, path: &Path) -> Event {
        Event::new(kind).add_path(path.to_path_buf())
    }

    #[test]
    fn test_normalize_file_create_modify_remove() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("a.txt");
        fs::write(&file, "x").unwrap();
        let mut watcher = FsWatcher::new().unwrap();

        assert_eq!(
            watcher.normalize(raw(EventKind::Create(CreateKind::File), &file)),
            vec![FsEvent::created(&file)]
        );
        assert_eq!(
            watcher.normalize(raw(
                EventKind::Modify(ModifyKind::Data(notify::event::DataChange::Content)),
                &file
            )),
            vec![FsEvent::modified(&file)]
        );
        assert_eq!(
            watcher.normalize(raw(EventKind::Remove(RemoveKind::File), &file)),
            vec![FsEvent::removed(&file)]
        );
    }

    #[test]
    fn test_normalize_ignores_noise() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("a.txt");
        let mut watcher = FsWatcher::new().unwrap();

        assert!(watcher
            .normalize(raw(EventKind::Access(AccessKind::Read), &file))
            .is_empty());
        assert!(watcher
            .normalize(raw(
                EventKind::Modify(ModifyKind::Metadata(notify::event::MetadataKind::Permissions)),
                &file
            ))
            .is_empty());
    }

    #[test]
    fn test_close_write_counts_as_modified() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("a.txt");
        fs::write(&file, "x").unwrap();
        let mut watcher = FsWatcher::new().unwrap();

        assert_eq!(
            watcher.normalize(raw(
                EventKind::Access(AccessKind::Close(AccessMode::Write)),
                &file
            )),
            vec![FsEvent::modified(&file)]
        );
    }

    #[test]
    fn test_new_directory_is_watched_and_its_files_emitted() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("sub");
        fs::create_dir_all(dir.join("nested")).unwrap();
        fs::write(dir.join("nested/inner.txt"), "x").unwrap();
        let mut watcher = FsWatcher::new().unwrap();

        let events = watcher.normalize(raw(EventKind::Create(CreateKind::Folder), &dir));

        assert!(watcher.is_watching(&dir));
        assert!(watcher.is_watching(&dir.join("nested")));
        assert_eq!(events, vec![FsEvent::created(dir.join("nested/inner.txt"))]);
    }

    #[test]
    fn test_removed_directory_is_released() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("sub");
        fs::create_dir_all(dir.join("nested")).unwrap();
        let mut watcher = FsWatcher::new().unwrap();
        watcher.watch_dir(&dir).unwrap();
        watcher.watch_dir(&dir.join("nested")).unwrap();

        fs::remove_dir_all(&dir).unwrap();
        let events = watcher.normalize(raw(EventKind::Remove(RemoveKind::Folder), &dir));

        assert_eq!(watcher.watched_count(), 0);
        assert_eq!(events, vec![FsEvent::removed(&dir)]);
    }

    #[test]
    fn test_unwatch_unknown_dir_is_not_an_error() {
        let temp = TempDir::new().unwrap();
        let mut watcher = FsWatcher::new().unwrap();
        watcher.unwatch_dir(&temp.path().join("never-watched"));
        assert_eq!(watcher.watched_count(), 0);
    }

    #[test]
    fn test_rename_pair() {
        let temp = TempDir::new().unwrap();
        let old = temp.path().join("old.txt");
        let new = temp.path().join("new.txt");
        fs::write(&new, "x").unwrap();
        let mut watcher = FsWatcher::new().unwrap();

        assert_eq!(
            watcher.normalize(raw(EventKind::Modify(ModifyKind::Name(RenameMode::From)), &old)),
            vec![FsEvent::removed(&old)]
        );
        assert_eq!(
            watcher.normalize(raw(EventKind::Modify(ModifyKind::Name(RenameMode::To)), &new)),
            vec![FsEvent::created(&new)]
        );
        let both = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(old.clone())
            .add_path(new.clone());
        assert!(watcher.normalize(both).is_empty());
    }

    #[test]
    fn test_rescan_reannounces_files_and_unseen_directories() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        fs::write(root.join("a.txt"), "a").unwrap();
        fs::create_dir_all(root.join("missed/inner")).unwrap();
        fs::write(root.join("missed/inner/b.txt"), "b").unwrap();
        let mut watcher = FsWatcher::new().unwrap();
        watcher.watch_dir(&root).unwrap();

        let mut events = watcher.rescan();
        events.sort_by(|a, b| a.path.cmp(&b.path));

        assert_eq!(
            events,
            vec![
                FsEvent::created(root.join("a.txt")),
                FsEvent::created(root.join("missed/inner/b.txt")),
            ]
        );
        assert!(watcher.is_watching(&root.join("missed")));
        assert!(watcher.is_watching(&root.join("missed/inner")));
    }

    #[tokio::test]
    async fn test_dropped_notifications_trigger_rescan() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        let unseen = root.join("unseen.txt");
        fs::write(&unseen, "x").unwrap();

        let mut watcher = FsWatcher::new().unwrap();
        watcher.watch_dir(&root).unwrap();
        watcher.dropped.store(3, Ordering::Relaxed);

        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(watcher.run(tx, cancel.clone()));

        // Any notification wakes the loop
        fs::write(root.join("trigger.txt"), "t").unwrap();

        let event = timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Some(e) if e.path == unseen => return e,
                    Some(_) => continue,
                    None => panic!("watcher stopped"),
                }
            }
        })
        .await
        .expect("Timed out waiting for rescan");
        assert_eq!(event.kind, FsEventKind::Created);

        cancel.cancel();
        timeout(Duration::from_secs(5), handle)
            .await
            .expect("watcher did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_delivers_real_events() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        let mut watcher = FsWatcher::new().unwrap();
        watcher.watch_dir(&root).unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(watcher.run(tx, cancel.clone()));

        let file = root.join("hello.txt");
        fs::write(&file, "hello").unwrap();

        let event = timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Some(e) if e.path == file => return e,
                    Some(_) => continue,
                    None => panic!("watcher stopped"),
                }
            }
        })
        .await
        .expect("Timed out waiting for event");
        assert!(matches!(
            event.kind,
            FsEventKind::Created | FsEventKind::Modified
        ));

        cancel.cancel();
        timeout(Duration::from_secs(5), handle)
            .await
            .expect("watcher did not stop")
            .unwrap();
    }
}
