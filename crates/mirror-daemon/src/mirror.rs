//! Startup sequence for the watch → ingest half of the daemon.

use std::sync::Arc;

use anyhow::{Context, Result};
use mirror_core::MetadataStore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::MirrorConfig;
use crate::ingest::{Ingestor, Pipeline};
use crate::scan::scan;
use crate::watcher::FsWatcher;

/// Running watcher and ingestion tasks.
pub struct MirrorHandle {
    watcher: JoinHandle<()>,
    pipeline: JoinHandle<()>,
}

impl MirrorHandle {
    /// Wait for both tasks to finish after cancellation.
    pub async fn join(self) {
        if let Err(e) = self.watcher.await {
            warn!("Watcher task failed: {}", e);
        }
        if let Err(e) = self.pipeline.await {
            warn!("Ingestion task failed: {}", e);
        }
    }
}

/// Scan the source tree, register watches, ingest what is already there and
/// start following changes.
///
/// Watches are registered before the initial ingestion so nothing written in
/// between is missed; such files are simply ingested twice.
pub async fn start(
    config: &MirrorConfig,
    store: Arc<MetadataStore>,
    cancel: CancellationToken,
) -> Result<MirrorHandle> {
    let found = scan(&config.source);
    info!(
        "Found {} files in {} directories under {:?}",
        found.files.len(),
        found.dirs.len(),
        config.source
    );

    let mut watcher = FsWatcher::new()?;
    watcher
        .watch_dir(&config.source)
        .context("watch source directory")?;
    for dir in found.dirs.iter().filter(|d| **d != config.source) {
        if let Err(e) = watcher.watch_dir(dir) {
            warn!("{:#}", e);
        }
    }

    let ingestor = Ingestor::new(config, store);
    let mut pipeline = Pipeline::new(ingestor.clone());
    pipeline.seed(found.files).await;
    info!("Initial ingestion complete ({} files)", pipeline.tracked_count());

    if config.prune_stale {
        let pruned = tokio::task::spawn_blocking(move || ingestor.prune_stale())
            .await
            .context("prune task failed")??;
        if pruned > 0 {
            info!("Pruned {} stale blobs from destination", pruned);
        }
    }

    let (tx, rx) = mpsc::channel(config.queue_capacity);
    let watcher = tokio::spawn(watcher.run(tx, cancel.clone()));
    let pipeline = tokio::spawn(pipeline.run(rx, cancel));

    Ok(MirrorHandle { watcher, pipeline })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SettlePolicy;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_start_seeds_and_prunes() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        fs::create_dir(src.path().join("sub")).unwrap();
        fs::write(src.path().join("a.txt"), "a").unwrap();
        fs::write(src.path().join("sub/b.txt"), "b").unwrap();
        fs::write(dst.path().join("0".repeat(64)), "left over").unwrap();

        let mut config = MirrorConfig::new(src.path(), dst.path()).unwrap();
        config.settle = SettlePolicy::disabled();
        let store = Arc::new(MetadataStore::new());
        let cancel = CancellationToken::new();

        let handle = start(&config, Arc::clone(&store), cancel.clone())
            .await
            .unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(fs::read_dir(dst.path()).unwrap().count(), 2);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .expect("tasks did not stop");
    }

    #[tokio::test]
    async fn test_start_keeps_stale_when_disabled() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        fs::write(dst.path().join("0".repeat(64)), "left over").unwrap();

        let mut config = MirrorConfig::new(src.path(), dst.path()).unwrap();
        config.prune_stale = false;
        let cancel = CancellationToken::new();

        let handle = start(&config, Arc::new(MetadataStore::new()), cancel.clone())
            .await
            .unwrap();
        assert!(dst.path().join("0".repeat(64)).exists());

        cancel.cancel();
        handle.join().await;
    }
}
