//! Command-line arguments and the validated runtime configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "mirror-daemon")]
#[command(about = "Mirroring encryption server")]
pub struct Args {
    /// Source directory to watch
    #[arg(long, env = "MIRROR_SRC")]
    pub src: PathBuf,

    /// Destination directory for encrypted blobs
    #[arg(long, env = "MIRROR_DST")]
    pub dst: PathBuf,

    /// HTTP server port
    #[arg(short, long, default_value_t = 8080, env = "MIRROR_PORT")]
    pub port: u16,

    /// Address to bind to
    #[arg(long, default_value = "0.0.0.0", env = "MIRROR_BIND")]
    pub bind: String,

    /// Format log lines as JSON
    #[arg(long)]
    pub json: bool,

    /// Enable verbose logging
    #[arg(long)]
    pub verbose: bool,

    /// Interval between size/mtime polls while waiting for a write to settle (0 disables)
    #[arg(long, default_value_t = 200, env = "MIRROR_SETTLE_MS")]
    pub settle_ms: u64,

    /// Maximum number of settle polls before ingesting anyway
    #[arg(long, default_value_t = 10)]
    pub settle_attempts: u32,

    /// Capacity of the watcher → ingestion event queue
    #[arg(long, default_value_t = 64)]
    pub queue: usize,

    /// Seconds to wait for in-flight requests on shutdown
    #[arg(long, default_value_t = 5)]
    pub shutdown_grace_secs: u64,

    /// Keep blobs in the destination that no live file maps to
    #[arg(long)]
    pub keep_stale: bool,
}

/// How long to wait for a file to stop changing before reading it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlePolicy {
    pub interval: Duration,
    pub attempts: u32,
}

impl SettlePolicy {
    pub fn disabled() -> Self {
        Self {
            interval: Duration::ZERO,
            attempts: 0,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.interval.is_zero() || self.attempts == 0
    }
}

impl Default for SettlePolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
            attempts: 10,
        }
    }
}

/// Validated configuration for a running mirror.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Canonical source root
    pub source: PathBuf,
    /// Canonical destination directory
    pub destination: PathBuf,
    pub listen: SocketAddr,
    pub settle: SettlePolicy,
    pub queue_capacity: usize,
    pub shutdown_grace: Duration,
    pub prune_stale: bool,
}

impl MirrorConfig {
    /// Build a config for the given directories with default tuning.
    pub fn new(source: &Path, destination: &Path) -> Result<Self> {
        let source = existing_dir(source, "source")?;
        let destination = existing_dir(destination, "destination")?;

        if destination.starts_with(&source) {
            bail!(
                "destination directory {:?} must not be inside source directory {:?}",
                destination,
                source
            );
        }

        Ok(Self {
            source,
            destination,
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            settle: SettlePolicy::default(),
            queue_capacity: 64,
            shutdown_grace: Duration::from_secs(5),
            prune_stale: true,
        })
    }
}

impl Args {
    pub fn into_config(self) -> Result<MirrorConfig> {
        let mut config = MirrorConfig::new(&self.src, &self.dst)?;

        config.listen = format!("{}:{}", self.bind, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.bind, self.port))?;
        config.settle = SettlePolicy {
            interval: Duration::from_millis(self.settle_ms),
            attempts: self.settle_attempts,
        };
        config.queue_capacity = self.queue.max(1);
        config.shutdown_grace = Duration::from_secs(self.shutdown_grace_secs);
        config.prune_stale = !self.keep_stale;

        Ok(config)
    }
}

fn existing_dir(path: &Path, role: &str) -> Result<PathBuf> {
    let canonical = path
        .canonicalize()
        .with_context(|| format!("{} directory does not exist: {:?}", role, path))?;
    if !canonical.is_dir() {
        bail!("{} path is not a directory: {:?}", role, path);
    }
    Ok(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args(src: &Path, dst: &Path, extra: &[&str]) -> Args {
        let mut argv = vec![
            "mirror-daemon".to_string(),
            "--src".to_string(),
            src.display().to_string(),
            "--dst".to_string(),
            dst.display().to_string(),
        ];
        argv.extend(extra.iter().map(|s| s.to_string()));
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let config = args(src.path(), dst.path(), &[]).into_config().unwrap();

        assert_eq!(config.source, src.path().canonicalize().unwrap());
        assert_eq!(config.destination, dst.path().canonicalize().unwrap());
        assert_eq!(config.listen.port(), 8080);
        assert_eq!(config.settle, SettlePolicy::default());
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
        assert!(config.prune_stale);
    }

    #[test]
    fn test_overrides() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let config = args(
            src.path(),
            dst.path(),
            &["-p", "9000", "--bind", "127.0.0.1", "--settle-ms", "0", "--keep-stale"],
        )
        .into_config()
        .unwrap();

        assert_eq!(config.listen, "127.0.0.1:9000".parse().unwrap());
        assert!(config.settle.is_disabled());
        assert!(!config.prune_stale);
    }

    #[test]
    fn test_missing_source_is_fatal() {
        let dst = TempDir::new().unwrap();
        let missing = dst.path().join("nope");
        let err = MirrorConfig::new(&missing, dst.path()).unwrap_err();
        assert!(err.to_string().contains("source directory does not exist"));
    }

    #[test]
    fn test_source_must_be_directory() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let file = src.path().join("file.txt");
        std::fs::write(&file, "x").unwrap();

        assert!(MirrorConfig::new(&file, dst.path()).is_err());
    }

    #[test]
    fn test_destination_inside_source_rejected() {
        let src = TempDir::new().unwrap();
        let nested = src.path().join("blobs");
        std::fs::create_dir(&nested).unwrap();

        assert!(MirrorConfig::new(src.path(), &nested).is_err());
    }
}
