//! mirror-daemon library: Exposes the daemon components for testing.
//!
//! The binary wires these together; integration tests drive the pipeline
//! and HTTP router directly.

pub mod config;
pub mod html;
pub mod ingest;
pub mod mirror;
pub mod scan;
pub mod server;
pub mod watcher;

// Re-export key types for convenience
pub use config::{Args, MirrorConfig, SettlePolicy};
pub use ingest::{Ingested, Ingestor, Pipeline};
pub use mirror::MirrorHandle;
pub use server::{AppState, router, serve};
pub use watcher::{FsEvent, FsEventKind, FsWatcher};
