//! Filesystem change ingestion
//!
//! `source` turns raw watcher events into per-root bursts of changed paths;
//! `batcher` coalesces the bursts into rate-limited, directory-scoped
//! refresh calls against the scanner port and emits tree updates for the
//! orchestrating owner of the tree.

pub mod batcher;
pub mod source;

pub use batcher::{BatcherConfig, TreeUpdate, WatchBatcher};
pub use source::WatchSource;

use crate::models::{FileEntry, FilePatch};
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

/// One notification event from the filesystem watcher. An empty
/// `changed_paths` means "refresh everything under `root`".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchBurst {
    pub root: String,
    pub changed_paths: Vec<String>,
}

pub type ScanResult<T> = std::result::Result<T, ScanError>;

#[derive(Debug)]
pub enum ScanError {
    Io(io::Error),
    /// The scanner backend rejected or failed the request for its own
    /// reasons (index lock contention, stale project id, ...).
    Backend(String),
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanError::Io(e) => write!(f, "IO error: {}", e),
            ScanError::Backend(msg) => write!(f, "scanner backend error: {}", msg),
        }
    }
}

impl std::error::Error for ScanError {}

impl From<io::Error> for ScanError {
    fn from(e: io::Error) -> Self {
        ScanError::Io(e)
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Port to the external directory-scanning backend.
///
/// `sync_dir` asks for a targeted diff of one directory's immediate
/// children; `None` (or an empty patch) means the backend had nothing to
/// diff against and the caller should fall back to `list_dir` plus a merge.
/// `scan_root` produces a full (shallow) listing of the watched root.
pub trait Scanner: Send + Sync {
    fn sync_dir<'a>(&'a self, dir: &'a str) -> BoxFuture<'a, ScanResult<Option<FilePatch>>>;
    fn list_dir<'a>(&'a self, dir: &'a str) -> BoxFuture<'a, ScanResult<Vec<Arc<FileEntry>>>>;
    fn scan_root<'a>(&'a self, root: &'a str) -> BoxFuture<'a, ScanResult<Vec<Arc<FileEntry>>>>;
}
