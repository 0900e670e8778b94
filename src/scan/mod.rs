//! Directory scanning
//!
//! Produces `FileEntry` trees straight from disk. Scans are bounded: depth
//! and per-directory entry caps keep a pathological tree from hanging the
//! caller, and well-known heavy directories are kept as empty folder stubs
//! instead of being descended into. Image files are collected into a
//! parallel flat list as they are encountered.
//!
//! [`FsScanner`] implements the `watch::Scanner` port on top of the raw
//! scan, diffing each directory against the listing it saw last time to
//! produce targeted `FilePatch`es.

use crate::codec::Snapshot;
use crate::models::{sort_siblings, FileEntry, FilePatch};
use crate::watch::{BoxFuture, ScanError, ScanResult, Scanner};
use rustc_hash::{FxHashMap, FxHashSet};
use std::fs;
use std::sync::{Arc, Mutex, MutexGuard};

const MAX_DEPTH: u32 = 5;
const RECURSE_DEPTH: u32 = 3;
const MAX_ENTRIES_PER_DIR: usize = 5000;

const HEAVY_DIRS: [&str; 5] = ["node_modules", ".git", "target", "dist", "build"];
const IMAGE_EXTS: [&str; 6] = [".png", ".jpg", ".jpeg", ".gif", ".webp", ".svg"];

/// Scans `root` recursively (to the recursion cap) and returns the tree
/// plus the flat image list, ready for the codec.
pub fn scan_project(root: &str) -> Snapshot {
    let mut images = Vec::new();
    let tree = scan_dir(root, &mut images, true, 0);
    Snapshot { tree, images }
}

/// One directory level, the shape the original indexer produced: folders
/// carry `Some(children)` even when unexplored, files carry `None`.
pub fn scan_dir(
    dir_path: &str,
    images: &mut Vec<Arc<FileEntry>>,
    recursive: bool,
    depth: u32,
) -> Vec<Arc<FileEntry>> {
    if depth > MAX_DEPTH {
        return Vec::new();
    }

    let mut nodes = Vec::new();
    if let Ok(entries) = fs::read_dir(dir_path) {
        for (count, entry) in entries.flatten().enumerate() {
            if count >= MAX_ENTRIES_PER_DIR {
                tracing::warn!(dir = %dir_path, cap = MAX_ENTRIES_PER_DIR, "entry cap hit, truncating listing");
                break;
            }
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = path.is_dir();
            let path_str = path.to_string_lossy().to_string();

            if is_dir && HEAVY_DIRS.contains(&name.as_str()) {
                nodes.push(Arc::new(FileEntry::folder(name.as_str(), path_str, Vec::new())));
                continue;
            }

            if !is_dir {
                let lower = name.to_lowercase();
                if IMAGE_EXTS.iter().any(|ext| lower.ends_with(ext)) {
                    images.push(Arc::new(FileEntry::file(name.as_str(), path_str.clone())));
                }
            }

            if is_dir {
                let children = if recursive && depth < RECURSE_DEPTH {
                    scan_dir(&path_str, images, true, depth + 1)
                } else {
                    Vec::new()
                };
                nodes.push(Arc::new(FileEntry::folder(name.as_str(), path_str, children)));
            } else {
                nodes.push(Arc::new(FileEntry::file(name.as_str(), path_str)));
            }
        }
    }

    sort_siblings(&mut nodes);
    nodes
}

/// Disk-backed implementation of the scanner port.
///
/// `sync_dir` diffs a directory's immediate children against the listing
/// recorded the last time that directory was scanned. With nothing recorded
/// yet it returns `None` and lets the caller fall back to a plain listing,
/// which primes the cache.
#[derive(Default)]
pub struct FsScanner {
    listings: Mutex<FxHashMap<String, FxHashSet<String>>>,
}

impl FsScanner {
    pub fn new() -> Self {
        Self::default()
    }

    fn listings(&self) -> MutexGuard<'_, FxHashMap<String, FxHashSet<String>>> {
        match self.listings.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn list_blocking(dir: String, recursive: bool) -> ScanResult<Vec<Arc<FileEntry>>> {
        tokio::task::spawn_blocking(move || {
            let mut images = Vec::new();
            scan_dir(&dir, &mut images, recursive, 0)
        })
        .await
        .map_err(|e| ScanError::Backend(e.to_string()))
    }

    fn record_listing(&self, dir: &str, nodes: &[Arc<FileEntry>]) {
        let paths: FxHashSet<String> = nodes.iter().map(|n| n.path.clone()).collect();
        self.listings().insert(dir.to_string(), paths);
    }
}

impl Scanner for FsScanner {
    fn sync_dir<'a>(&'a self, dir: &'a str) -> BoxFuture<'a, ScanResult<Option<FilePatch>>> {
        Box::pin(async move {
            let disk = Self::list_blocking(dir.to_string(), false).await?;
            let disk_paths: FxHashSet<String> = disk.iter().map(|n| n.path.clone()).collect();

            let mut listings = self.listings();
            let Some(previous) = listings.get(dir) else {
                listings.insert(dir.to_string(), disk_paths);
                return Ok(None);
            };

            let added: Vec<Arc<FileEntry>> = disk
                .iter()
                .filter(|node| !previous.contains(&node.path))
                .cloned()
                .collect();
            let mut removed: Vec<String> = previous
                .iter()
                .filter(|path| !disk_paths.contains(*path))
                .cloned()
                .collect();
            removed.sort_unstable();

            listings.insert(dir.to_string(), disk_paths);
            Ok(Some(FilePatch {
                parent_path: dir.to_string(),
                added,
                removed,
            }))
        })
    }

    fn list_dir<'a>(&'a self, dir: &'a str) -> BoxFuture<'a, ScanResult<Vec<Arc<FileEntry>>>> {
        Box::pin(async move {
            let nodes = Self::list_blocking(dir.to_string(), false).await?;
            self.record_listing(dir, &nodes);
            Ok(nodes)
        })
    }

    fn scan_root<'a>(&'a self, root: &'a str) -> BoxFuture<'a, ScanResult<Vec<Arc<FileEntry>>>> {
        Box::pin(async move {
            let nodes = Self::list_blocking(root.to_string(), true).await?;
            self.record_listing(root, &nodes);
            Ok(nodes)
        })
    }
}
