//! File tree data model

use compact_str::CompactString;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One node (file or folder) in the in-memory project tree.
///
/// Nodes are immutable once built and shared behind `Arc`: every tree
/// operation returns a new `Vec<Arc<FileEntry>>` that reuses the untouched
/// branches of its input, so callers can detect unchanged subtrees with
/// `Arc::ptr_eq`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: CompactString,
    pub path: String,
    #[serde(rename = "isFolder")]
    pub is_folder: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<Arc<FileEntry>>>,
}

impl FileEntry {
    pub fn file(name: impl Into<CompactString>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            is_folder: false,
            children: None,
        }
    }

    pub fn folder(
        name: impl Into<CompactString>,
        path: impl Into<String>,
        children: Vec<Arc<FileEntry>>,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            is_folder: true,
            children: Some(children),
        }
    }

    pub fn children(&self) -> &[Arc<FileEntry>] {
        self.children.as_deref().unwrap_or(&[])
    }

    pub fn has_children(&self) -> bool {
        self.children.as_ref().is_some_and(|c| !c.is_empty())
    }
}

/// The set of folder paths currently expanded in the UI. Membership test
/// only; the set does not own the tree.
pub type ExpansionState = FxHashSet<String>;

/// A flattened row produced by the virtualization index, never persisted.
#[derive(Debug, Clone)]
pub struct FlatEntry {
    pub entry: Arc<FileEntry>,
    pub level: u16,
    pub global_index: usize,
}

/// An add/remove delta scoped to one directory's immediate children,
/// produced by the scanner's targeted re-scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePatch {
    pub parent_path: String,
    pub added: Vec<Arc<FileEntry>>,
    pub removed: Vec<String>,
}

impl FilePatch {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Sorts siblings in place: folders before files, each group alphabetical
/// by name.
pub fn sort_siblings(nodes: &mut [Arc<FileEntry>]) {
    nodes.sort_by(|a, b| {
        if a.is_folder == b.is_folder {
            a.name.cmp(&b.name)
        } else if a.is_folder {
            std::cmp::Ordering::Less
        } else {
            std::cmp::Ordering::Greater
        }
    });
}

/// Normalizes a path for comparison: backslashes become slashes and a
/// trailing slash is trimmed. Patch parent paths and node paths may arrive
/// with either slash direction.
pub fn normalize_path(path: &str) -> String {
    let normalized = path.replace('\\', "/");
    normalized.trim_end_matches('/').to_string()
}

/// The parent directory implied by a changed path: the final
/// separator-delimited segment removed. An empty result maps to the watched
/// root.
pub fn parent_dir(path: &str, root: &str) -> String {
    let normalized = normalize_path(path);
    match normalized.rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => parent.to_string(),
        _ => normalize_path(root),
    }
}
