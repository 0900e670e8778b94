//! Incremental tree reconciliation
//!
//! Every operation here is pure: it returns a new tree sharing every
//! untouched branch with the input. The orchestrating owner swaps the tree
//! value wholesale, so readers never observe a half-applied update.

use crate::models::{normalize_path, sort_siblings, FileEntry, FilePatch};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;

/// Unions a partial scan result into an existing tree.
///
/// Used when a root directory's children arrive progressively in chunks.
/// A chunk that reports empty children for a folder we already loaded must
/// not appear to collapse it, and nodes absent from the chunk are retained:
/// `new` is a union contribution, not a replacement. Merging the same chunk
/// twice is a no-op the second time.
pub fn merge_trees(old: &[Arc<FileEntry>], new: &[Arc<FileEntry>]) -> Vec<Arc<FileEntry>> {
    if old.is_empty() {
        return new.to_vec();
    }

    let old_by_path: FxHashMap<&str, &Arc<FileEntry>> =
        old.iter().map(|node| (node.path.as_str(), node)).collect();
    let new_paths: FxHashSet<&str> = new.iter().map(|node| node.path.as_str()).collect();

    let mut result = Vec::with_capacity(old.len().max(new.len()));

    for new_node in new {
        match old_by_path.get(new_node.path.as_str()) {
            Some(old_node) if new_node.is_folder => {
                result.push(merge_folder(old_node, new_node));
            }
            _ => result.push(new_node.clone()),
        }
    }

    // Old nodes the chunk did not mention survive; a path already present
    // in the chunk wins over its old counterpart.
    for old_node in old {
        if !new_paths.contains(old_node.path.as_str()) {
            result.push(old_node.clone());
        }
    }

    sort_siblings(&mut result);
    result
}

fn merge_folder(old_node: &Arc<FileEntry>, new_node: &Arc<FileEntry>) -> Arc<FileEntry> {
    let new_children = new_node.children();
    let old_children = old_node.children();

    if new_children.is_empty() && !old_children.is_empty() {
        // Partial chunk with unloaded children: keep what we already have.
        return Arc::new(FileEntry {
            children: old_node.children.clone(),
            ..FileEntry::clone(new_node)
        });
    }

    if !new_children.is_empty() && !old_children.is_empty() {
        return Arc::new(FileEntry {
            children: Some(merge_trees(old_children, new_children)),
            ..FileEntry::clone(new_node)
        });
    }

    new_node.clone()
}

/// Applies a directory-scoped add/remove patch to the tree.
///
/// The patch's parent path is matched slash-direction and trailing-slash
/// insensitively against every node, searched with an explicit stack. When
/// no node matches at any depth but every top-level path begins with the
/// normalized parent, the patch targets the root level itself. The prefix
/// inference can misfire on an unrelated sibling sharing the prefix; the
/// scanner protocol carries no explicit root flag, so it stays.
///
/// Total by construction: an unmatched parent returns the tree unchanged,
/// so callers never handle a rejected patch.
pub fn apply_file_patch(tree: &[Arc<FileEntry>], patch: &FilePatch) -> Vec<Arc<FileEntry>> {
    let norm_parent = normalize_path(&patch.parent_path);

    // Sanitize additions the way the scanner's consumer always has: skip
    // nameless/pathless entries, normalize the paths that remain.
    let clean_added: Vec<Arc<FileEntry>> = patch
        .added
        .iter()
        .filter(|entry| !entry.name.is_empty() && !entry.path.is_empty())
        .map(|entry| {
            let normalized = normalize_path(&entry.path);
            if normalized == entry.path {
                entry.clone()
            } else {
                Arc::new(FileEntry {
                    path: normalized,
                    ..FileEntry::clone(entry)
                })
            }
        })
        .collect();

    if let Some(chain) = find_target_chain(tree, &norm_parent) {
        return rebuild_along_chain(tree, &chain, &clean_added, &patch.removed);
    }

    let root_heuristic = norm_parent.is_empty()
        || tree
            .iter()
            .all(|node| normalize_path(&node.path).starts_with(&norm_parent));
    if root_heuristic {
        tracing::debug!(parent = %norm_parent, "patching root level");
        return patch_children(tree, &clean_added, &patch.removed);
    }

    tracing::warn!(parent = %norm_parent, "patch parent not found, tree unchanged");
    tree.to_vec()
}

/// Unions a fresh directory listing into the tree at `dir`.
///
/// Used when a targeted diff was unavailable and the watcher fell back to
/// re-listing a directory. The listing is folded in with [`merge_trees`]
/// rather than replacing the child set, so already-loaded grandchildren
/// survive a shallow listing. Target resolution mirrors
/// [`apply_file_patch`]: normalized path match first, then the root-prefix
/// fallback, otherwise the tree is returned unchanged.
pub fn merge_children_at(
    tree: &[Arc<FileEntry>],
    dir: &str,
    children: &[Arc<FileEntry>],
) -> Vec<Arc<FileEntry>> {
    let norm_dir = normalize_path(dir);

    if let Some(chain) = find_target_chain(tree, &norm_dir) {
        let target = node_at(tree, &chain);
        let merged = merge_trees(target.children(), children);
        return replace_along_chain(tree, &chain, merged);
    }

    let root_heuristic = norm_dir.is_empty()
        || tree
            .iter()
            .all(|node| normalize_path(&node.path).starts_with(&norm_dir));
    if root_heuristic {
        tracing::debug!(dir = %norm_dir, "merging listing at root level");
        return merge_trees(tree, children);
    }

    tracing::warn!(dir = %norm_dir, "listing target not found, tree unchanged");
    tree.to_vec()
}

/// Depth-first search (explicit stack) for the folder whose normalized path
/// equals `norm_parent`, returning the index chain from the root to it.
/// Paths are globally unique, so the first match is the only one.
fn find_target_chain(tree: &[Arc<FileEntry>], norm_parent: &str) -> Option<Vec<usize>> {
    if norm_parent.is_empty() {
        return None;
    }

    // Each frame is (children slice, next index to visit).
    let mut stack: Vec<(&[Arc<FileEntry>], usize)> = vec![(tree, 0)];

    while let Some(frame) = stack.last_mut() {
        let (nodes, idx) = (frame.0, frame.1);
        if idx >= nodes.len() {
            stack.pop();
            continue;
        }
        frame.1 += 1;

        let node = &nodes[idx];
        if node.is_folder && normalize_path(&node.path) == norm_parent {
            let mut chain: Vec<usize> = stack[..stack.len() - 1]
                .iter()
                .map(|(_, next)| next - 1)
                .collect();
            chain.push(idx);
            return Some(chain);
        }

        if node.has_children() {
            stack.push((node.children(), 0));
        }
    }

    None
}

fn rebuild_along_chain(
    tree: &[Arc<FileEntry>],
    chain: &[usize],
    added: &[Arc<FileEntry>],
    removed: &[String],
) -> Vec<Arc<FileEntry>> {
    let target = node_at(tree, chain);
    let children = patch_children(target.children(), added, removed);
    replace_along_chain(tree, chain, children)
}

fn node_at<'a>(tree: &'a [Arc<FileEntry>], chain: &[usize]) -> &'a Arc<FileEntry> {
    let mut level = tree;
    let mut node = &level[chain[0]];
    for &idx in &chain[1..] {
        level = node.children();
        node = &level[idx];
    }
    node
}

/// Rebuilds the tree with `new_children` at the end of `chain`, cloning only
/// the sibling vectors along the ancestor path. Iterative bottom-up so the
/// rebuild depth never touches the call stack.
fn replace_along_chain(
    tree: &[Arc<FileEntry>],
    chain: &[usize],
    new_children: Vec<Arc<FileEntry>>,
) -> Vec<Arc<FileEntry>> {
    // Collect the ancestor nodes from root to target.
    let mut ancestors: Vec<&Arc<FileEntry>> = Vec::with_capacity(chain.len());
    let mut level = tree;
    for &idx in chain {
        let node = &level[idx];
        ancestors.push(node);
        level = node.children();
    }

    let target = ancestors[ancestors.len() - 1];
    let mut rebuilt = Arc::new(FileEntry {
        children: Some(new_children),
        ..FileEntry::clone(target)
    });

    for depth in (1..chain.len()).rev() {
        let parent = ancestors[depth - 1];
        let mut siblings = parent.children().to_vec();
        siblings[chain[depth]] = rebuilt;
        rebuilt = Arc::new(FileEntry {
            children: Some(siblings),
            ..FileEntry::clone(parent)
        });
    }

    let mut result = tree.to_vec();
    result[chain[0]] = rebuilt;
    result
}

fn patch_children(
    children: &[Arc<FileEntry>],
    added: &[Arc<FileEntry>],
    removed: &[String],
) -> Vec<Arc<FileEntry>> {
    let removed_set: FxHashSet<String> = removed.iter().map(|p| normalize_path(p)).collect();
    let added_paths: FxHashSet<&str> = added.iter().map(|entry| entry.path.as_str()).collect();

    let mut result: Vec<Arc<FileEntry>> = children
        .iter()
        .filter(|child| {
            let norm = normalize_path(&child.path);
            !removed_set.contains(&norm) && !added_paths.contains(norm.as_str())
        })
        .cloned()
        .collect();
    result.extend(added.iter().cloned());
    sort_siblings(&mut result);
    result
}
