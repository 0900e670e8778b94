//! Windowed virtualization index
//!
//! Counts and windows the visible rows of a tree under an expansion set
//! without ever materializing the full flattened list. Traversals use an
//! explicit stack so stack usage stays bounded on trees with tens of
//! thousands of entries.

use crate::models::{ExpansionState, FileEntry, FlatEntry};
use rustc_hash::FxHashSet;
use std::sync::Arc;

/// Counts every node reachable by descending only into folders whose path
/// is in `expanded`. Root-level nodes always count; a nested node counts
/// only if every ancestor folder is expanded.
pub fn count_expanded_nodes(tree: &[Arc<FileEntry>], expanded: &ExpansionState) -> usize {
    let mut total = 0;
    // Each frame is (siblings, next index to visit).
    let mut stack: Vec<(&[Arc<FileEntry>], usize)> = vec![(tree, 0)];

    while let Some(frame) = stack.last_mut() {
        let (nodes, idx) = (frame.0, frame.1);
        if idx >= nodes.len() {
            stack.pop();
            continue;
        }
        frame.1 += 1;

        let node = &nodes[idx];
        total += 1;

        if descend_into(node, expanded) {
            stack.push((node.children(), 0));
        }
    }

    total
}

/// Performs the same traversal and numbering as [`count_expanded_nodes`]
/// but materializes only the rows whose global index falls in
/// `[start, end)`, and abandons the walk entirely once the index passes
/// `end`. For any split point `k`, the window `[0,k)` concatenated with
/// `[k,n)` equals `[0,n)`.
pub fn visible_window(
    tree: &[Arc<FileEntry>],
    expanded: &ExpansionState,
    start: usize,
    end: usize,
) -> Vec<FlatEntry> {
    let mut result = Vec::new();
    if start >= end {
        return result;
    }

    let mut global_index = 0;
    let mut stack: Vec<(&[Arc<FileEntry>], usize)> = vec![(tree, 0)];

    while let Some(frame) = stack.last_mut() {
        let (nodes, idx) = (frame.0, frame.1);
        if idx >= nodes.len() {
            stack.pop();
            continue;
        }
        frame.1 += 1;

        let node = &nodes[idx];
        if global_index >= start {
            result.push(FlatEntry {
                entry: node.clone(),
                level: (stack.len() - 1) as u16,
                global_index,
            });
        }
        global_index += 1;
        if global_index >= end {
            break;
        }

        if descend_into(node, expanded) {
            stack.push((node.children(), 0));
        }
    }

    result
}

fn descend_into(node: &FileEntry, expanded: &ExpansionState) -> bool {
    node.is_folder && node.has_children() && expanded.contains(&node.path)
}

/// A search-filtered projection of the tree: only matching nodes and their
/// ancestor folders survive, and every surviving folder is force-expanded
/// so no match hides behind a collapsed ancestor. Counting and windowing
/// then run against `tree` with `expanded`, ignoring persisted expansion
/// state for the duration of the query.
#[derive(Debug, Clone, Default)]
pub struct SearchView {
    pub tree: Vec<Arc<FileEntry>>,
    pub expanded: ExpansionState,
}

/// Filters the tree depth-first for a case-insensitive substring query.
/// A node survives if its own name matches or, for a folder, at least one
/// descendant survives.
pub fn filter_tree(tree: &[Arc<FileEntry>], query: &str) -> SearchView {
    let needle = query.to_lowercase();
    let mut expanded = FxHashSet::default();
    let tree = filter_nodes(tree, &needle, &mut expanded);
    SearchView { tree, expanded }
}

fn filter_nodes(
    nodes: &[Arc<FileEntry>],
    needle: &str,
    expanded: &mut ExpansionState,
) -> Vec<Arc<FileEntry>> {
    let mut result = Vec::new();

    for node in nodes {
        let self_matches = node.name.to_lowercase().contains(needle);

        if node.is_folder {
            let surviving = filter_nodes(node.children(), needle, expanded);
            if self_matches || !surviving.is_empty() {
                expanded.insert(node.path.clone());
                if surviving.len() == node.children().len() {
                    // Whole subtree survived: keep the original allocation.
                    result.push(node.clone());
                } else {
                    result.push(Arc::new(FileEntry {
                        children: Some(surviving),
                        ..FileEntry::clone(node)
                    }));
                }
            }
        } else if self_matches {
            result.push(node.clone());
        }
    }

    result
}
