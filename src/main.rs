use std::env;
use std::path::Path;
use std::sync::Arc;

use treeline::models::{ExpansionState, FileEntry};
use treeline::scan::FsScanner;
use treeline::watch::{TreeUpdate, WatchBatcher, WatchSource};
use treeline::worker::{ResponseGate, TreeResponse, TreeWorker};
use treeline::{codec, logging, patch, scan, worker};

const WINDOW_ROWS: usize = 20;
const UPDATE_CHANNEL_CAPACITY: usize = 64;

fn main() {
    let Some(root) = env::args().nth(1) else {
        eprintln!("usage: treeline <root-dir>");
        std::process::exit(2);
    };

    let _logging = logging::init(None);

    if let Err(err) = run(&root) {
        tracing::error!(error = %err, "fatal");
        eprintln!("treeline: {err}");
        std::process::exit(1);
    }
}

fn run(root: &str) -> Result<(), Box<dyn std::error::Error>> {
    // Initial index, round-tripped through the worker the way a snapshot
    // arrives from an external scanner process.
    let snapshot = scan::scan_project(root);
    let bytes = codec::encode(&snapshot.tree, &snapshot.images);
    tracing::info!(
        bytes = bytes.len(),
        top_level = snapshot.tree.len(),
        images = snapshot.images.len(),
        "initial scan encoded"
    );

    let tree_worker = worker::spawn();
    let mut gate = ResponseGate::default();

    tree_worker.handle().request_decode(bytes);
    let Some(TreeResponse::Decoded { snapshot, .. }) = tree_worker.recv() else {
        return Err("tree worker went away during decode".into());
    };
    let mut tree = snapshot.tree;

    // Expand the top level so the sample window shows something nested.
    let expanded: ExpansionState = tree
        .iter()
        .filter(|node| node.is_folder)
        .map(|node| node.path.clone())
        .collect();

    log_window(&tree_worker, &mut gate, &tree, &expanded);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let (source, burst_rx) = WatchSource::new(Path::new(root))?;
    let watch_root = source.root().to_string();
    let _source_thread = source.spawn();

    let (update_tx, mut update_rx) = tokio::sync::mpsc::channel(UPDATE_CHANNEL_CAPACITY);
    let batcher = WatchBatcher::new(watch_root, FsScanner::new(), update_tx);
    runtime.spawn(batcher.run(burst_rx));

    tracing::info!(root = %root, "watching for changes");
    runtime.block_on(async {
        while let Some(update) = update_rx.recv().await {
            tree = apply_update(&tree, update);
            log_window(&tree_worker, &mut gate, &tree, &expanded);
        }
    });

    Ok(())
}

fn apply_update(tree: &[Arc<FileEntry>], update: TreeUpdate) -> Vec<Arc<FileEntry>> {
    match update {
        TreeUpdate::Patch(file_patch) => patch::apply_file_patch(tree, &file_patch),
        TreeUpdate::Listing { dir, children } => patch::merge_children_at(tree, &dir, &children),
        TreeUpdate::RootListing { children } => patch::merge_trees(tree, &children),
    }
}

/// Asks the worker for the visible count and the top window, then logs
/// whatever the sequence gate admits.
fn log_window(
    tree_worker: &TreeWorker,
    gate: &mut ResponseGate,
    tree: &[Arc<FileEntry>],
    expanded: &ExpansionState,
) {
    let handle = tree_worker.handle();
    handle.request_count(tree.to_vec(), expanded.clone(), None);
    handle.request_window(tree.to_vec(), expanded.clone(), 0, WINDOW_ROWS, None);

    for _ in 0..2 {
        let Some(response) = tree_worker.recv() else {
            return;
        };
        if !gate.admit(&response) {
            continue;
        }
        match response {
            TreeResponse::Count { count, .. } => tracing::info!(count, "visible rows"),
            TreeResponse::Window { items, .. } => {
                for row in &items {
                    tracing::info!(
                        index = row.global_index,
                        level = row.level,
                        name = %row.entry.name,
                        folder = row.entry.is_folder,
                        "row"
                    );
                }
            }
            TreeResponse::Decoded { .. } => {}
        }
    }
}
