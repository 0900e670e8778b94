//! Background tree worker
//!
//! Hosts the codec and the virtualization index on a dedicated thread so
//! decoding and windowing a large tree never block the interactive thread.
//! Requests and responses travel over plain channels; both operations are
//! pure functions of their payload, so overlapping outstanding requests are
//! safe. Tree payloads share structure through `Arc`, making the send cheap.

mod message;

pub use message::{QueryClass, ResponseGate, TreeRequest, TreeResponse};

use crate::models::{ExpansionState, FileEntry, FlatEntry};
use crate::{codec, view};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::{mpsc, Arc};
use std::thread;

/// Client side of the worker channel. Cloneable; sequence counters are
/// shared so every clone allocates from the same monotonic stream.
#[derive(Clone)]
pub struct TreeWorkerHandle {
    tx: Sender<TreeRequest>,
    decode_seq: Arc<AtomicU64>,
    count_seq: Arc<AtomicU64>,
    window_seq: Arc<AtomicU64>,
}

pub struct TreeWorker {
    handle: TreeWorkerHandle,
    response_rx: Receiver<TreeResponse>,
    join: Option<thread::JoinHandle<()>>,
}

pub fn spawn() -> TreeWorker {
    let (request_tx, request_rx) = mpsc::channel::<TreeRequest>();
    let (response_tx, response_rx) = mpsc::channel::<TreeResponse>();

    let join = thread::Builder::new()
        .name("tree-worker".to_string())
        .spawn(move || worker_loop(request_rx, response_tx))
        .expect("spawn tree worker thread");

    TreeWorker {
        handle: TreeWorkerHandle {
            tx: request_tx,
            decode_seq: Arc::new(AtomicU64::new(0)),
            count_seq: Arc::new(AtomicU64::new(0)),
            window_seq: Arc::new(AtomicU64::new(0)),
        },
        response_rx,
        join: Some(join),
    }
}

impl TreeWorker {
    pub fn handle(&self) -> TreeWorkerHandle {
        self.handle.clone()
    }

    pub fn try_recv(&self) -> Result<TreeResponse, TryRecvError> {
        self.response_rx.try_recv()
    }

    /// Blocking receive, used by callers that own a drain loop.
    pub fn recv(&self) -> Option<TreeResponse> {
        self.response_rx.recv().ok()
    }
}

impl Drop for TreeWorker {
    fn drop(&mut self) {
        // Closing the request channel ends the worker loop.
        drop(std::mem::replace(&mut self.handle.tx, mpsc::channel().0));
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl TreeWorkerHandle {
    /// Queues a snapshot decode; returns the request's sequence number.
    pub fn request_decode(&self, bytes: Vec<u8>) -> u64 {
        let seq = self.decode_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let _ = self.tx.send(TreeRequest::Decode { seq, bytes });
        seq
    }

    pub fn request_count(
        &self,
        tree: Vec<Arc<FileEntry>>,
        expanded: ExpansionState,
        query: Option<String>,
    ) -> u64 {
        let seq = self.count_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let _ = self.tx.send(TreeRequest::Count {
            seq,
            tree,
            expanded,
            query,
        });
        seq
    }

    pub fn request_window(
        &self,
        tree: Vec<Arc<FileEntry>>,
        expanded: ExpansionState,
        start: usize,
        end: usize,
        query: Option<String>,
    ) -> u64 {
        let seq = self.window_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let _ = self.tx.send(TreeRequest::Window {
            seq,
            tree,
            expanded,
            start,
            end,
            query,
        });
        seq
    }
}

fn worker_loop(request_rx: Receiver<TreeRequest>, response_tx: Sender<TreeResponse>) {
    while let Ok(request) = request_rx.recv() {
        let response = handle_request(request);
        if response_tx.send(response).is_err() {
            break;
        }
    }
    tracing::debug!("tree worker loop exited");
}

fn handle_request(request: TreeRequest) -> TreeResponse {
    match request {
        TreeRequest::Decode { seq, bytes } => TreeResponse::Decoded {
            seq,
            snapshot: codec::decode(&bytes),
        },
        TreeRequest::Count {
            seq,
            tree,
            expanded,
            query,
        } => TreeResponse::Count {
            seq,
            count: count_with_query(&tree, &expanded, query.as_deref()),
        },
        TreeRequest::Window {
            seq,
            tree,
            expanded,
            start,
            end,
            query,
        } => TreeResponse::Window {
            seq,
            items: window_with_query(&tree, &expanded, start, end, query.as_deref()),
        },
    }
}

fn active_query(query: Option<&str>) -> Option<&str> {
    query.map(str::trim).filter(|q| !q.is_empty())
}

fn count_with_query(
    tree: &[Arc<FileEntry>],
    expanded: &ExpansionState,
    query: Option<&str>,
) -> usize {
    match active_query(query) {
        Some(query) => {
            let filtered = view::filter_tree(tree, query);
            view::count_expanded_nodes(&filtered.tree, &filtered.expanded)
        }
        None => view::count_expanded_nodes(tree, expanded),
    }
}

fn window_with_query(
    tree: &[Arc<FileEntry>],
    expanded: &ExpansionState,
    start: usize,
    end: usize,
    query: Option<&str>,
) -> Vec<FlatEntry> {
    match active_query(query) {
        Some(query) => {
            let filtered = view::filter_tree(tree, query);
            view::visible_window(&filtered.tree, &filtered.expanded, start, end)
        }
        None => view::visible_window(tree, expanded, start, end),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use rustc_hash::FxHashSet;

    fn sample_tree() -> Vec<Arc<FileEntry>> {
        vec![
            Arc::new(FileEntry::folder(
                "src",
                "/p/src",
                vec![Arc::new(FileEntry::file("a.ts", "/p/src/a.ts"))],
            )),
            Arc::new(FileEntry::file("b.ts", "/p/b.ts")),
        ]
    }

    #[test]
    fn worker_answers_decode_count_and_window() {
        let worker = spawn();
        let handle = worker.handle();
        let tree = sample_tree();

        let bytes = codec::encode(&tree, &[]);
        handle.request_decode(bytes);
        let expanded: ExpansionState =
            std::iter::once("/p/src".to_string()).collect::<FxHashSet<_>>();
        handle.request_count(tree.clone(), expanded.clone(), None);
        handle.request_window(tree.clone(), expanded, 0, 10, None);

        let mut decoded = None;
        let mut count = None;
        let mut window = None;
        for _ in 0..3 {
            match worker.recv().expect("worker alive") {
                TreeResponse::Decoded { snapshot, .. } => decoded = Some(snapshot),
                TreeResponse::Count { count: c, .. } => count = Some(c),
                TreeResponse::Window { items, .. } => window = Some(items),
            }
        }

        assert_eq!(decoded.expect("decoded").tree.len(), 2);
        assert_eq!(count.expect("count"), 3);
        let names: Vec<String> = window
            .expect("window")
            .iter()
            .map(|r| r.entry.name.to_string())
            .collect();
        assert_eq!(names, vec!["src", "a.ts", "b.ts"]);
    }

    #[test]
    fn search_query_overrides_collapsed_expansion_state() {
        let worker = spawn();
        let handle = worker.handle();

        // Nothing expanded, but the query must surface the nested match.
        handle.request_count(sample_tree(), ExpansionState::default(), Some("a.ts".into()));
        match worker.recv().expect("worker alive") {
            TreeResponse::Count { count, .. } => assert_eq!(count, 2),
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn blank_query_is_not_a_search() {
        let worker = spawn();
        let handle = worker.handle();

        handle.request_count(sample_tree(), ExpansionState::default(), Some("  ".into()));
        match worker.recv().expect("worker alive") {
            TreeResponse::Count { count, .. } => assert_eq!(count, 2),
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn sequence_numbers_increase_per_class() {
        let worker = spawn();
        let handle = worker.handle();
        let first = handle.request_count(sample_tree(), ExpansionState::default(), None);
        let second = handle.request_count(sample_tree(), ExpansionState::default(), None);
        let other_class = handle.request_window(
            sample_tree(),
            ExpansionState::default(),
            0,
            1,
            None,
        );
        assert!(second > first);
        assert_eq!(other_class, 1, "classes allocate independently");
    }

    #[test]
    fn gate_drops_response_of_superseded_window_query() {
        let worker = spawn();
        let handle = worker.handle();
        let tree = sample_tree();

        let stale = handle.request_window(tree.clone(), ExpansionState::default(), 0, 1, None);
        let fresh = handle.request_window(tree, ExpansionState::default(), 0, 2, None);

        let mut gate = ResponseGate::default();
        // Apply the fresh response first, as if the stale one was slow.
        let mut responses = Vec::new();
        for _ in 0..2 {
            responses.push(worker.recv().expect("worker alive"));
        }
        responses.sort_by_key(|r| std::cmp::Reverse(r.seq()));

        assert_eq!(responses[0].seq(), fresh);
        assert!(gate.admit(&responses[0]));
        assert_eq!(responses[1].seq(), stale);
        assert!(!gate.admit(&responses[1]), "stale window response must be dropped");
    }
}
