//! Change-burst batching
//!
//! One `WatchBatcher` per watched root. Bursts of changed paths are
//! unioned into a pending set and processed either immediately (when the
//! root has not been refreshed for a while) or after a graduated delay, so
//! busier filesystems get coarser, less frequent processing. Processing
//! resolves the pending paths to their parent directories and refreshes
//! each one sequentially through the scanner port; a wide-spread change
//! cuts over to a single full-root rescan instead.

use super::{Scanner, WatchBurst};
use crate::models::{parent_dir, FileEntry, FilePatch};
use rustc_hash::FxHashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Tree updates emitted toward the orchestrating owner of the tree.
/// `Patch` is applied with `patch::apply_file_patch`; the listings are
/// folded in with `patch::merge_children_at`.
#[derive(Debug)]
pub enum TreeUpdate {
    Patch(FilePatch),
    Listing {
        dir: String,
        children: Vec<Arc<FileEntry>>,
    },
    RootListing {
        children: Vec<Arc<FileEntry>>,
    },
}

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Delay tier for small pending sets.
    pub base_delay: Duration,
    /// Delay tier once the pending set exceeds `busy_threshold` paths.
    pub busy_delay: Duration,
    /// Delay tier once the pending set exceeds `flood_threshold` paths.
    pub flood_delay: Duration,
    pub busy_threshold: usize,
    pub flood_threshold: usize,
    /// A burst is processed immediately when this much time has passed
    /// since the root's last processed refresh.
    pub immediate_after: Duration,
    /// Above this many distinct parent directories, per-directory diffing
    /// is abandoned in favor of one full-root rescan.
    pub max_patch_dirs: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(300),
            busy_delay: Duration::from_millis(800),
            flood_delay: Duration::from_millis(2000),
            busy_threshold: 100,
            flood_threshold: 1000,
            immediate_after: Duration::from_millis(2000),
            max_patch_dirs: 8,
        }
    }
}

/// Working state for one watched root: the accumulated changed paths not
/// yet processed, the last processed timestamp, and the per-directory
/// in-flight guard.
#[derive(Default)]
struct PendingChangeSet {
    pending: FxHashSet<String>,
    last_processed: Option<Instant>,
    in_flight: FxHashSet<String>,
}

struct BatcherInner<S> {
    root: String,
    config: BatcherConfig,
    scanner: S,
    update_tx: mpsc::Sender<TreeUpdate>,
    state: Mutex<PendingChangeSet>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

pub struct WatchBatcher<S> {
    inner: Arc<BatcherInner<S>>,
}

impl<S> Clone for WatchBatcher<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Scanner + Send + Sync + 'static> WatchBatcher<S> {
    pub fn new(root: impl Into<String>, scanner: S, update_tx: mpsc::Sender<TreeUpdate>) -> Self {
        Self::with_config(root, scanner, update_tx, BatcherConfig::default())
    }

    pub fn with_config(
        root: impl Into<String>,
        scanner: S,
        update_tx: mpsc::Sender<TreeUpdate>,
        config: BatcherConfig,
    ) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                root: root.into(),
                config,
                scanner,
                update_tx,
                state: Mutex::new(PendingChangeSet::default()),
                timer: Mutex::new(None),
            }),
        }
    }

    pub fn root(&self) -> &str {
        &self.inner.root
    }

    /// Drains a burst channel until the sender side closes. Bursts for a
    /// different root are ignored.
    pub async fn run(self, mut burst_rx: mpsc::Receiver<WatchBurst>) {
        while let Some(burst) = burst_rx.recv().await {
            if burst.root != self.inner.root {
                tracing::debug!(
                    root = %self.inner.root,
                    burst_root = %burst.root,
                    "ignoring burst for another root"
                );
                continue;
            }
            self.on_burst(burst.changed_paths);
        }
        self.cancel_timer();
    }

    /// Ingests one change-notification burst. Must be called inside a
    /// tokio runtime; processing runs on spawned tasks so ingestion never
    /// waits on the scanner.
    pub fn on_burst(&self, paths: Vec<String>) {
        if paths.is_empty() {
            // "Refresh everything": bypass batching entirely.
            self.cancel_timer();
            let batcher = self.clone();
            tokio::spawn(async move {
                batcher.full_refresh().await;
                let mut state = batcher.inner.state.lock().expect("batcher state lock");
                state.last_processed = Some(Instant::now());
            });
            return;
        }

        let (process_now, delay) = {
            let mut state = self.inner.state.lock().expect("batcher state lock");
            state.pending.extend(paths);

            let stale = state
                .last_processed
                .map_or(true, |t| t.elapsed() > self.inner.config.immediate_after);
            if stale {
                // Mark the refresh as started right away so bursts that
                // arrive while it is being dispatched take the delay path.
                state.last_processed = Some(Instant::now());
                (true, Duration::ZERO)
            } else {
                let pending = state.pending.len();
                let config = &self.inner.config;
                let delay = if pending > config.flood_threshold {
                    config.flood_delay
                } else if pending > config.busy_threshold {
                    config.busy_delay
                } else {
                    config.base_delay
                };
                (false, delay)
            }
        };

        if process_now {
            self.cancel_timer();
            let batcher = self.clone();
            tokio::spawn(async move {
                batcher.process_pending().await;
            });
        } else {
            self.arm_timer(delay);
        }
    }

    fn arm_timer(&self, delay: Duration) {
        let batcher = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            batcher.inner.timer.lock().expect("batcher timer lock").take();
            batcher.process_pending().await;
        });
        if let Some(previous) = self
            .inner
            .timer
            .lock()
            .expect("batcher timer lock")
            .replace(handle)
        {
            previous.abort();
        }
    }

    fn cancel_timer(&self) {
        if let Some(handle) = self.inner.timer.lock().expect("batcher timer lock").take() {
            handle.abort();
        }
    }

    /// Processes the pending set: resolves paths to parent directories and
    /// refreshes them sequentially, or cuts over to a full-root rescan
    /// when the change spread is too wide. The pending set and timestamp
    /// are reset only once the batch has been fully dispatched, so bursts
    /// arriving mid-dispatch see the true backlog size.
    async fn process_pending(&self) {
        let (snapshot, dirs) = {
            let state = self.inner.state.lock().expect("batcher state lock");
            if state.pending.is_empty() {
                return;
            }
            let snapshot: Vec<String> = state.pending.iter().cloned().collect();
            let dirs: FxHashSet<String> = snapshot
                .iter()
                .map(|path| parent_dir(path, &self.inner.root))
                .collect();
            (snapshot, dirs)
        };

        if dirs.len() > self.inner.config.max_patch_dirs {
            tracing::info!(
                root = %self.inner.root,
                dirs = dirs.len(),
                "change spread too wide, falling back to full-root refresh"
            );
            self.full_refresh().await;
        } else {
            // Sequential on purpose: parallel refreshes would contend on
            // the scanner's index lock.
            let mut ordered: Vec<String> = dirs.into_iter().collect();
            ordered.sort_unstable();
            for dir in ordered {
                self.refresh_dir(&dir).await;
            }
        }

        let mut state = self.inner.state.lock().expect("batcher state lock");
        for path in &snapshot {
            state.pending.remove(path);
        }
        state.last_processed = Some(Instant::now());
    }

    async fn refresh_dir(&self, dir: &str) {
        if !self.claim(dir) {
            tracing::debug!(dir, "refresh already in flight, skipping");
            return;
        }

        match self.inner.scanner.sync_dir(dir).await {
            Ok(Some(patch)) if !patch.is_empty() => {
                let _ = self.inner.update_tx.send(TreeUpdate::Patch(patch)).await;
            }
            Ok(_) => {
                // No diff available: fall back to a fresh child listing.
                match self.inner.scanner.list_dir(dir).await {
                    Ok(children) => {
                        let _ = self
                            .inner
                            .update_tx
                            .send(TreeUpdate::Listing {
                                dir: dir.to_string(),
                                children,
                            })
                            .await;
                    }
                    Err(err) => {
                        tracing::warn!(dir, error = %err, "directory listing failed");
                    }
                }
            }
            Err(err) => {
                tracing::warn!(dir, error = %err, "directory sync failed");
            }
        }

        self.release(dir);
    }

    async fn full_refresh(&self) {
        let root = self.inner.root.clone();
        if !self.claim(&root) {
            tracing::debug!(root = %root, "full refresh already in flight, skipping");
            return;
        }

        match self.inner.scanner.scan_root(&root).await {
            Ok(children) => {
                let _ = self
                    .inner
                    .update_tx
                    .send(TreeUpdate::RootListing { children })
                    .await;
            }
            Err(err) => {
                tracing::warn!(root = %root, error = %err, "full-root refresh failed");
            }
        }

        self.release(&root);
    }

    fn claim(&self, dir: &str) -> bool {
        self.inner
            .state
            .lock()
            .expect("batcher state lock")
            .in_flight
            .insert(dir.to_string())
    }

    fn release(&self, dir: &str) {
        self.inner
            .state
            .lock()
            .expect("batcher state lock")
            .in_flight
            .remove(dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::{BoxFuture, ScanResult};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Records every port call; `sync_dir` answers from a canned patch
    /// table, `scan_root` can be slowed down to simulate a busy backend.
    #[derive(Default)]
    struct MockScanner {
        sync_calls: StdMutex<Vec<String>>,
        list_calls: StdMutex<Vec<String>>,
        root_calls: AtomicUsize,
        patches: StdMutex<Vec<FilePatch>>,
        root_delay: Option<Duration>,
    }

    impl MockScanner {
        fn with_patch(patch: FilePatch) -> Self {
            Self {
                patches: StdMutex::new(vec![patch]),
                ..Self::default()
            }
        }
    }

    impl Scanner for Arc<MockScanner> {
        fn sync_dir<'a>(&'a self, dir: &'a str) -> BoxFuture<'a, ScanResult<Option<FilePatch>>> {
            Box::pin(async move {
                self.sync_calls.lock().unwrap().push(dir.to_string());
                let patch = self
                    .patches
                    .lock()
                    .unwrap()
                    .iter()
                    .find(|p| p.parent_path == dir)
                    .cloned();
                Ok(patch)
            })
        }

        fn list_dir<'a>(&'a self, dir: &'a str) -> BoxFuture<'a, ScanResult<Vec<Arc<FileEntry>>>> {
            Box::pin(async move {
                self.list_calls.lock().unwrap().push(dir.to_string());
                Ok(vec![Arc::new(FileEntry::file("listed.ts", format!("{dir}/listed.ts")))])
            })
        }

        fn scan_root<'a>(&'a self, _root: &'a str) -> BoxFuture<'a, ScanResult<Vec<Arc<FileEntry>>>> {
            Box::pin(async move {
                if let Some(delay) = self.root_delay {
                    tokio::time::sleep(delay).await;
                }
                self.root_calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![Arc::new(FileEntry::file("root.ts", "/p/root.ts"))])
            })
        }
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("build runtime")
    }

    fn fast_config() -> BatcherConfig {
        BatcherConfig {
            base_delay: Duration::from_millis(10),
            busy_delay: Duration::from_millis(30),
            flood_delay: Duration::from_millis(60),
            busy_threshold: 100,
            flood_threshold: 1000,
            immediate_after: Duration::from_millis(50),
            max_patch_dirs: 8,
        }
    }

    #[test]
    fn wide_spread_burst_issues_one_full_root_refresh() {
        let rt = runtime();
        rt.block_on(async {
            let scanner = Arc::new(MockScanner::default());
            let (tx, mut rx) = mpsc::channel(16);
            let batcher = WatchBatcher::with_config("/p", scanner.clone(), tx, fast_config());

            // 9 distinct parent directories: above the 8-dir cutover.
            let paths: Vec<String> = (0..9).map(|i| format!("/p/dir{i}/file.ts")).collect();
            batcher.on_burst(paths);

            let update = rx.recv().await.expect("one update");
            assert!(matches!(update, TreeUpdate::RootListing { .. }));
            assert_eq!(scanner.root_calls.load(Ordering::SeqCst), 1);
            assert!(scanner.sync_calls.lock().unwrap().is_empty(), "no per-dir calls");
        });
    }

    #[test]
    fn narrow_burst_refreshes_each_directory_sequentially() {
        let rt = runtime();
        rt.block_on(async {
            let scanner = Arc::new(MockScanner::default());
            let (tx, mut rx) = mpsc::channel(16);
            let batcher = WatchBatcher::with_config("/p", scanner.clone(), tx, fast_config());

            batcher.on_burst(vec![
                "/p/a/x.ts".to_string(),
                "/p/a/y.ts".to_string(),
                "/p/b/z.ts".to_string(),
            ]);

            let mut listed = Vec::new();
            for _ in 0..2 {
                match rx.recv().await.expect("update") {
                    TreeUpdate::Listing { dir, .. } => listed.push(dir),
                    other => panic!("unexpected update {other:?}"),
                }
            }
            listed.sort();
            assert_eq!(listed, vec!["/p/a", "/p/b"]);
            assert_eq!(scanner.root_calls.load(Ordering::SeqCst), 0);
            // sync_dir tried first for both, in deterministic order
            assert_eq!(*scanner.sync_calls.lock().unwrap(), vec!["/p/a", "/p/b"]);
        });
    }

    #[test]
    fn patch_from_scanner_is_forwarded_instead_of_listing() {
        let rt = runtime();
        rt.block_on(async {
            let patch = FilePatch {
                parent_path: "/p/a".to_string(),
                added: vec![Arc::new(FileEntry::file("new.ts", "/p/a/new.ts"))],
                removed: vec![],
            };
            let scanner = Arc::new(MockScanner::with_patch(patch));
            let (tx, mut rx) = mpsc::channel(16);
            let batcher = WatchBatcher::with_config("/p", scanner.clone(), tx, fast_config());

            batcher.on_burst(vec!["/p/a/new.ts".to_string()]);

            match rx.recv().await.expect("update") {
                TreeUpdate::Patch(patch) => assert_eq!(patch.parent_path, "/p/a"),
                other => panic!("unexpected update {other:?}"),
            }
            assert!(scanner.list_calls.lock().unwrap().is_empty());
        });
    }

    #[test]
    fn empty_burst_bypasses_batching_with_full_refresh() {
        let rt = runtime();
        rt.block_on(async {
            let scanner = Arc::new(MockScanner::default());
            let (tx, mut rx) = mpsc::channel(16);
            let batcher = WatchBatcher::with_config("/p", scanner.clone(), tx, fast_config());

            batcher.on_burst(Vec::new());

            let update = rx.recv().await.expect("update");
            assert!(matches!(update, TreeUpdate::RootListing { .. }));
        });
    }

    #[test]
    fn first_burst_processes_immediately_then_bursts_coalesce_at_flood_tier() {
        let rt = runtime();
        rt.block_on(async {
            let scanner = Arc::new(MockScanner {
                // Slow rescan so follow-up bursts arrive mid-dispatch.
                root_delay: Some(Duration::from_millis(40)),
                ..MockScanner::default()
            });
            let (tx, mut rx) = mpsc::channel(16);
            let batcher = WatchBatcher::with_config("/p", scanner.clone(), tx, fast_config());

            // 5000 paths across many directories; the last refresh is
            // long past, so this is processed immediately.
            let flood: Vec<String> = (0..5000).map(|i| format!("/p/d{}/f{i}.ts", i % 20)).collect();
            batcher.on_burst(flood);
            tokio::time::sleep(Duration::from_millis(10)).await;

            // Two follow-up bursts while the rescan is still in flight:
            // the pending set is still above the flood threshold, so both
            // coalesce into a single delayed batch.
            let second: Vec<String> = (0..50).map(|i| format!("/p/late/s{i}.ts")).collect();
            batcher.on_burst(second);
            let third: Vec<String> = (0..10).map(|i| format!("/p/late/t{i}.ts")).collect();
            batcher.on_burst(third);

            let first = rx.recv().await.expect("immediate full refresh");
            assert!(matches!(first, TreeUpdate::RootListing { .. }));

            let followup = rx.recv().await.expect("coalesced delayed batch");
            match followup {
                TreeUpdate::Listing { dir, .. } => assert_eq!(dir, "/p/late"),
                other => panic!("unexpected update {other:?}"),
            }
            assert_eq!(
                scanner.root_calls.load(Ordering::SeqCst),
                1,
                "only the first burst triggered a full refresh"
            );
            assert_eq!(*scanner.sync_calls.lock().unwrap(), vec!["/p/late"]);
        });
    }

    #[test]
    fn rearmed_timer_fires_once_for_coalesced_bursts() {
        let rt = runtime();
        rt.block_on(async {
            let scanner = Arc::new(MockScanner::default());
            let (tx, mut rx) = mpsc::channel(16);
            let batcher = WatchBatcher::with_config("/p", scanner.clone(), tx, fast_config());

            // Prime the timestamp so following bursts take the delay path.
            batcher.on_burst(vec!["/p/a/seed.ts".to_string()]);
            let _ = rx.recv().await.expect("seed refresh");

            batcher.on_burst(vec!["/p/b/one.ts".to_string()]);
            batcher.on_burst(vec!["/p/b/two.ts".to_string()]);

            match rx.recv().await.expect("delayed batch") {
                TreeUpdate::Listing { dir, .. } => assert_eq!(dir, "/p/b"),
                other => panic!("unexpected update {other:?}"),
            }
            // Both paths were in one batch; exactly one /p/b refresh ran.
            let sync_calls = scanner.sync_calls.lock().unwrap();
            assert_eq!(sync_calls.iter().filter(|d| d.as_str() == "/p/b").count(), 1);
        });
    }

    #[test]
    fn in_flight_guard_suppresses_duplicate_refresh() {
        let rt = runtime();
        rt.block_on(async {
            let scanner = Arc::new(MockScanner::default());
            let (tx, _rx) = mpsc::channel(16);
            let batcher =
                WatchBatcher::with_config("/p", scanner.clone(), tx, fast_config());

            // Simulate an outstanding refresh for /p/a.
            assert!(batcher.claim("/p/a"));
            batcher.refresh_dir("/p/a").await;
            assert!(
                scanner.sync_calls.lock().unwrap().is_empty(),
                "guarded directory must not be refreshed again"
            );

            batcher.release("/p/a");
            batcher.refresh_dir("/p/a").await;
            assert_eq!(*scanner.sync_calls.lock().unwrap(), vec!["/p/a"]);
        });
    }

    #[test]
    fn run_loop_ignores_bursts_for_other_roots() {
        let rt = runtime();
        rt.block_on(async {
            let scanner = Arc::new(MockScanner::default());
            let (update_tx, mut update_rx) = mpsc::channel(16);
            let batcher =
                WatchBatcher::with_config("/p", scanner.clone(), update_tx, fast_config());

            let (burst_tx, burst_rx) = mpsc::channel(16);
            let loop_task = tokio::spawn(batcher.run(burst_rx));

            burst_tx
                .send(WatchBurst {
                    root: "/other".to_string(),
                    changed_paths: vec!["/other/a.ts".to_string()],
                })
                .await
                .expect("send");
            burst_tx
                .send(WatchBurst {
                    root: "/p".to_string(),
                    changed_paths: vec!["/p/a/x.ts".to_string()],
                })
                .await
                .expect("send");
            drop(burst_tx);

            match update_rx.recv().await.expect("update") {
                TreeUpdate::Listing { dir, .. } => assert_eq!(dir, "/p/a"),
                other => panic!("unexpected update {other:?}"),
            }
            loop_task.await.expect("run loop ends when channel closes");
            assert!(scanner.sync_calls.lock().unwrap().iter().all(|d| d.starts_with("/p")));
        });
    }
}
