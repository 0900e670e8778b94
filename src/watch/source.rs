//! Raw filesystem watcher adapter
//!
//! Wraps the platform watcher and turns its event stream into
//! [`WatchBurst`]s on a channel the batcher consumes. No coalescing happens
//! here; one raw event becomes at most one burst.

use super::WatchBurst;
use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;

const WATCHER_POLL_INTERVAL: Duration = Duration::from_millis(250);
const BURST_CHANNEL_CAPACITY: usize = 64;

pub struct WatchSource {
    watcher: RecommendedWatcher,
    raw_event_rx: std_mpsc::Receiver<notify::Event>,
    root: String,
    burst_tx: mpsc::Sender<WatchBurst>,
}

impl WatchSource {
    /// Starts watching `root` recursively. Returns the source and the burst
    /// receiver to hand to a batcher.
    pub fn new(root: &Path) -> Result<(Self, mpsc::Receiver<WatchBurst>), notify::Error> {
        let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        let (raw_tx, raw_event_rx) = std_mpsc::channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| {
                let Ok(event) = res else { return };
                let _ = raw_tx.send(event);
            },
            Config::default().with_poll_interval(WATCHER_POLL_INTERVAL),
        )?;
        watcher.watch(&root, RecursiveMode::Recursive)?;

        let (burst_tx, burst_rx) = mpsc::channel(BURST_CHANNEL_CAPACITY);
        Ok((
            Self {
                watcher,
                raw_event_rx,
                root: root.to_string_lossy().into_owned(),
                burst_tx,
            },
            burst_rx,
        ))
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Forwards raw watcher events as bursts until the watcher callback or
    /// the burst consumer goes away. Blocking; run it on its own thread.
    pub fn forward(self) {
        let _watcher_guard = &self.watcher;
        while let Ok(event) = self.raw_event_rx.recv() {
            let Some(burst) = burst_from_event(&self.root, event) else {
                continue;
            };
            if self.burst_tx.blocking_send(burst).is_err() {
                break;
            }
        }
        tracing::debug!(root = %self.root, "watch source loop exited");
    }

    pub fn spawn(self) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name("watch-source".to_string())
            .spawn(move || self.forward())
            .expect("spawn watch source thread")
    }
}

/// Creation, modification and removal are the only kinds the tree cares
/// about. A backend-requested rescan (and a relevant event that names no
/// paths) degrades to a full-root burst.
fn burst_from_event(root: &str, event: notify::Event) -> Option<WatchBurst> {
    if event.need_rescan() {
        return Some(WatchBurst {
            root: root.to_string(),
            changed_paths: Vec::new(),
        });
    }

    if !matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) {
        return None;
    }

    let changed_paths: Vec<String> = event
        .paths
        .iter()
        .map(|path| path.to_string_lossy().into_owned())
        .collect();
    Some(WatchBurst {
        root: root.to_string(),
        changed_paths,
    })
}
