//! Worker query protocol
//!
//! Every request carries a sequence number allocated per query class by the
//! client handle. The consumer side keeps the newest applied sequence per
//! class and discards anything older, so a slow superseded query can never
//! overwrite a newer result.

use crate::codec::Snapshot;
use crate::models::{ExpansionState, FileEntry, FlatEntry};
use std::sync::Arc;

#[derive(Debug)]
pub enum TreeRequest {
    /// Decode a binary snapshot buffer.
    Decode { seq: u64, bytes: Vec<u8> },
    /// Count the visible rows of `tree` under `expanded`, optionally under
    /// a search query (which overrides `expanded` with forced expansion).
    Count {
        seq: u64,
        tree: Vec<Arc<FileEntry>>,
        expanded: ExpansionState,
        query: Option<String>,
    },
    /// Materialize the visible rows in `[start, end)`.
    Window {
        seq: u64,
        tree: Vec<Arc<FileEntry>>,
        expanded: ExpansionState,
        start: usize,
        end: usize,
        query: Option<String>,
    },
}

impl TreeRequest {
    pub fn class(&self) -> QueryClass {
        match self {
            TreeRequest::Decode { .. } => QueryClass::Decode,
            TreeRequest::Count { .. } => QueryClass::Count,
            TreeRequest::Window { .. } => QueryClass::Window,
        }
    }
}

#[derive(Debug)]
pub enum TreeResponse {
    Decoded { seq: u64, snapshot: Snapshot },
    Count { seq: u64, count: usize },
    Window { seq: u64, items: Vec<FlatEntry> },
}

impl TreeResponse {
    pub fn class(&self) -> QueryClass {
        match self {
            TreeResponse::Decoded { .. } => QueryClass::Decode,
            TreeResponse::Count { .. } => QueryClass::Count,
            TreeResponse::Window { .. } => QueryClass::Window,
        }
    }

    pub fn seq(&self) -> u64 {
        match self {
            TreeResponse::Decoded { seq, .. }
            | TreeResponse::Count { seq, .. }
            | TreeResponse::Window { seq, .. } => *seq,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryClass {
    Decode,
    Count,
    Window,
}

/// Tracks the newest sequence number applied per query class and rejects
/// anything staler.
#[derive(Debug, Default)]
pub struct ResponseGate {
    last_decode: Option<u64>,
    last_count: Option<u64>,
    last_window: Option<u64>,
}

impl ResponseGate {
    pub fn admit(&mut self, response: &TreeResponse) -> bool {
        let slot = match response.class() {
            QueryClass::Decode => &mut self.last_decode,
            QueryClass::Count => &mut self.last_count,
            QueryClass::Window => &mut self.last_window,
        };
        let seq = response.seq();
        if slot.is_some_and(|last| seq <= last) {
            return false;
        }
        *slot = Some(seq);
        true
    }
}
