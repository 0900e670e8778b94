//! treeline - file tree synchronization and virtualization engine
//!
//! Module map:
//! - models: tree data model (FileEntry, FilePatch, path helpers)
//! - codec: binary snapshot decoder/encoder
//! - patch: incremental tree reconciliation
//! - view: windowed virtualization index and search filter
//! - worker: background thread hosting codec + view queries
//! - watch: change-burst batching and the notify event source
//! - scan: bounded disk scanner and the scanner port implementation

pub mod codec;
pub mod logging;
pub mod models;
pub mod patch;
pub mod scan;
pub mod view;
pub mod watch;
pub mod worker;
