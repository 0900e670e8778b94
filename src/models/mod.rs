//! Data model layer

pub mod tree;

pub use tree::{
    normalize_path, parent_dir, sort_siblings, ExpansionState, FileEntry, FilePatch, FlatEntry,
};
