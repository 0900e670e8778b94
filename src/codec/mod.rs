//! Binary snapshot codec
//!
//! Wire layout (little-endian), as emitted by the scanner:
//! `[count:u32][count x Node]` for the tree section, immediately followed by
//! `[count:u32][count x Node]` for the image list. A `Node` is
//! `[is_folder:u8][name_len:u32][path_len:u32][child_count:u32][name][path]`,
//! followed by `child_count` nested nodes iff `is_folder` is set. Length
//! fields are trusted; there is no delimiter or checksum.

use crate::models::FileEntry;
use std::fmt;
use std::sync::Arc;

/// Placeholder used when a node's name bytes are missing or unreadable.
const PLACEHOLDER_NAME: &str = "unknown";

/// A decoded snapshot: the directory tree and the parallel image-file list.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub tree: Vec<Arc<FileEntry>>,
    pub images: Vec<Arc<FileEntry>>,
}

#[derive(Debug)]
pub enum DecodeError {
    /// The buffer ended before the declared structure did. A benign short
    /// read from a streaming producer looks like this.
    Truncated { offset: usize, needed: usize },
    /// A name or path field held invalid UTF-8: the producer violated the
    /// format invariant, not a transport hiccup.
    InvalidUtf8 { offset: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated { offset, needed } => {
                write!(f, "snapshot truncated at offset {offset}: {needed} more bytes needed")
            }
            DecodeError::InvalidUtf8 { offset } => {
                write!(f, "invalid utf-8 in snapshot at offset {offset}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

struct Cursor<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.offset.checked_add(len).ok_or(DecodeError::Truncated {
            offset: self.offset,
            needed: len,
        })?;
        if end > self.buf.len() {
            return Err(DecodeError::Truncated {
                offset: self.offset,
                needed: end - self.buf.len(),
            });
        }
        let slice = &self.buf[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_str(&mut self, len: usize) -> Result<&'a str, DecodeError> {
        let start = self.offset;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8 { offset: start })
    }
}

/// Decodes a snapshot buffer, tolerating malformed input.
///
/// Truncated or corrupt data never fails: a missing name becomes
/// `"unknown"`, a missing path becomes `"error-{offset}"`, and whatever was
/// decoded so far is returned. The scanner favors always rendering
/// something over rejecting a partial read; callers that need to tell a
/// short read from a corrupt buffer use [`decode_strict`].
pub fn decode(buf: &[u8]) -> Snapshot {
    match decode_strict(buf) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            tracing::warn!(error = %err, len = buf.len(), "malformed snapshot, decoding leniently");
            decode_lenient(buf)
        }
    }
}

/// Decodes a snapshot buffer, failing on the first malformation.
pub fn decode_strict(buf: &[u8]) -> Result<Snapshot, DecodeError> {
    let mut cursor = Cursor::new(buf);
    let tree = decode_section(&mut cursor)?;
    let images = decode_section(&mut cursor)?;
    Ok(Snapshot { tree, images })
}

fn decode_section(cursor: &mut Cursor<'_>) -> Result<Vec<Arc<FileEntry>>, DecodeError> {
    let count = cursor.read_u32()?;
    let mut nodes = Vec::with_capacity(count.min(4096) as usize);
    for _ in 0..count {
        nodes.push(Arc::new(decode_node(cursor)?));
    }
    Ok(nodes)
}

fn decode_node(cursor: &mut Cursor<'_>) -> Result<FileEntry, DecodeError> {
    let is_folder = cursor.read_u8()? == 1;
    let name_len = cursor.read_u32()? as usize;
    let path_len = cursor.read_u32()? as usize;
    let child_count = cursor.read_u32()?;

    let name = cursor.read_str(name_len)?;
    let path = cursor.read_str(path_len)?;

    let children = if is_folder {
        let mut children = Vec::with_capacity(child_count.min(4096) as usize);
        for _ in 0..child_count {
            children.push(Arc::new(decode_node(cursor)?));
        }
        Some(children)
    } else {
        None
    };

    Ok(FileEntry {
        name: if name.is_empty() { PLACEHOLDER_NAME.into() } else { name.into() },
        path: if path.is_empty() {
            format!("error-{}", cursor.offset)
        } else {
            path.to_string()
        },
        is_folder,
        children,
    })
}

fn decode_lenient(buf: &[u8]) -> Snapshot {
    let mut cursor = Cursor::new(buf);
    let tree = decode_section_lenient(&mut cursor);
    let images = decode_section_lenient(&mut cursor);
    Snapshot { tree, images }
}

fn decode_section_lenient(cursor: &mut Cursor<'_>) -> Vec<Arc<FileEntry>> {
    let Ok(count) = cursor.read_u32() else {
        return Vec::new();
    };
    let mut nodes = Vec::with_capacity(count.min(4096) as usize);
    for _ in 0..count {
        match decode_node_lenient(cursor) {
            Some(node) => nodes.push(Arc::new(node)),
            None => break,
        }
    }
    nodes
}

fn decode_node_lenient(cursor: &mut Cursor<'_>) -> Option<FileEntry> {
    let is_folder = cursor.read_u8().ok()? == 1;
    let name_len = cursor.read_u32().ok()? as usize;
    let path_len = cursor.read_u32().ok()? as usize;
    let child_count = cursor.read_u32().ok()?;

    let name = read_str_lenient(cursor, name_len);
    let path = read_str_lenient(cursor, path_len);

    let children = if is_folder {
        let mut children = Vec::new();
        for _ in 0..child_count {
            match decode_node_lenient(cursor) {
                Some(child) => children.push(Arc::new(child)),
                None => break,
            }
        }
        Some(children)
    } else {
        None
    };

    Some(FileEntry {
        name: match name {
            Some(name) if !name.is_empty() => name.into(),
            _ => PLACEHOLDER_NAME.into(),
        },
        path: match path {
            Some(path) if !path.is_empty() => path,
            _ => format!("error-{}", cursor.offset),
        },
        is_folder,
        children,
    })
}

fn read_str_lenient(cursor: &mut Cursor<'_>, len: usize) -> Option<String> {
    let bytes = cursor.take(len).ok()?;
    Some(String::from_utf8_lossy(bytes).into_owned())
}

/// Encodes a tree and image list into the binary snapshot format.
pub fn encode(tree: &[Arc<FileEntry>], images: &[Arc<FileEntry>]) -> Vec<u8> {
    let mut buffer = Vec::with_capacity((tree.len() + images.len()) * 128);

    buffer.extend_from_slice(&(tree.len() as u32).to_le_bytes());
    for node in tree {
        encode_node(node, &mut buffer);
    }

    buffer.extend_from_slice(&(images.len() as u32).to_le_bytes());
    for node in images {
        encode_node(node, &mut buffer);
    }

    buffer
}

fn encode_node(node: &FileEntry, buffer: &mut Vec<u8>) {
    let name_bytes = node.name.as_bytes();
    let path_bytes = node.path.as_bytes();
    let children = node.children();

    buffer.push(u8::from(node.is_folder));
    buffer.extend_from_slice(&(name_bytes.len() as u32).to_le_bytes());
    buffer.extend_from_slice(&(path_bytes.len() as u32).to_le_bytes());
    buffer.extend_from_slice(&(children.len() as u32).to_le_bytes());
    buffer.extend_from_slice(name_bytes);
    buffer.extend_from_slice(path_bytes);

    if node.is_folder {
        for child in children {
            encode_node(child, buffer);
        }
    }
}
