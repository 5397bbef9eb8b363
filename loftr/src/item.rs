//! The item record: one filesystem entry inside an archive.
//!
//! Items are msgpack maps with a stable field order, concatenated into the
//! item stream which is itself chunked and stored. The encoding is
//! self-delimiting so [`ItemDecoder`] can recover item by item from a byte
//! stream without any outer framing, and resynchronize after damage.

use std::collections::BTreeMap;

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::{ChunkId, Error};

/// One reference to a file content chunk: `(id, size, csize)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef(pub ChunkId, pub u32, pub u32);

impl ChunkRef {
    pub fn id(&self) -> &ChunkId {
        &self.0
    }
    pub fn size(&self) -> u32 {
        self.1
    }
    pub fn csize(&self) -> u32 {
        self.2
    }
}

/// A single filesystem entry. Which of the optional fields are meaningful is
/// selected by the file type bits of `mode`: regular files carry `chunks`
/// (or `source` naming an earlier item they hardlink to), symlinks carry
/// their target in `source`, devices carry `rdev`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub path: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Nanoseconds since the epoch.
    pub mtime: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rdev: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<ChunkRef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xattrs: Option<BTreeMap<ByteBuf, ByteBuf>>,
}

pub(crate) const S_IFMT: u32 = 0o170_000;
pub(crate) const S_IFSOCK: u32 = 0o140_000;
pub(crate) const S_IFLNK: u32 = 0o120_000;
pub(crate) const S_IFREG: u32 = 0o100_000;
pub(crate) const S_IFBLK: u32 = 0o060_000;
pub(crate) const S_IFDIR: u32 = 0o040_000;
pub(crate) const S_IFCHR: u32 = 0o020_000;
pub(crate) const S_IFIFO: u32 = 0o010_000;

impl Item {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }
    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }
    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }
    pub fn is_fifo(&self) -> bool {
        self.mode & S_IFMT == S_IFIFO
    }
    pub fn is_device(&self) -> bool {
        matches!(self.mode & S_IFMT, S_IFCHR | S_IFBLK)
    }

    /// Pack the item for the item stream.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(rmp_serde::to_vec_named(self)?)
    }
}

/// Streaming decoder over the concatenated item stream.
///
/// Fed one decrypted chunk at a time; yields items as soon as they are
/// complete, holding back a partial record until more data arrives.
#[derive(Default)]
pub struct ItemDecoder {
    buf: BytesMut,
}

impl ItemDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Decode the next complete item, or None if more data is needed.
    pub fn next(&mut self) -> Result<Option<Item>, Error> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let (result, consumed) = {
            let mut cursor = std::io::Cursor::new(&self.buf[..]);
            let result = Item::deserialize(&mut rmp_serde::Deserializer::new(&mut cursor));
            (result, cursor.position() as usize)
        };
        match result {
            Ok(item) => {
                self.buf.advance(consumed);
                Ok(Some(item))
            }
            Err(e) if is_unexpected_eof(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn is_unexpected_eof(e: &rmp_serde::decode::Error) -> bool {
    match e {
        rmp_serde::decode::Error::InvalidMarkerRead(io)
        | rmp_serde::decode::Error::InvalidDataRead(io) => {
            io.kind() == std::io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

/// Find the first offset in `data` at which an item record starts.
///
/// Used after metadata damage, where the stream may re-enter mid record.
/// The candidate must look like a msgpack map whose first key is `path` and
/// must decode as an item; a decode that merely runs out of data is accepted
/// since the record may complete in the following chunk.
pub(crate) fn resync_offset(data: &[u8]) -> Option<usize> {
    const PATH_KEY: &[u8] = b"\xa4path";
    for offset in 0..data.len() {
        let marker = data[offset];
        let key_at = match marker {
            0x80..=0x8f => offset + 1,
            0xde => offset + 3,
            0xdf => offset + 5,
            _ => continue,
        };
        if !data[key_at.min(data.len())..].starts_with(PATH_KEY) {
            continue;
        }
        let mut cursor = std::io::Cursor::new(&data[offset..]);
        match Item::deserialize(&mut rmp_serde::Deserializer::new(&mut cursor)) {
            Ok(_) => return Some(offset),
            Err(e) if is_unexpected_eof(&e) => return Some(offset),
            Err(_) => continue,
        }
    }
    None
}

/// Strip leading separators and parent references, yielding the relative
/// path an entry is stored under.
pub fn make_path_safe(path: &str) -> String {
    let safe: Vec<&str> = path
        .split('/')
        .filter(|part| !part.is_empty() && *part != "." && *part != "..")
        .collect();
    if safe.is_empty() {
        ".".to_string()
    } else {
        safe.join("/")
    }
}
