//! Archive engine for the loft backup tool.
//!
//! A repository is a content-addressed store of encrypted chunks. Files are
//! split by a rolling-hash chunker, each unique chunk is stored once and
//! reference counted through the chunk cache. An archive is a named metadata
//! block pointing at an item stream, itself chunked and stored like file
//! data, so archive metadata stays small and restores can stream.

mod archive;
mod cache;
mod check;
mod chunk_id;
mod chunk_index;
mod chunker;
mod error;
mod item;
mod key;
mod manifest;
mod pipeline;
mod repository;
mod rolling_hash;
mod stats;

pub use archive::{
    Archive, ArchiveMeta, ArchiveWriter, Extractor, ExtractorOptions, WriterOptions, CHUNK_MASK_BITS,
    CHUNK_MAX, CHUNK_MIN, WINDOW_SIZE,
};
pub use cache::Cache;
pub use check::ArchiveChecker;
pub use chunk_id::ChunkId;
pub use chunk_index::{ChunkEntry, ChunkIndex};
pub use chunker::{Chunker, FilterConfig, RollingHashChunker, StreamingChunker};
pub use error::Error;
pub use item::{make_path_safe, ChunkRef, Item, ItemDecoder};
pub use key::Key;
pub use manifest::{ArchiveInfo, Manifest, MANIFEST_ID};
pub use pipeline::{ItemFilter, ItemStream};
pub use repository::Repository;
pub use rolling_hash::{BuzHash, RollingHash};
pub use stats::Statistics;
