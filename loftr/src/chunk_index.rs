use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{ChunkId, Error};

/// Reference count and sizes of one chunk.
///
/// `count` is the number of logical references from live archives, `size`
/// the plaintext length and `csize` the stored (sealed) length.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    pub count: u32,
    pub size: u32,
    pub csize: u32,
}

/// Table mapping chunk ids to their reference count and sizes, with a disk
/// image it can be written to and loaded from.
#[derive(Clone, Debug, Default)]
pub struct ChunkIndex {
    path: Option<PathBuf>,
    map: HashMap<ChunkId, ChunkEntry>,
}

impl ChunkIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an index backed by `path`, pre-sized for `capacity` entries to
    /// avoid rehashing while it is being filled.
    pub fn create(path: &Path, capacity: usize) -> Self {
        Self {
            path: Some(path.to_path_buf()),
            map: HashMap::with_capacity(capacity),
        }
    }

    /// Load an index from its disk image. A missing image yields an empty
    /// index backed by the same path.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let map = match std::fs::read(path) {
            Ok(data) => rmp_serde::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            map,
        })
    }

    /// Write the index to its disk image using a temp file and rename.
    pub fn write(&self) -> Result<(), Error> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let data = rmp_serde::to_vec(&self.map)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn get(&self, id: &ChunkId) -> Option<ChunkEntry> {
        self.map.get(id).copied()
    }

    pub fn insert(&mut self, id: ChunkId, entry: ChunkEntry) {
        self.map.insert(id, entry);
    }

    pub fn remove(&mut self, id: &ChunkId) -> Option<ChunkEntry> {
        self.map.remove(id)
    }

    pub fn contains(&self, id: &ChunkId) -> bool {
        self.map.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ChunkId, &ChunkEntry)> {
        self.map.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ChunkId> {
        self.map.keys()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_image_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunks");
        let mut index = ChunkIndex::create(&path, 16);
        let id = ChunkId::from_slice(&[9u8; 32]);
        index.insert(
            id,
            ChunkEntry {
                count: 2,
                size: 100,
                csize: 60,
            },
        );
        index.write().unwrap();
        let loaded = ChunkIndex::load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(
            loaded.get(&id),
            Some(ChunkEntry {
                count: 2,
                size: 100,
                csize: 60,
            })
        );
    }

    #[test]
    fn load_missing_image_gives_empty_index() {
        let dir = tempfile::tempdir().unwrap();
        let index = ChunkIndex::load(&dir.path().join("chunks")).unwrap();
        assert!(index.is_empty());
    }
}
