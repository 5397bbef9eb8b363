//! Chunk cache: the reference counted index of every chunk in the
//! repository, plus a per-file memo so unchanged files are never re-read.
//!
//! All mutation happens inside a transaction. The first mutating call takes
//! an in-memory snapshot; `rollback` restores it and `commit` persists the
//! cache to disk. The cache remembers which manifest it was built against
//! and rebuilds its counts from the repository when the two diverge, e.g.
//! after a repair.

use std::collections::HashMap;
use std::path::PathBuf;

use log::info;
use serde::{Deserialize, Serialize};

use crate::archive::ArchiveMeta;
use crate::{
    ChunkEntry, ChunkId, ChunkIndex, ChunkRef, Error, ItemDecoder, Key, Manifest, Repository,
    Statistics,
};

const CHUNKS_NAME: &str = "chunks";
const FILES_NAME: &str = "files";
const CONFIG_NAME: &str = "config";

#[derive(Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub inode: u64,
    pub size: u64,
    pub mtime_ns: i64,
    pub ids: Vec<ChunkId>,
}

#[derive(Serialize, Deserialize)]
struct CacheConfig {
    version: u32,
    manifest_id: ChunkId,
}

struct TxnBackup {
    chunks: ChunkIndex,
    files: HashMap<ChunkId, FileEntry>,
    manifest_id: ChunkId,
}

pub struct Cache {
    dir: PathBuf,
    pub chunks: ChunkIndex,
    files: HashMap<ChunkId, FileEntry>,
    manifest_id: ChunkId,
    txn: Option<Box<TxnBackup>>,
}

impl Cache {
    /// Open the cache belonging to a repository, rebuilding the chunk counts
    /// when the manifest changed since the cache was last committed.
    pub async fn open(
        repository: &mut Repository,
        key: &Key,
        manifest: &Manifest,
    ) -> Result<Self, Error> {
        let dir = repository.cache_dir();
        let chunks = ChunkIndex::load(&dir.join(CHUNKS_NAME))?;
        let files = match std::fs::read(dir.join(FILES_NAME)) {
            Ok(data) => rmp_serde::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        let manifest_id = match std::fs::read(dir.join(CONFIG_NAME)) {
            Ok(data) => rmp_serde::from_slice::<CacheConfig>(&data)?.manifest_id,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ChunkId::zero(),
            Err(e) => return Err(e.into()),
        };
        let mut cache = Self {
            dir,
            chunks,
            files,
            manifest_id,
            txn: None,
        };
        if cache.manifest_id != manifest.id {
            cache.sync(repository, key, manifest).await?;
        }
        Ok(cache)
    }

    fn begin_txn_if_needed(&mut self) {
        if self.txn.is_none() {
            self.begin_txn();
        }
    }

    /// Snapshot the cache state so it can be rolled back.
    pub fn begin_txn(&mut self) {
        self.txn = Some(Box::new(TxnBackup {
            chunks: self.chunks.clone(),
            files: self.files.clone(),
            manifest_id: self.manifest_id,
        }));
    }

    /// Persist the cache to disk and drop the transaction snapshot.
    pub fn commit(&mut self) -> Result<(), Error> {
        std::fs::create_dir_all(&self.dir)?;
        self.chunks.write()?;
        let files = rmp_serde::to_vec(&self.files)?;
        write_atomic(&self.dir.join(FILES_NAME), &files)?;
        let config = rmp_serde::to_vec(&CacheConfig {
            version: 1,
            manifest_id: self.manifest_id,
        })?;
        write_atomic(&self.dir.join(CONFIG_NAME), &config)?;
        self.txn = None;
        Ok(())
    }

    /// Restore the state taken at `begin_txn`. No-op without a transaction.
    pub fn rollback(&mut self) {
        if let Some(backup) = self.txn.take() {
            self.chunks = backup.chunks;
            self.files = backup.files;
            self.manifest_id = backup.manifest_id;
        }
    }

    /// Record that the cache now reflects the given manifest.
    pub fn set_manifest_id(&mut self, id: ChunkId) {
        self.begin_txn_if_needed();
        self.manifest_id = id;
    }

    pub fn seen_chunk(&self, id: &ChunkId) -> bool {
        self.chunks.contains(id)
    }

    /// Insert a chunk, or increment its count if it is already present.
    /// New chunks are sealed and staged into the repository here.
    pub fn add_chunk(
        &mut self,
        repository: &mut Repository,
        key: &Key,
        id: ChunkId,
        data: &[u8],
        stats: &mut Statistics,
    ) -> Result<ChunkRef, Error> {
        if self.seen_chunk(&id) {
            return self.chunk_incref(&id, stats);
        }
        self.begin_txn_if_needed();
        let size = data.len() as u32;
        let sealed = key.encrypt(data)?;
        let csize = sealed.len() as u32;
        repository.put(id, sealed);
        self.chunks.insert(
            id,
            ChunkEntry {
                count: 1,
                size,
                csize,
            },
        );
        stats.update(size, csize, true);
        Ok(ChunkRef(id, size, csize))
    }

    /// Count one more reference to an existing chunk.
    pub fn chunk_incref(
        &mut self,
        id: &ChunkId,
        stats: &mut Statistics,
    ) -> Result<ChunkRef, Error> {
        self.begin_txn_if_needed();
        let mut entry = self.chunks.get(id).ok_or(Error::ChunkMissing(*id))?;
        entry.count += 1;
        self.chunks.insert(*id, entry);
        stats.update(entry.size, entry.csize, false);
        Ok(ChunkRef(*id, entry.size, entry.csize))
    }

    /// Drop one reference. The repository object is deleted together with
    /// the last reference.
    pub fn chunk_decref(&mut self, repository: &mut Repository, id: &ChunkId) -> Result<(), Error> {
        self.begin_txn_if_needed();
        let mut entry = self.chunks.get(id).ok_or(Error::ChunkMissing(*id))?;
        if entry.count == 1 {
            self.chunks.remove(id);
            repository.delete(id);
        } else {
            entry.count -= 1;
            self.chunks.insert(*id, entry);
        }
        Ok(())
    }

    /// Chunk ids previously memorized for a file, if its stat data is
    /// unchanged.
    pub fn file_known_and_unchanged(
        &self,
        path_hash: &ChunkId,
        inode: u64,
        size: u64,
        mtime_ns: i64,
    ) -> Option<Vec<ChunkId>> {
        let entry = self.files.get(path_hash)?;
        if entry.inode == inode && entry.size == size && entry.mtime_ns == mtime_ns {
            Some(entry.ids.clone())
        } else {
            None
        }
    }

    pub fn memorize_file(
        &mut self,
        path_hash: ChunkId,
        inode: u64,
        size: u64,
        mtime_ns: i64,
        ids: Vec<ChunkId>,
    ) {
        self.begin_txn_if_needed();
        self.files.insert(
            path_hash,
            FileEntry {
                inode,
                size,
                mtime_ns,
                ids,
            },
        );
    }

    /// Rebuild the chunk counts by walking every archive graph in the
    /// repository.
    async fn sync(
        &mut self,
        repository: &mut Repository,
        key: &Key,
        manifest: &Manifest,
    ) -> Result<(), Error> {
        info!("chunk cache out of sync with manifest, rebuilding");
        self.begin_txn_if_needed();
        let mut chunks = ChunkIndex::create(&self.dir.join(CHUNKS_NAME), 0);
        let account = |chunks: &mut ChunkIndex, id: &ChunkId, size: u32, csize: u32| {
            match chunks.get(id) {
                Some(mut entry) => {
                    entry.count += 1;
                    chunks.insert(*id, entry);
                }
                None => chunks.insert(
                    *id,
                    ChunkEntry {
                        count: 1,
                        size,
                        csize,
                    },
                ),
            }
        };
        for info in manifest.archives.values() {
            let sealed = repository.get(&info.id).await?;
            let data = key.decrypt(Some(&info.id), &sealed)?;
            let meta: ArchiveMeta = rmp_serde::from_slice(&data)?;
            account(&mut chunks, &info.id, data.len() as u32, sealed.len() as u32);
            let mut decoder = ItemDecoder::new();
            for id in &meta.items {
                let sealed = repository.get(id).await?;
                let data = key.decrypt(Some(id), &sealed)?;
                account(&mut chunks, id, data.len() as u32, sealed.len() as u32);
                decoder.feed(&data);
                while let Some(item) = decoder.next()? {
                    for chunk in item.chunks.iter().flatten() {
                        account(&mut chunks, chunk.id(), chunk.size(), chunk.csize());
                    }
                }
            }
        }
        self.chunks = chunks;
        self.manifest_id = manifest.id;
        Ok(())
    }
}

fn write_atomic(path: &std::path::Path, data: &[u8]) -> Result<(), Error> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
