//! Local content-addressed object store.
//!
//! Objects live as individual files under `objects/`, fanned out by the
//! leading id byte. Writes and deletes are staged in memory and only reach
//! disk on `commit`, so a reader within the same transaction observes its
//! own writes while a crash before commit leaves the store untouched.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_stream::try_stream;
use bytes::Bytes;
use futures_util::Stream;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{ChunkId, Error};

const CONFIG_NAME: &str = "config";
const KEY_NAME: &str = "key";
const OBJECTS_DIR: &str = "objects";
const CACHE_DIR: &str = "cache";

#[derive(Serialize, Deserialize)]
struct RepoConfig {
    version: u32,
}

pub struct Repository {
    root: PathBuf,
    staged: HashMap<ChunkId, Bytes>,
    deleted: HashSet<ChunkId>,
    prefetched: HashMap<ChunkId, Bytes>,
}

impl Repository {
    /// Initialize a fresh repository at the given directory.
    pub async fn create(root: &Path) -> Result<Self, Error> {
        if tokio::fs::try_exists(root.join(CONFIG_NAME)).await? {
            return Err(Error::IO(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("repository already exists at {}", root.display()),
            )));
        }
        tokio::fs::create_dir_all(root.join(OBJECTS_DIR)).await?;
        tokio::fs::create_dir_all(root.join(CACHE_DIR)).await?;
        let config = rmp_serde::to_vec(&RepoConfig { version: 1 })?;
        tokio::fs::write(root.join(CONFIG_NAME), config).await?;
        Self::open(root).await
    }

    /// Open an existing repository.
    pub async fn open(root: &Path) -> Result<Self, Error> {
        let config = tokio::fs::read(root.join(CONFIG_NAME))
            .await
            .map_err(|_| Error::NotARepository)?;
        let config: RepoConfig =
            rmp_serde::from_slice(&config).map_err(|_| Error::NotARepository)?;
        if config.version != 1 {
            return Err(Error::NotARepository);
        }
        Ok(Self {
            root: root.to_path_buf(),
            staged: HashMap::new(),
            deleted: HashSet::new(),
            prefetched: HashMap::new(),
        })
    }

    /// Path of the keyfile belonging to this repository.
    pub fn keyfile_path(&self) -> PathBuf {
        self.root.join(KEY_NAME)
    }

    /// Directory holding the chunk cache of this repository.
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(CACHE_DIR)
    }

    fn object_path(&self, id: &ChunkId) -> PathBuf {
        let hex = id.to_string();
        self.root.join(OBJECTS_DIR).join(&hex[..2]).join(hex)
    }

    /// Test if an object exists, as seen from within the transaction.
    pub async fn contains(&self, id: &ChunkId) -> bool {
        if self.staged.contains_key(id) {
            return true;
        }
        if self.deleted.contains(id) {
            return false;
        }
        tokio::fs::try_exists(self.object_path(id))
            .await
            .unwrap_or(false)
    }

    /// Get an object. Staged writes and the prefetch queue are consulted
    /// before disk.
    pub async fn get(&mut self, id: &ChunkId) -> Result<Bytes, Error> {
        if let Some(data) = self.staged.get(id) {
            return Ok(data.clone());
        }
        if self.deleted.contains(id) {
            return Err(Error::ChunkMissing(*id));
        }
        if let Some(data) = self.prefetched.remove(id) {
            return Ok(data);
        }
        match tokio::fs::read(self.object_path(id)).await {
            Ok(data) => Ok(data.into()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::ChunkMissing(*id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Get a sequence of objects, in input order.
    pub fn get_many<'a>(
        &'a mut self,
        ids: &'a [ChunkId],
    ) -> impl Stream<Item = Result<Bytes, Error>> + 'a {
        try_stream! {
            for id in ids {
                let data = self.get(id).await?;
                yield data;
            }
        }
    }

    /// Read objects ahead of use so later `get` calls resolve from memory.
    ///
    /// Ids without a committed object are left for `get` to report.
    pub async fn preload(&mut self, ids: &[ChunkId]) -> Result<(), Error> {
        for id in ids {
            if self.staged.contains_key(id) || self.prefetched.contains_key(id) {
                continue;
            }
            match tokio::fs::read(self.object_path(id)).await {
                Ok(data) => {
                    self.prefetched.insert(*id, data.into());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Stage an object write.
    pub fn put(&mut self, id: ChunkId, data: Bytes) {
        self.deleted.remove(&id);
        self.staged.insert(id, data);
    }

    /// Stage an object delete.
    pub fn delete(&mut self, id: &ChunkId) {
        self.staged.remove(id);
        self.prefetched.remove(id);
        self.deleted.insert(*id);
    }

    /// List committed object ids in ascending order, starting after `marker`.
    pub async fn list(
        &self,
        limit: usize,
        marker: Option<&ChunkId>,
    ) -> Result<Vec<ChunkId>, Error> {
        let mut ids = self.committed_ids().await?;
        ids.sort_unstable();
        let start = match marker {
            Some(marker) => ids.partition_point(|id| id <= marker),
            None => 0,
        };
        ids.drain(..start);
        ids.truncate(limit);
        Ok(ids)
    }

    /// Number of committed objects.
    pub async fn count(&self) -> Result<usize, Error> {
        Ok(self.committed_ids().await?.len())
    }

    async fn committed_ids(&self) -> Result<Vec<ChunkId>, Error> {
        let mut ids = Vec::new();
        let mut outer = tokio::fs::read_dir(self.root.join(OBJECTS_DIR)).await?;
        while let Some(fan) = outer.next_entry().await? {
            if !fan.file_type().await?.is_dir() {
                continue;
            }
            let mut inner = tokio::fs::read_dir(fan.path()).await?;
            while let Some(entry) = inner.next_entry().await? {
                if let Some(id) = entry
                    .file_name()
                    .to_str()
                    .and_then(ChunkId::from_hex)
                {
                    if !self.deleted.contains(&id) {
                        ids.push(id);
                    }
                }
            }
        }
        Ok(ids)
    }

    /// Flush staged writes and deletes to disk and end the transaction.
    pub async fn commit(&mut self) -> Result<(), Error> {
        let staged = std::mem::take(&mut self.staged);
        for (id, data) in staged {
            let path = self.object_path(&id);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let tmp = path.with_extension("tmp");
            tokio::fs::write(&tmp, &data).await?;
            tokio::fs::rename(&tmp, &path).await?;
        }
        let deleted = std::mem::take(&mut self.deleted);
        for id in deleted {
            match tokio::fs::remove_file(self.object_path(&id)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!("repository committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(fill: u8) -> ChunkId {
        ChunkId::from_slice(&[fill; 32])
    }

    #[tokio::test]
    async fn get_sees_staged_put_before_commit() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = Repository::create(dir.path()).await.unwrap();
        repo.put(id(1), Bytes::from_static(b"one"));
        assert_eq!(repo.get(&id(1)).await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(repo.count().await.unwrap(), 0);
        repo.commit().await.unwrap();
        assert_eq!(repo.count().await.unwrap(), 1);
        assert_eq!(repo.get(&id(1)).await.unwrap(), Bytes::from_static(b"one"));
    }

    #[tokio::test]
    async fn deleted_object_is_missing_within_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = Repository::create(dir.path()).await.unwrap();
        repo.put(id(1), Bytes::from_static(b"one"));
        repo.commit().await.unwrap();
        repo.delete(&id(1));
        assert!(matches!(
            repo.get(&id(1)).await,
            Err(Error::ChunkMissing(_))
        ));
        repo.commit().await.unwrap();
        assert_eq!(repo.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn list_pages_in_id_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = Repository::create(dir.path()).await.unwrap();
        for fill in [3u8, 1, 7, 5] {
            repo.put(id(fill), Bytes::from_static(b"x"));
        }
        repo.commit().await.unwrap();
        let first = repo.list(2, None).await.unwrap();
        assert_eq!(first, vec![id(1), id(3)]);
        let second = repo.list(2, Some(&first[1])).await.unwrap();
        assert_eq!(second, vec![id(5), id(7)]);
        let rest = repo.list(2, Some(&second[1])).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn preload_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = Repository::create(dir.path()).await.unwrap();
        repo.put(id(1), Bytes::from_static(b"one"));
        repo.put(id(2), Bytes::from_static(b"two"));
        repo.commit().await.unwrap();
        repo.preload(&[id(1), id(2), id(9)]).await.unwrap();
        assert_eq!(repo.get(&id(1)).await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(repo.get(&id(2)).await.unwrap(), Bytes::from_static(b"two"));
        assert!(matches!(
            repo.get(&id(9)).await,
            Err(Error::ChunkMissing(_))
        ));
    }

    #[tokio::test]
    async fn open_rejects_non_repository() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Repository::open(dir.path()).await,
            Err(Error::NotARepository)
        ));
    }
}
