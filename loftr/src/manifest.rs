use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{ChunkId, Error, Key, Repository};

/// Fixed id the manifest object is stored at. Not a content hash.
pub const MANIFEST_ID: ChunkId = ChunkId::zero();

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchiveInfo {
    pub id: ChunkId,
    pub time: String,
}

#[derive(Serialize, Deserialize)]
struct ManifestData {
    version: u32,
    archives: BTreeMap<String, ArchiveInfo>,
    timestamp: String,
}

/// Registry of the archives known to a repository.
#[derive(Default)]
pub struct Manifest {
    pub archives: BTreeMap<String, ArchiveInfo>,
    /// Content hash of the manifest as last loaded or written. Used by the
    /// chunk cache to detect that the repository changed under it.
    pub id: ChunkId,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load(repository: &mut Repository, key: &Key) -> Result<Self, Error> {
        let sealed = repository.get(&MANIFEST_ID).await?;
        let data = key.decrypt(None, &sealed)?;
        let manifest: ManifestData = rmp_serde::from_slice(&data)?;
        if manifest.version != 1 {
            return Err(Error::UnknownManifestVersion(manifest.version));
        }
        Ok(Self {
            archives: manifest.archives,
            id: key.id_hash(&data),
        })
    }

    /// Stage the manifest into the repository. Durable once the repository
    /// transaction commits.
    pub fn write(&mut self, repository: &mut Repository, key: &Key) -> Result<(), Error> {
        let data = rmp_serde::to_vec_named(&ManifestData {
            version: 1,
            archives: self.archives.clone(),
            timestamp: Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
        })?;
        self.id = key.id_hash(&data);
        repository.put(MANIFEST_ID, key.encrypt(&data)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = Repository::create(dir.path()).await.unwrap();
        let key = Key::generate();
        let mut manifest = Manifest::new();
        manifest.archives.insert(
            "backup".to_string(),
            ArchiveInfo {
                id: ChunkId::from_slice(&[1u8; 32]),
                time: "2024-01-01T00:00:00".to_string(),
            },
        );
        manifest.write(&mut repo, &key).unwrap();
        repo.commit().await.unwrap();

        let loaded = Manifest::load(&mut repo, &key).await.unwrap();
        assert_eq!(loaded.archives.len(), 1);
        assert_eq!(loaded.archives["backup"].id, ChunkId::from_slice(&[1u8; 32]));
        assert_eq!(loaded.id, manifest.id);
    }
}
