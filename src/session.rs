use std::path::Path;

use anyhow::{Context, Result};
use loftr::{Cache, Key, Manifest, Repository, MANIFEST_ID};

/// The open handles every archive operation is driven with.
pub struct Session {
    pub repository: Repository,
    pub key: Key,
    pub manifest: Manifest,
}

pub async fn open(repository_path: &Path) -> Result<Session> {
    let mut repository = Repository::open(repository_path)
        .await
        .with_context(|| format!("unable to open repository {}", repository_path.display()))?;
    let sealed = repository
        .get(&MANIFEST_ID)
        .await
        .context("repository has no manifest")?;
    let key = Key::detect(&repository.keyfile_path(), &sealed)?;
    let manifest = Manifest::load(&mut repository, &key).await?;
    Ok(Session {
        repository,
        key,
        manifest,
    })
}

impl Session {
    pub async fn open_cache(&mut self) -> Result<Cache> {
        Ok(Cache::open(&mut self.repository, &self.key, &self.manifest).await?)
    }
}
