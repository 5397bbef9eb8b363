#![allow(dead_code)]

use std::path::Path;

use loftr::{Archive, ArchiveWriter, Cache, Key, Manifest, Repository, WriterOptions};

/// Initialize an empty repository with a fresh secret key.
pub async fn init_repo(root: &Path) -> (Repository, Key, Manifest) {
    let mut repository = Repository::create(root).await.unwrap();
    let key = Key::generate();
    key.save(&repository.keyfile_path()).unwrap();
    let mut manifest = Manifest::new();
    manifest.write(&mut repository, &key).unwrap();
    repository.commit().await.unwrap();
    (repository, key, manifest)
}

pub async fn open_cache(
    repository: &mut Repository,
    key: &Key,
    manifest: &Manifest,
) -> Cache {
    Cache::open(repository, key, manifest).await.unwrap()
}

/// Archive one tree under the given name and finalize it.
pub async fn create_archive(
    repository: &mut Repository,
    key: &Key,
    manifest: &mut Manifest,
    cache: &mut Cache,
    name: &str,
    root: &Path,
) -> Archive {
    let mut writer = ArchiveWriter::new(key, manifest, name, WriterOptions::default()).unwrap();
    writer
        .archive_tree(repository, key, cache, manifest, root)
        .await
        .unwrap();
    writer
        .save(repository, key, cache, manifest)
        .await
        .unwrap()
}

/// Deterministic pseudo random data, no external randomness involved.
pub fn pseudo_random_data(size: usize) -> Vec<u8> {
    let mut seed: usize = 0xa3;
    (0..size)
        .map(|v| {
            seed ^= seed.wrapping_mul(4);
            (seed ^ v) as u8
        })
        .collect()
}

/// Collect all items of an archive in stream order.
pub async fn collect_items(
    repository: &mut Repository,
    key: &Key,
    archive: &Archive,
) -> Vec<loftr::Item> {
    let mut items = archive.iter_items(None, false);
    let mut collected = Vec::new();
    while let Some(item) = items.next(repository, key).await.unwrap() {
        collected.push(item);
    }
    collected
}
