mod common;

use std::collections::HashMap;

use loftr::{ArchiveChecker, ChunkEntry, ChunkId};

use common::*;

#[tokio::test]
async fn zero_file_dedups_to_a_single_chunk_across_archives() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(src.join("big"), vec![0u8; 1024 * 1024]).unwrap();

    let (mut repository, key, mut manifest) = init_repo(&tmp.path().join("repo")).await;
    let mut cache = open_cache(&mut repository, &key, &manifest).await;
    let a1 = create_archive(&mut repository, &key, &mut manifest, &mut cache, "a1", &src).await;

    let items = collect_items(&mut repository, &key, &a1).await;
    let file = items.iter().find(|item| item.is_regular()).unwrap();
    let chunks = file.chunks.as_ref().unwrap();
    // A megabyte of zeros never hits a boundary, so it is one single chunk.
    assert_eq!(chunks.len(), 1);
    let content_id = *chunks[0].id();
    assert_eq!(cache.chunks.get(&content_id).unwrap().count, 1);

    let _a2 = create_archive(&mut repository, &key, &mut manifest, &mut cache, "a2", &src).await;
    assert_eq!(cache.chunks.get(&content_id).unwrap().count, 2);

    a1.delete(&mut repository, &key, &mut manifest, &mut cache)
        .await
        .unwrap();
    assert_eq!(cache.chunks.get(&content_id).unwrap().count, 1);
    let sealed = repository.get(&content_id).await.unwrap();
    assert_eq!(key.decrypt(Some(&content_id), &sealed).unwrap().len(), 1024 * 1024);
}

#[tokio::test]
async fn delete_keeps_shared_chunks_and_leaves_no_orphans() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    std::fs::create_dir_all(src.join("d")).unwrap();
    std::fs::write(src.join("d/one"), pseudo_random_data(64 * 1024)).unwrap();
    std::fs::write(src.join("two"), b"second file").unwrap();

    let (mut repository, key, mut manifest) = init_repo(&tmp.path().join("repo")).await;
    let mut cache = open_cache(&mut repository, &key, &manifest).await;
    let a1 = create_archive(&mut repository, &key, &mut manifest, &mut cache, "a1", &src).await;
    let a2 = create_archive(&mut repository, &key, &mut manifest, &mut cache, "a2", &src).await;

    a1.delete(&mut repository, &key, &mut manifest, &mut cache)
        .await
        .unwrap();
    // Every chunk referenced by a2 must still be there.
    let items = collect_items(&mut repository, &key, &a2).await;
    for item in &items {
        for chunk in item.chunks.iter().flatten() {
            assert!(cache.chunks.get(chunk.id()).map(|e| e.count >= 1).unwrap_or(false));
            assert!(repository.get(chunk.id()).await.is_ok());
        }
    }
    // And a consistency check finds nothing wrong.
    let checker = ArchiveChecker::new(false).unwrap();
    assert!(checker.check(&mut repository).await.unwrap());

    // Dropping the second archive as well leaves just the manifest object.
    a2.delete(&mut repository, &key, &mut manifest, &mut cache)
        .await
        .unwrap();
    assert_eq!(repository.count().await.unwrap(), 1);
}

#[tokio::test]
async fn checkpoints_do_not_linger() {
    use loftr::{ArchiveWriter, WriterOptions};
    use std::time::Duration;

    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    std::fs::create_dir_all(&src).unwrap();
    for index in 0..3 {
        std::fs::write(src.join(format!("f{}", index)), pseudo_random_data(2048)).unwrap();
    }

    let (mut repository, key, mut manifest) = init_repo(&tmp.path().join("repo")).await;
    let mut cache = open_cache(&mut repository, &key, &manifest).await;
    // A zero interval forces a checkpoint after every single item.
    let mut writer = ArchiveWriter::new(
        &key,
        &manifest,
        "a1",
        WriterOptions {
            checkpoint_interval: Duration::ZERO,
            ..Default::default()
        },
    )
    .unwrap();
    writer
        .archive_tree(&mut repository, &key, &mut cache, &mut manifest, &src)
        .await
        .unwrap();
    let archive = writer
        .save(&mut repository, &key, &mut cache, &mut manifest)
        .await
        .unwrap();

    assert!(manifest.archives.contains_key("a1"));
    assert!(!manifest.archives.keys().any(|name| name.contains("checkpoint")));
    // The interim checkpoints left neither archives nor orphaned objects.
    let checker = ArchiveChecker::new(false).unwrap();
    assert!(checker.check(&mut repository).await.unwrap());
    let items = collect_items(&mut repository, &key, &archive).await;
    assert_eq!(items.iter().filter(|item| item.is_regular()).count(), 3);
}

#[tokio::test]
async fn creating_an_existing_archive_name_fails() {
    use loftr::{ArchiveWriter, Error, WriterOptions};

    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(src.join("f"), b"x").unwrap();

    let (mut repository, key, mut manifest) = init_repo(&tmp.path().join("repo")).await;
    let mut cache = open_cache(&mut repository, &key, &manifest).await;
    create_archive(&mut repository, &key, &mut manifest, &mut cache, "a1", &src).await;
    assert!(matches!(
        ArchiveWriter::new(&key, &manifest, "a1", WriterOptions::default()),
        Err(Error::ArchiveExists(_))
    ));
}

#[tokio::test]
async fn calc_stats_does_not_change_the_cache() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(src.join("f1"), pseudo_random_data(96 * 1024)).unwrap();
    std::fs::write(src.join("f2"), b"tiny").unwrap();

    let (mut repository, key, mut manifest) = init_repo(&tmp.path().join("repo")).await;
    let mut cache = open_cache(&mut repository, &key, &manifest).await;
    let archive = create_archive(&mut repository, &key, &mut manifest, &mut cache, "a1", &src).await;

    let before: HashMap<ChunkId, ChunkEntry> =
        cache.chunks.iter().map(|(id, entry)| (*id, *entry)).collect();
    let stats = archive
        .calc_stats(&mut repository, &key, &mut cache)
        .await
        .unwrap();
    let after: HashMap<ChunkId, ChunkEntry> =
        cache.chunks.iter().map(|(id, entry)| (*id, *entry)).collect();
    assert_eq!(before, after);
    assert_eq!(stats.nfiles, 2);
    assert!(stats.osize >= 96 * 1024 + 4);
    // Single archive, so everything it stores is unique to it.
    assert_eq!(stats.csize, stats.ucsize);
}
