mod common;

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use loftr::{make_path_safe, Error, Extractor, ExtractorOptions, Item};

use common::*;

/// Destination subdirectory the items of `src` land in after restore.
fn restored_root(dest: &Path, src: &Path) -> PathBuf {
    dest.join(make_path_safe(&src.to_string_lossy()))
}

#[tokio::test]
async fn archive_and_restore_tree() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    std::fs::create_dir_all(src.join("sub")).unwrap();
    let big = pseudo_random_data(200 * 1024);
    std::fs::write(src.join("big"), &big).unwrap();
    std::fs::write(src.join("sub/small"), b"small file").unwrap();
    std::fs::write(src.join("empty"), b"").unwrap();
    std::fs::set_permissions(src.join("big"), std::fs::Permissions::from_mode(0o754)).unwrap();
    let mtime = filetime::FileTime::from_unix_time(1_600_000_000, 123_456_789);
    filetime::set_file_times(&src.join("sub/small"), mtime, mtime).unwrap();

    let repo_dir = tmp.path().join("repo");
    let (mut repository, key, mut manifest) = init_repo(&repo_dir).await;
    let mut cache = open_cache(&mut repository, &key, &manifest).await;
    let archive = create_archive(&mut repository, &key, &mut manifest, &mut cache, "a1", &src).await;

    let dest = tmp.path().join("dest");
    std::fs::create_dir_all(&dest).unwrap();
    let mut items = archive.iter_items(None, true);
    let mut extractor = Extractor::new(&dest, ExtractorOptions::default());
    while let Some(item) = items.next(&mut repository, &key).await.unwrap() {
        extractor
            .extract_item(&mut repository, &key, &item)
            .await
            .unwrap();
    }

    let out = restored_root(&dest, &src);
    assert_eq!(std::fs::read(out.join("big")).unwrap(), big);
    assert_eq!(std::fs::read(out.join("sub/small")).unwrap(), b"small file");
    assert_eq!(std::fs::read(out.join("empty")).unwrap(), b"");
    assert_eq!(
        std::fs::metadata(out.join("big")).unwrap().mode() & 0o7777,
        0o754
    );
    let restored = std::fs::metadata(out.join("sub/small")).unwrap();
    assert_eq!(restored.mtime(), 1_600_000_000);
    assert_eq!(restored.mtime_nsec(), 123_456_789);
}

#[tokio::test]
async fn hardlinks_share_an_inode_after_restore() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(src.join("a"), b"linked content").unwrap();
    std::fs::hard_link(src.join("a"), src.join("b")).unwrap();

    let (mut repository, key, mut manifest) = init_repo(&tmp.path().join("repo")).await;
    let mut cache = open_cache(&mut repository, &key, &manifest).await;
    let archive = create_archive(&mut repository, &key, &mut manifest, &mut cache, "a1", &src).await;

    // Exactly one of the two siblings carries chunks, the other points back.
    let items = collect_items(&mut repository, &key, &archive).await;
    let files: Vec<&Item> = items.iter().filter(|item| item.is_regular()).collect();
    assert_eq!(files.len(), 2);
    assert_eq!(
        files.iter().filter(|item| item.chunks.is_some()).count(),
        1
    );
    assert_eq!(
        files.iter().filter(|item| item.source.is_some()).count(),
        1
    );

    let dest = tmp.path().join("dest");
    std::fs::create_dir_all(&dest).unwrap();
    let mut stream = archive.iter_items(None, true);
    let mut extractor = Extractor::new(&dest, ExtractorOptions::default());
    while let Some(item) = stream.next(&mut repository, &key).await.unwrap() {
        extractor
            .extract_item(&mut repository, &key, &item)
            .await
            .unwrap();
    }
    let out = restored_root(&dest, &src);
    let meta_a = std::fs::metadata(out.join("a")).unwrap();
    let meta_b = std::fs::metadata(out.join("b")).unwrap();
    assert_eq!(meta_a.ino(), meta_b.ino());
    assert_eq!(std::fs::read(out.join("a")).unwrap(), b"linked content");
    assert_eq!(std::fs::read(out.join("b")).unwrap(), b"linked content");
}

#[tokio::test]
async fn symlink_target_is_preserved_not_followed() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    std::fs::create_dir_all(&src).unwrap();
    std::os::unix::fs::symlink("../outside/x", src.join("s")).unwrap();

    let (mut repository, key, mut manifest) = init_repo(&tmp.path().join("repo")).await;
    let mut cache = open_cache(&mut repository, &key, &manifest).await;
    let archive = create_archive(&mut repository, &key, &mut manifest, &mut cache, "a1", &src).await;

    let dest = tmp.path().join("dest");
    std::fs::create_dir_all(&dest).unwrap();
    let mut stream = archive.iter_items(None, true);
    let mut extractor = Extractor::new(&dest, ExtractorOptions::default());
    while let Some(item) = stream.next(&mut repository, &key).await.unwrap() {
        extractor
            .extract_item(&mut repository, &key, &item)
            .await
            .unwrap();
    }
    let out = restored_root(&dest, &src);
    let target = std::fs::read_link(out.join("s")).unwrap();
    assert_eq!(target, PathBuf::from("../outside/x"));
    assert!(!out.join("../outside/x").exists());
    assert!(!dest.join("outside").exists());
}

#[tokio::test]
async fn fifo_restores_as_fifo() {
    use std::os::unix::fs::FileTypeExt;

    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    std::fs::create_dir_all(&src).unwrap();
    nix::unistd::mkfifo(&src.join("pipe"), nix::sys::stat::Mode::from_bits_truncate(0o644))
        .unwrap();

    let (mut repository, key, mut manifest) = init_repo(&tmp.path().join("repo")).await;
    let mut cache = open_cache(&mut repository, &key, &manifest).await;
    let archive = create_archive(&mut repository, &key, &mut manifest, &mut cache, "a1", &src).await;

    let dest = tmp.path().join("dest");
    std::fs::create_dir_all(&dest).unwrap();
    let mut stream = archive.iter_items(None, true);
    let mut extractor = Extractor::new(&dest, ExtractorOptions::default());
    while let Some(item) = stream.next(&mut repository, &key).await.unwrap() {
        extractor
            .extract_item(&mut repository, &key, &item)
            .await
            .unwrap();
    }
    let out = restored_root(&dest, &src);
    assert!(std::fs::symlink_metadata(out.join("pipe"))
        .unwrap()
        .file_type()
        .is_fifo());
}

#[tokio::test]
async fn unsafe_paths_are_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let (mut repository, key, _manifest) = init_repo(&tmp.path().join("repo")).await;
    let mut extractor = Extractor::new(tmp.path(), ExtractorOptions::default());
    for bad in ["/etc/hacked", "a/../../b", ".."] {
        let item = Item {
            path: bad.to_string(),
            mode: 0o040_755,
            uid: 0,
            gid: 0,
            user: None,
            group: None,
            mtime: 0,
            rdev: None,
            source: None,
            chunks: None,
            xattrs: None,
        };
        assert!(matches!(
            extractor.extract_item(&mut repository, &key, &item).await,
            Err(Error::UnsafePath(_))
        ));
    }
}

#[tokio::test]
async fn dry_run_touches_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(src.join("f"), b"data").unwrap();

    let (mut repository, key, mut manifest) = init_repo(&tmp.path().join("repo")).await;
    let mut cache = open_cache(&mut repository, &key, &manifest).await;
    let archive = create_archive(&mut repository, &key, &mut manifest, &mut cache, "a1", &src).await;

    let dest = tmp.path().join("dest");
    std::fs::create_dir_all(&dest).unwrap();
    let mut stream = archive.iter_items(None, true);
    let mut extractor = Extractor::new(
        &dest,
        ExtractorOptions {
            dry_run: true,
            ..Default::default()
        },
    );
    while let Some(item) = stream.next(&mut repository, &key).await.unwrap() {
        extractor
            .extract_item(&mut repository, &key, &item)
            .await
            .unwrap();
    }
    assert_eq!(std::fs::read_dir(&dest).unwrap().count(), 0);
}
