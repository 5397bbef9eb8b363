//! Archives: ingest of filesystem trees, restore, and metadata lifecycle.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, NaiveDateTime, Utc};
use filetime::FileTime;
use futures_util::{pin_mut, StreamExt};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;
use xattr::FileExt;

use crate::chunker::{Chunker, FilterConfig, StreamingChunker};
use crate::item::S_IFMT;
use crate::pipeline::ItemFilter;
use crate::rolling_hash::BuzHash;
use crate::{
    make_path_safe, Cache, ChunkId, ChunkRef, Error, Item, ItemDecoder, ItemStream, Key, Manifest,
    Repository, RollingHashChunker, Statistics,
};

/// Rolling hash window used for both file data and the item stream.
pub const WINDOW_SIZE: usize = 0xfff;
/// Boundary filter width, giving 64 KiB chunks on average.
pub const CHUNK_MASK_BITS: u32 = 16;
/// No chunks smaller than this.
pub const CHUNK_MIN: usize = 1024;
/// Hard upper bound so low entropy input still terminates a chunk.
pub const CHUNK_MAX: usize = 32 * 1024 * 1024;

const ITEMS_BUFFER_SIZE: usize = 1024 * 1024;
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

pub(crate) fn chunker_config(seed: u32) -> FilterConfig {
    FilterConfig {
        filter_bits: CHUNK_MASK_BITS,
        min_chunk_size: CHUNK_MIN,
        max_chunk_size: CHUNK_MAX,
        window_size: WINDOW_SIZE,
        seed,
    }
}

/// Accumulates serialized items and re-chunks the concatenated stream.
///
/// Chunks are only split where the rolling hash finds a boundary; data after
/// the last boundary stays buffered until more items arrive or the buffer is
/// finalized. Boundaries therefore depend on content alone, not on flush
/// timing, which keeps the item stream deduplicating across archives.
pub(crate) struct ChunkBuffer {
    buf: BytesMut,
    chunker: RollingHashChunker<BuzHash>,
}

impl ChunkBuffer {
    pub fn new(seed: u32) -> Self {
        Self {
            buf: BytesMut::new(),
            chunker: chunker_config(seed).new_chunker(),
        }
    }

    /// Append one item. Returns chunks ready to be stored once the buffer
    /// has grown past its high-water mark.
    pub fn add(&mut self, item: &Item) -> Result<Vec<Bytes>, Error> {
        let packed = item.to_bytes()?;
        self.buf.extend_from_slice(&packed);
        if self.buf.len() > ITEMS_BUFFER_SIZE {
            Ok(self.flush(false))
        } else {
            Ok(Vec::new())
        }
    }

    /// Split the buffered stream at rolling hash boundaries. With `finalize`
    /// set the trailing partial chunk is emitted as well, leaving the buffer
    /// empty.
    pub fn flush(&mut self, finalize: bool) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.chunker.next(&mut self.buf) {
            chunks.push(chunk);
        }
        if finalize && !self.buf.is_empty() {
            chunks.push(self.buf.split().freeze());
        }
        chunks
    }
}

/// The archive metadata block, version 1.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchiveMeta {
    pub version: u32,
    pub name: String,
    /// Ordered chunk ids whose concatenated plaintexts form the item stream.
    pub items: Vec<ChunkId>,
    pub cmdline: Vec<String>,
    pub hostname: String,
    pub username: String,
    pub time: String,
}

/// A stored archive: its content id plus the decoded metadata block.
pub struct Archive {
    pub id: ChunkId,
    pub meta: ArchiveMeta,
}

impl Archive {
    /// Open an archive by name.
    pub async fn open(
        repository: &mut Repository,
        key: &Key,
        manifest: &Manifest,
        name: &str,
    ) -> Result<Self, Error> {
        let info = manifest
            .archives
            .get(name)
            .ok_or_else(|| Error::ArchiveDoesNotExist(name.to_string()))?;
        Self::load(repository, key, info.id).await
    }

    /// Load an archive metadata block by id.
    pub async fn load(repository: &mut Repository, key: &Key, id: ChunkId) -> Result<Self, Error> {
        let sealed = repository.get(&id).await?;
        let data = key.decrypt(Some(&id), &sealed)?;
        let meta: ArchiveMeta = rmp_serde::from_slice(&data)?;
        if meta.version != 1 {
            return Err(Error::UnknownArchiveVersion(meta.version));
        }
        Ok(Self { id, meta })
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Creation time of the archive in UTC.
    pub fn ts(&self) -> Result<DateTime<Utc>, Error> {
        let naive = NaiveDateTime::parse_from_str(&self.meta.time, "%Y-%m-%dT%H:%M:%S%.f")?;
        Ok(naive.and_utc())
    }

    /// Lazy iteration over the archive's items.
    pub fn iter_items(&self, filter: Option<ItemFilter>, preload: bool) -> ItemStream {
        ItemStream::new(self.meta.items.clone(), filter, preload)
    }

    /// Compute size statistics for this archive.
    ///
    /// Walks the chunk graph while decrementing refcounts inside a cache
    /// transaction, so that the first decrement to zero identifies bytes
    /// unique to this archive. The transaction is rolled back afterwards;
    /// persistent state is untouched.
    pub async fn calc_stats(
        &self,
        repository: &mut Repository,
        key: &Key,
        cache: &mut Cache,
    ) -> Result<Statistics, Error> {
        cache.begin_txn();
        let result = self.calc_stats_inner(repository, key, cache).await;
        cache.rollback();
        result
    }

    async fn calc_stats_inner(
        &self,
        repository: &mut Repository,
        key: &Key,
        cache: &mut Cache,
    ) -> Result<Statistics, Error> {
        fn sub(cache: &mut Cache, id: &ChunkId, stats: &mut Statistics) -> Result<(), Error> {
            let mut entry = cache.chunks.get(id).ok_or(Error::ChunkMissing(*id))?;
            stats.update(entry.size, entry.csize, entry.count == 1);
            entry.count = entry.count.saturating_sub(1);
            cache.chunks.insert(*id, entry);
            Ok(())
        }
        let mut stats = Statistics::default();
        sub(cache, &self.id, &mut stats)?;
        let ids = self.meta.items.clone();
        let mut decoder = ItemDecoder::new();
        let mut index = 0;
        let stream = repository.get_many(&ids);
        pin_mut!(stream);
        while let Some(sealed) = stream.next().await {
            let id = &ids[index];
            index += 1;
            sub(cache, id, &mut stats)?;
            decoder.feed(&key.decrypt(Some(id), &sealed?)?);
            while let Some(item) = decoder.next()? {
                if let Some(chunks) = &item.chunks {
                    stats.nfiles += 1;
                    for chunk in chunks {
                        sub(cache, chunk.id(), &mut stats)?;
                    }
                }
            }
        }
        Ok(stats)
    }

    /// Delete the archive, dropping one reference from every chunk in its
    /// graph. Commits manifest, repository and cache in that order.
    pub async fn delete(
        self,
        repository: &mut Repository,
        key: &Key,
        manifest: &mut Manifest,
        cache: &mut Cache,
    ) -> Result<(), Error> {
        let mut decoder = ItemDecoder::new();
        for id in &self.meta.items {
            let sealed = repository.get(id).await?;
            let data = key.decrypt(Some(id), &sealed)?;
            cache.chunk_decref(repository, id)?;
            decoder.feed(&data);
            while let Some(item) = decoder.next()? {
                for chunk in item.chunks.iter().flatten() {
                    cache.chunk_decref(repository, chunk.id())?;
                }
            }
        }
        cache.chunk_decref(repository, &self.id)?;
        manifest.archives.remove(&self.meta.name);
        manifest.write(repository, key)?;
        repository.commit().await?;
        cache.set_manifest_id(manifest.id);
        cache.commit()?;
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct WriterOptions {
    pub checkpoint_interval: Duration,
    pub numeric_owner: bool,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            checkpoint_interval: Duration::from_secs(300),
            numeric_owner: false,
        }
    }
}

/// Builds a new archive from filesystem trees.
pub struct ArchiveWriter {
    name: String,
    checkpoint_name: String,
    options: WriterOptions,
    last_checkpoint: Instant,
    buffer: ChunkBuffer,
    items: Vec<ChunkId>,
    hard_links: HashMap<(u64, u64), String>,
    stats: Statistics,
    cwd: PathBuf,
    user_cache: HashMap<u32, Option<String>>,
    group_cache: HashMap<u32, Option<String>>,
}

impl ArchiveWriter {
    pub fn new(
        key: &Key,
        manifest: &Manifest,
        name: &str,
        options: WriterOptions,
    ) -> Result<Self, Error> {
        if manifest.archives.contains_key(name) {
            return Err(Error::ArchiveExists(name.to_string()));
        }
        let mut suffix = 0;
        let checkpoint_name = loop {
            let candidate = if suffix == 0 {
                format!("{}.checkpoint", name)
            } else {
                format!("{}.checkpoint.{}", name, suffix)
            };
            if !manifest.archives.contains_key(&candidate) {
                break candidate;
            }
            suffix += 1;
        };
        Ok(Self {
            name: name.to_string(),
            checkpoint_name,
            options,
            last_checkpoint: Instant::now(),
            buffer: ChunkBuffer::new(key.chunk_seed()),
            items: Vec::new(),
            hard_links: HashMap::new(),
            stats: Statistics::default(),
            cwd: std::env::current_dir()?,
            user_cache: HashMap::new(),
            group_cache: HashMap::new(),
        })
    }

    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    /// Recursively archive one input path, in sorted visit order.
    pub async fn archive_tree(
        &mut self,
        repository: &mut Repository,
        key: &Key,
        cache: &mut Cache,
        manifest: &mut Manifest,
        root: &Path,
    ) -> Result<(), Error> {
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry?;
            let metadata = entry.metadata()?;
            self.process_entry(repository, key, cache, manifest, entry.path(), &metadata)
                .await?;
        }
        Ok(())
    }

    async fn process_entry(
        &mut self,
        repository: &mut Repository,
        key: &Key,
        cache: &mut Cache,
        manifest: &mut Manifest,
        path: &Path,
        metadata: &std::fs::Metadata,
    ) -> Result<(), Error> {
        let file_type = metadata.file_type();
        if file_type.is_dir() || file_type.is_fifo() {
            let item = self.stat_item(path, metadata);
            self.add_item(repository, key, cache, manifest, item).await
        } else if file_type.is_symlink() {
            let source = std::fs::read_link(path)?.to_string_lossy().into_owned();
            let mut item = self.stat_item(path, metadata);
            item.source = Some(source);
            self.add_item(repository, key, cache, manifest, item).await
        } else if file_type.is_char_device() || file_type.is_block_device() {
            let mut item = self.stat_item(path, metadata);
            item.rdev = Some(metadata.rdev());
            self.add_item(repository, key, cache, manifest, item).await
        } else if file_type.is_file() {
            self.process_file(repository, key, cache, manifest, path, metadata)
                .await
        } else {
            // Sockets and anything else without an archive representation.
            warn!("{}: unsupported file type, skipped", path.display());
            Ok(())
        }
    }

    async fn process_file(
        &mut self,
        repository: &mut Repository,
        key: &Key,
        cache: &mut Cache,
        manifest: &mut Manifest,
        path: &Path,
        metadata: &std::fs::Metadata,
    ) -> Result<(), Error> {
        if metadata.nlink() > 1 {
            let link_key = (metadata.ino(), metadata.dev());
            if let Some(source) = self.hard_links.get(&link_key).cloned() {
                let mut item = self.stat_item(path, metadata);
                item.source = Some(source);
                return self.add_item(repository, key, cache, manifest, item).await;
            }
            self.hard_links
                .insert(link_key, make_path_safe(&path.to_string_lossy()));
        }
        let absolute = self.cwd.join(path);
        let path_hash = key.id_hash(absolute.as_os_str().as_bytes());
        let mtime_ns = metadata.mtime() * 1_000_000_000 + metadata.mtime_nsec();

        let mut chunks: Option<Vec<ChunkRef>> = None;
        if let Some(ids) =
            cache.file_known_and_unchanged(&path_hash, metadata.ino(), metadata.len(), mtime_ns)
        {
            // Only trust the memo if every chunk is still present.
            if ids.iter().all(|id| cache.seen_chunk(id)) {
                let mut refs = Vec::with_capacity(ids.len());
                for id in &ids {
                    refs.push(cache.chunk_incref(id, &mut self.stats)?);
                }
                chunks = Some(refs);
            }
        }
        if chunks.is_none() {
            let file = tokio::fs::File::open(path).await?;
            let chunker = StreamingChunker::new(chunker_config(key.chunk_seed()).new_chunker(), file);
            pin_mut!(chunker);
            let mut refs = Vec::new();
            while let Some(chunk) = chunker.next().await {
                let chunk = chunk?;
                let id = key.id_hash(&chunk);
                refs.push(cache.add_chunk(repository, key, id, &chunk, &mut self.stats)?);
            }
            cache.memorize_file(
                path_hash,
                metadata.ino(),
                metadata.len(),
                mtime_ns,
                refs.iter().map(|chunk| *chunk.id()).collect(),
            );
            chunks = Some(refs);
        }
        let mut item = self.stat_item(path, metadata);
        item.chunks = chunks;
        self.stats.nfiles += 1;
        self.add_item(repository, key, cache, manifest, item).await
    }

    fn stat_item(&mut self, path: &Path, metadata: &std::fs::Metadata) -> Item {
        let uid = metadata.uid();
        let gid = metadata.gid();
        let (user, group) = if self.options.numeric_owner {
            (None, None)
        } else {
            (self.lookup_user(uid), self.lookup_group(gid))
        };
        let xattrs = if metadata.file_type().is_symlink() {
            None
        } else {
            collect_xattrs(path)
        };
        Item {
            path: make_path_safe(&path.to_string_lossy()),
            mode: metadata.mode(),
            uid,
            gid,
            user,
            group,
            mtime: metadata.mtime() * 1_000_000_000 + metadata.mtime_nsec(),
            rdev: None,
            source: None,
            chunks: None,
            xattrs,
        }
    }

    fn lookup_user(&mut self, uid: u32) -> Option<String> {
        self.user_cache
            .entry(uid)
            .or_insert_with(|| {
                nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
                    .ok()
                    .flatten()
                    .map(|user| user.name)
            })
            .clone()
    }

    fn lookup_group(&mut self, gid: u32) -> Option<String> {
        self.group_cache
            .entry(gid)
            .or_insert_with(|| {
                nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid))
                    .ok()
                    .flatten()
                    .map(|group| group.name)
            })
            .clone()
    }

    async fn add_item(
        &mut self,
        repository: &mut Repository,
        key: &Key,
        cache: &mut Cache,
        manifest: &mut Manifest,
        item: Item,
    ) -> Result<(), Error> {
        debug!("adding {}", item.path);
        let blobs = self.buffer.add(&item)?;
        self.store_item_chunks(repository, key, cache, blobs)?;
        if self.last_checkpoint.elapsed() > self.options.checkpoint_interval {
            self.last_checkpoint = Instant::now();
            self.write_checkpoint(repository, key, cache, manifest)
                .await?;
        }
        Ok(())
    }

    fn store_item_chunks(
        &mut self,
        repository: &mut Repository,
        key: &Key,
        cache: &mut Cache,
        blobs: Vec<Bytes>,
    ) -> Result<(), Error> {
        for blob in blobs {
            let id = key.id_hash(&blob);
            let chunk = cache.add_chunk(repository, key, id, &blob, &mut self.stats)?;
            self.items.push(*chunk.id());
        }
        Ok(())
    }

    /// Write an interim archive so a crash loses at most one checkpoint
    /// interval of work. The checkpoint is unregistered again right away;
    /// its metadata chunk stays until the next commit makes the final
    /// archive durable.
    async fn write_checkpoint(
        &mut self,
        repository: &mut Repository,
        key: &Key,
        cache: &mut Cache,
        manifest: &mut Manifest,
    ) -> Result<(), Error> {
        let name = self.checkpoint_name.clone();
        let checkpoint = self.save_as(repository, key, cache, manifest, &name).await?;
        manifest.archives.remove(&name);
        cache.chunk_decref(repository, &checkpoint.id)?;
        Ok(())
    }

    /// Finalize the archive under the name given at construction.
    pub async fn save(
        &mut self,
        repository: &mut Repository,
        key: &Key,
        cache: &mut Cache,
        manifest: &mut Manifest,
    ) -> Result<Archive, Error> {
        let name = self.name.clone();
        self.save_as(repository, key, cache, manifest, &name).await
    }

    async fn save_as(
        &mut self,
        repository: &mut Repository,
        key: &Key,
        cache: &mut Cache,
        manifest: &mut Manifest,
        name: &str,
    ) -> Result<Archive, Error> {
        if manifest.archives.contains_key(name) {
            return Err(Error::ArchiveExists(name.to_string()));
        }
        let blobs = self.buffer.flush(true);
        self.store_item_chunks(repository, key, cache, blobs)?;
        let meta = ArchiveMeta {
            version: 1,
            name: name.to_string(),
            items: self.items.clone(),
            cmdline: std::env::args().collect(),
            hostname: hostname(),
            username: username(),
            time: Utc::now().format(TIME_FORMAT).to_string(),
        };
        let data = rmp_serde::to_vec_named(&meta)?;
        let id = key.id_hash(&data);
        cache.add_chunk(repository, key, id, &data, &mut self.stats)?;
        manifest.archives.insert(
            name.to_string(),
            crate::ArchiveInfo {
                id,
                time: meta.time.clone(),
            },
        );
        // Commit order matters: manifest before repository before cache, so
        // a crash leaves orphan chunks at worst, never dangling references.
        manifest.write(repository, key)?;
        repository.commit().await?;
        cache.set_manifest_id(manifest.id);
        cache.commit()?;
        Ok(Archive { id, meta })
    }
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

fn username() -> String {
    nix::unistd::User::from_uid(nix::unistd::Uid::effective())
        .ok()
        .flatten()
        .map(|user| user.name)
        .unwrap_or_else(|| nix::unistd::Uid::effective().to_string())
}

fn collect_xattrs(path: &Path) -> Option<BTreeMap<ByteBuf, ByteBuf>> {
    let names = xattr::list(path).ok()?;
    let mut map = BTreeMap::new();
    for name in names {
        if let Ok(Some(value)) = xattr::get(path, &name) {
            map.insert(ByteBuf::from(name.as_bytes().to_vec()), ByteBuf::from(value));
        }
    }
    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

#[derive(Clone, Debug)]
pub struct ExtractorOptions {
    pub restore_attrs: bool,
    pub dry_run: bool,
    pub numeric_owner: bool,
}

impl Default for ExtractorOptions {
    fn default() -> Self {
        Self {
            restore_attrs: true,
            dry_run: false,
            numeric_owner: false,
        }
    }
}

/// Rebuilds filesystem entries from archive items.
pub struct Extractor {
    dest: PathBuf,
    options: ExtractorOptions,
    uid_cache: HashMap<String, Option<u32>>,
    gid_cache: HashMap<String, Option<u32>>,
}

impl Extractor {
    pub fn new(dest: &Path, options: ExtractorOptions) -> Self {
        Self {
            dest: dest.to_path_buf(),
            options,
            uid_cache: HashMap::new(),
            gid_cache: HashMap::new(),
        }
    }

    /// Restore one item below the destination directory.
    pub async fn extract_item(
        &mut self,
        repository: &mut Repository,
        key: &Key,
        item: &Item,
    ) -> Result<(), Error> {
        if item.path.starts_with('/') || item.path.split('/').any(|part| part == "..") {
            return Err(Error::UnsafePath(item.path.clone()));
        }
        if self.options.dry_run {
            // Just drain the file chunks to surface read or decrypt errors.
            if let Some(chunks) = &item.chunks {
                for chunk in chunks {
                    let sealed = repository.get(chunk.id()).await?;
                    key.decrypt(Some(chunk.id()), &sealed)?;
                }
            }
            return Ok(());
        }
        let path = self.dest.join(&item.path);
        // Attempt to remove an existing entry, ignore errors on failure.
        if let Ok(existing) = std::fs::symlink_metadata(&path) {
            if existing.is_dir() {
                let _ = std::fs::remove_dir(&path);
            } else {
                let _ = std::fs::remove_file(&path);
            }
        }
        if item.is_dir() {
            tokio::fs::create_dir_all(&path).await?;
            if self.options.restore_attrs {
                self.restore_attrs(&path, item, false, None)?;
            }
        } else if item.is_regular() && item.source.is_some() {
            ensure_parent(&path).await?;
            let source = item.source.as_deref().unwrap_or_default();
            std::fs::hard_link(self.dest.join(source), &path)?;
        } else if item.is_regular() {
            ensure_parent(&path).await?;
            let mut file = tokio::fs::File::create(&path).await?;
            for chunk in item.chunks.iter().flatten() {
                let sealed = repository.get(chunk.id()).await?;
                let data = key.decrypt(Some(chunk.id()), &sealed)?;
                file.write_all(&data).await?;
            }
            file.flush().await?;
            // Apply attributes on the open descriptor before it is closed.
            let file = file.into_std().await;
            if self.options.restore_attrs {
                self.restore_attrs(&path, item, false, Some(&file))?;
            }
        } else if item.is_fifo() {
            ensure_parent(&path).await?;
            nix::unistd::mkfifo(&path, nix::sys::stat::Mode::from_bits_truncate(item.mode))?;
            if self.options.restore_attrs {
                self.restore_attrs(&path, item, false, None)?;
            }
        } else if item.is_symlink() {
            ensure_parent(&path).await?;
            let source = item
                .source
                .as_deref()
                .ok_or(Error::UnknownItemType(item.mode))?;
            std::os::unix::fs::symlink(source, &path)?;
            if self.options.restore_attrs {
                self.restore_attrs(&path, item, true, None)?;
            }
        } else if item.is_device() {
            ensure_parent(&path).await?;
            nix::sys::stat::mknod(
                &path,
                nix::sys::stat::SFlag::from_bits_truncate(item.mode & S_IFMT),
                nix::sys::stat::Mode::from_bits_truncate(item.mode),
                item.rdev.unwrap_or(0),
            )?;
            if self.options.restore_attrs {
                self.restore_attrs(&path, item, false, None)?;
            }
        } else {
            return Err(Error::UnknownItemType(item.mode));
        }
        Ok(())
    }

    /// Restore xattrs, ownership, mode and mtime, in that order.
    ///
    /// Ownership is best effort, xattrs tolerate filesystems without
    /// support, and symlink modes are skipped where they cannot be set
    /// without following the link.
    fn restore_attrs(
        &mut self,
        path: &Path,
        item: &Item,
        symlink: bool,
        file: Option<&std::fs::File>,
    ) -> Result<(), Error> {
        if let Some(xattrs) = &item.xattrs {
            for (name, value) in xattrs {
                let name = OsStr::from_bytes(name);
                let result = match file {
                    Some(file) => file.set_xattr(name, value),
                    None => xattr::set(path, name, value),
                };
                match result {
                    Err(e) if is_enotsup(&e) => {}
                    Err(e) => return Err(e.into()),
                    Ok(()) => {}
                }
            }
        }
        let uid = self
            .lookup_uid(item)
            .unwrap_or(item.uid);
        let gid = self
            .lookup_gid(item)
            .unwrap_or(item.gid);
        // Ownership restore needs privileges, ignore failures.
        let _ = match file {
            Some(file) => std::os::unix::fs::fchown(file, Some(uid), Some(gid)),
            None => std::os::unix::fs::lchown(path, Some(uid), Some(gid)),
        };
        let permissions = std::fs::Permissions::from_mode(item.mode & 0o7777);
        if let Some(file) = file {
            file.set_permissions(permissions)?;
        } else if !symlink {
            std::fs::set_permissions(path, permissions)?;
        }
        // No lchmod here, symlink modes are not restorable on Linux.
        let mtime = FileTime::from_unix_time(
            item.mtime.div_euclid(1_000_000_000),
            item.mtime.rem_euclid(1_000_000_000) as u32,
        );
        match file {
            Some(file) => filetime::set_file_handle_times(file, None, Some(mtime))?,
            None if symlink => filetime::set_symlink_file_times(path, mtime, mtime)?,
            None => filetime::set_file_times(path, mtime, mtime)?,
        }
        Ok(())
    }

    fn lookup_uid(&mut self, item: &Item) -> Option<u32> {
        if self.options.numeric_owner {
            return None;
        }
        let name = item.user.as_deref()?;
        *self.uid_cache.entry(name.to_string()).or_insert_with(|| {
            nix::unistd::User::from_name(name)
                .ok()
                .flatten()
                .map(|user| user.uid.as_raw())
        })
    }

    fn lookup_gid(&mut self, item: &Item) -> Option<u32> {
        if self.options.numeric_owner {
            return None;
        }
        let name = item.group.as_deref()?;
        *self.gid_cache.entry(name.to_string()).or_insert_with(|| {
            nix::unistd::Group::from_name(name)
                .ok()
                .flatten()
                .map(|group| group.gid.as_raw())
        })
    }
}

async fn ensure_parent(path: &Path) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

fn is_enotsup(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(nix::errno::Errno::ENOTSUP as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::S_IFREG;

    fn test_item(path: &str, payload_len: usize) -> Item {
        Item {
            path: path.to_string(),
            mode: S_IFREG | 0o644,
            uid: 1000,
            gid: 1000,
            user: Some("u".repeat(payload_len % 30 + 1)),
            group: None,
            mtime: payload_len as i64,
            rdev: None,
            source: None,
            chunks: None,
            xattrs: None,
        }
    }

    #[test]
    fn tail_is_held_back_until_finalized() {
        let mut buffer = ChunkBuffer::new(0);
        let item = test_item("small", 3);
        assert!(buffer.add(&item).unwrap().is_empty());
        // Nothing reaches a boundary for a single small item.
        assert!(buffer.flush(false).is_empty());
        let chunks = buffer.flush(true);
        assert_eq!(chunks.len(), 1);
        assert_eq!(&chunks[0][..], &item.to_bytes().unwrap()[..]);
    }

    #[test]
    fn buffer_overflow_triggers_flush() {
        let mut buffer = ChunkBuffer::new(0);
        let mut emitted = Vec::new();
        let mut expected = Vec::new();
        for index in 0..40_000 {
            let item = test_item(&format!("dir/sub/file-{}", index), index);
            expected.extend_from_slice(&item.to_bytes().unwrap());
            emitted.extend(buffer.add(&item).unwrap());
        }
        assert!(!emitted.is_empty());
        emitted.extend(buffer.flush(true));
        let total: Vec<u8> = emitted
            .iter()
            .fold(Vec::new(), |mut acc, chunk| {
                acc.extend_from_slice(chunk);
                acc
            });
        assert_eq!(total, expected);
    }

    #[test]
    fn chunking_is_independent_of_add_granularity() {
        let items: Vec<Item> = (0..30_000)
            .map(|index| test_item(&format!("a/b/c/d-{}", index), index))
            .collect();
        let mut one = ChunkBuffer::new(0x7ab1);
        let mut one_chunks = Vec::new();
        for item in &items {
            one_chunks.extend(one.add(item).unwrap());
        }
        one_chunks.extend(one.flush(true));

        // Same items but flushed aggressively after every add.
        let mut other = ChunkBuffer::new(0x7ab1);
        let mut other_chunks = Vec::new();
        for item in &items {
            other_chunks.extend(other.add(item).unwrap());
            other_chunks.extend(other.flush(false));
        }
        other_chunks.extend(other.flush(true));
        assert_eq!(one_chunks, other_chunks);
    }

    #[test]
    fn timestamp_parses_back() {
        let meta = ArchiveMeta {
            version: 1,
            name: "a".to_string(),
            items: Vec::new(),
            cmdline: Vec::new(),
            hostname: "h".to_string(),
            username: "u".to_string(),
            time: "2024-03-01T10:20:30.123456".to_string(),
        };
        let archive = Archive {
            id: ChunkId::zero(),
            meta,
        };
        let ts = archive.ts().unwrap();
        assert_eq!(ts.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(), "2024-03-01T10:20:30.123456");
    }
}
