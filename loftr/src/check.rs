//! Repository consistency check and repair.
//!
//! The checker trusts nothing but the raw objects: it enumerates the
//! repository, rebuilds a reference count table from scratch, recovers the
//! manifest when its object is gone, and walks every archive through a
//! damage tolerant item iterator. In repair mode damaged archives are
//! rewritten (missing file chunks replaced by zero chunks of the same
//! size) and unreferenced objects are deleted.

use std::collections::HashSet;

use bytes::Bytes;
use log::{info, warn};
use tempfile::TempDir;

use crate::archive::{ArchiveMeta, ChunkBuffer};
use crate::item::resync_offset;
use crate::{
    ArchiveInfo, ChunkEntry, ChunkId, ChunkIndex, ChunkRef, Error, Item, ItemDecoder, Key,
    Manifest, Repository, MANIFEST_ID,
};

const LIST_PAGE_SIZE: usize = 10_000;

pub struct ArchiveChecker {
    repair: bool,
    error_found: bool,
    possibly_superseded: HashSet<ChunkId>,
    chunks: ChunkIndex,
    tmpdir: TempDir,
}

impl ArchiveChecker {
    pub fn new(repair: bool) -> Result<Self, Error> {
        Ok(Self {
            repair,
            error_found: false,
            possibly_superseded: HashSet::new(),
            chunks: ChunkIndex::new(),
            tmpdir: tempfile::tempdir()?,
        })
    }

    /// Run the check. Returns true when the repository is consistent, or
    /// when it was repaired.
    pub async fn check(mut self, repository: &mut Repository) -> Result<bool, Error> {
        info!("Starting archive consistency check...");
        self.init_chunks(repository).await?;
        if self.chunks.is_empty() {
            info!("Repository contains no objects");
            return Ok(true);
        }
        let key = self.identify_key(repository).await?;
        let mut manifest = if !self.chunks.contains(&MANIFEST_ID) {
            self.rebuild_manifest(repository, &key).await?
        } else {
            Manifest::load(repository, &key).await?
        };
        self.rebuild_chunks(repository, &key, &mut manifest).await?;
        self.verify_chunks(repository, &key, &mut manifest).await?;
        if !self.error_found {
            info!("Archive consistency check complete, no problems found.");
        }
        Ok(self.repair || !self.error_found)
    }

    fn report_error(&mut self, msg: &str) {
        self.error_found = true;
        warn!("{}", msg);
    }

    /// Enumerate every object id, pre-sizing the index to avoid rehashing
    /// while it fills.
    async fn init_chunks(&mut self, repository: &mut Repository) -> Result<(), Error> {
        let capacity = repository.count().await? * 12 / 10;
        self.chunks = ChunkIndex::create(&self.tmpdir.path().join("chunks"), capacity);
        let mut marker = None;
        loop {
            let page = repository.list(LIST_PAGE_SIZE, marker.as_ref()).await?;
            let Some(last) = page.last().copied() else {
                break;
            };
            marker = Some(last);
            for id in page {
                self.chunks.insert(
                    id,
                    ChunkEntry {
                        count: 0,
                        size: 0,
                        csize: 0,
                    },
                );
            }
        }
        Ok(())
    }

    /// Recover the key mode from any stored object.
    async fn identify_key(&self, repository: &mut Repository) -> Result<Key, Error> {
        let id = *self.chunks.keys().next().ok_or(Error::NotARepository)?;
        let sample = repository.get(&id).await?;
        Key::detect(&repository.keyfile_path(), &sample)
    }

    /// Scan every object for things that decode as archive metadata blocks
    /// and register them under their recorded names.
    async fn rebuild_manifest(
        &mut self,
        repository: &mut Repository,
        key: &Key,
    ) -> Result<Manifest, Error> {
        self.report_error("Rebuilding missing manifest, this might take some time...");
        let mut manifest = Manifest::new();
        let ids: Vec<ChunkId> = self.chunks.keys().copied().collect();
        for id in ids {
            let sealed = repository.get(&id).await?;
            let Ok(data) = key.decrypt(Some(&id), &sealed) else {
                continue;
            };
            let Ok(meta) = rmp_serde::from_slice::<ArchiveMeta>(&data) else {
                continue;
            };
            if meta.version != 1 {
                continue;
            }
            warn!("Found archive {}", meta.name);
            manifest.archives.insert(
                meta.name.clone(),
                ArchiveInfo {
                    id,
                    time: meta.time,
                },
            );
        }
        info!("Manifest rebuild complete");
        Ok(manifest)
    }

    /// Walk all archives, recount every reference and, in repair mode,
    /// rewrite archives whose metadata or file chunks are damaged.
    async fn rebuild_chunks(
        &mut self,
        repository: &mut Repository,
        key: &Key,
        manifest: &mut Manifest,
    ) -> Result<(), Error> {
        // The manifest is not part of any archive graph.
        self.chunks.remove(&MANIFEST_ID);
        let names: Vec<String> = manifest.archives.keys().cloned().collect();
        let total = names.len();
        for (index, name) in names.iter().enumerate() {
            info!("Analyzing archive {} ({}/{})", name, index + 1, total);
            let Some(info) = manifest.archives.get(name).cloned() else {
                continue;
            };
            if !self.chunks.contains(&info.id) {
                self.report_error("Archive metadata block is missing");
                manifest.archives.remove(name);
                continue;
            }
            let sealed = repository.get(&info.id).await?;
            let data = key.decrypt(Some(&info.id), &sealed)?;
            let mut meta: ArchiveMeta = rmp_serde::from_slice(&data)?;
            if meta.version != 1 {
                return Err(Error::UnknownArchiveVersion(meta.version));
            }
            let old_items = std::mem::take(&mut meta.items);
            let mut new_items = Vec::new();
            let mut buffer = ChunkBuffer::new(key.chunk_seed());
            self.iterate_robust(
                repository,
                key,
                &old_items,
                &mut buffer,
                &mut new_items,
            )
            .await?;
            let blobs = buffer.flush(true);
            self.store_item_chunks(repository, key, &mut new_items, blobs)?;
            for id in &old_items {
                self.record_unused(id);
            }
            meta.items = new_items;
            let data = rmp_serde::to_vec_named(&meta)?;
            let new_id = key.id_hash(&data);
            let sealed = key.encrypt(&data)?;
            self.add_reference(
                repository,
                new_id,
                data.len() as u32,
                sealed.len() as u32,
                Some(sealed),
            );
            self.record_unused(&info.id);
            manifest.archives.insert(
                name.clone(),
                ArchiveInfo {
                    id: new_id,
                    time: info.time,
                },
            );
        }
        Ok(())
    }

    /// Stream the item chunks, skipping runs of missing ids and
    /// resynchronizing the record decoder when re-entering intact data.
    async fn iterate_robust(
        &mut self,
        repository: &mut Repository,
        key: &Key,
        item_ids: &[ChunkId],
        buffer: &mut ChunkBuffer,
        new_items: &mut Vec<ChunkId>,
    ) -> Result<(), Error> {
        // Group the stream into alternating runs of present and missing ids.
        let mut runs: Vec<(bool, Vec<ChunkId>)> = Vec::new();
        for id in item_ids {
            let present = self.chunks.contains(id);
            if runs.last().map(|(p, _)| *p != present).unwrap_or(true) {
                runs.push((present, Vec::new()));
            }
            if let Some((_, ids)) = runs.last_mut() {
                ids.push(*id);
            }
        }
        let mut need_resync = false;
        for (present, ids) in runs {
            if !present {
                self.report_error("Archive metadata damage detected");
                need_resync = true;
                continue;
            }
            let mut decoder = ItemDecoder::new();
            for id in ids {
                let sealed = repository.get(&id).await?;
                let data = match key.decrypt(Some(&id), &sealed) {
                    Ok(data) => data,
                    Err(Error::Crypto) => {
                        // Present but unreadable counts as damage as well.
                        self.report_error("Archive metadata damage detected");
                        decoder = ItemDecoder::new();
                        need_resync = true;
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                let feed = if need_resync {
                    match resync_offset(&data) {
                        Some(offset) => {
                            need_resync = false;
                            &data[offset..]
                        }
                        None => {
                            self.report_error("Unable to resynchronize item stream");
                            continue;
                        }
                    }
                } else {
                    &data[..]
                };
                decoder.feed(feed);
                loop {
                    match decoder.next() {
                        Ok(Some(mut item)) => {
                            if item.chunks.is_some() {
                                self.verify_file_chunks(repository, key, &mut item)?;
                            }
                            let blobs = buffer.add(&item)?;
                            self.store_item_chunks(repository, key, new_items, blobs)?;
                        }
                        Ok(None) => break,
                        Err(_) => {
                            self.report_error("Malformed item record detected");
                            decoder = ItemDecoder::new();
                            need_resync = true;
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Replace file chunks missing from the repository with zero chunks of
    /// the recorded size and recount the surviving ones.
    fn verify_file_chunks(
        &mut self,
        repository: &mut Repository,
        key: &Key,
        item: &mut Item,
    ) -> Result<(), Error> {
        let Some(chunks) = item.chunks.take() else {
            return Ok(());
        };
        let mut offset = 0u64;
        let mut repaired = Vec::with_capacity(chunks.len());
        for ChunkRef(id, size, csize) in chunks {
            if !self.chunks.contains(&id) {
                self.report_error(&format!(
                    "{}: Missing file chunk detected (Byte {}-{})",
                    item.path,
                    offset,
                    offset + u64::from(size)
                ));
                let zeros = vec![0u8; size as usize];
                let zero_id = key.id_hash(&zeros);
                let sealed = key.encrypt(&zeros)?;
                let zero_csize = sealed.len() as u32;
                self.add_reference(repository, zero_id, size, zero_csize, Some(sealed));
                repaired.push(ChunkRef(zero_id, size, zero_csize));
            } else {
                self.add_reference(repository, id, size, csize, None);
                repaired.push(ChunkRef(id, size, csize));
            }
            offset += u64::from(size);
        }
        item.chunks = Some(repaired);
        Ok(())
    }

    fn store_item_chunks(
        &mut self,
        repository: &mut Repository,
        key: &Key,
        new_items: &mut Vec<ChunkId>,
        blobs: Vec<Bytes>,
    ) -> Result<(), Error> {
        for blob in blobs {
            let id = key.id_hash(&blob);
            let sealed = key.encrypt(&blob)?;
            self.add_reference(repository, id, blob.len() as u32, sealed.len() as u32, Some(sealed));
            new_items.push(id);
        }
        Ok(())
    }

    /// Count a reference, inserting the chunk first if it is new to the
    /// rebuilt index. New chunks reach the repository only in repair mode.
    fn add_reference(
        &mut self,
        repository: &mut Repository,
        id: ChunkId,
        size: u32,
        csize: u32,
        sealed: Option<Bytes>,
    ) {
        match self.chunks.get(&id) {
            Some(mut entry) => {
                entry.count += 1;
                if entry.size == 0 {
                    entry.size = size;
                    entry.csize = csize;
                }
                self.chunks.insert(id, entry);
            }
            None => {
                self.chunks.insert(
                    id,
                    ChunkEntry {
                        count: 1,
                        size,
                        csize,
                    },
                );
                if self.repair {
                    if let Some(sealed) = sealed {
                        repository.put(id, sealed);
                    }
                }
            }
        }
    }

    /// Remember ids that lost their last reference during a rewrite; they
    /// are deletion candidates, not orphans.
    fn record_unused(&mut self, id: &ChunkId) {
        if self.chunks.get(id).map(|entry| entry.count) == Some(0) {
            self.possibly_superseded.insert(*id);
        }
    }

    /// Report orphaned objects and, in repair mode, delete everything
    /// unreferenced and commit.
    async fn verify_chunks(
        &mut self,
        repository: &mut Repository,
        key: &Key,
        manifest: &mut Manifest,
    ) -> Result<(), Error> {
        let unused: Vec<ChunkId> = self
            .chunks
            .iter()
            .filter(|(_, entry)| entry.count == 0)
            .map(|(id, _)| *id)
            .collect();
        let orphaned = unused
            .iter()
            .filter(|id| !self.possibly_superseded.contains(id))
            .count();
        if orphaned > 0 {
            self.report_error(&format!("{} orphaned objects found", orphaned));
        }
        if self.repair {
            for id in &unused {
                repository.delete(id);
            }
            manifest.write(repository, key)?;
            repository.commit().await?;
        }
        Ok(())
    }
}
