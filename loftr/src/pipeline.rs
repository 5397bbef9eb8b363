//! Streaming decode of an archive's item stream.

use std::collections::VecDeque;

use crate::{ChunkId, Error, Item, ItemDecoder, Key, Repository};

pub type ItemFilter = Box<dyn Fn(&Item) -> bool + Send>;

/// Lazy cursor over the items referenced by an archive.
///
/// Holds the remaining chunk ids, a streaming decoder and the items decoded
/// from the chunk fetched last, so at most one chunk's worth of items is in
/// memory at a time. With `preload` set, the content chunks of yielded file
/// items are queued for prefetch in the repository as soon as the item is
/// decoded.
pub struct ItemStream {
    ids: VecDeque<ChunkId>,
    decoder: ItemDecoder,
    queue: VecDeque<Item>,
    filter: Option<ItemFilter>,
    preload: bool,
}

impl ItemStream {
    pub fn new(ids: Vec<ChunkId>, filter: Option<ItemFilter>, preload: bool) -> Self {
        Self {
            ids: ids.into(),
            decoder: ItemDecoder::new(),
            queue: VecDeque::new(),
            filter,
            preload,
        }
    }

    /// Decode the next item, fetching further item-stream chunks as needed.
    pub async fn next(
        &mut self,
        repository: &mut Repository,
        key: &Key,
    ) -> Result<Option<Item>, Error> {
        loop {
            if let Some(item) = self.queue.pop_front() {
                return Ok(Some(item));
            }
            let Some(id) = self.ids.pop_front() else {
                return Ok(None);
            };
            let sealed = repository.get(&id).await?;
            let data = key.decrypt(Some(&id), &sealed)?;
            self.decoder.feed(&data);
            let mut preload_ids = Vec::new();
            while let Some(item) = self.decoder.next()? {
                if let Some(filter) = &self.filter {
                    if !filter(&item) {
                        continue;
                    }
                }
                if self.preload {
                    if let Some(chunks) = &item.chunks {
                        preload_ids.extend(chunks.iter().map(|chunk| *chunk.id()));
                    }
                }
                self.queue.push_back(item);
            }
            if !preload_ids.is_empty() {
                repository.preload(&preload_ids).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{S_IFDIR, S_IFREG};
    use crate::ChunkRef;

    fn item(path: &str, mode: u32) -> Item {
        Item {
            path: path.to_string(),
            mode,
            uid: 0,
            gid: 0,
            user: None,
            group: None,
            mtime: 0,
            rdev: None,
            source: None,
            chunks: None,
            xattrs: None,
        }
    }

    async fn store_stream(
        repository: &mut Repository,
        key: &Key,
        items: &[Item],
        split_at: usize,
    ) -> Vec<ChunkId> {
        let mut stream = Vec::new();
        for item in items {
            stream.extend_from_slice(&item.to_bytes().unwrap());
        }
        // Split mid record to exercise the partial decode path.
        let mut ids = Vec::new();
        for part in [&stream[..split_at], &stream[split_at..]] {
            let id = key.id_hash(part);
            repository.put(id, key.encrypt(part).unwrap());
            ids.push(id);
        }
        repository.commit().await.unwrap();
        ids
    }

    #[tokio::test]
    async fn yields_items_in_stream_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = Repository::create(dir.path()).await.unwrap();
        let key = Key::generate();
        let items = [
            item("a", S_IFDIR | 0o755),
            item("a/b", S_IFREG | 0o644),
            item("a/c", S_IFREG | 0o600),
        ];
        let ids = store_stream(&mut repo, &key, &items, 11).await;

        let mut stream = ItemStream::new(ids, None, false);
        let mut seen = Vec::new();
        while let Some(item) = stream.next(&mut repo, &key).await.unwrap() {
            seen.push(item);
        }
        assert_eq!(seen, items);
    }

    #[tokio::test]
    async fn filter_excludes_items() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = Repository::create(dir.path()).await.unwrap();
        let key = Key::generate();
        let items = [item("keep/x", S_IFDIR | 0o755), item("drop/y", S_IFDIR | 0o755)];
        let ids = store_stream(&mut repo, &key, &items, 5).await;

        let filter: ItemFilter = Box::new(|item: &Item| item.path.starts_with("keep"));
        let mut stream = ItemStream::new(ids, Some(filter), false);
        let first = stream.next(&mut repo, &key).await.unwrap().unwrap();
        assert_eq!(first.path, "keep/x");
        assert!(stream.next(&mut repo, &key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn preload_warms_file_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = Repository::create(dir.path()).await.unwrap();
        let key = Key::generate();
        let content = b"file content";
        let content_id = key.id_hash(content);
        repo.put(content_id, key.encrypt(content).unwrap());
        let mut file = item("f", S_IFREG | 0o644);
        file.chunks = Some(vec![ChunkRef(content_id, content.len() as u32, 0)]);
        let ids = store_stream(&mut repo, &key, &[file], 3).await;

        let mut stream = ItemStream::new(ids, None, true);
        let item = stream.next(&mut repo, &key).await.unwrap().unwrap();
        let chunk = item.chunks.as_ref().unwrap()[0];
        let sealed = repo.get(chunk.id()).await.unwrap();
        assert_eq!(&key.decrypt(Some(chunk.id()), &sealed).unwrap()[..], content);
    }

    #[tokio::test]
    async fn damaged_chunk_fails_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = Repository::create(dir.path()).await.unwrap();
        let key = Key::generate();
        let items = [item("a", S_IFDIR | 0o755)];
        let ids = store_stream(&mut repo, &key, &items, 4).await;
        repo.delete(&ids[1]);
        repo.commit().await.unwrap();

        let mut stream = ItemStream::new(ids, None, false);
        // First chunk holds only part of the single record, the second is gone.
        assert!(matches!(
            stream.next(&mut repo, &key).await,
            Err(Error::ChunkMissing(_))
        ));
    }
}
