//! Chunked, versioned blob storage.
//!
//! A blob is a root record `{id, active_version}` plus chunk records keyed
//! by `(id, version, index)`. A save writes every chunk under a new version,
//! then publishes the root, then deletes chunks of older versions. Readers
//! only ever follow the published version, so a reader never observes a
//! partially written blob.
//!
//! New versions are the active version plus a random step, so writers in
//! separate processes need no shared sequence. Two racing writers both
//! publish; the larger version wins. A writer that finds a larger version
//! already published discards its own chunks instead. The window between
//! that check and the commit is not closed: the losing write can still
//! land last. This is accepted, not prevented.
//!
//! Once the active version is `u64::MAX` no larger version exists; the next
//! save first clears the chunks of that version and rewrites it in the same
//! session.

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use dynastore_core::escape::escape;
use dynastore_core::{StoreError, StoreResult};

use crate::config::BlobConfig;
use crate::storage::{
    decode_record, encode_record, finish, DurableStore, StoreSession, BLOBS_TABLE,
    BLOB_CHUNKS_TABLE,
};

/// Largest random step between consecutive versions of one blob.
pub const MAX_VERSION_STEP: u64 = (1 << 31) - 1;

const BLOB_ROOT: &str = "blob root";
const BLOB_CHUNK: &str = "blob chunk";

/// Byte-stream storage keyed by string id.
///
/// Used as `Arc<dyn BlobStore>`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores everything `source` yields under `id`, replacing any previous
    /// content. Returns the number of bytes stored.
    async fn save(&self, id: &str, source: &mut (dyn AsyncRead + Unpin + Send)) -> StoreResult<u64>;

    /// Writes the content of `id` to `sink`. Returns the number of bytes
    /// written, or `None` if no blob is published under `id`.
    async fn load(
        &self,
        id: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> StoreResult<Option<u64>>;

    /// Unpublishes `id`. Returns whether it was published.
    async fn delete(&self, id: &str) -> StoreResult<bool>;

    async fn exists(&self, id: &str) -> StoreResult<bool>;

    /// Ids of every published blob, in order.
    async fn list_all(&self) -> StoreResult<Vec<String>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct BlobRoot {
    id: String,
    active_version: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct BlobChunk {
    id: String,
    version: u64,
    index: u64,
    #[serde(with = "serde_bytes")]
    content: Vec<u8>,
}

/// Prefix shared by every chunk key of `id`. Escaped ids never contain `/`,
/// so no other blob's keys share it.
fn chunk_prefix(id: &str) -> String {
    format!("{}/", escape(id))
}

fn chunk_key(id: &str, version: u64, index: u64) -> String {
    format!("{}{version:020}/{index:020}", chunk_prefix(id))
}

fn chunk_version(key: &str, prefix: &str) -> Option<u64> {
    key.strip_prefix(prefix)?.split('/').next()?.parse().ok()
}

/// Reads until `buf` is full or `source` is exhausted.
async fn fill(source: &mut (dyn AsyncRead + Unpin + Send), buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// [`BlobStore`] over a [`DurableStore`], splitting content into
/// fixed-size chunk records.
pub struct ChunkedBlobStore {
    store: Arc<dyn DurableStore>,
    chunk_size: usize,
}

impl ChunkedBlobStore {
    #[must_use]
    pub fn new(store: Arc<dyn DurableStore>, config: &BlobConfig) -> Self {
        Self {
            store,
            chunk_size: config.chunk_size.max(1),
        }
    }

    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Published version of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] or [`StoreError::Io`] if the root
    /// record cannot be read.
    pub async fn active_version(
        &self,
        session: &mut dyn StoreSession,
        id: &str,
    ) -> StoreResult<Option<u64>> {
        let Some(bytes) = session.get(BLOBS_TABLE, id).await? else {
            return Ok(None);
        };
        let root: BlobRoot = decode_record(BLOB_ROOT, &bytes)?;
        Ok(Some(root.active_version))
    }

    /// [`BlobStore::save`] as a step of an enclosing session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if reading `source` or the session fails.
    pub async fn save_in(
        &self,
        session: &mut dyn StoreSession,
        id: &str,
        source: &mut (dyn AsyncRead + Unpin + Send),
    ) -> StoreResult<u64> {
        let base = self.active_version(session, id).await?.unwrap_or(0);
        let step = rand::rng().random_range(1..=MAX_VERSION_STEP);
        let version = match base.checked_add(step) {
            Some(version) => version,
            None => {
                // Versions are exhausted; rewrite the last one in place.
                warn!(blob_id = %id, "blob version space exhausted, reusing the active version");
                self.delete_chunks_where(session, id, |v| v == u64::MAX)
                    .await?;
                u64::MAX
            }
        };

        let mut buf = vec![0u8; self.chunk_size];
        let mut index = 0u64;
        let mut total = 0u64;
        loop {
            let filled = fill(source, &mut buf).await.map_err(StoreError::io)?;
            if filled == 0 {
                break;
            }
            let chunk = BlobChunk {
                id: id.to_string(),
                version,
                index,
                content: buf[..filled].to_vec(),
            };
            session
                .put(
                    BLOB_CHUNKS_TABLE,
                    &chunk_key(id, version, index),
                    encode_record(BLOB_CHUNK, &chunk)?,
                )
                .await?;
            total += filled as u64;
            index += 1;
            if filled < buf.len() {
                break;
            }
        }

        if let Some(published) = self.active_version(session, id).await? {
            if published > version {
                debug!(
                    blob_id = %id,
                    version,
                    published,
                    "newer blob version published concurrently, discarding ours"
                );
                for index in 0..index {
                    session
                        .delete(BLOB_CHUNKS_TABLE, &chunk_key(id, version, index))
                        .await?;
                }
                return Ok(total);
            }
        }

        let root = BlobRoot {
            id: id.to_string(),
            active_version: version,
        };
        session
            .put(BLOBS_TABLE, id, encode_record(BLOB_ROOT, &root)?)
            .await?;
        debug!(blob_id = %id, version, chunks = index, bytes = total, "saved blob");

        if let Err(err) = self.delete_chunks_where(session, id, |v| v < version).await {
            warn!(blob_id = %id, version, error = %err, "failed to delete stale blob chunks");
        }
        Ok(total)
    }

    /// [`BlobStore::load`] as a step of an enclosing session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] if a chunk does not decode, or
    /// [`StoreError::Io`] if the session or `sink` fails.
    pub async fn load_in(
        &self,
        session: &mut dyn StoreSession,
        id: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> StoreResult<Option<u64>> {
        let Some(version) = self.active_version(session, id).await? else {
            return Ok(None);
        };
        let mut total = 0u64;
        let mut index = 0u64;
        while let Some(bytes) = session
            .get(BLOB_CHUNKS_TABLE, &chunk_key(id, version, index))
            .await?
        {
            let chunk: BlobChunk = decode_record(BLOB_CHUNK, &bytes)?;
            sink.write_all(&chunk.content).await.map_err(StoreError::io)?;
            total += chunk.content.len() as u64;
            index += 1;
        }
        sink.flush().await.map_err(StoreError::io)?;
        Ok(Some(total))
    }

    /// [`BlobStore::delete`] as a step of an enclosing session. Chunks of
    /// every version are removed along with the root.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the session fails.
    pub async fn delete_in(&self, session: &mut dyn StoreSession, id: &str) -> StoreResult<bool> {
        let existed = session.get(BLOBS_TABLE, id).await?.is_some();
        session.delete(BLOBS_TABLE, id).await?;
        for key in session.scan_keys(BLOB_CHUNKS_TABLE, &chunk_prefix(id)).await? {
            session.delete(BLOB_CHUNKS_TABLE, &key).await?;
        }
        Ok(existed)
    }

    /// [`BlobStore::list_all`] as a step of an enclosing session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the session fails.
    pub async fn list_in(&self, session: &mut dyn StoreSession) -> StoreResult<Vec<String>> {
        session.scan_keys(BLOBS_TABLE, "").await
    }

    /// Deletes chunks of `id` whose version satisfies `doomed`.
    async fn delete_chunks_where(
        &self,
        session: &mut dyn StoreSession,
        id: &str,
        doomed: impl Fn(u64) -> bool + Send,
    ) -> StoreResult<()> {
        let prefix = chunk_prefix(id);
        for key in session.scan_keys(BLOB_CHUNKS_TABLE, &prefix).await? {
            if chunk_version(&key, &prefix).is_some_and(&doomed) {
                session.delete(BLOB_CHUNKS_TABLE, &key).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for ChunkedBlobStore {
    async fn save(&self, id: &str, source: &mut (dyn AsyncRead + Unpin + Send)) -> StoreResult<u64> {
        let mut session = self.store.begin_session().await?;
        let result = self.save_in(session.as_mut(), id, source).await;
        finish(session, result).await
    }

    async fn load(
        &self,
        id: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> StoreResult<Option<u64>> {
        let mut session = self.store.begin_session().await?;
        let result = self.load_in(session.as_mut(), id, sink).await;
        finish(session, result).await
    }

    async fn delete(&self, id: &str) -> StoreResult<bool> {
        let mut session = self.store.begin_session().await?;
        let result = self.delete_in(session.as_mut(), id).await;
        finish(session, result).await
    }

    async fn exists(&self, id: &str) -> StoreResult<bool> {
        let mut session = self.store.begin_session().await?;
        let result = self.active_version(session.as_mut(), id).await;
        finish(session, result).await.map(|v| v.is_some())
    }

    async fn list_all(&self) -> StoreResult<Vec<String>> {
        let mut session = self.store.begin_session().await?;
        let result = self.list_in(session.as_mut()).await;
        finish(session, result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::engines::MemoryStore;

    fn store_with_chunk_size(chunk_size: usize) -> (MemoryStore, ChunkedBlobStore) {
        let memory = MemoryStore::new();
        let blobs = ChunkedBlobStore::new(Arc::new(memory.clone()), &BlobConfig { chunk_size });
        (memory, blobs)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn load_bytes(blobs: &ChunkedBlobStore, id: &str) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        blobs.load(id, &mut out).await.unwrap().map(|_| out)
    }

    #[test]
    fn chunk_keys_sort_by_version_then_index() {
        assert!(chunk_key("a", 2, 10) > chunk_key("a", 2, 9));
        assert!(chunk_key("a", 10, 0) > chunk_key("a", 9, 99));
        assert_eq!(chunk_version(&chunk_key("a b", 42, 3), &chunk_prefix("a b")), Some(42));
        assert!(!chunk_key("ab", 1, 0).starts_with(&chunk_prefix("a")));
    }

    #[tokio::test]
    async fn round_trip_around_chunk_boundaries() {
        let chunk = 16;
        let (_, blobs) = store_with_chunk_size(chunk);
        for len in [0, chunk - 1, chunk, chunk + 1, 3 * chunk + 5] {
            let data = pattern(len);
            let saved = blobs.save("doc1", &mut data.as_slice()).await.unwrap();
            assert_eq!(saved, len as u64);
            assert_eq!(load_bytes(&blobs, "doc1").await, Some(data), "len {len}");
        }
    }

    #[tokio::test]
    async fn chunk_count_matches_content_length() {
        let (memory, blobs) = store_with_chunk_size(8);
        blobs.save("a", &mut pattern(17).as_slice()).await.unwrap();
        assert_eq!(memory.table_len(BLOB_CHUNKS_TABLE), 3);
        blobs.save("b", &mut pattern(0).as_slice()).await.unwrap();
        assert_eq!(memory.table_len(BLOB_CHUNKS_TABLE), 3);
        assert!(blobs.exists("b").await.unwrap());
    }

    #[tokio::test]
    async fn resave_publishes_larger_version_and_drops_old_chunks() {
        let (memory, blobs) = store_with_chunk_size(4);
        blobs.save("x", &mut b"first content".as_slice()).await.unwrap();
        let mut session = memory.begin_session().await.unwrap();
        let v1 = blobs.active_version(session.as_mut(), "x").await.unwrap().unwrap();

        blobs.save("x", &mut b"second".as_slice()).await.unwrap();
        let mut session = memory.begin_session().await.unwrap();
        let v2 = blobs.active_version(session.as_mut(), "x").await.unwrap().unwrap();

        assert!(v2 > v1);
        assert_eq!(load_bytes(&blobs, "x").await, Some(b"second".to_vec()));
        let prefix = chunk_prefix("x");
        let versions: Vec<_> = memory
            .keys(BLOB_CHUNKS_TABLE)
            .iter()
            .filter_map(|k| chunk_version(k, &prefix))
            .collect();
        assert_eq!(versions, vec![v2, v2]);
    }

    /// Publishes a root with the largest possible version right before the
    /// wrapped session's second root read, as a concurrent writer would.
    struct RacingSession {
        inner: Box<dyn StoreSession>,
        store: MemoryStore,
        root_reads: usize,
    }

    #[async_trait]
    impl StoreSession for RacingSession {
        async fn get(&mut self, table: &str, key: &str) -> StoreResult<Option<Vec<u8>>> {
            if table == BLOBS_TABLE {
                self.root_reads += 1;
                if self.root_reads == 2 {
                    let root = BlobRoot {
                        id: key.to_string(),
                        active_version: u64::MAX,
                    };
                    let mut other = self.store.begin_session().await?;
                    other
                        .put(BLOBS_TABLE, key, encode_record(BLOB_ROOT, &root)?)
                        .await?;
                    other.commit().await?;
                }
            }
            self.inner.get(table, key).await
        }

        async fn put(&mut self, table: &str, key: &str, value: Vec<u8>) -> StoreResult<()> {
            self.inner.put(table, key, value).await
        }

        async fn delete(&mut self, table: &str, key: &str) -> StoreResult<()> {
            self.inner.delete(table, key).await
        }

        async fn scan_prefix(
            &mut self,
            table: &str,
            prefix: &str,
        ) -> StoreResult<Vec<(String, Vec<u8>)>> {
            self.inner.scan_prefix(table, prefix).await
        }

        async fn scan_keys(&mut self, table: &str, prefix: &str) -> StoreResult<Vec<String>> {
            self.inner.scan_keys(table, prefix).await
        }

        async fn commit(self: Box<Self>) -> StoreResult<()> {
            self.inner.commit().await
        }

        async fn rollback(self: Box<Self>) {
            self.inner.rollback().await;
        }
    }

    #[tokio::test]
    async fn save_yields_to_larger_concurrent_version() {
        let (memory, blobs) = store_with_chunk_size(4);
        let mut session = RacingSession {
            inner: memory.begin_session().await.unwrap(),
            store: memory.clone(),
            root_reads: 0,
        };
        let saved = blobs
            .save_in(&mut session, "x", &mut b"late write".as_slice())
            .await
            .unwrap();
        assert_eq!(saved, 10);
        Box::new(session).commit().await.unwrap();

        let mut session = memory.begin_session().await.unwrap();
        assert_eq!(
            blobs.active_version(session.as_mut(), "x").await.unwrap(),
            Some(u64::MAX)
        );
        assert_eq!(memory.table_len(BLOB_CHUNKS_TABLE), 0);
    }

    #[tokio::test]
    async fn save_after_the_last_version_rewrites_it() {
        let (memory, blobs) = store_with_chunk_size(4);
        let mut session = memory.begin_session().await.unwrap();
        let root = BlobRoot {
            id: "x".to_string(),
            active_version: u64::MAX,
        };
        session
            .put(BLOBS_TABLE, "x", encode_record(BLOB_ROOT, &root).unwrap())
            .await
            .unwrap();
        for (index, content) in [b"AAAA", b"BBBB", b"CCCC"].into_iter().enumerate() {
            let index = index as u64;
            let chunk = BlobChunk {
                id: "x".to_string(),
                version: u64::MAX,
                index,
                content: content.to_vec(),
            };
            session
                .put(
                    BLOB_CHUNKS_TABLE,
                    &chunk_key("x", u64::MAX, index),
                    encode_record(BLOB_CHUNK, &chunk).unwrap(),
                )
                .await
                .unwrap();
        }
        session.commit().await.unwrap();
        assert_eq!(load_bytes(&blobs, "x").await, Some(b"AAAABBBBCCCC".to_vec()));

        blobs.save("x", &mut b"new".as_slice()).await.unwrap();
        assert_eq!(load_bytes(&blobs, "x").await, Some(b"new".to_vec()));
        assert_eq!(memory.table_len(BLOB_CHUNKS_TABLE), 1);
    }

    /// Fails every value scan, so only key scans may be used.
    struct KeysOnlySession {
        inner: Box<dyn StoreSession>,
    }

    #[async_trait]
    impl StoreSession for KeysOnlySession {
        async fn get(&mut self, table: &str, key: &str) -> StoreResult<Option<Vec<u8>>> {
            self.inner.get(table, key).await
        }

        async fn put(&mut self, table: &str, key: &str, value: Vec<u8>) -> StoreResult<()> {
            self.inner.put(table, key, value).await
        }

        async fn delete(&mut self, table: &str, key: &str) -> StoreResult<()> {
            self.inner.delete(table, key).await
        }

        async fn scan_prefix(
            &mut self,
            table: &str,
            _prefix: &str,
        ) -> StoreResult<Vec<(String, Vec<u8>)>> {
            Err(StoreError::io(anyhow::anyhow!("value scan of {table}")))
        }

        async fn scan_keys(&mut self, table: &str, prefix: &str) -> StoreResult<Vec<String>> {
            self.inner.scan_keys(table, prefix).await
        }

        async fn commit(self: Box<Self>) -> StoreResult<()> {
            self.inner.commit().await
        }

        async fn rollback(self: Box<Self>) {
            self.inner.rollback().await;
        }
    }

    #[tokio::test]
    async fn chunk_cleanup_reads_keys_only() {
        let (memory, blobs) = store_with_chunk_size(4);
        blobs.save("x", &mut pattern(13).as_slice()).await.unwrap();

        let mut session = KeysOnlySession {
            inner: memory.begin_session().await.unwrap(),
        };
        blobs
            .save_in(&mut session, "x", &mut pattern(5).as_slice())
            .await
            .unwrap();
        Box::new(session).commit().await.unwrap();
        assert_eq!(memory.table_len(BLOB_CHUNKS_TABLE), 2);

        let mut session = KeysOnlySession {
            inner: memory.begin_session().await.unwrap(),
        };
        assert!(blobs.delete_in(&mut session, "x").await.unwrap());
        assert!(blobs.list_in(&mut session).await.unwrap().is_empty());
        Box::new(session).commit().await.unwrap();
        assert_eq!(memory.table_len(BLOB_CHUNKS_TABLE), 0);
    }

    #[tokio::test]
    async fn missing_blob_loads_as_none() {
        let (_, blobs) = store_with_chunk_size(4);
        assert_eq!(load_bytes(&blobs, "nope").await, None);
        assert!(!blobs.exists("nope").await.unwrap());
        assert!(!blobs.delete("nope").await.unwrap());
    }

    #[tokio::test]
    async fn delete_unpublishes_and_reclaims_chunks() {
        let (memory, blobs) = store_with_chunk_size(4);
        blobs.save("a", &mut pattern(9).as_slice()).await.unwrap();
        blobs.save("ab", &mut pattern(3).as_slice()).await.unwrap();

        assert!(blobs.delete("a").await.unwrap());
        assert_eq!(load_bytes(&blobs, "a").await, None);
        assert_eq!(load_bytes(&blobs, "ab").await, Some(pattern(3)));
        assert_eq!(memory.table_len(BLOB_CHUNKS_TABLE), 1);
    }

    #[tokio::test]
    async fn list_all_returns_published_ids() {
        let (_, blobs) = store_with_chunk_size(4);
        for id in ["b", "a", "xwiki:Main.WebHome@logo.png"] {
            blobs.save(id, &mut pattern(5).as_slice()).await.unwrap();
        }
        blobs.delete("b").await.unwrap();
        assert_eq!(
            blobs.list_all().await.unwrap(),
            vec!["a", "xwiki:Main.WebHome@logo.png"]
        );
    }
}
